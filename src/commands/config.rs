use anyhow::Result;
use colored::Colorize;
use request_audit::config::{self, Config};
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration with secrets masked
pub fn show(cfg: &Config) -> Result<()> {
    println!("{}", "Effective Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(&config::masked(cfg))?;
    println!("{}", toml_string);

    info!("Configuration displayed");
    Ok(())
}

/// Execute the config validate command
///
/// Loading already validated the config; this re-runs the checks and prints a summary
pub fn validate(cfg: &Config) -> Result<()> {
    config::validate_config(cfg)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Storage backends: {}", enabled_backends(cfg).join(", "));
    println!("  Embedded store: {}", cfg.storage.sqlite_path);
    println!(
        "  Correlation: {} ({})",
        if cfg.logging.enable_correlation { "enabled" } else { "disabled" },
        cfg.logging.correlation_header
    );
    println!("  Vendors: {}", cfg.vendors.len());
    for (name, vendor) in &cfg.vendors {
        let fallback = vendor
            .fallback
            .as_deref()
            .map(|f| format!(" -> fallback {f}"))
            .unwrap_or_default();
        println!(
            "    {}: {} (threshold {}, cool-down {}s){}",
            name, vendor.base_url, vendor.failure_threshold, vendor.recovery_timeout_seconds, fallback
        );
    }

    info!("Configuration validation successful");
    Ok(())
}

/// Backends the config asks for, in registry precedence order
fn enabled_backends(cfg: &Config) -> Vec<&'static str> {
    let storage = &cfg.storage;
    let mut backends = Vec::new();
    if storage.document.enabled {
        backends.push("document");
    }
    if storage.dynamodb.enabled {
        backends.push("dynamodb");
    }
    if storage.sql_url.is_some() {
        backends.push("sql");
    }
    if storage.sqlite_enabled || (backends.is_empty() && storage.fallback_enabled) {
        backends.push("sqlite");
    }
    if backends.is_empty() {
        backends.push("none");
    }
    backends
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_backends_default() {
        assert_eq!(enabled_backends(&Config::default()), vec!["sqlite"]);
    }

    #[test]
    fn test_enabled_backends_remote_only() {
        let mut cfg = Config::default();
        cfg.storage.sqlite_enabled = false;
        cfg.storage.dynamodb.enabled = true;
        cfg.storage.sql_url = Some("postgres://audit@db/audit".to_string());
        assert_eq!(enabled_backends(&cfg), vec!["dynamodb", "sql"]);

        cfg.storage.dynamodb.enabled = false;
        cfg.storage.sql_url = None;
        cfg.storage.fallback_enabled = false;
        assert_eq!(enabled_backends(&cfg), vec!["none"]);
    }
}
