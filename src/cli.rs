use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "request-audit", version, about = "Request and outbound call audit logging server")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true, env = "REQUEST_AUDIT_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the server (default)
    Serve,

    /// Show recent inbound request rows from the embedded store
    Logs {
        /// Maximum number of rows
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Include headers and bodies
        #[arg(long)]
        with_body: bool,

        /// Show full detail for one request id
        #[arg(short, long)]
        request_id: Option<String>,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display effective configuration (with secrets masked)
    Show,

    /// Validate configuration
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Serve if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::try_parse_from(["request-audit"]).unwrap();
        assert!(matches!(cli.get_command(), Commands::Serve));
        assert_eq!(cli.config, PathBuf::from("config.toml"));
    }

    #[test]
    fn test_cli_parsing_logs() {
        let cli = Cli::try_parse_from([
            "request-audit",
            "logs",
            "--limit",
            "5",
            "--with-body",
            "--config",
            "/etc/audit.toml",
        ])
        .unwrap();

        match cli.get_command() {
            Commands::Logs {
                limit,
                with_body,
                request_id,
            } => {
                assert_eq!(limit, 5);
                assert!(with_body);
                assert!(request_id.is_none());
            }
            _ => panic!("Expected Logs command"),
        }
        assert_eq!(cli.config, PathBuf::from("/etc/audit.toml"));
    }

    #[test]
    fn test_cli_parsing_config_validate() {
        let cli = Cli::try_parse_from(["request-audit", "config", "validate"]).unwrap();
        match cli.get_command() {
            Commands::Config { action } => assert!(matches!(action, ConfigCommands::Validate)),
            _ => panic!("Expected Config command"),
        }
    }

    #[test]
    fn test_logs_by_request_id() {
        let cli = Cli::try_parse_from(["request-audit", "logs", "-r", "abc"]).unwrap();
        match cli.get_command() {
            Commands::Logs { request_id, .. } => assert_eq!(request_id.as_deref(), Some("abc")),
            _ => panic!("Expected Logs command"),
        }
    }
}
