use anyhow::Result;
use colored::Colorize;
use request_audit::{config::Config, server};
use tracing::info;

/// Execute the serve command
pub async fn execute(cfg: Config) -> Result<()> {
    println!(
        "{} {}:{}",
        "Starting request audit server on".green(),
        cfg.server.host,
        cfg.server.port
    );
    info!(
        sqlite_path = %cfg.storage.sqlite_path,
        correlation_header = %cfg.logging.correlation_header,
        "Loaded configuration"
    );

    server::start_server(cfg).await
}
