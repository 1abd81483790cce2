use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use request_audit::{config, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let cfg = config::load_config(&args.config)?;
    init_tracing(&cfg.logging.level, &cfg.logging.format);

    match args.get_command() {
        cli::Commands::Serve => commands::serve::execute(cfg).await?,
        cli::Commands::Logs {
            limit,
            with_body,
            request_id,
        } => commands::logs::execute(&cfg, limit, with_body, request_id).await?,
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&cfg)?,
            cli::ConfigCommands::Validate => commands::config::validate(&cfg)?,
        },
    }

    Ok(())
}
