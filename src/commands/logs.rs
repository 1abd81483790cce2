//! Logs query command
//!
//! Reads inbound request rows straight from the embedded store.

use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use request_audit::config::Config;
use request_audit::storage::sqlite::StoredRequest;
use request_audit::storage::SqliteBackend;

/// Execute the logs command
pub async fn execute(
    cfg: &Config,
    limit: i64,
    with_body: bool,
    request_id: Option<String>,
) -> Result<()> {
    let path = &cfg.storage.sqlite_path;
    if !std::path::Path::new(path).exists() {
        eprintln!("{} {}", "No embedded log store at".red(), path);
        return Ok(());
    }

    let store = SqliteBackend::open(path)
        .await
        .with_context(|| format!("Failed to open embedded log store at {path}"))?;

    match request_id {
        Some(id) => show_request(&store, &id).await?,
        None => {
            let rows = store.recent_requests(limit.max(1), with_body).await?;
            if rows.is_empty() {
                println!("{}", "No requests logged yet".yellow());
            } else {
                println!("{}", render_table(&rows));
                if with_body {
                    for row in &rows {
                        print_bodies(row)?;
                    }
                }
            }
        }
    }

    store.pool().close().await;
    Ok(())
}

async fn show_request(store: &SqliteBackend, request_id: &str) -> Result<()> {
    let Some(row) = store.request_by_request_id(request_id).await? else {
        eprintln!("{} {}", "No request with id".red(), request_id);
        return Ok(());
    };

    println!("{}", serde_json::to_string_pretty(&row)?);

    let calls = store.calls_for_correlation(&row.log.correlation_id).await?;
    if !calls.is_empty() {
        println!();
        println!("{} ({})", "Outbound calls".bold(), calls.len());
        for call in calls {
            let status = call
                .log
                .status_code
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} {} {} {} {:.2}ms{}",
                call.status,
                call.log.vendor,
                call.log.method,
                call.log.url,
                call.log.execution_time_ms,
                if status == "-" { String::new() } else { format!(" [{status}]") }
            );
        }
    }
    Ok(())
}

fn render_table(rows: &[StoredRequest]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Time"),
        Cell::new("Request ID"),
        Cell::new("Method"),
        Cell::new("Path"),
        Cell::new("Status"),
        Cell::new("ms"),
        Cell::new("Error"),
    ]);

    for row in rows {
        let log = &row.log;
        let status_color = match log.status_code {
            200..=399 => Color::Green,
            400..=499 => Color::Yellow,
            _ => Color::Red,
        };
        table.add_row(vec![
            Cell::new(log.timestamp.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&log.request_id),
            Cell::new(&log.method),
            Cell::new(&log.path),
            Cell::new(log.status_code).fg(status_color),
            Cell::new(format!("{:.2}", log.execution_time_ms)),
            Cell::new(log.error_type.as_deref().unwrap_or("")),
        ]);
    }

    table
}

fn print_bodies(row: &StoredRequest) -> Result<()> {
    println!();
    println!("{} {}", "Request".bold(), row.log.request_id);
    println!("  headers: {}", serde_json::to_string(&row.log.request_headers)?);
    if let Some(body) = &row.log.request_body {
        println!("  request body: {}", serde_json::to_string_pretty(body)?);
    }
    if let Some(body) = &row.log.response_body {
        println!("  response body: {}", serde_json::to_string_pretty(body)?);
    }
    Ok(())
}
