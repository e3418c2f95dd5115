//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table, or the serializable source as JSON
pub fn print_rows<T: Tabled, S: Serialize + ?Sized>(
    rows: Vec<T>,
    source: &S,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No items found".yellow());
                return Ok(());
            }
            let table = Table::new(rows).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(source)?,
    }
    Ok(())
}

pub fn print_json<S: Serialize + ?Sized>(value: &S) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format bytes as GiB with two decimals
pub fn format_gib(bytes: f64) -> String {
    format!("{:.2}Gi", controller_lib::quantity::gib(bytes))
}

/// Render an optional string, `-` when empty
pub fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

/// Human-readable age from a creation time
pub fn format_age(created: Option<chrono::DateTime<chrono::Utc>>) -> String {
    let Some(created) = created else {
        return "-".to_string();
    };
    let age = chrono::Utc::now().signed_duration_since(created);
    if age.num_days() > 0 {
        format!("{}d", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{}m", age.num_minutes())
    } else {
        format!("{}s", age.num_seconds().max(0))
    }
}

/// Color a health or eligibility word
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "ready" | "eligible" | "placed" => status.green().to_string(),
        "pending" | "degraded" => status.yellow().to_string(),
        "unhealthy" | "error" | "failed" | "ineligible" => status.red().to_string(),
        _ => status.to_string(),
    }
}
