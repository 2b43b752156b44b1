//! Output formatting: tables for humans, JSON for scripts.

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Render rows as a styled table or a JSON array.
pub fn print_rows<T: Tabled + Serialize>(format: OutputFormat, rows: &[T]) {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "(no rows)".dimmed());
                return;
            }
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{}", table);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(rows).unwrap_or_default());
        }
    }
}

/// Render one value as key/value lines or a JSON object.
pub fn print_detail<T: Serialize>(format: OutputFormat, value: &T) {
    match format {
        OutputFormat::Table => {
            let json = serde_json::to_value(value).unwrap_or_default();
            if let Some(object) = json.as_object() {
                for (key, val) in object {
                    let rendered = match val {
                        serde_json::Value::Null => "-".dimmed().to_string(),
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    println!("{:<36} {}", key.bold(), rendered);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
        }
    }
}

/// Color a batch or request state for terminal output.
pub fn colored_state(state: &str) -> String {
    match state {
        "delivered" | "done" => state.green().to_string(),
        "failed" | "delivery_failed" | "cancelled" => state.red().to_string(),
        "partially_delivered" | "expired" | "waiting_for_capacity" => {
            state.yellow().to_string()
        }
        _ => state.cyan().to_string(),
    }
}
