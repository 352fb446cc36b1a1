//! Output formatting for CLI

use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Output format options
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "table" => OutputFormat::Table,
            _ => OutputFormat::Text,
        }
    }
}

/// Render a list of rows
pub fn format_rows<T: Serialize + Tabled>(rows: &[T], format: &str) -> String {
    match OutputFormat::from(format) {
        OutputFormat::Json => serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string()),
        OutputFormat::Table => Table::new(rows).with(Style::modern()).to_string(),
        OutputFormat::Text => Table::new(rows).with(Style::blank()).to_string(),
    }
}

/// Render a single record as `key: value` lines, or JSON
pub fn format_record<T: Serialize>(record: &T, format: &str) -> String {
    let value = serde_json::to_value(record).unwrap_or_default();
    match OutputFormat::from(format) {
        OutputFormat::Json => serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Table | OutputFormat::Text => match value {
            serde_json::Value::Object(fields) => fields
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => format!("{}: {}", k, s),
                    other => format!("{}: {}", k, other),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_string(),
        },
    }
}
