//! Display utilities for the ccidadm CLI

use colored::Colorize;
use std::fmt::Display;

/// A formatted section title
pub struct SectionTitle(pub &'static str);

impl Display for SectionTitle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\n{}", self.0.bold().underline())
    }
}

/// Format a section header
pub fn section_title(title: &'static str) -> SectionTitle {
    SectionTitle(title)
}

/// Format a success message
pub fn success(message: &str) -> String {
    format!("✅ {}", message.green().bold())
}

/// Format a warning message
pub fn warning(message: &str) -> String {
    format!("⚠️  {}", message.yellow().bold())
}

/// Format a key-value section
pub fn key_value_box(title: &str, items: Vec<(&str, String)>) -> String {
    let mut result = format!("{}", title.bold().underline());

    for (key, value) in items {
        result.push_str(&format!("\n  {}: {}", key.bold(), value));
    }

    result
}

/// Hex with spaces between bytes
pub fn hex_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "(none)".dimmed().to_string();
    }
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Optional value or a dimmed placeholder
pub fn optional<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "absent".dimmed().to_string(), |v| v.to_string())
}

/// Parse hex input, tolerating spaces and colons
pub fn parse_hex(input: &str) -> eyre::Result<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(cleaned.trim_start_matches("0x"))
        .map_err(|e| eyre::eyre!("Invalid hex input: {e}"))
}
