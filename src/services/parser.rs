//! D-Bus service file parser
//!
//! Service files are desktop-entry style INI files. Only the
//! `[D-BUS Service]` section matters; everything else is skipped.

use std::collections::HashMap;
use std::path::Path;

/// Section holding the activation keys
pub const SERVICE_SECTION: &str = "D-BUS Service";

/// Flat key map of one section. Later duplicates win.
pub type ParsedSection = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing name in service file")]
    MissingName,
}

/// One parsed service file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFile {
    /// Well-known bus name (`Name=`)
    pub name: String,
    /// Reserved (`User=`), not acted upon
    pub user: Option<String>,
    /// systemd unit to activate (`SystemdService=`)
    pub systemd_service: Option<String>,
    /// Command line (`Exec=`), split on spaces
    pub exec: Option<Vec<String>>,
}

impl ServiceFile {
    /// Build from a parsed `[D-BUS Service]` section
    pub fn from_section(section: &ParsedSection) -> Result<Self, ServiceFileError> {
        let name = section
            .get("Name")
            .cloned()
            .ok_or(ServiceFileError::MissingName)?;

        Ok(Self {
            name,
            user: section.get("User").cloned(),
            systemd_service: section.get("SystemdService").cloned(),
            exec: section.get("Exec").map(|raw| split_list(raw)),
        })
    }
}

/// Extract the `[D-BUS Service]` section from file content
pub fn parse_section(content: &str, wanted: &str) -> ParsedSection {
    let mut entries = ParsedSection::new();
    let mut in_section = false;

    for line in content.lines().map(str::trim) {
        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            in_section = header.strip_suffix(']') == Some(wanted);
            continue;
        }

        if !in_section {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        entries.insert(key.trim().to_string(), value.trim_start().to_string());
    }

    entries
}

/// Load and parse a service file from disk
pub async fn load_service_file(path: &Path) -> Result<ServiceFile, ServiceFileError> {
    let content = tokio::fs::read_to_string(path).await?;
    ServiceFile::from_section(&parse_section(&content, SERVICE_SECTION))
}

/// Split a space separated list value, dropping empty fields
fn split_list(raw: &str) -> Vec<String> {
    raw.split(' ')
        .filter(|s| !s.is_empty())
        .map(unescape)
        .collect()
}

/// Resolve the key-file escapes `\s`, `\t`, `\n`, `\r` and `\\`
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}
