//! File and stdout handling for the CLI
//!
//! - Scripts: a single JSON document
//! - Storage parts: JSON lines, one part per line
//! - Output: a single JSON object on stdout

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde_json::Value;

use super::errors::{CliError, CliResult};
use crate::index::StoragePart;

/// Read a whole file as UTF-8 text
pub fn read_text(path: &Path) -> CliResult<String> {
    fs::read_to_string(path)
        .map_err(|e| CliError::io_error(format!("Failed to read {}: {}", path.display(), e)))
}

/// Read storage parts written by [`write_parts`]
pub fn read_parts(path: &Path) -> CliResult<Vec<StoragePart>> {
    let file = File::open(path)
        .map_err(|e| CliError::io_error(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut parts = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let part = StoragePart::from_json(&line).map_err(|e| {
            CliError::io_error(format!("Invalid storage part on line {}: {}", number + 1, e))
        })?;
        parts.push(part);
    }
    Ok(parts)
}

/// Write storage parts as JSON lines
pub fn write_parts(path: &Path, parts: &[StoragePart]) -> CliResult<()> {
    let file = File::create(path)
        .map_err(|e| CliError::io_error(format!("Failed to create {}: {}", path.display(), e)))?;
    let mut writer = BufWriter::new(file);
    for part in parts {
        writeln!(writer, "{}", part.to_json()?)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    let response = serde_json::json!({
        "status": "ok",
        "data": data
    });

    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, &response)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    let response = serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    });

    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, &response)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}
