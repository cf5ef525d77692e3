//! Append-only JSONL ledgers.
//!
//! Each subsystem writes one JSON object per line. Ledgers are never rewritten; derived
//! state is rebuilt by reading them back in order.

use crate::core::error;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), error::RouterError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(error::RouterError::IoError)?;
    }
    let line = serde_json::to_string(value)?;
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(error::RouterError::IoError)?;
    writeln!(f, "{}", line).map_err(error::RouterError::IoError)?;
    Ok(())
}

/// Append several records with a single write, so a failure never leaves a partial run.
pub fn append_jsonl_all<T: Serialize>(
    path: &Path,
    values: &[T],
) -> Result<(), error::RouterError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(error::RouterError::IoError)?;
    }
    let mut buf = String::new();
    for value in values {
        buf.push_str(&serde_json::to_string(value)?);
        buf.push('\n');
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(error::RouterError::IoError)?;
    f.write_all(buf.as_bytes()).map_err(error::RouterError::IoError)?;
    Ok(())
}

pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, error::RouterError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).map_err(error::RouterError::IoError)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(error::RouterError::IoError)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).map_err(|e| {
            error::RouterError::ValidationError(format!(
                "corrupt ledger {} line {}: {}",
                path.display(),
                idx + 1,
                e
            ))
        })?;
        out.push(value);
    }
    Ok(out)
}
