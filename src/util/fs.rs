use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Recursively ensure a directory exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

/// Write a string to an existing file (no parent creation; cgroup control
/// files must never be created by us).
pub fn write_str(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .with_context(|| format!("failed to write '{contents}' to {}", path.display()))
}
