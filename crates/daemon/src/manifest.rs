//! Concat manifest generation.
//!
//! The concat demuxer reads one `file '<path>'` entry per line. Inside the quotes a
//! single quote cannot appear literally, so it is written as `'\''` (close, escaped
//! quote, reopen). Backslash separators are normalised to `/` so Windows-style paths
//! never introduce escape sequences. Control characters cannot be quoted at all and
//! are rejected.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Escape a path for use inside a quoted manifest entry.
pub fn escape_manifest_path(path: &str) -> String {
    path.replace('\\', "/").replace('\'', r"'\''")
}

/// Format one manifest entry for `path`.
pub fn manifest_line(path: &Path) -> String {
    format!("file '{}'", escape_manifest_path(&path.to_string_lossy()))
}

/// Parse one manifest entry back into the path it names.
///
/// Returns `None` for lines that are not `file '...'` entries.
pub fn parse_manifest_line(line: &str) -> Option<String> {
    let inner = line.trim_end().strip_prefix("file '")?.strip_suffix('\'')?;
    Some(inner.replace(r"'\''", "'"))
}

/// Resolve `path` against the current directory without requiring it to exist.
fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Write a fresh manifest listing `sources` in order, replacing any previous file.
pub fn write_manifest(manifest_path: &Path, sources: &[PathBuf]) -> io::Result<()> {
    if manifest_path.exists() {
        std::fs::remove_file(manifest_path)?;
    }
    if let Some(parent) = manifest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let entries = sources
        .iter()
        .map(|source| {
            let path = absolute(source);
            if path.to_string_lossy().chars().any(char::is_control) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("control character in manifest path {:?}", path),
                ));
            }
            Ok(manifest_line(&path))
        })
        .collect::<io::Result<Vec<_>>>()?;

    let mut file = std::fs::File::create(manifest_path)?;
    for entry in entries {
        writeln!(file, "{}", entry)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Read the paths listed in a manifest, skipping lines that are not entries.
pub fn read_manifest(manifest_path: &Path) -> io::Result<Vec<String>> {
    let content = std::fs::read_to_string(manifest_path)?;
    Ok(content.lines().filter_map(parse_manifest_line).collect())
}
