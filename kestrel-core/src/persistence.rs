//! Shared persistence utilities: atomic file writes, YAML/JSON load/save and success markers.
//!
//! Every artifact file is written to a `.tmp` sibling and renamed into place, so a reader
//! never sees a half-written file under its final name. Completeness of a whole directory
//! is signalled separately by the success marker.

use std::io;
use std::path::Path;

/// Name of the empty sentinel file that marks a directory as complete.
pub const SUCCESS_MARKER: &str = ".success";

/// Atomically write raw bytes to a file.
///
/// Writes to a `.tmp` sibling file, then renames to the target path.
/// Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomically write JSON data to a file.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write YAML data to a file.
pub fn atomic_write_yaml<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let yaml = serde_yaml::to_string(data).map_err(io::Error::other)?;
    atomic_write(path, yaml.as_bytes())
}

/// Load and deserialize YAML from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_yaml::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Make sure `dir` exists as a directory.
///
/// A regular file occupying the path is removed first. A stale success marker left by an
/// earlier write is deleted so the directory reads as incomplete until the new marker lands.
pub fn prepare_artifact_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() && !dir.is_dir() {
        std::fs::remove_file(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    let marker = dir.join(SUCCESS_MARKER);
    if marker.exists() {
        std::fs::remove_file(marker)?;
    }
    Ok(())
}

/// Write the empty success marker. Must be the last write into `dir`.
pub fn write_success_marker(dir: &Path) -> io::Result<()> {
    std::fs::write(dir.join(SUCCESS_MARKER), b"")
}

pub fn has_success_marker(dir: &Path) -> bool {
    dir.join(SUCCESS_MARKER).is_file()
}
