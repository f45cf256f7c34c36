//! Crash-safe JSON persistence.
//!
//! Writes go to a sibling temp file named after the process id, are synced
//! to disk, and then renamed over the target, so readers only ever observe
//! the previous or the next complete document.

use crate::{Result, TetherError};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process;
use tracing::{debug, warn};

/// Read and parse a JSON file. `None` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(TetherError::Io {
                message: format!("Failed to read {}", path.display()),
                path: Some(path.to_path_buf()),
                source: Some(e),
            })
        }
    };

    let data = serde_json::from_str(&contents).map_err(|e| TetherError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;
    Ok(Some(data))
}

/// Replace `path` with the JSON encoding of `data`.
pub fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| TetherError::io_with_path(e, parent))?;
        }
    }

    let serialized = serde_json::to_string_pretty(data).map_err(|e| TetherError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;

    let temp_path = path.with_extension(format!("json.{}.tmp", process::id()));
    let written = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(serialized.as_bytes())?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(TetherError::Io {
            message: format!("Failed to write temp file {}", temp_path.display()),
            path: Some(temp_path),
            source: Some(e),
        });
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        warn!("Failed to move {} into place: {}", temp_path.display(), e);
        let _ = fs::remove_file(&temp_path);
        return Err(TetherError::io_with_path(e, path));
    }

    debug!("Wrote {}", path.display());
    Ok(())
}
