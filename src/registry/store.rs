use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Station;
use crate::error::RegistryError;

/// On-disk shape of the registry, camelCase to match what the web UI writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    pub stations: Vec<Station>,
    pub selected_station_id: String,
}

/// Read the document, `Ok(None)` when the file does not exist yet (fresh install)
pub fn read_document(path: &Path) -> Result<Option<RegistryDocument>, RegistryError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RegistryError::Storage(e)),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| RegistryError::CorruptRegistry {
            path: path.to_path_buf(),
            source,
        })
}

/// Write to a sibling temp file and rename over the target, so a crash
/// mid-write leaves the previous copy intact
pub fn write_document(path: &Path, document: &RegistryDocument) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut json = serde_json::to_string_pretty(document)?;
    json.push('\n');

    let tmp = temp_path(path);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    debug!("Persisted {} stations to {}", document.stations.len(), path.display());
    Ok(())
}

/// Move an unreadable registry out of the way so the defaults don't clobber it
pub fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let mut target = path.as_os_str().to_owned();
    target.push(".corrupt");
    let target = PathBuf::from(target);
    fs::rename(path, &target)?;
    Ok(target)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
