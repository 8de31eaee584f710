// Station registry - the catalog of streams we can put on air, plus which one
// to resume after a reboot. Pure data, every mutation hits disk before returning.

pub mod store;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::error::RegistryError;
use store::RegistryDocument;

pub const DEFAULT_STATION_ID: &str = "default";
pub const DEFAULT_STATION_NAME: &str = "Dance UK";
pub const DEFAULT_STREAM_URL: &str = "http://51.89.148.171:8022/";

// FM broadcast band, MHz
const MIN_FREQUENCY: f64 = 76.0;
const MAX_FREQUENCY: f64 = 108.0;

/// A single stream the rebroadcaster knows how to play
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: String,
    pub name: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_override: Option<f64>,
}

impl Station {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_url: source_url.into(),
            frequency_override: None,
        }
    }

    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency_override = Some(frequency);
        self
    }

    /// The always-present fallback station
    pub fn default_station() -> Self {
        Self::new(DEFAULT_STATION_ID, DEFAULT_STATION_NAME, DEFAULT_STREAM_URL)
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_STATION_ID
    }

    /// Frequency to broadcast on, falling back to the process-wide default
    pub fn frequency_or(&self, default_frequency: f64) -> f64 {
        self.frequency_override.unwrap_or(default_frequency)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::InvalidStation("station id is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidStation(format!("station '{}' has no name", self.id)));
        }
        if self.source_url.trim().is_empty() {
            return Err(RegistryError::InvalidStation(format!("station '{}' has no stream URL", self.id)));
        }

        let url = Url::parse(self.source_url.trim()).map_err(|e| {
            RegistryError::InvalidStation(format!("stream URL '{}' is malformed: {}", self.source_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(RegistryError::InvalidStation(format!(
                "stream URL '{}' must be an http(s) address",
                self.source_url
            )));
        }

        if let Some(freq) = self.frequency_override {
            if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&freq) {
                return Err(RegistryError::InvalidStation(format!(
                    "frequency {:.1} MHz is outside the FM band",
                    freq
                )));
            }
        }

        Ok(())
    }
}

/// In-memory view of the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryState {
    stations: Vec<Station>,
    selected_station_id: String,
}

impl RegistryState {
    /// Fresh install: just the default station, selected
    pub fn seeded() -> Self {
        Self {
            stations: vec![Station::default_station()],
            selected_station_id: DEFAULT_STATION_ID.to_string(),
        }
    }

    /// Repair whatever came off disk so the invariants hold
    fn from_document(document: RegistryDocument) -> Self {
        let mut stations: Vec<Station> = Vec::with_capacity(document.stations.len() + 1);
        for station in document.stations {
            if stations.iter().any(|s| s.id == station.id) {
                warn!("Dropping duplicate station id '{}'", station.id);
                continue;
            }
            stations.push(station);
        }

        // default station always exists and always leads the list
        match stations.iter().position(|s| s.is_default()) {
            Some(0) => {}
            Some(pos) => {
                let default = stations.remove(pos);
                stations.insert(0, default);
            }
            None => stations.insert(0, Station::default_station()),
        }

        let mut state = Self {
            stations,
            selected_station_id: document.selected_station_id,
        };
        if state.find(&state.selected_station_id).is_none() {
            warn!(
                "Selected station '{}' no longer exists, falling back to default",
                state.selected_station_id
            );
            state.selected_station_id = DEFAULT_STATION_ID.to_string();
        }
        state
    }

    fn to_document(&self) -> RegistryDocument {
        RegistryDocument {
            stations: self.stations.clone(),
            selected_station_id: self.selected_station_id.clone(),
        }
    }

    fn find(&self, id: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.id == id)
    }

    pub fn selected_station_id(&self) -> &str {
        &self.selected_station_id
    }
}

/// Durable station catalog backed by a JSON file
#[derive(Debug)]
pub struct StationRegistry {
    path: PathBuf,
    state: RegistryState,
}

impl StationRegistry {
    /// Load persisted state. A missing file means a fresh install.
    ///
    /// Fails with [`RegistryError::CorruptRegistry`] when the file can't be parsed;
    /// callers fall back to [`StationRegistry::with_defaults`].
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let state = match store::read_document(&path)? {
            Some(document) => RegistryState::from_document(document),
            None => {
                info!("No station registry at {}, starting fresh", path.display());
                RegistryState::seeded()
            }
        };

        info!("Loaded {} stations from {}", state.stations.len(), path.display());
        Ok(Self { path, state })
    }

    /// A registry holding only the default station, not yet written to disk
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RegistryState::seeded(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    /// Stations in display order, default first. Never empty.
    pub fn list(&self) -> &[Station] {
        &self.state.stations
    }

    pub fn get(&self, id: &str) -> Result<&Station, RegistryError> {
        self.state
            .find(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// The station to resume on boot
    pub fn selected(&self) -> &Station {
        self.state
            .find(&self.state.selected_station_id)
            .unwrap_or(&self.state.stations[0])
    }

    /// Insert a new station or replace the one with the same id
    pub fn upsert(&mut self, mut station: Station) -> Result<(), RegistryError> {
        station.id = station.id.trim().to_string();
        station.name = station.name.trim().to_string();
        station.source_url = station.source_url.trim().to_string();
        station.validate()?;

        let mut next = self.state.clone();
        match next.stations.iter_mut().find(|s| s.id == station.id) {
            Some(existing) => *existing = station.clone(),
            None => next.stations.push(station.clone()),
        }
        self.commit(next)?;

        info!("Saved station '{}' ({})", station.id, station.source_url);
        Ok(())
    }

    /// Remove a station; the default station is protected
    pub fn remove(&mut self, id: &str) -> Result<Station, RegistryError> {
        if id == DEFAULT_STATION_ID {
            return Err(RegistryError::ProtectedStation(id.to_string()));
        }

        let mut next = self.state.clone();
        let pos = next
            .stations
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let removed = next.stations.remove(pos);
        if next.selected_station_id == id {
            info!("Removed station '{}' was selected, selecting default", id);
            next.selected_station_id = DEFAULT_STATION_ID.to_string();
        }
        self.commit(next)?;

        info!("Removed station '{}'", id);
        Ok(removed)
    }

    /// Record the station to resume on the next boot
    pub fn select(&mut self, id: &str) -> Result<&Station, RegistryError> {
        if self.state.find(id).is_none() {
            return Err(RegistryError::NotFound(id.to_string()));
        }

        let mut next = self.state.clone();
        next.selected_station_id = id.to_string();
        self.commit(next)?;

        self.get(id)
    }

    /// Write the current state out, used after falling back to defaults
    pub fn persist(&self) -> Result<(), RegistryError> {
        store::write_document(&self.path, &self.state.to_document())?;
        Ok(())
    }

    // disk first, memory second: a failed write leaves both untouched
    fn commit(&mut self, next: RegistryState) -> Result<(), RegistryError> {
        store::write_document(&self.path, &next.to_document())?;
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn registry_in(dir: &tempfile::TempDir) -> StationRegistry {
        StationRegistry::load(dir.path().join("stations.json")).unwrap()
    }

    #[test]
    fn test_fresh_install_has_default() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);

        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].name, DEFAULT_STATION_NAME);
        assert_eq!(registry.selected().id, DEFAULT_STATION_ID);
    }

    #[test]
    fn test_default_station_is_protected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(&dir);
        registry.upsert(Station::new("jazz", "Jazz FM", "http://jazz.example/stream")).unwrap();

        let err = registry.remove(DEFAULT_STATION_ID).unwrap_err();
        assert!(matches!(err, RegistryError::ProtectedStation(_)));
        assert!(registry.get(DEFAULT_STATION_ID).is_ok());

        // editing it is fine
        let mut edited = Station::default_station();
        edited.name = "Dance UK (edited)".to_string();
        registry.upsert(edited).unwrap();
        assert_eq!(registry.get(DEFAULT_STATION_ID).unwrap().name, "Dance UK (edited)");
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_upsert_rejects_bad_urls() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(&dir);

        for url in ["", "   ", "not a url", "ftp://example.com/stream", "http://"] {
            let err = registry.upsert(Station::new("bad", "Bad", url)).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidStation(_)), "accepted {:?}", url);
        }

        let err = registry
            .upsert(Station::new("far", "Far", "http://far.example/").with_frequency(150.0))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidStation(_)));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(&dir);
        registry.upsert(Station::new("jazz", "Jazz", "http://jazz.example/a")).unwrap();
        registry.upsert(Station::new("rock", "Rock", "http://rock.example/")).unwrap();
        registry.upsert(Station::new("jazz", "Jazz FM", "http://jazz.example/b")).unwrap();

        let ids: Vec<&str> = registry.list().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["default", "jazz", "rock"]);
        assert_eq!(registry.get("jazz").unwrap().source_url, "http://jazz.example/b");
    }

    #[test]
    fn test_removing_selected_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(&dir);
        registry.upsert(Station::new("jazz", "Jazz", "http://jazz.example/")).unwrap();
        registry.select("jazz").unwrap();

        registry.remove("jazz").unwrap();
        assert_eq!(registry.selected().id, DEFAULT_STATION_ID);

        let reloaded = registry_in(&dir);
        assert_eq!(reloaded.state().selected_station_id(), DEFAULT_STATION_ID);
        assert!(matches!(reloaded.get("jazz"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_select_unknown_station() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(&dir);
        assert!(matches!(registry.select("nope"), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.remove("nope"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_mutations_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(&dir);
        registry
            .upsert(Station::new("jazz", "Jazz", "http://jazz.example/").with_frequency(94.5))
            .unwrap();
        registry.select("jazz").unwrap();

        let reloaded = registry_in(&dir);
        assert_eq!(reloaded.state(), registry.state());
        assert_eq!(reloaded.get("jazz").unwrap().frequency_override, Some(94.5));
    }

    #[test]
    fn test_document_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.json");
        fs::write(
            &path,
            r#"{"stations":[{"id":"default","name":"Dance UK","sourceUrl":"http://a/stream"}],"selectedStationId":"default"}"#,
        )
        .unwrap();

        let mut registry = StationRegistry::load(&path).unwrap();
        assert_eq!(registry.path(), path.as_path());
        assert_eq!(registry.selected().source_url, "http://a/stream");

        registry.upsert(Station::new("jazz", "Jazz", "http://jazz.example/")).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["selectedStationId"], "default");
        assert_eq!(raw["stations"][1]["sourceUrl"], "http://jazz.example/");
        assert!(raw["stations"][1].get("frequencyOverride").is_none());
    }

    #[test]
    fn test_load_repairs_missing_default_and_dangling_selection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.json");
        fs::write(
            &path,
            r#"{"stations":[{"id":"jazz","name":"Jazz","sourceUrl":"http://jazz.example/"}],"selectedStationId":"gone"}"#,
        )
        .unwrap();

        let registry = StationRegistry::load(&path).unwrap();
        assert_eq!(registry.list()[0].id, DEFAULT_STATION_ID);
        assert_eq!(registry.list()[1].id, "jazz");
        assert_eq!(registry.selected().id, DEFAULT_STATION_ID);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.json");
        fs::write(&path, "{ this is not json").unwrap();

        let err = StationRegistry::load(&path).unwrap_err();
        assert!(matches!(err, RegistryError::CorruptRegistry { .. }));

        let fallback = StationRegistry::with_defaults(&path);
        assert_eq!(fallback.list().len(), 1);
    }
}
