// Broadcast controller - the operator-facing facade. Owns the station registry,
// turns operator intents into supervisor commands, and reports merged status.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{BroadcastError, PipelineError, RegistryError};
use crate::metadata::{MetadataHandle, MetadataSnapshot};
use crate::pipeline::{PipelineEvent, PipelineStage, PipelineStatus, PipelineSupervisor};
use crate::registry::{store, Station, StationRegistry};

/// What `status()` hands back: pipeline state plus whatever we know is playing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStatus {
    pub pipeline: PipelineStatus,
    pub metadata: Option<MetadataSnapshot>,
}

pub struct BroadcastController {
    registry: Mutex<StationRegistry>,
    supervisor: PipelineSupervisor,
    metadata: MetadataHandle,
    intent: Mutex<()>, // one select/stop at a time
}

impl BroadcastController {
    /// Boot: load the registry (or recover from a corrupt one), then put the
    /// selected station on air. A failed first launch is logged, not fatal;
    /// the supervisor keeps retrying in the background.
    pub async fn on_startup(
        registry_path: impl Into<PathBuf>,
        supervisor: PipelineSupervisor,
        metadata: MetadataHandle,
    ) -> Self {
        let registry = load_registry(registry_path.into());
        let station = registry.selected().clone();

        info!("Resuming '{}' ({})", station.name, station.id);
        match supervisor.start(station).await {
            Ok(status) => info!("Boot broadcast live on {:?} MHz", status.frequency),
            Err(e) => warn!("Boot broadcast did not come up yet: {}", e),
        }

        Self {
            registry: Mutex::new(registry),
            supervisor,
            metadata,
            intent: Mutex::new(()),
        }
    }

    /// Make `id` the selected station and put it on air
    pub async fn select_station(&self, id: &str) -> Result<PipelineStatus, BroadcastError> {
        let _intent = self.intent.try_lock().map_err(|_| PipelineError::Busy)?;

        let station = {
            let mut registry = self.registry.lock().await;
            registry.select(id)?.clone()
        };

        let status = if self.supervisor.current_state().stage == PipelineStage::Idle {
            self.supervisor.start(station).await?
        } else {
            self.supervisor.switch_to(station).await?
        };
        Ok(status)
    }

    pub async fn stop_broadcast(&self) -> Result<PipelineStatus, BroadcastError> {
        let _intent = self.intent.try_lock().map_err(|_| PipelineError::Busy)?;
        Ok(self.supervisor.stop().await?)
    }

    pub fn status(&self) -> BroadcastStatus {
        BroadcastStatus {
            pipeline: self.supervisor.current_state(),
            metadata: self.metadata.latest(),
        }
    }

    /// Re-read track info and push any pending RDS text right away
    pub fn refresh_metadata(&self) {
        self.metadata.refresh();
    }

    pub async fn list_stations(&self) -> Vec<Station> {
        self.registry.lock().await.list().to_vec()
    }

    /// Add or edit a station. A live pipeline keeps its snapshot until restarted.
    pub async fn save_station(&self, station: Station) -> Result<(), BroadcastError> {
        self.registry.lock().await.upsert(station)?;
        Ok(())
    }

    pub async fn remove_station(&self, id: &str) -> Result<Station, BroadcastError> {
        Ok(self.registry.lock().await.remove(id)?)
    }

    /// Lifecycle trace of the pipeline, for logging or a control surface
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.supervisor.subscribe()
    }
}

fn load_registry(path: PathBuf) -> StationRegistry {
    match StationRegistry::load(&path) {
        Ok(registry) => registry,
        Err(RegistryError::CorruptRegistry { path, source }) => {
            error!("Station registry {} is corrupt: {}", path.display(), source);
            match store::quarantine(&path) {
                Ok(moved) => warn!("Moved unreadable registry to {}", moved.display()),
                Err(e) => warn!("Could not move unreadable registry aside: {}", e),
            }

            let registry = StationRegistry::with_defaults(path);
            if let Err(e) = registry.persist() {
                warn!("Could not write fresh registry: {}", e);
            }
            registry
        }
        Err(e) => {
            // leave the file alone, it may be fine once the disk is
            error!("Could not read station registry, using defaults: {}", e);
            StationRegistry::with_defaults(path)
        }
    }
}
