// Error taxonomy - registry problems, pipeline problems, and the union the
// controller hands back to whoever is driving it

use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::StageKind;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("station not found: {0}")]
    NotFound(String),

    #[error("invalid station: {0}")]
    InvalidStation(String),

    #[error("station '{0}' is protected and cannot be removed")]
    ProtectedStation(String),

    #[error("station registry {} is unreadable: {source}", path.display())]
    CorruptRegistry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist station registry: {0}")]
    Storage(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("a pipeline is already running")]
    AlreadyRunning,

    #[error("another pipeline operation is in progress")]
    Busy,

    #[error("pipeline failed to launch: {0}")]
    LaunchFailure(String),

    #[error("{stage} stage crashed: {reason}")]
    StageCrashed { stage: StageKind, reason: String },

    #[error("teardown did not finish within {0:?}; stages were killed")]
    SwitchTimeout(Duration),

    #[error("operation was superseded by a newer request")]
    Superseded,

    #[error("pipeline supervisor is no longer running")]
    SupervisorGone,
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl BroadcastError {
    pub fn is_busy(&self) -> bool {
        matches!(self, BroadcastError::Pipeline(PipelineError::Busy))
    }
}
