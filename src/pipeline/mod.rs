// Pipeline supervision - the fetch -> decode -> broadcast process chain
// One pipeline at a time, owned by a single supervisor task

pub mod stage;      // spawning, byte relays, teardown of the external processes
pub mod supervisor; // state machine, restart/backoff policy, operator commands

pub use stage::{StageFault, StagePlan};
pub use supervisor::{PipelineSettings, PipelineSupervisor};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::Station;

/// The three processes of a broadcast, in launch order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Fetch,
    Decode,
    Broadcast,
}

impl StageKind {
    /// Launch order: producers before consumers
    pub const LAUNCH_ORDER: [StageKind; 3] = [StageKind::Fetch, StageKind::Decode, StageKind::Broadcast];
    /// Teardown order: never leave a consumer fed by a dead producer
    pub const TEARDOWN_ORDER: [StageKind; 3] = [StageKind::Broadcast, StageKind::Decode, StageKind::Fetch];

    pub fn index(self) -> usize {
        match self {
            StageKind::Fetch => 0,
            StageKind::Decode => 1,
            StageKind::Broadcast => 2,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Fetch => "fetch",
            StageKind::Decode => "decode",
            StageKind::Broadcast => "broadcast",
        };
        f.write_str(name)
    }
}

/// Supervisor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Idle,
    Starting,
    Live,
    Recovering,
    Stopping,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The one pipeline the supervisor owns. Never leaves the supervisor task.
#[derive(Debug, Clone)]
pub struct PipelineInstance {
    pub station: Station, // snapshot taken at start, registry edits don't leak in
    pub frequency: f64,
    pub stage: PipelineStage,
    pub run_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

impl PipelineInstance {
    pub fn new(station: Station, frequency: f64) -> Self {
        Self {
            station,
            frequency,
            stage: PipelineStage::Starting,
            run_id: Uuid::new_v4(),
            started_at: None,
            failure_count: 0,
            last_error: None,
        }
    }
}

/// Read-only snapshot handed to anyone who asks
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub stage: PipelineStage,
    pub station_id: Option<String>,
    pub station_name: Option<String>,
    pub source_url: Option<String>,
    pub frequency: Option<f64>,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    /// Wall-clock time of the next automatic relaunch, while `Recovering`
    pub retry_at: Option<DateTime<Utc>>,
}

impl PipelineStatus {
    pub fn idle() -> Self {
        Self {
            stage: PipelineStage::Idle,
            station_id: None,
            station_name: None,
            source_url: None,
            frequency: None,
            run_id: None,
            started_at: None,
            failure_count: 0,
            last_error: None,
            retry_at: None,
        }
    }

    pub fn from_instance(instance: &PipelineInstance, retry_at: Option<DateTime<Utc>>) -> Self {
        Self {
            stage: instance.stage,
            station_id: Some(instance.station.id.clone()),
            station_name: Some(instance.station.name.clone()),
            source_url: Some(instance.station.source_url.clone()),
            frequency: Some(instance.frequency),
            run_id: Some(instance.run_id),
            started_at: instance.started_at,
            failure_count: instance.failure_count,
            last_error: instance.last_error.clone(),
            retry_at,
        }
    }

    pub fn is_live(&self) -> bool {
        self.stage == PipelineStage::Live
    }
}

/// Lifecycle trace, published on a broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PipelineEvent {
    StageLaunched {
        stage: StageKind,
        station_id: String,
    },
    StageExited {
        stage: StageKind,
        station_id: String,
        outcome: String,
    },
    PipelineStarted {
        station_id: String,
        run_id: Uuid,
    },
    PipelineRecovering {
        station_id: String,
        failure_count: u32,
        backoff_ms: u64,
        reason: String,
    },
    PipelineStopped {
        station_id: String,
    },
}
