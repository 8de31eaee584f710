// fmrelay - keeps one internet radio stream on air through an FM/RDS
// transmitter, restarting whatever breaks and keeping the RDS text current

pub mod config;     // TOML settings: stage commands, timings, defaults
pub mod controller; // operator facade: select, stop, status, catalog edits
pub mod error;      // error taxonomy shared by every layer
pub mod logging;    // tracing subscriber setup
pub mod metadata;   // now-playing text and the RDS control channel
pub mod pipeline;   // fetch -> decode -> broadcast processes and their supervisor
pub mod registry;   // persisted station catalog

// The surface the binary (and anything embedding us) actually uses
pub use config::Config;
pub use controller::{BroadcastController, BroadcastStatus};
pub use error::{BroadcastError, PipelineError, RegistryError};
pub use pipeline::{PipelineEvent, PipelineSettings, PipelineStage, PipelineStatus, PipelineSupervisor};
pub use registry::{Station, StationRegistry};
