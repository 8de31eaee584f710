// Now-playing metadata - where track info comes from, how it becomes RDS text,
// and the periodic task that pushes it to the transmitter

#[cfg(feature = "icy")]
pub mod icy;          // ICY StreamTitle probe on a side connection
pub mod rds;          // PS/RT formatting and the control FIFO
pub mod synchronizer; // poll loop gated on the pipeline being live

pub use rds::{FifoSink, RdsCommand, RdsSink};
pub use synchronizer::{MetadataHandle, MetadataSynchronizer};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What we last knew about the stream. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSnapshot {
    pub station_name: String,
    pub track_title: Option<String>,
    pub track_artist: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// One observation from a track source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
}

impl TrackInfo {
    /// Split a raw stream title like "Artist - Title" on the first delimiter
    /// that appears in it. Without one, the whole string is the title.
    pub fn from_stream_title(raw: &str) -> Self {
        const DELIMITERS: [&str; 4] = [" - ", " \u{2013} ", " | ", " ~ "];

        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }

        let first = DELIMITERS
            .iter()
            .filter_map(|d| raw.find(d).map(|at| (at, d.len())))
            .min_by_key(|(at, _)| *at);

        if let Some((at, len)) = first {
            let artist = raw[..at].trim();
            let title = raw[at + len..].trim();
            if !artist.is_empty() && !title.is_empty() {
                return Self {
                    title: Some(title.to_string()),
                    artist: Some(artist.to_string()),
                };
            }
        }

        Self {
            title: Some(raw.to_string()),
            artist: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artist.is_none()
    }
}

/// Something that can be asked "what is playing now" while a pipeline runs
pub trait TrackSource: Send {
    fn latest(&self) -> Option<TrackInfo>;
}

/// Produces a track source for a stream, if it can. Absence is normal.
pub trait MetadataProvider: Send + Sync {
    fn attach(&self, source_url: &str) -> Option<Box<dyn TrackSource>>;
}

/// Provider for when nothing is configured: every snapshot is just the station
pub struct NoMetadata;

impl MetadataProvider for NoMetadata {
    fn attach(&self, _source_url: &str) -> Option<Box<dyn TrackSource>> {
        None
    }
}
