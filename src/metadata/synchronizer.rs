// Metadata synchronizer - keeps the transmitter's RDS text in step with the
// live pipeline. Entirely best-effort: nothing here can fail a broadcast.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rds::{format_rt, RdsCommand, RdsSink};
use super::{MetadataProvider, MetadataSnapshot, TrackInfo, TrackSource};
use crate::config::MetadataConfig;
use crate::pipeline::PipelineStatus;

/// The RDS text we want on air versus what we know the transmitter has
#[derive(Debug, Default)]
struct RdsText {
    wanted_ps: Option<String>,
    wanted_rt: Option<String>,
    sent_ps: Option<String>,
    sent_rt: Option<String>,
}

/// One live run as the synchronizer sees it
struct Attached {
    run_id: Uuid,
    station_name: String,
    source: Option<Box<dyn TrackSource>>,
}

pub struct MetadataSynchronizer {
    pipeline: watch::Receiver<PipelineStatus>,
    sink: Box<dyn RdsSink>,
    provider: Arc<dyn MetadataProvider>,
    poll_interval: Duration,
    default_ps: String,
    default_rt: String,

    snapshot: watch::Sender<Option<MetadataSnapshot>>,
    refresh: Arc<Notify>,
    attached: Option<Attached>,
    text: RdsText,
}

/// Handle to a running synchronizer. Dropping it stops the task.
pub struct MetadataHandle {
    snapshot: watch::Receiver<Option<MetadataSnapshot>>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl MetadataHandle {
    pub fn latest(&self) -> Option<MetadataSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MetadataSnapshot>> {
        self.snapshot.clone()
    }

    /// Poll the track source and resend anything outstanding now instead of
    /// at the next tick
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }
}

impl Drop for MetadataHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MetadataSynchronizer {
    pub fn new(
        pipeline: watch::Receiver<PipelineStatus>,
        sink: Box<dyn RdsSink>,
        provider: Arc<dyn MetadataProvider>,
        config: &MetadataConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            pipeline,
            sink,
            provider,
            poll_interval: config.poll_interval(),
            default_ps: config.default_ps.clone(),
            default_rt: config.default_rt.clone(),
            snapshot,
            refresh: Arc::new(Notify::new()),
            attached: None,
            text: RdsText::default(),
        }
    }

    pub fn spawn(self) -> MetadataHandle {
        let snapshot = self.snapshot.subscribe();
        let refresh = self.refresh.clone();
        let task = tokio::spawn(self.run());
        MetadataHandle {
            snapshot,
            refresh,
            task,
        }
    }

    async fn run(mut self) {
        let refresh = self.refresh.clone();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let initial = self.pipeline.borrow_and_update().clone();
        self.on_pipeline(&initial);

        loop {
            tokio::select! {
                changed = self.pipeline.changed() => {
                    if changed.is_err() {
                        debug!("Pipeline supervisor gone, metadata synchronizer exiting");
                        break;
                    }
                    let status = self.pipeline.borrow_and_update().clone();
                    self.on_pipeline(&status);
                }
                _ = ticker.tick() => self.on_tick(),
                _ = refresh.notified() => {
                    debug!("Metadata refresh requested");
                    self.on_tick();
                }
            }
        }
    }

    /// Follow the pipeline: attach on a new live run, reset on anything else
    fn on_pipeline(&mut self, status: &PipelineStatus) {
        let current_run = self.attached.as_ref().map(|a| a.run_id);

        if status.is_live() && status.run_id.is_some() && status.run_id == current_run {
            return;
        }
        if current_run.is_some() {
            self.detach();
        }
        if status.is_live() {
            if let Some(run_id) = status.run_id {
                self.attach(run_id, status);
            }
        }
        self.flush();
    }

    fn attach(&mut self, run_id: Uuid, status: &PipelineStatus) {
        let station_name = status.station_name.clone().unwrap_or_default();
        let source = status
            .source_url
            .as_deref()
            .and_then(|url| self.provider.attach(url));
        debug!(
            "Metadata attached to '{}' run {} ({})",
            station_name,
            run_id,
            if source.is_some() { "track source" } else { "station name only" }
        );

        self.attached = Some(Attached {
            run_id,
            station_name,
            source,
        });
        self.recompute();
    }

    /// Back to the neutral text, forget the run and its snapshot
    fn detach(&mut self) {
        if let Some(old) = self.attached.take() {
            debug!("Metadata detached from run {}", old.run_id);
        }
        self.text.wanted_ps = Some(self.default_ps.clone());
        self.text.wanted_rt = Some(self.default_rt.clone());
        self.snapshot.send_replace(None);
    }

    fn on_tick(&mut self) {
        self.recompute();
        self.flush();
    }

    /// Recompute the snapshot and wanted text for the attached run
    fn recompute(&mut self) {
        let Some(attached) = &self.attached else {
            return;
        };

        let track = attached
            .source
            .as_ref()
            .and_then(|s| s.latest())
            .unwrap_or_default();
        let ps = RdsCommand::program_service(&attached.station_name, &self.default_ps);
        let rt = RdsCommand::radio_text(&format_rt(
            &attached.station_name,
            track.title.as_deref(),
            track.artist.as_deref(),
        ));
        let station_name = attached.station_name.clone();

        self.text.wanted_ps = Some(command_text(ps));
        self.text.wanted_rt = Some(command_text(rt));
        publish_snapshot(&self.snapshot, station_name, track);
    }

    /// Send whatever differs from what the transmitter already has.
    /// Failures leave the field dirty so the next tick tries again.
    fn flush(&mut self) {
        let text = &mut self.text;

        if let Some(ps) = dirty(&text.wanted_ps, &text.sent_ps) {
            match self.sink.send(&RdsCommand::ProgramService(ps.clone())) {
                Ok(()) => text.sent_ps = Some(ps),
                Err(e) => warn!("RDS PS update failed, will retry: {}", e),
            }
        }

        if let Some(rt) = dirty(&text.wanted_rt, &text.sent_rt) {
            match self.sink.send(&RdsCommand::RadioText(rt.clone())) {
                Ok(()) => {
                    info!("RDS text: {}", rt);
                    text.sent_rt = Some(rt);
                }
                Err(e) => warn!("RDS RT update failed, will retry: {}", e),
            }
        }
    }
}

fn dirty(wanted: &Option<String>, sent: &Option<String>) -> Option<String> {
    match wanted {
        Some(w) if sent.as_ref() != Some(w) => Some(w.clone()),
        _ => None,
    }
}

fn command_text(command: RdsCommand) -> String {
    match command {
        RdsCommand::ProgramService(text) | RdsCommand::RadioText(text) => text,
    }
}

fn publish_snapshot(
    snapshot: &watch::Sender<Option<MetadataSnapshot>>,
    station_name: String,
    track: TrackInfo,
) {
    snapshot.send_if_modified(|current| {
        let unchanged = current.as_ref().is_some_and(|s| {
            s.station_name == station_name && s.track_title == track.title && s.track_artist == track.artist
        });
        if unchanged {
            return false;
        }
        *current = Some(MetadataSnapshot {
            station_name,
            track_title: track.title,
            track_artist: track.artist,
            observed_at: Utc::now(),
        });
        true
    });
}
