// Pipeline supervisor - a single task owns the one PipelineInstance and the
// processes behind it. Everyone else talks to it through PipelineSupervisor.

use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::stage::{PipelineSignal, RunningPipeline, StageFault, StagePlan};
use super::{PipelineEvent, PipelineInstance, PipelineStage, PipelineStatus, StageKind};
use crate::config::{Config, StagesConfig, SupervisorConfig};
use crate::error::PipelineError;
use crate::metadata::rds;
use crate::registry::Station;

type Reply = oneshot::Sender<Result<PipelineStatus, PipelineError>>;

/// Everything the supervisor needs to build and police a pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stages: StagesConfig,
    pub timing: SupervisorConfig,
    pub default_frequency: f64,
    pub control_fifo: PathBuf,
    pub nice: i32,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stages: config.stages.clone(),
            timing: config.supervisor.clone(),
            default_frequency: config.broadcast.default_frequency,
            control_fifo: config.broadcast.control_fifo.clone(),
            nice: config.broadcast.nice,
        }
    }
}

#[derive(Debug)]
enum Command {
    Start { station: Station, reply: Reply },
    SwitchTo { station: Station, reply: Reply },
    Stop { reply: Reply },
}

/// Handle to the supervisor task. Cheap to clone.
///
/// `start`, `switch_to` and `stop` are serialized: while one is in flight any
/// other fails with [`PipelineError::Busy`]. Automatic recovery is not an
/// operation in that sense, so an operator request always preempts a pending
/// retry or a relaunch that is still waiting for audio.
#[derive(Clone)]
pub struct PipelineSupervisor {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<PipelineStatus>,
    events: broadcast::Sender<PipelineEvent>,
    gate: Arc<Mutex<()>>,
}

impl PipelineSupervisor {
    /// Spawn the supervisor task on the current tokio runtime
    pub fn spawn(settings: PipelineSettings) -> Self {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(PipelineStatus::idle());
        let (event_tx, _) = broadcast::channel(256);

        let task = Supervisor {
            settings,
            commands: command_rx,
            state: state_tx,
            events: event_tx.clone(),
            instance: None,
            running: None,
            pending: None,
            retry_at: None,
            retry_due: None,
            ready_deadline: None,
            live_since: None,
        };
        tokio::spawn(task.run());

        Self {
            commands: command_tx,
            state: state_rx,
            events: event_tx,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Launch a pipeline for `station`. Fails with `AlreadyRunning` unless idle.
    ///
    /// Resolves once audio reaches the broadcast stage. A launch failure is
    /// returned to the caller but the supervisor keeps retrying in `Recovering`.
    pub async fn start(&self, station: Station) -> Result<PipelineStatus, PipelineError> {
        self.request(|reply| Command::Start { station, reply }).await
    }

    /// Tear the current pipeline down completely, then launch `station`
    pub async fn switch_to(&self, station: Station) -> Result<PipelineStatus, PipelineError> {
        self.request(|reply| Command::SwitchTo { station, reply }).await
    }

    /// Stop broadcasting. A no-op when already idle.
    pub async fn stop(&self) -> Result<PipelineStatus, PipelineError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub fn current_state(&self) -> PipelineStatus {
        self.state.borrow().clone()
    }

    /// Follow state changes (used by the metadata synchronizer)
    pub fn watch_state(&self) -> watch::Receiver<PipelineStatus> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    async fn request<F>(&self, make: F) -> Result<PipelineStatus, PipelineError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let _permit = self.gate.try_lock().map_err(|_| PipelineError::Busy)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| PipelineError::SupervisorGone)?;
        reply_rx.await.map_err(|_| PipelineError::SupervisorGone)?
    }
}

struct Supervisor {
    settings: PipelineSettings,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<PipelineStatus>,
    events: broadcast::Sender<PipelineEvent>,

    instance: Option<PipelineInstance>,
    running: Option<RunningPipeline>,
    pending: Option<Reply>, // operator waiting for Starting to resolve
    retry_at: Option<Instant>,
    retry_due: Option<DateTime<Utc>>, // retry_at on the wall clock, for status
    ready_deadline: Option<Instant>,
    live_since: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self) {
        info!("Pipeline supervisor started");

        loop {
            let retry_at = self.retry_at;
            let ready_deadline = self.ready_deadline;
            let stable_at = self.stable_at();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                signal = next_signal(&mut self.running) => match signal {
                    PipelineSignal::Ready => self.on_ready(),
                    PipelineSignal::Fault(fault) => self.on_fault(fault).await,
                },
                _ = sleep_until_opt(ready_deadline) => self.on_ready_timeout().await,
                _ = sleep_until_opt(retry_at) => self.relaunch().await,
                _ = sleep_until_opt(stable_at) => self.on_stable(),
            }
        }

        info!("All supervisor handles dropped, shutting the pipeline down");
        if self.instance.is_some() {
            self.stop_pipeline().await;
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { station, reply } => {
                if self.instance.is_some() {
                    let _ = reply.send(Err(PipelineError::AlreadyRunning));
                    return;
                }
                self.begin(station, Some(reply)).await;
            }
            Command::SwitchTo { station, reply } => {
                self.supersede_pending();
                if let Err(e) = self.teardown_for_switch().await {
                    self.recover_after_forced_switch(station, e.clone());
                    let _ = reply.send(Err(e));
                    return;
                }
                self.begin(station, Some(reply)).await;
            }
            Command::Stop { reply } => {
                self.supersede_pending();
                if self.instance.is_some() {
                    self.stop_pipeline().await;
                } else {
                    debug!("Stop requested while idle, nothing to do");
                }
                let _ = reply.send(Ok(self.status()));
            }
        }
    }

    /// Fresh instance for `station`, then launch it
    async fn begin(&mut self, station: Station, reply: Option<Reply>) {
        let frequency = station.frequency_or(self.settings.default_frequency);
        info!("Starting '{}' on {:.1} MHz ({})", station.name, frequency, station.source_url);
        self.instance = Some(PipelineInstance::new(station, frequency));
        self.launch(reply).await;
    }

    /// Spawn fetch, decode and broadcast for the current instance
    async fn launch(&mut self, reply: Option<Reply>) {
        self.cancel_retry();
        self.pending = reply;

        let Some(instance) = self.instance.as_mut() else {
            return;
        };
        instance.stage = PipelineStage::Starting;
        instance.run_id = Uuid::new_v4();
        instance.started_at = None;
        let station = instance.station.clone();
        let frequency = instance.frequency;
        self.publish();

        if let Err(e) = rds::ensure_fifo(&self.settings.control_fifo) {
            warn!(
                "Could not prepare RDS control FIFO {}: {}",
                self.settings.control_fifo.display(),
                e
            );
        }

        let plans = StagePlan::for_station(&self.settings.stages, &station, frequency, &self.settings.control_fifo);
        let mut running = RunningPipeline::default();
        for plan in &plans {
            if let Err(e) = running.spawn(plan, self.settings.nice) {
                self.running = Some(running);
                let reason = format!("could not start {} stage ({}): {}", plan.kind, plan.program, e);
                self.fail(PipelineError::LaunchFailure(reason)).await;
                return;
            }
            self.emit(PipelineEvent::StageLaunched {
                stage: plan.kind,
                station_id: station.id.clone(),
            });
        }

        running.connect(self.settings.timing.stall_timeout());
        self.running = Some(running);
        self.ready_deadline = Some(Instant::now() + self.settings.timing.readiness_timeout());
    }

    async fn relaunch(&mut self) {
        if let Some(instance) = &self.instance {
            info!(
                "Retrying '{}' after {} consecutive failures",
                instance.station.id, instance.failure_count
            );
        }
        self.launch(None).await;
    }

    fn on_ready(&mut self) {
        self.ready_deadline = None;
        self.live_since = Some(Instant::now());

        let Some(instance) = self.instance.as_mut() else {
            return;
        };
        instance.stage = PipelineStage::Live;
        instance.started_at = Some(Utc::now());
        let event = PipelineEvent::PipelineStarted {
            station_id: instance.station.id.clone(),
            run_id: instance.run_id,
        };
        info!("'{}' is live", instance.station.name);

        self.publish();
        self.emit(event);
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Ok(self.status()));
        }
    }

    async fn on_fault(&mut self, fault: StageFault) {
        let starting = matches!(
            self.instance.as_ref().map(|i| i.stage),
            Some(PipelineStage::Starting)
        );
        let error = if starting {
            PipelineError::LaunchFailure(format!("{} stage {}", fault.stage, fault.reason))
        } else {
            PipelineError::StageCrashed {
                stage: fault.stage,
                reason: fault.reason,
            }
        };
        self.fail(error).await;
    }

    async fn on_ready_timeout(&mut self) {
        let waited = self.settings.timing.readiness_timeout();
        self.fail(PipelineError::LaunchFailure(format!(
            "no audio reached the broadcast stage within {:.1}s",
            waited.as_secs_f64()
        )))
        .await;
    }

    /// Pipeline survived long enough: forgive earlier failures
    fn on_stable(&mut self) {
        if let Some(instance) = self.instance.as_mut() {
            info!(
                "'{}' stable for {:?}, resetting failure count (was {})",
                instance.station.id,
                self.settings.timing.min_uptime(),
                instance.failure_count
            );
            instance.failure_count = 0;
        }
        self.publish();
    }

    /// Tear down what is left, count the failure, schedule a retry
    async fn fail(&mut self, error: PipelineError) {
        self.ready_deadline = None;
        self.live_since = None;

        let station_id = self.station_id();
        warn!("Pipeline for '{}' failed: {}", station_id, error);
        self.shutdown_running(&station_id).await;

        let Some(instance) = self.instance.as_mut() else {
            return;
        };
        instance.failure_count = instance.failure_count.saturating_add(1);
        instance.last_error = Some(error.to_string());
        instance.stage = PipelineStage::Recovering;
        let failure_count = instance.failure_count;

        let backoff = self.settings.timing.backoff(failure_count);
        self.schedule_retry(backoff);
        info!("Retrying '{}' in {:?} (failure #{})", station_id, backoff, failure_count);

        self.publish();
        self.emit(PipelineEvent::PipelineRecovering {
            station_id,
            failure_count,
            backoff_ms: backoff.as_millis() as u64,
            reason: error.to_string(),
        });
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Err(error));
        }
    }

    /// Deliberate stop: Stopping, reverse-order teardown, Idle
    async fn stop_pipeline(&mut self) {
        self.cancel_retry();
        self.ready_deadline = None;
        self.live_since = None;

        let station_id = self.station_id();
        info!("Stopping pipeline for '{}'", station_id);
        if let Some(instance) = self.instance.as_mut() {
            instance.stage = PipelineStage::Stopping;
        }
        self.publish();

        self.shutdown_running(&station_id).await;
        self.clear_instance(station_id);
    }

    /// First half of a switch. Bounded by the switch timeout; on overrun the
    /// survivors are killed outright so the transmitter is free either way.
    async fn teardown_for_switch(&mut self) -> Result<(), PipelineError> {
        self.cancel_retry();
        self.ready_deadline = None;
        self.live_since = None;

        if self.instance.is_none() {
            return Ok(());
        }

        let station_id = self.station_id();
        info!("Switching away from '{}'", station_id);
        if let Some(instance) = self.instance.as_mut() {
            instance.stage = PipelineStage::Stopping;
        }
        self.publish();

        let mut result = Ok(());
        if let Some(mut running) = self.running.take() {
            let limit = self.settings.timing.switch_timeout();
            let grace = self.settings.timing.grace_period();
            let events = self.events.clone();
            let graceful = timeout(limit, running.shutdown(grace, exit_reporter(&events, &station_id))).await;

            if graceful.is_err() {
                error!("Teardown of '{}' overran {:?}, killing remaining stages", station_id, limit);
                running.force_kill(exit_reporter(&events, &station_id)).await;
                result = Err(PipelineError::SwitchTimeout(limit));
            }
        }

        self.clear_instance(station_id);
        result
    }

    /// A switch whose teardown had to be forced still ends up on the new
    /// station, just through the retry path
    fn recover_after_forced_switch(&mut self, station: Station, error: PipelineError) {
        let frequency = station.frequency_or(self.settings.default_frequency);
        let mut instance = PipelineInstance::new(station, frequency);
        instance.stage = PipelineStage::Recovering;
        instance.failure_count = 1;
        instance.last_error = Some(error.to_string());

        let backoff = self.settings.timing.backoff(1);
        let event = PipelineEvent::PipelineRecovering {
            station_id: instance.station.id.clone(),
            failure_count: 1,
            backoff_ms: backoff.as_millis() as u64,
            reason: error.to_string(),
        };
        self.instance = Some(instance);
        self.schedule_retry(backoff);

        self.publish();
        self.emit(event);
    }

    async fn shutdown_running(&mut self, station_id: &str) {
        if let Some(mut running) = self.running.take() {
            let grace = self.settings.timing.grace_period();
            let events = self.events.clone();
            running.shutdown(grace, exit_reporter(&events, station_id)).await;
        }
    }

    fn clear_instance(&mut self, station_id: String) {
        self.instance = None;
        self.publish();
        self.emit(PipelineEvent::PipelineStopped { station_id });
    }

    fn schedule_retry(&mut self, backoff: Duration) {
        self.retry_at = Some(Instant::now() + backoff);
        self.retry_due = chrono::Duration::from_std(backoff).ok().map(|d| Utc::now() + d);
    }

    fn cancel_retry(&mut self) {
        self.retry_at = None;
        self.retry_due = None;
    }

    fn supersede_pending(&mut self) {
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Err(PipelineError::Superseded));
        }
    }

    /// When the current run will have earned a failure-count reset
    fn stable_at(&self) -> Option<Instant> {
        let instance = self.instance.as_ref()?;
        if instance.stage != PipelineStage::Live || instance.failure_count == 0 {
            return None;
        }
        self.live_since.map(|since| since + self.settings.timing.min_uptime())
    }

    fn station_id(&self) -> String {
        self.instance
            .as_ref()
            .map(|i| i.station.id.clone())
            .unwrap_or_default()
    }

    fn status(&self) -> PipelineStatus {
        match &self.instance {
            Some(instance) => PipelineStatus::from_instance(instance, self.retry_due),
            None => PipelineStatus::idle(),
        }
    }

    fn publish(&self) {
        self.state.send_replace(self.status());
    }

    fn emit(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn exit_reporter<'a>(
    events: &'a broadcast::Sender<PipelineEvent>,
    station_id: &'a str,
) -> impl FnMut(StageKind, String) + 'a {
    move |stage, outcome| {
        let _ = events.send(PipelineEvent::StageExited {
            stage,
            station_id: station_id.to_string(),
            outcome,
        });
    }
}

async fn next_signal(running: &mut Option<RunningPipeline>) -> PipelineSignal {
    match running {
        Some(running) => running.next_signal().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageCommand;
    use std::path::Path;
    use tokio::sync::broadcast::error::TryRecvError;

    const FLOWING_SOURCE: &str = "while true; do echo frame; sleep 0.02; done";

    fn sh(script: &str) -> StageCommand {
        StageCommand::new("sh", &["-c", script])
    }

    fn settings(dir: &Path, broadcast: &str) -> PipelineSettings {
        PipelineSettings {
            stages: StagesConfig {
                fetch: sh(FLOWING_SOURCE),
                decode: StageCommand::new("cat", &[]),
                broadcast: sh(broadcast),
            },
            timing: SupervisorConfig {
                readiness_timeout_ms: 3_000,
                stall_timeout_ms: 2_000,
                grace_period_ms: 1_000,
                switch_timeout_ms: 5_000,
                backoff_initial_ms: 50,
                backoff_max_ms: 200,
                min_uptime_ms: 400,
            },
            default_frequency: 100.0,
            control_fifo: dir.join("rds_ctl"),
            nice: 0,
        }
    }

    fn healthy(dir: &Path) -> PipelineSupervisor {
        PipelineSupervisor::spawn(settings(dir, "cat > /dev/null"))
    }

    async fn wait_for<F>(supervisor: &PipelineSupervisor, what: &str, mut pred: F) -> PipelineStatus
    where
        F: FnMut(&PipelineStatus) -> bool,
    {
        let mut state = supervisor.watch_state();
        let found = timeout(Duration::from_secs(10), state.wait_for(|s| pred(s)))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}: {:?}", what, supervisor.current_state()))
            .expect("supervisor gone");
        found.clone()
    }

    fn drain(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut seen = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => seen.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return seen,
            }
        }
    }

    #[tokio::test]
    async fn test_start_goes_live() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = healthy(dir.path());

        let status = supervisor.start(Station::default_station()).await.unwrap();
        assert_eq!(status.stage, PipelineStage::Live);
        assert_eq!(status.station_id.as_deref(), Some("default"));
        assert_eq!(status.frequency, Some(100.0));
        assert!(status.started_at.is_some());
        assert_eq!(supervisor.current_state().stage, PipelineStage::Live);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_while_live_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = healthy(dir.path());
        supervisor.start(Station::default_station()).await.unwrap();

        let jazz = Station::new("jazz", "Jazz", "http://jazz.example/");
        assert_eq!(supervisor.start(jazz).await.unwrap_err(), PipelineError::AlreadyRunning);
        assert_eq!(supervisor.current_state().station_id.as_deref(), Some("default"));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = healthy(dir.path());
        let mut events = supervisor.subscribe();

        let status = supervisor.stop().await.unwrap();
        assert_eq!(status, PipelineStatus::idle());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_stop_tears_down_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = healthy(dir.path());
        supervisor.start(Station::default_station()).await.unwrap();
        let mut events = supervisor.subscribe();

        let status = supervisor.stop().await.unwrap();
        assert_eq!(status.stage, PipelineStage::Idle);

        let exited: Vec<StageKind> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::StageExited { stage, .. } => Some(stage),
                _ => None,
            })
            .collect();
        assert_eq!(exited, StageKind::TEARDOWN_ORDER.to_vec());
    }

    #[tokio::test]
    async fn test_switch_never_overlaps_broadcast_stages() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = healthy(dir.path());
        supervisor.start(Station::default_station()).await.unwrap();
        let mut events = supervisor.subscribe();

        let jazz = Station::new("jazz", "Jazz", "http://jazz.example/").with_frequency(94.5);
        let status = supervisor.switch_to(jazz).await.unwrap();
        assert_eq!(status.stage, PipelineStage::Live);
        assert_eq!(status.station_id.as_deref(), Some("jazz"));
        assert_eq!(status.frequency, Some(94.5));

        let trace = drain(&mut events);
        let old_exit = trace
            .iter()
            .position(|e| matches!(e, PipelineEvent::StageExited { stage: StageKind::Broadcast, station_id, .. } if station_id == "default"))
            .expect("old broadcast stage exit");
        let new_launch = trace
            .iter()
            .position(|e| matches!(e, PipelineEvent::StageLaunched { stage: StageKind::Broadcast, station_id } if station_id == "jazz"))
            .expect("new broadcast stage launch");
        assert!(old_exit < new_launch, "trace: {:?}", trace);

        let launches = trace
            .iter()
            .filter(|e| matches!(e, PipelineEvent::StageLaunched { stage: StageKind::Broadcast, .. }))
            .count();
        assert_eq!(launches, 1);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_recovers_with_same_station() {
        let dir = tempfile::tempdir().unwrap();
        // takes a few hundred ms of audio before dying, so the run is live first
        let supervisor = PipelineSupervisor::spawn(settings(dir.path(), "head -c 300 > /dev/null; exit 3"));
        let mut events = supervisor.subscribe();

        let first = supervisor.start(Station::default_station()).await.unwrap();
        assert_eq!(first.stage, PipelineStage::Live);

        let crashed = wait_for(&supervisor, "recovering", |s| s.stage == PipelineStage::Recovering).await;
        assert_eq!(crashed.station_id.as_deref(), Some("default"));
        assert_eq!(crashed.failure_count, 1);
        let reason = crashed.last_error.clone().unwrap_or_default();
        assert!(reason.starts_with("broadcast stage crashed"), "last error: {}", reason);

        let again = wait_for(&supervisor, "live again", |s| {
            s.stage == PipelineStage::Live && s.run_id != first.run_id
        })
        .await;
        assert_eq!(again.station_id.as_deref(), Some("default"));

        let trace = drain(&mut events);
        assert!(trace
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageLaunched { station_id, .. } => Some(station_id),
                _ => None,
            })
            .all(|id| id == "default"));

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.current_state().stage, PipelineStage::Idle);
    }

    #[tokio::test]
    async fn test_failure_count_resets_after_min_uptime() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("crashed-once");
        let script = format!(
            "if [ -e '{m}' ]; then exec cat > /dev/null; fi; touch '{m}'; head -c 64 > /dev/null; exit 3",
            m = marker.display()
        );
        let supervisor = PipelineSupervisor::spawn(settings(dir.path(), &script));

        let _ = supervisor.start(Station::default_station()).await;
        wait_for(&supervisor, "first failure", |s| s.failure_count == 1).await;
        wait_for(&supervisor, "relaunch live", |s| s.stage == PipelineStage::Live).await;
        let status = wait_for(&supervisor, "reset", |s| s.failure_count == 0).await;
        assert_eq!(status.stage, PipelineStage::Live);
        assert!(status.last_error.is_some());

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_keeps_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "cat > /dev/null");
        settings.stages.decode = StageCommand::new("definitely-not-a-real-fmrelay-decoder", &[]);
        let supervisor = PipelineSupervisor::spawn(settings);

        let err = supervisor.start(Station::default_station()).await.unwrap_err();
        assert!(matches!(err, PipelineError::LaunchFailure(_)));
        assert_eq!(supervisor.current_state().stage, PipelineStage::Recovering);

        wait_for(&supervisor, "retries", |s| s.failure_count >= 3).await;

        // stop cancels the pending retry
        let status = supervisor.stop().await.unwrap();
        assert_eq!(status.stage, PipelineStage::Idle);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(supervisor.current_state().stage, PipelineStage::Idle);
    }

    #[tokio::test]
    async fn test_switch_while_recovering_cancels_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "cat > /dev/null");
        settings.stages.fetch = sh("if [ \"$0\" = jazz ]; then exec sh -c 'while true; do echo frame; sleep 0.02; done'; fi; exit 7");
        settings.stages.fetch.args.push("{url}".to_string());
        settings.timing.backoff_initial_ms = 5_000;
        settings.timing.backoff_max_ms = 5_000;
        let supervisor = PipelineSupervisor::spawn(settings);

        let broken = Station::new("broken", "Broken", "http://broken.example/");
        assert!(supervisor.start(broken).await.is_err());
        let recovering = supervisor.current_state();
        assert_eq!(recovering.stage, PipelineStage::Recovering);

        // an absolute deadline, not a countdown frozen at publish time
        let retry_at = recovering.retry_at.expect("retry scheduled");
        assert!(retry_at > Utc::now() + chrono::Duration::seconds(4));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.current_state().retry_at, Some(retry_at));

        let jazz = Station::new("jazz", "Jazz", "jazz");
        let status = supervisor.switch_to(jazz).await.unwrap();
        assert_eq!(status.stage, PipelineStage::Live);
        assert_eq!(status.station_id.as_deref(), Some("jazz"));
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.retry_at, None);

        supervisor.stop().await.unwrap();
    }

    const DEAF_TO_SIGTERM: &str = "trap '' TERM; cat > /dev/null; while true; do sleep 0.1; done";

    #[tokio::test]
    async fn test_switch_timeout_kills_and_recovers_on_new_station() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), DEAF_TO_SIGTERM);
        settings.timing.grace_period_ms = 3_000;
        settings.timing.switch_timeout_ms = 500;
        settings.timing.backoff_initial_ms = 500;
        settings.timing.backoff_max_ms = 500;
        let supervisor = PipelineSupervisor::spawn(settings);
        supervisor.start(Station::default_station()).await.unwrap();
        let mut events = supervisor.subscribe();

        let jazz = Station::new("jazz", "Jazz", "http://jazz.example/");
        let begun = Instant::now();
        let err = supervisor.switch_to(jazz).await.unwrap_err();
        assert!(matches!(err, PipelineError::SwitchTimeout(_)), "got {:?}", err);
        assert!(begun.elapsed() < Duration::from_secs(3), "switch waited out the grace period");

        let state = supervisor.current_state();
        assert_eq!(state.stage, PipelineStage::Recovering);
        assert_eq!(state.station_id.as_deref(), Some("jazz"));
        assert_eq!(state.failure_count, 1);
        assert!(state.retry_at.is_some());

        // every stage of the old run is gone before anything new is launched
        let trace = drain(&mut events);
        let old_exits = trace
            .iter()
            .filter(|e| matches!(e, PipelineEvent::StageExited { station_id, .. } if station_id == "default"))
            .count();
        assert_eq!(old_exits, 3, "trace: {:?}", trace);

        let live = wait_for(&supervisor, "jazz live", |s| s.stage == PipelineStage::Live).await;
        assert_eq!(live.station_id.as_deref(), Some("jazz"));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_kills_stage_that_ignores_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), DEAF_TO_SIGTERM);
        settings.timing.grace_period_ms = 500;
        let supervisor = PipelineSupervisor::spawn(settings);
        supervisor.start(Station::default_station()).await.unwrap();
        let mut events = supervisor.subscribe();

        let begun = Instant::now();
        let status = supervisor.stop().await.unwrap();
        assert_eq!(status.stage, PipelineStage::Idle);
        assert!(begun.elapsed() >= Duration::from_millis(500));
        assert_eq!(supervisor.current_state(), PipelineStatus::idle());

        let broadcast_outcome = drain(&mut events).into_iter().find_map(|e| match e {
            PipelineEvent::StageExited { stage: StageKind::Broadcast, outcome, .. } => Some(outcome),
            _ => None,
        });
        assert_eq!(broadcast_outcome.as_deref(), Some("killed"));
    }

    #[tokio::test]
    async fn test_concurrent_operations_are_busy() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = healthy(dir.path());

        let jazz = Station::new("jazz", "Jazz", "http://jazz.example/");
        let (first, second) = tokio::join!(
            supervisor.start(Station::default_station()),
            supervisor.switch_to(jazz),
        );
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err(), PipelineError::Busy);
        assert_eq!(supervisor.current_state().station_id.as_deref(), Some("default"));

        supervisor.stop().await.unwrap();
    }
}
