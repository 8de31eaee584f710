// Stage plumbing - one child process per stage, with this process relaying the
// bytes between them so we can see data flowing (readiness) and stopping (stalls)

use std::future::pending;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use super::StageKind;
use crate::config::{StageCommand, StagesConfig};
use crate::registry::Station;

const RELAY_BUFFER: usize = 16 * 1024;
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// A stage command with its placeholders filled in for one station
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub kind: StageKind,
    pub program: String,
    pub args: Vec<String>,
}

impl StagePlan {
    pub fn render(kind: StageKind, command: &StageCommand, station: &Station, frequency: f64, control_fifo: &Path) -> Self {
        let freq = format!("{:.1}", frequency);
        let ctl = control_fifo.display().to_string();
        let args = command
            .args
            .iter()
            .map(|arg| {
                arg.replace("{url}", &station.source_url)
                    .replace("{freq}", &freq)
                    .replace("{ctl}", &ctl)
            })
            .collect();

        Self {
            kind,
            program: command.program.clone(),
            args,
        }
    }

    /// All three stages in launch order
    pub fn for_station(stages: &StagesConfig, station: &Station, frequency: f64, control_fifo: &Path) -> [StagePlan; 3] {
        StageKind::LAUNCH_ORDER.map(|kind| {
            let command = match kind {
                StageKind::Fetch => &stages.fetch,
                StageKind::Decode => &stages.decode,
                StageKind::Broadcast => &stages.broadcast,
            };
            Self::render(kind, command, station, frequency, control_fifo)
        })
    }
}

/// Why a running pipeline can no longer be considered healthy
#[derive(Debug, Clone, PartialEq)]
pub struct StageFault {
    pub stage: StageKind,
    pub reason: String,
}

/// What a byte relay between two stages observed when it stopped
#[derive(Debug)]
enum RelayOutcome {
    UpstreamClosed,
    UpstreamStalled(Duration),
    UpstreamFailed(io::Error),
    DownstreamStalled(Duration),
    DownstreamFailed(io::Error),
}

struct Relay {
    upstream: StageKind,
    downstream: StageKind,
    handle: JoinHandle<RelayOutcome>,
}

impl Relay {
    fn fault(&self, outcome: RelayOutcome) -> StageFault {
        match outcome {
            RelayOutcome::UpstreamClosed => StageFault {
                stage: self.upstream,
                reason: "closed its output".to_string(),
            },
            RelayOutcome::UpstreamStalled(after) => StageFault {
                stage: self.upstream,
                reason: format!("produced no audio for {:.1}s", after.as_secs_f64()),
            },
            RelayOutcome::UpstreamFailed(e) => StageFault {
                stage: self.upstream,
                reason: format!("output read failed: {}", e),
            },
            RelayOutcome::DownstreamStalled(after) => StageFault {
                stage: self.downstream,
                reason: format!("stopped accepting audio for {:.1}s", after.as_secs_f64()),
            },
            RelayOutcome::DownstreamFailed(e) => StageFault {
                stage: self.downstream,
                reason: format!("input write failed: {}", e),
            },
        }
    }
}

/// One launched external process
struct StageProcess {
    kind: StageKind,
    program: String,
    child: Child,
    launched_at: Instant,
}

impl StageProcess {
    fn spawn(plan: &StagePlan, nice: i32) -> io::Result<Self> {
        let mut command = Command::new(&plan.program);
        command.args(&plan.args).stderr(Stdio::piped()).kill_on_drop(true);
        match plan.kind {
            StageKind::Fetch => command.stdin(Stdio::null()).stdout(Stdio::piped()),
            StageKind::Decode => command.stdin(Stdio::piped()).stdout(Stdio::piped()),
            StageKind::Broadcast => command.stdin(Stdio::piped()).stdout(Stdio::null()),
        };

        let mut child = command.spawn()?;
        let pid = child.id();
        debug!("Spawned {} stage: {} {:?} (pid {:?})", plan.kind, plan.program, plan.args, pid);

        if plan.kind == StageKind::Broadcast {
            if let Some(pid) = pid {
                raise_priority(pid, nice);
            }
        }
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(plan.kind, stderr);
        }

        Ok(Self {
            kind: plan.kind,
            program: plan.program.clone(),
            child,
            launched_at: Instant::now(),
        })
    }

    async fn wait_exit(&mut self) -> StageFault {
        let reason = match self.child.wait().await {
            Ok(status) => format!("exited unexpectedly ({})", describe_exit(status)),
            Err(e) => format!("could not be waited on: {}", e),
        };
        StageFault {
            stage: self.kind,
            reason,
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL
    async fn terminate(&mut self, grace: Duration) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => return describe_exit(status),
            Ok(None) => {}
            Err(e) => warn!("Could not poll {} stage: {}", self.kind, e),
        }

        if let Some(pid) = self.child.id() {
            send_terminate(pid);
        }

        let waited = timeout(grace, self.child.wait()).await;
        match waited {
            Ok(Ok(status)) => describe_exit(status),
            Ok(Err(e)) => format!("wait failed: {}", e),
            Err(_) => {
                warn!(
                    "{} stage ({}) ignored SIGTERM for {:?}, killing it",
                    self.kind, self.program, grace
                );
                self.kill().await
            }
        }
    }

    async fn kill(&mut self) -> String {
        match timeout(KILL_TIMEOUT, self.child.kill()).await {
            Ok(Ok(())) => "killed".to_string(),
            Ok(Err(e)) => format!("kill failed: {}", e),
            Err(_) => {
                error!("{} stage ({}) survived SIGKILL for {:?}", self.kind, self.program, KILL_TIMEOUT);
                "unkillable".to_string()
            }
        }
    }
}

/// The set of processes and relays behind one launch attempt
#[derive(Default)]
pub struct RunningPipeline {
    stages: [Option<StageProcess>; 3],
    relays: [Option<Relay>; 2],
    ready: Option<oneshot::Receiver<()>>,
}

/// What the supervisor hears back from a running pipeline
#[derive(Debug)]
pub enum PipelineSignal {
    Ready,
    Fault(StageFault),
}

enum Observed {
    Ready(bool),
    Fault(StageFault),
}

impl RunningPipeline {
    /// Launch one stage. Call in launch order.
    pub fn spawn(&mut self, plan: &StagePlan, nice: i32) -> io::Result<()> {
        let process = StageProcess::spawn(plan, nice)?;
        self.stages[plan.kind.index()] = Some(process);
        Ok(())
    }

    /// Wire fetch -> decode -> broadcast once every stage is up
    pub fn connect(&mut self, stall_timeout: Duration) {
        let (ready_tx, ready_rx) = oneshot::channel();
        self.ready = Some(ready_rx);

        let [fetch, decode, broadcast] = &mut self.stages;
        let (Some(fetch), Some(decode), Some(broadcast)) = (fetch, decode, broadcast) else {
            return;
        };

        if let (Some(from), Some(to)) = (fetch.child.stdout.take(), decode.child.stdin.take()) {
            self.relays[0] = Some(Relay {
                upstream: StageKind::Fetch,
                downstream: StageKind::Decode,
                handle: tokio::spawn(relay(from, to, stall_timeout, None)),
            });
        }
        if let (Some(from), Some(to)) = (decode.child.stdout.take(), broadcast.child.stdin.take()) {
            self.relays[1] = Some(Relay {
                upstream: StageKind::Decode,
                downstream: StageKind::Broadcast,
                handle: tokio::spawn(relay(from, to, stall_timeout, Some(ready_tx))),
            });
        }
    }

    /// Resolves on readiness (first audio into the broadcast stage) or on the
    /// first fault. Cancel-safe.
    pub async fn next_signal(&mut self) -> PipelineSignal {
        loop {
            let observed = {
                let Self { stages, relays, ready } = self;
                tokio::select! {
                    delivered = wait_ready(ready) => Observed::Ready(delivered),
                    fault = wait_fault(stages, relays) => Observed::Fault(fault),
                }
            };

            match observed {
                Observed::Ready(true) => {
                    self.ready = None;
                    return PipelineSignal::Ready;
                }
                // relay ended before any audio got through, its fault follows
                Observed::Ready(false) => self.ready = None,
                Observed::Fault(fault) => return PipelineSignal::Fault(fault),
            }
        }
    }

    /// Stop every stage in teardown order, reporting each exit as it is observed.
    ///
    /// Stages are forgotten as soon as they are gone, so calling this again after
    /// an interrupted run only touches the survivors.
    pub async fn shutdown<F>(&mut self, grace: Duration, mut on_exit: F)
    where
        F: FnMut(StageKind, String),
    {
        self.abort_relays();

        for kind in StageKind::TEARDOWN_ORDER {
            let slot = &mut self.stages[kind.index()];
            if let Some(stage) = slot.as_mut() {
                let outcome = stage.terminate(grace).await;
                info!(
                    "{} stage stopped after {:.1}s: {}",
                    kind,
                    stage.launched_at.elapsed().as_secs_f64(),
                    outcome
                );
                *slot = None;
                on_exit(kind, outcome);
            }
        }
    }

    /// Skip the courtesy SIGTERM. Used when a graceful teardown overran.
    pub async fn force_kill<F>(&mut self, mut on_exit: F)
    where
        F: FnMut(StageKind, String),
    {
        self.abort_relays();

        for kind in StageKind::TEARDOWN_ORDER {
            let slot = &mut self.stages[kind.index()];
            if let Some(stage) = slot.as_mut() {
                let outcome = stage.kill().await;
                *slot = None;
                on_exit(kind, outcome);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(Option::is_none)
    }

    fn abort_relays(&mut self) {
        self.ready = None;
        for relay in self.relays.iter_mut() {
            if let Some(relay) = relay.take() {
                relay.handle.abort();
            }
        }
    }
}

async fn wait_ready(ready: &mut Option<oneshot::Receiver<()>>) -> bool {
    match ready {
        Some(rx) => rx.await.is_ok(),
        None => pending().await,
    }
}

async fn wait_fault(stages: &mut [Option<StageProcess>; 3], relays: &mut [Option<Relay>; 2]) -> StageFault {
    let [fetch, decode, broadcast] = stages;
    let [upstream_relay, downstream_relay] = relays;
    tokio::select! {
        fault = wait_stage(fetch) => fault,
        fault = wait_stage(decode) => fault,
        fault = wait_stage(broadcast) => fault,
        fault = wait_relay(upstream_relay) => fault,
        fault = wait_relay(downstream_relay) => fault,
    }
}

async fn wait_stage(stage: &mut Option<StageProcess>) -> StageFault {
    match stage {
        Some(stage) => stage.wait_exit().await,
        None => pending().await,
    }
}

async fn wait_relay(relay: &mut Option<Relay>) -> StageFault {
    let Some(relay) = relay else {
        return pending().await;
    };
    match (&mut relay.handle).await {
        Ok(outcome) => relay.fault(outcome),
        Err(e) => StageFault {
            stage: relay.downstream,
            reason: format!("relay task failed: {}", e),
        },
    }
}

/// Copy audio from one stage to the next until something goes wrong
async fn relay(
    mut from: ChildStdout,
    mut to: ChildStdin,
    stall_timeout: Duration,
    mut ready: Option<oneshot::Sender<()>>,
) -> RelayOutcome {
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = match timeout(stall_timeout, from.read(&mut buf)).await {
            Err(_) => return RelayOutcome::UpstreamStalled(stall_timeout),
            Ok(Ok(0)) => return RelayOutcome::UpstreamClosed,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return RelayOutcome::UpstreamFailed(e),
        };

        match timeout(stall_timeout, to.write_all(&buf[..n])).await {
            Err(_) => return RelayOutcome::DownstreamStalled(stall_timeout),
            Ok(Err(e)) => return RelayOutcome::DownstreamFailed(e),
            Ok(Ok(())) => {}
        }

        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }
    }
}

fn forward_stderr(kind: StageKind, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                warn!(stage = %kind, "{}", line);
            }
        }
    });
}

fn describe_exit(status: ExitStatus) -> String {
    status.to_string()
}

fn send_terminate(pid: u32) {
    // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!("SIGTERM to pid {} failed: {}", pid, io::Error::last_os_error());
    }
}

fn raise_priority(pid: u32, nice: i32) {
    // SAFETY: setpriority(2) only reads its integer arguments
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
    if rc != 0 {
        // needs root or CAP_SYS_NICE, not worth failing the launch over
        debug!("Could not renice pid {} to {}: {}", pid, nice, io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagesConfig;
    use std::path::PathBuf;

    fn sh(script: &str) -> StageCommand {
        StageCommand::new("sh", &["-c", script])
    }

    #[test]
    fn test_render_fills_placeholders() {
        let station = Station::new("jazz", "Jazz", "http://jazz.example/stream");
        let plans = StagePlan::for_station(
            &StagesConfig::default(),
            &station,
            94.5,
            &PathBuf::from("/tmp/ctl"),
        );

        assert_eq!(plans[0].kind, StageKind::Fetch);
        assert_eq!(plans[0].args.last().unwrap(), "http://jazz.example/stream");
        assert_eq!(plans[2].kind, StageKind::Broadcast);
        assert_eq!(plans[2].args, vec!["-freq", "94.5", "-ctl", "/tmp/ctl", "-audio", "-"]);
    }

    fn plans(fetch: &str, decode: &str, broadcast: &str) -> [StagePlan; 3] {
        let stages = StagesConfig {
            fetch: sh(fetch),
            decode: sh(decode),
            broadcast: sh(broadcast),
        };
        StagePlan::for_station(&stages, &Station::default_station(), 100.0, Path::new("/tmp/unused"))
    }

    fn launch(plans: &[StagePlan; 3]) -> RunningPipeline {
        let mut running = RunningPipeline::default();
        for plan in plans {
            running.spawn(plan, 0).unwrap();
        }
        running.connect(Duration::from_secs(2));
        running
    }

    #[tokio::test]
    async fn test_audio_flow_reports_ready() {
        let plans = plans(
            "while true; do echo frame; sleep 0.02; done",
            "cat",
            "cat > /dev/null",
        );
        let mut running = launch(&plans);

        let signal = timeout(Duration::from_secs(5), running.next_signal()).await.unwrap();
        assert!(matches!(signal, PipelineSignal::Ready));

        let mut exits = Vec::new();
        running
            .shutdown(Duration::from_secs(2), |kind, _| exits.push(kind))
            .await;
        assert_eq!(exits, StageKind::TEARDOWN_ORDER.to_vec());
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_crashing_stage_is_reported() {
        let plans = plans(
            "while true; do echo frame; sleep 0.02; done",
            "cat",
            "head -c 4 > /dev/null; exit 3",
        );
        let mut running = launch(&plans);

        let fault = timeout(Duration::from_secs(5), async {
            loop {
                if let PipelineSignal::Fault(fault) = running.next_signal().await {
                    return fault;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(fault.stage, StageKind::Broadcast);

        running.shutdown(Duration::from_secs(2), |_, _| {}).await;
    }

    #[tokio::test]
    async fn test_silent_source_stalls() {
        let plans = plans("sleep 30", "cat", "cat > /dev/null");
        let mut running = RunningPipeline::default();
        for plan in &plans {
            running.spawn(plan, 0).unwrap();
        }
        running.connect(Duration::from_millis(200));

        let signal = timeout(Duration::from_secs(5), running.next_signal()).await.unwrap();
        match signal {
            PipelineSignal::Fault(fault) => assert!(fault.reason.contains("no audio"), "{}", fault.reason),
            PipelineSignal::Ready => panic!("silent source reported ready"),
        }

        running.shutdown(Duration::from_millis(500), |_, _| {}).await;
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let plan = StagePlan {
            kind: StageKind::Fetch,
            program: "definitely-not-a-real-fmrelay-binary".to_string(),
            args: Vec::new(),
        };
        let mut running = RunningPipeline::default();
        assert!(running.spawn(&plan, 0).is_err());
        assert!(running.is_empty());
    }
}
