//! The reconciliation loop: keeps one remote dashboard message in sync with a
//! local child process and applies the commands that come back.
//!
//! Everything that touches the process handle, the log buffer, or the "last
//! pushed" marker runs on the single task that owns [`Reconciler`], so a
//! Terminate command and a scheduled poll can never interleave. Inbound
//! commands arrive through a bounded queue; resource snapshots arrive through a
//! watch channel fed by the sampling task.

use crate::channel::{
    ChannelError, CommandInbox, CommandKind, InboundCommand, RemoteChannel, RemoteMessageRef,
};
use crate::dashboard::{self, DashboardState, RenderedDashboard};
use crate::files::FileDescriptor;
use crate::log_buffer::LogBuffer;
use crate::retry::{PushRetryPolicy, RetryDecision};
use crate::runner::{CommandSpec, Liveness, ProcessHandle, ProcessRunner, SpawnError, TerminateError};
use crate::sampler::ResourceSnapshot;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// How long to wait for trailing output once the child has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(500);

/// Outcome of the monitored run, as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed { exit_code: i32 },
    Terminated,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Lifecycle of the loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    /// The child is gone; the dashboard stays up for refreshes and downloads.
    Zombie,
    Closed,
}

/// Tunables for one loop, resolved from configuration.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub update_interval: Duration,
    pub log_buffer_size: usize,
    pub zombie_idle_timeout: Option<Duration>,
    pub echo_output: bool,
    pub terminate_grace: Duration,
    pub push_max_attempts: u32,
    pub push_initial_backoff: Duration,
    pub push_max_backoff: Duration,
    pub files_dir: PathBuf,
    pub files_limit: usize,
    pub include_hidden: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            log_buffer_size: 50,
            zombie_idle_timeout: None,
            echo_output: true,
            terminate_grace: Duration::from_secs(10),
            push_max_attempts: 3,
            push_initial_backoff: Duration::from_millis(500),
            push_max_backoff: Duration::from_secs(5),
            files_dir: PathBuf::from("."),
            files_limit: 5,
            include_hidden: false,
        }
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    SpawnFailed,
    Closed(RunStatus),
}

impl RunOutcome {
    /// Exit code for the agent process.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::SpawnFailed => 1,
            RunOutcome::Closed(RunStatus::Completed { exit_code }) => exit_code,
            RunOutcome::Closed(RunStatus::Terminated) => 143,
            // Closed while the child was still running.
            RunOutcome::Closed(RunStatus::Running) => 130,
        }
    }
}

pub struct Reconciler {
    channel: Arc<dyn RemoteChannel>,
    inbox: CommandInbox,
    resources: watch::Receiver<ResourceSnapshot>,
    runner: ProcessRunner,
    command: CommandSpec,
    host: String,
    settings: LoopSettings,

    state: LoopState,
    status: RunStatus,
    spawn_failed: bool,
    process: Option<ProcessHandle>,
    logs: LogBuffer,
    files: Vec<FileDescriptor>,
    notice: Option<String>,

    message: Option<RemoteMessageRef>,
    last_pushed: Option<RenderedDashboard>,

    finished_after: Option<Duration>,
    last_interaction: Instant,
    terminate_sent_at: Option<Instant>,
    echo: Box<dyn Write + Send>,
}

impl Reconciler {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        inbox: CommandInbox,
        resources: watch::Receiver<ResourceSnapshot>,
        runner: ProcessRunner,
        command: CommandSpec,
        host: impl Into<String>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            channel,
            inbox,
            resources,
            runner,
            command,
            host: host.into(),
            logs: LogBuffer::new(settings.log_buffer_size),
            settings,
            state: LoopState::Starting,
            status: RunStatus::Running,
            spawn_failed: false,
            process: None,
            files: Vec::new(),
            notice: None,
            message: None,
            last_pushed: None,
            finished_after: None,
            last_interaction: Instant::now(),
            terminate_sent_at: None,
            echo: Box::new(std::io::stdout()),
        }
    }

    /// Drive the loop until it is closed.
    pub async fn run(mut self) -> RunOutcome {
        self.start().await;

        let mut ticker = tokio::time::interval(self.settings.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; start() already pushed.
        ticker.tick().await;

        let mut inbox_open = true;
        while self.state != LoopState::Closed {
            tokio::select! {
                _ = ticker.tick() => {
                    for command in self.inbox.poll_inbound_commands() {
                        self.apply(command).await;
                        if self.state == LoopState::Closed {
                            break;
                        }
                    }
                    self.tick().await;
                }
                command = self.inbox.recv(), if inbox_open => match command {
                    Some(command) => self.apply(command).await,
                    None => {
                        tracing::debug!("command inbox closed, continuing on cadence only");
                        inbox_open = false;
                    }
                },
            }
        }

        self.outcome()
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.spawn_failed {
            RunOutcome::SpawnFailed
        } else {
            RunOutcome::Closed(self.status)
        }
    }

    /// Launch the child and publish the first dashboard. A spawn failure
    /// publishes a failure notice and closes the loop.
    pub async fn start(&mut self) {
        if self.state != LoopState::Starting {
            return;
        }

        match self.runner.launch(&self.command) {
            Ok(handle) => {
                self.last_interaction = Instant::now();
                self.process = Some(handle);
                self.state = LoopState::Running;
                self.push(true).await;
            }
            Err(e) => {
                tracing::error!(command = %self.command.display, error = %e, "failed to start command");
                let reason = match e {
                    SpawnError::NotFound { .. } => "Command not found",
                    SpawnError::Pty(_) => "Terminal unavailable",
                    SpawnError::Io { .. } => "Could not start command",
                };
                let view = dashboard::render_spawn_failure(&self.host, &self.command.display, reason);
                self.push_view(view).await;
                self.spawn_failed = true;
                self.state = LoopState::Closed;
            }
        }
    }

    /// One reconciliation cycle: drain, poll, render, push if changed.
    pub async fn tick(&mut self) {
        match self.state {
            LoopState::Running => self.step_process().await,
            LoopState::Zombie => self.step_zombie().await,
            LoopState::Starting | LoopState::Closed => return,
        }
        if self.state == LoopState::Closed {
            return;
        }
        self.push(false).await;
    }

    /// Apply one inbound command.
    pub async fn apply(&mut self, command: InboundCommand) {
        if self.state == LoopState::Closed {
            return;
        }
        self.last_interaction = Instant::now();
        tracing::debug!(command = ?command.kind, source = ?command.source, "applying inbound command");

        match command.kind {
            CommandKind::Refresh => {
                if self.state == LoopState::Running {
                    self.step_process().await;
                }
                self.push(true).await;
            }
            CommandKind::Terminate => self.terminate().await,
            CommandKind::Close => self.close().await,
            CommandKind::Download(id) => self.download(&id).await,
        }
    }

    async fn step_process(&mut self) {
        let Some(handle) = self.process.as_mut() else {
            return;
        };
        let output = handle.read_available_output();
        let liveness = handle.poll();
        if let Some(bytes) = output {
            self.ingest(&bytes);
        }

        match liveness {
            Liveness::Alive => self.escalate_terminate(),
            Liveness::Exited { exit_code } => self.finish(exit_code).await,
        }
    }

    fn escalate_terminate(&mut self) {
        let Some(sent_at) = self.terminate_sent_at else {
            return;
        };
        if sent_at.elapsed() < self.settings.terminate_grace {
            return;
        }
        self.terminate_sent_at = None;
        if let Some(handle) = self.process.as_mut() {
            tracing::warn!(
                pid = handle.pid(),
                grace_secs = self.settings.terminate_grace.as_secs(),
                "child ignored termination signal"
            );
            if let Err(e) = handle.kill() {
                tracing::warn!(error = %e, "failed to kill child process");
            }
        }
    }

    async fn finish(&mut self, exit_code: i32) {
        let drained = match self.process.as_mut() {
            Some(handle) => handle.drain_remaining(EXIT_DRAIN).await,
            None => None,
        };
        if let Some(bytes) = drained {
            self.ingest(&bytes);
        }
        self.logs.flush();

        if self.status != RunStatus::Terminated {
            self.status = RunStatus::Completed { exit_code };
        }
        self.finished_after = self.process.as_ref().map(ProcessHandle::elapsed);
        self.terminate_sent_at = None;
        self.state = LoopState::Zombie;
        self.last_interaction = Instant::now();
        self.refresh_files();

        tracing::info!(
            exit_code,
            status = ?self.status,
            log_lines = self.logs.len(),
            "run finished, dashboard stays open"
        );
        self.push(true).await;
    }

    async fn step_zombie(&mut self) {
        if let Some(timeout) = self.settings.zombie_idle_timeout {
            if self.last_interaction.elapsed() >= timeout {
                tracing::info!(
                    idle_secs = self.last_interaction.elapsed().as_secs(),
                    "no remote interaction, closing"
                );
                self.close().await;
                return;
            }
        }
        self.refresh_files();
    }

    async fn terminate(&mut self) {
        if self.state != LoopState::Running || self.status != RunStatus::Running {
            tracing::debug!(state = ?self.state, "ignoring terminate, nothing to stop");
            return;
        }
        let Some(handle) = self.process.as_mut() else {
            return;
        };

        match handle.terminate() {
            Ok(()) => {
                self.status = RunStatus::Terminated;
                self.terminate_sent_at = Some(Instant::now());
                self.notice = None;
                self.logs.append(b"\n[telewrap] Sent SIGTERM to process...\n");
            }
            Err(e) => {
                tracing::warn!(error = %e, "terminate failed");
                self.notice = Some(match e {
                    TerminateError::NotRunning => "Process already exited".to_string(),
                    TerminateError::Signal(_) => "Terminate failed".to_string(),
                });
            }
        }
        self.push(true).await;
    }

    async fn close(&mut self) {
        if let Some(mut handle) = self.process.take() {
            if handle.poll() == Liveness::Alive {
                if let Err(e) = handle.kill() {
                    tracing::warn!(error = %e, "failed to kill child on close");
                }
            }
        }
        let view = dashboard::render_closed(&self.host);
        self.push_view(view).await;
        self.state = LoopState::Closed;
        tracing::info!("wrapper closed");
    }

    async fn download(&mut self, id: &str) {
        self.refresh_files();
        let Some(file) = self.files.iter().find(|f| f.id == id).cloned() else {
            tracing::info!(id, "download requested for unknown file");
            if let Err(e) = self.channel.send_notice("File not found").await {
                tracing::warn!(error = %e, "failed to send notice");
            }
            return;
        };

        tracing::info!(file = %file.name, size = file.size, "sending file");
        let caption = format!("File from {}", self.host);
        if let Err(e) = self.channel.send_file(&file, &caption).await {
            tracing::warn!(file = %file.name, error = %e, "failed to send file");
            if let Err(e) = self.channel.send_notice("Upload failed").await {
                tracing::warn!(error = %e, "failed to send notice");
            }
        }
    }

    fn refresh_files(&mut self) {
        self.files = self.channel.list_downloadable_files(
            &self.settings.files_dir,
            self.settings.files_limit,
            self.settings.include_hidden,
        );
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.logs.append(bytes);
        if self.settings.echo_output {
            let echoed = self.echo.write_all(bytes).and_then(|()| self.echo.flush());
            if let Err(e) = echoed {
                tracing::warn!(error = %e, "cannot echo child output locally, echo disabled");
                self.settings.echo_output = false;
            }
        }
    }

    fn render(&self) -> RenderedDashboard {
        let resources = self.resources.borrow();
        let elapsed = self.finished_after.unwrap_or_else(|| {
            self.process
                .as_ref()
                .map(ProcessHandle::elapsed)
                .unwrap_or_default()
        });
        dashboard::render(&DashboardState {
            host: &self.host,
            pid: self.process.as_ref().map(ProcessHandle::pid),
            command: &self.command.display,
            status: self.status,
            elapsed,
            resources: &resources,
            logs: &self.logs,
            files: &self.files,
            notice: self.notice.as_deref(),
        })
    }

    /// Render and push, unless unchanged since the last successful push.
    async fn push(&mut self, force: bool) {
        let view = self.render();
        if !force && self.last_pushed.as_ref() == Some(&view) {
            tracing::trace!("dashboard unchanged, push suppressed");
            return;
        }
        self.push_view(view).await;
    }

    /// Push with bounded retries. Failures are logged and the cycle skipped.
    async fn push_view(&mut self, view: RenderedDashboard) {
        let mut policy = PushRetryPolicy::new(
            self.settings.push_max_attempts,
            self.settings.push_initial_backoff,
            self.settings.push_max_backoff,
        );

        loop {
            let error = match self.channel.push_or_edit(self.message.as_ref(), &view).await {
                Ok(reference) => {
                    if self.message.as_ref() != Some(&reference) {
                        tracing::debug!(message_id = %reference.message_id, "dashboard message posted");
                    }
                    self.message = Some(reference);
                    self.last_pushed = Some(view);
                    return;
                }
                Err(ChannelError::NotModified) => {
                    self.last_pushed = Some(view);
                    return;
                }
                Err(e) => e,
            };

            if matches!(error, ChannelError::MessageGone) {
                // Only one live dashboard: forget the stale one and post anew.
                self.message = None;
            }

            match policy.evaluate(&error) {
                RetryDecision::Retry { delay, .. } => tokio::time::sleep(delay).await,
                RetryDecision::Skip => return,
            }
        }
    }
}
