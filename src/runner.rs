//! Process runner: spawn the monitored command, expose its output without
//! blocking, report liveness, and deliver termination signals.
//!
//! Where the platform has pseudo-terminals the child runs on one, so progress
//! bars and colorized output behave as they would in a real terminal. Otherwise
//! it runs on plain pipes with stderr merged into the same stream. The channel is
//! picked once at launch; callers only ever see [`ProcessHandle`].

use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// Which output channel to use, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPreference {
    /// Pseudo-terminal where supported, pipes otherwise.
    #[default]
    Auto,
    Pty,
    Pipe,
}

/// The channel actually in use for a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Pty,
    Pipe,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Pty => write!(f, "pty"),
            ChannelKind::Pipe => write!(f, "pipe"),
        }
    }
}

/// The command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// How the command is shown on the dashboard.
    pub display: String,
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Build from CLI arguments. A single argument with whitespace in it is a
    /// shell command line; anything else is an argv vector run directly.
    pub fn from_args(args: &[String]) -> Option<Self> {
        match args {
            [] => None,
            [line] if line.trim().is_empty() => None,
            [line] if line.contains(char::is_whitespace) => Some(Self::shell(line)),
            [program, rest @ ..] => Some(Self {
                display: args.join(" "),
                program: program.clone(),
                args: rest.to_vec(),
            }),
        }
    }

    /// Run `line` through the platform shell.
    pub fn shell(line: &str) -> Self {
        #[cfg(unix)]
        let (program, flag) = ("sh", "-c");
        #[cfg(not(unix))]
        let (program, flag) = ("cmd", "/C");

        Self {
            display: line.to_string(),
            program: program.to_string(),
            args: vec![flag.to_string(), line.to_string()],
        }
    }
}

/// Liveness of the child at the time of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited { exit_code: i32 },
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("command not found: {program}")]
    NotFound { program: String },

    #[error("failed to open pseudo-terminal: {0}")]
    Pty(String),

    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("process already exited")]
    NotRunning,

    #[error("failed to signal process: {0}")]
    Signal(String),
}

/// Launches commands on the channel the platform supports.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    preference: ChannelPreference,
    cwd: PathBuf,
}

impl ProcessRunner {
    pub fn new(preference: ChannelPreference, cwd: impl Into<PathBuf>) -> Self {
        Self {
            preference,
            cwd: cwd.into(),
        }
    }

    /// Channel a launch will try first.
    pub fn channel_kind(&self) -> ChannelKind {
        match self.preference {
            ChannelPreference::Pty => ChannelKind::Pty,
            ChannelPreference::Pipe => ChannelKind::Pipe,
            ChannelPreference::Auto if cfg!(unix) => ChannelKind::Pty,
            ChannelPreference::Auto => ChannelKind::Pipe,
        }
    }

    /// Start the command. Fails if the program cannot be found or started.
    pub fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
        let program = self.resolve(&spec.program)?;

        let handle = match self.channel_kind() {
            ChannelKind::Pty => match self.launch_pty(&program, spec) {
                Err(SpawnError::Pty(reason)) if self.preference == ChannelPreference::Auto => {
                    tracing::warn!(%reason, "pseudo-terminal unavailable, falling back to pipes");
                    self.launch_pipe(&program, spec)?
                }
                other => other?,
            },
            ChannelKind::Pipe => self.launch_pipe(&program, spec)?,
        };

        tracing::info!(
            pid = handle.pid,
            channel = %handle.kind,
            started_at = %handle.started_at.to_rfc3339(),
            command = %spec.display,
            "child process started"
        );
        Ok(handle)
    }

    fn resolve(&self, program: &str) -> Result<PathBuf, SpawnError> {
        which::which_in(program, std::env::var_os("PATH"), &self.cwd).map_err(|_| {
            SpawnError::NotFound {
                program: program.to_string(),
            }
        })
    }

    fn launch_pty(&self, program: &Path, spec: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
        let pair = native_pty_system()
            .openpty(pty_size())
            .map_err(|e| SpawnError::Pty(e.to_string()))?;

        let mut builder = CommandBuilder::new(program);
        builder.args(&spec.args);
        builder.cwd(&self.cwd);
        builder.env("PYTHONUNBUFFERED", "1");
        if std::env::var_os("TERM").is_none() {
            builder.env("TERM", "xterm-256color");
        }

        let io_err = |e: anyhow::Error| SpawnError::Io {
            program: spec.program.clone(),
            source: std::io::Error::other(e.to_string()),
        };

        let child = pair.slave.spawn_command(builder).map_err(io_err)?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);
        let mut reader = pair.master.try_clone_reader().map_err(io_err)?;

        let pid = child.process_id().unwrap_or(0);
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name(format!("pty-reader-{pid}"))
            .spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        // EIO once the slave side is closed on Linux.
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| SpawnError::Io {
                program: spec.program.clone(),
                source: e,
            })?;

        Ok(ProcessHandle::new(
            pid,
            ChannelKind::Pty,
            Channel::Pty {
                child,
                _master: pair.master,
            },
            rx,
        ))
    }

    fn launch_pipe(&self, program: &Path, spec: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(&spec.args)
            .current_dir(&self.cwd)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0); // New process group so the whole tree gets the signal

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SpawnError::NotFound {
                program: spec.program.clone(),
            },
            _ => SpawnError::Io {
                program: spec.program.clone(),
                source: e,
            },
        })?;

        let pid = child.id().unwrap_or(0);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, tx));
        }

        Ok(ProcessHandle::new(
            pid,
            ChannelKind::Pipe,
            Channel::Pipe { child },
            rx,
        ))
    }
}

async fn forward_output<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

fn pty_size() -> PtySize {
    let dimension = |var: &str, default: u16| {
        std::env::var(var)
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(default)
            .max(1)
    };
    PtySize {
        rows: dimension("LINES", 40),
        cols: dimension("COLUMNS", 120),
        pixel_width: 0,
        pixel_height: 0,
    }
}

enum Channel {
    Pty {
        child: Box<dyn portable_pty::Child + Send + Sync>,
        // Dropping the master closes the terminal, so it lives as long as the handle.
        _master: Box<dyn MasterPty + Send>,
    },
    Pipe {
        child: tokio::process::Child,
    },
}

/// A spawned command. Owned by the reconciliation loop; released on close.
pub struct ProcessHandle {
    pid: u32,
    kind: ChannelKind,
    started_at: DateTime<Utc>,
    started: Instant,
    exit_code: Option<i32>,
    channel: Channel,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ProcessHandle {
    fn new(
        pid: u32,
        kind: ChannelKind,
        channel: Channel,
        output: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            pid,
            kind,
            started_at: Utc::now(),
            started: Instant::now(),
            exit_code: None,
            channel,
            output,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Non-blocking liveness check. Caches the exit code once observed.
    pub fn poll(&mut self) -> Liveness {
        if let Some(exit_code) = self.exit_code {
            return Liveness::Exited { exit_code };
        }

        let exited = match &mut self.channel {
            Channel::Pty { child, .. } => child
                .try_wait()
                .map(|status| status.map(|s| s.exit_code() as i32)),
            Channel::Pipe { child } => child.try_wait().map(|status| status.map(exit_code_of)),
        };

        match exited {
            Ok(Some(exit_code)) => {
                self.exit_code = Some(exit_code);
                tracing::info!(pid = self.pid, exit_code, "child process exited");
                Liveness::Exited { exit_code }
            }
            Ok(None) => Liveness::Alive,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "failed to poll child process");
                Liveness::Alive
            }
        }
    }

    /// Everything the child wrote since the last call, or `None` if nothing new.
    pub fn read_available_output(&mut self) -> Option<Vec<u8>> {
        let mut collected = Vec::new();
        while let Ok(chunk) = self.output.try_recv() {
            collected.extend_from_slice(&chunk);
        }
        (!collected.is_empty()).then_some(collected)
    }

    /// After exit: wait up to `grace` for the readers to reach end of stream and
    /// return whatever arrived. A grandchild holding the terminal open cannot
    /// stall the caller past `grace`.
    pub async fn drain_remaining(&mut self, grace: Duration) -> Option<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + grace;
        let mut collected = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
                Ok(None) | Err(_) => break,
            }
        }
        (!collected.is_empty()).then_some(collected)
    }

    /// Ask the child (and its process group) to stop with SIGTERM.
    pub fn terminate(&mut self) -> Result<(), TerminateError> {
        if let Liveness::Exited { .. } = self.poll() {
            return Err(TerminateError::NotRunning);
        }
        tracing::info!(pid = self.pid, "sending termination signal");
        self.signal(false)
    }

    /// Forcefully stop the child. Used after the terminate grace period and on close.
    pub fn kill(&mut self) -> Result<(), TerminateError> {
        if let Liveness::Exited { .. } = self.poll() {
            return Err(TerminateError::NotRunning);
        }
        tracing::warn!(pid = self.pid, "killing child process");
        self.signal(true)
    }

    #[cfg(unix)]
    fn signal(&mut self, force: bool) -> Result<(), TerminateError> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        // Both channels start the child as a process group leader.
        match killpg(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(TerminateError::NotRunning),
            Err(e) => Err(TerminateError::Signal(e.to_string())),
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _force: bool) -> Result<(), TerminateError> {
        use portable_pty::ChildKiller;

        let result = match &mut self.channel {
            Channel::Pty { child, .. } => child.kill(),
            Channel::Pipe { child } => child.start_kill(),
        };
        result.map_err(|e| TerminateError::Signal(e.to_string()))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            let _ = self.kill();
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner(preference: ChannelPreference) -> ProcessRunner {
        ProcessRunner::new(preference, std::env::temp_dir())
    }

    async fn wait_exit(handle: &mut ProcessHandle) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Liveness::Exited { exit_code } = handle.poll() {
                return exit_code;
            }
            assert!(Instant::now() < deadline, "child did not exit in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn collect_output(handle: &mut ProcessHandle) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = handle.read_available_output() {
            out.extend(chunk);
        }
        if let Some(rest) = handle.drain_remaining(Duration::from_secs(2)).await {
            out.extend(rest);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_command_spec_from_args() {
        assert_eq!(CommandSpec::from_args(&[]), None);
        assert_eq!(CommandSpec::from_args(&["  ".to_string()]), None);

        let shell = CommandSpec::from_args(&["python train.py --epochs 3".to_string()]).unwrap();
        assert_eq!(shell.program, "sh");
        assert_eq!(shell.args, vec!["-c", "python train.py --epochs 3"]);
        assert_eq!(shell.display, "python train.py --epochs 3");

        let argv = CommandSpec::from_args(&["ls".to_string(), "-la".to_string()]).unwrap();
        assert_eq!(argv.program, "ls");
        assert_eq!(argv.args, vec!["-la"]);
        assert_eq!(argv.display, "ls -la");

        let single = CommandSpec::from_args(&["make".to_string()]).unwrap();
        assert_eq!(single.program, "make");
        assert!(single.args.is_empty());
    }

    #[test]
    fn test_auto_prefers_pty_on_unix() {
        assert_eq!(runner(ChannelPreference::Auto).channel_kind(), ChannelKind::Pty);
        assert_eq!(runner(ChannelPreference::Pipe).channel_kind(), ChannelKind::Pipe);
    }

    #[tokio::test]
    async fn test_pipe_captures_stdout_and_stderr() {
        let spec = CommandSpec::shell("echo out-line; echo err-line >&2");
        let mut handle = runner(ChannelPreference::Pipe).launch(&spec).unwrap();
        assert_eq!(handle.kind, ChannelKind::Pipe);
        assert!(handle.pid() > 0);

        assert_eq!(wait_exit(&mut handle).await, 0);
        let out = collect_output(&mut handle).await;
        assert!(out.contains("out-line"));
        assert!(out.contains("err-line"));
    }

    #[tokio::test]
    async fn test_pty_captures_output() {
        let spec = CommandSpec::shell("printf 'tty:'; test -t 1 && echo yes");
        let mut handle = runner(ChannelPreference::Auto).launch(&spec).unwrap();

        assert_eq!(wait_exit(&mut handle).await, 0);
        let out = collect_output(&mut handle).await;
        if handle.kind == ChannelKind::Pty {
            assert!(out.contains("tty:yes"), "got {out:?}");
        } else {
            assert!(out.contains("tty:"));
        }
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let spec = CommandSpec::shell("exit 3");
        let mut handle = runner(ChannelPreference::Pipe).launch(&spec).unwrap();
        assert_eq!(wait_exit(&mut handle).await, 3);
        // Cached after the first observation.
        assert_eq!(handle.poll(), Liveness::Exited { exit_code: 3 });
    }

    #[tokio::test]
    async fn test_nonexistent_program_is_spawn_error() {
        let spec = CommandSpec::from_args(&[
            "nonexistent-binary-xyz".to_string(),
            "--flag".to_string(),
        ])
        .unwrap();
        for preference in [ChannelPreference::Pipe, ChannelPreference::Auto] {
            let err = runner(preference).launch(&spec).err().unwrap();
            assert!(matches!(err, SpawnError::NotFound { .. }));
            assert!(err.to_string().contains("nonexistent-binary-xyz"));
        }
    }

    #[tokio::test]
    async fn test_read_available_output_is_non_blocking() {
        let spec = CommandSpec::shell("sleep 5");
        let mut handle = runner(ChannelPreference::Pipe).launch(&spec).unwrap();
        let started = Instant::now();
        assert_eq!(handle.read_available_output(), None);
        assert_eq!(handle.poll(), Liveness::Alive);
        assert!(started.elapsed() < Duration::from_millis(500));
        handle.kill().unwrap();
    }

    #[tokio::test]
    async fn test_terminate_stops_process_group() {
        for preference in [ChannelPreference::Pipe, ChannelPreference::Auto] {
            let spec = CommandSpec::shell("sleep 30; echo never");
            let mut handle = runner(preference).launch(&spec).unwrap();
            assert_eq!(handle.poll(), Liveness::Alive);

            handle.terminate().unwrap();
            let code = wait_exit(&mut handle).await;
            assert_ne!(code, 0);

            assert!(matches!(
                handle.terminate(),
                Err(TerminateError::NotRunning)
            ));
        }
    }
}
