use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use sysinfo::Pid;
use sysinfo::ProcessStatus;
use sysinfo::System;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::LspError;

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Inherit,
    Discard,
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// stderr goes wherever stdout goes.
    Merged,
    Separate,
}

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub inherit_env: bool,
    pub cwd: Option<PathBuf>,
    pub stdout: Sink,
    pub stderr: Sink,
    pub channel_mode: ChannelMode,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            inherit_env: true,
            cwd: None,
            stdout: Sink::Discard,
            stderr: Sink::Discard,
            channel_mode: ChannelMode::Merged,
        }
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(Option<i32>),
    Terminated,
}

/// Owns one child process and reports when it dies on its own.
pub struct ProcessSupervisor {
    kind: &'static str,
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Starts the process described by `spec`.
    ///
    /// `on_error` runs at most once, when the process exits without having
    /// been asked to via [`ProcessSupervisor::terminate`].
    pub fn spawn<F>(kind: &'static str, spec: &SpawnSpec, on_error: F) -> Result<Self, LspError>
    where
        F: FnOnce(LspError) + Send + 'static,
    {
        let spawn_err = |source| LspError::Spawn {
            program: spec.program.display().to_string(),
            source,
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null()).kill_on_drop(true);
        if !spec.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(spec.env.iter().map(|(key, value)| (key, value)));
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        let (stdout, stderr) = redirections(spec).map_err(spawn_err)?;
        cmd.stdout(stdout).stderr(stderr);

        debug!(kind, command = %spec.command_line(), "spawning process");
        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();

        let (state_tx, state) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let monitor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = status.as_ref().ok().and_then(|status| status.code());
                    warn!(kind, ?pid, ?code, "process exited unexpectedly");
                    let _ = state_tx.send(ProcessState::Exited(code));
                    on_error(LspError::ProcessExit { kind });
                }
                _ = kill_rx => {
                    if let Err(err) = child.kill().await {
                        debug!(kind, ?pid, "kill failed: {err}");
                    }
                    let _ = state_tx.send(ProcessState::Terminated);
                }
            }
        });

        Ok(Self {
            kind,
            pid,
            state,
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
        })
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Kills the process and waits up to one second for it to be reaped.
    pub async fn terminate(&mut self) {
        let Some(kill_tx) = self.kill_tx.take() else {
            return;
        };
        let _ = kill_tx.send(());
        if let Some(monitor) = self.monitor.take() {
            match tokio::time::timeout(TERMINATE_TIMEOUT, monitor).await {
                Ok(_) => {}
                Err(_) => warn!(kind = self.kind, pid = ?self.pid, "process did not exit in time"),
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

fn open_sink(sink: &Sink) -> std::io::Result<Stdio> {
    Ok(match sink {
        Sink::Inherit => Stdio::inherit(),
        Sink::Discard => Stdio::null(),
        Sink::File(path) => Stdio::from(File::create(path)?),
    })
}

fn redirections(spec: &SpawnSpec) -> std::io::Result<(Stdio, Stdio)> {
    match spec.channel_mode {
        ChannelMode::Separate => Ok((open_sink(&spec.stdout)?, open_sink(&spec.stderr)?)),
        ChannelMode::Merged => match &spec.stdout {
            Sink::File(path) => {
                let file = File::create(path)?;
                let err = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(err)))
            }
            Sink::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
            Sink::Discard => Ok((Stdio::null(), Stdio::null())),
        },
    }
}

/// A pid counts as alive while it exists and is not a zombie.
pub fn stdio_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .map(|process| process.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

/// Kills a process we do not own a handle to, such as a stdio server
/// spawned by the transport.
pub fn kill_pid(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return false;
    }
    system.process(pid).is_some_and(|process| process.kill())
}
