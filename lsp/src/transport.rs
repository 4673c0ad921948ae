use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::info;

use crate::error::LspError;
use crate::process::ProcessSupervisor;
use crate::process::SpawnSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    NotStarted,
    Running,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    /// The transport spawns the server and talks to it over stdin/stdout.
    Stdio {
        server_argv: Vec<String>,
        server_log_file: Option<PathBuf>,
    },
    /// The transport connects to a server listening on host:port.
    External,
}

/// Command-line contract of the transport program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportArgs {
    pub folder: PathBuf,
    pub debug_level: u8,
    pub server_host: String,
    pub server_port: u16,
    /// Host side "to-transport" port; the transport reads from it.
    pub host_out_port: u16,
    /// Host side "from-transport" port; the transport writes to it.
    pub host_in_port: u16,
    pub mode: TransportMode,
}

impl TransportArgs {
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "--folder".to_string(),
            self.folder.display().to_string(),
            "--transport-debug".to_string(),
            self.debug_level.to_string(),
            "--server-host".to_string(),
            self.server_host.clone(),
            "--server-port".to_string(),
            self.server_port.to_string(),
            "--zmq-in-port".to_string(),
            self.host_out_port.to_string(),
            "--zmq-out-port".to_string(),
            self.host_in_port.to_string(),
        ];
        match &self.mode {
            TransportMode::Stdio {
                server_argv,
                server_log_file,
            } => {
                argv.push("--stdio-server".to_string());
                if let Some(log) = server_log_file {
                    argv.push("--server-log-file".to_string());
                    argv.push(log.display().to_string());
                }
                argv.extend(server_argv.iter().cloned());
            }
            TransportMode::External => argv.push("--external-server".to_string()),
        }
        argv
    }
}

pub type WentDownFn = Arc<dyn Fn() + Send + Sync>;

/// The helper process bridging the message channel and the server.
pub struct TransportProcess {
    process: Option<ProcessSupervisor>,
    dead: Arc<AtomicBool>,
    went_down: Option<WentDownFn>,
}

impl Default for TransportProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportProcess {
    pub fn new() -> Self {
        Self {
            process: None,
            dead: Arc::new(AtomicBool::new(false)),
            went_down: None,
        }
    }

    /// Spawns the transport. `went_down` runs once if it dies afterwards,
    /// either by exiting or through [`TransportProcess::mark_dead`].
    pub fn start(&mut self, spec: &SpawnSpec, went_down: WentDownFn) -> Result<(), LspError> {
        info!(command = %spec.command_line(), "starting transport");
        let dead = Arc::new(AtomicBool::new(false));
        let on_exit_dead = Arc::clone(&dead);
        let on_exit = Arc::clone(&went_down);
        let process = ProcessSupervisor::spawn("transport", spec, move |_| {
            if !on_exit_dead.swap(true, Ordering::AcqRel) {
                on_exit();
            }
        })?;
        self.process = Some(process);
        self.dead = dead;
        self.went_down = Some(went_down);
        Ok(())
    }

    /// Records an unrecoverable socket error.
    pub fn mark_dead(&self) {
        if self.process.is_none() {
            return;
        }
        if !self.dead.swap(true, Ordering::AcqRel) {
            if let Some(went_down) = &self.went_down {
                went_down();
            }
        }
    }

    pub fn state(&self) -> TransportState {
        match &self.process {
            None => TransportState::NotStarted,
            Some(process) if process.is_alive() && !self.dead.load(Ordering::Acquire) => {
                TransportState::Running
            }
            Some(_) => TransportState::Dead,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state() == TransportState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessSupervisor::pid)
    }

    pub async fn terminate(&mut self) {
        // Deliberate teardown never counts as going down.
        self.dead.store(true, Ordering::Release);
        if let Some(process) = self.process.as_mut() {
            process.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn args(mode: TransportMode) -> TransportArgs {
        TransportArgs {
            folder: PathBuf::from("/work/project"),
            debug_level: 2,
            server_host: "127.0.0.1".to_string(),
            server_port: 2087,
            host_out_port: 5001,
            host_in_port: 5002,
            mode,
        }
    }

    #[test]
    fn external_argv_swaps_channel_ports() {
        let argv = args(TransportMode::External).to_argv();
        assert_eq!(
            argv,
            vec![
                "--folder",
                "/work/project",
                "--transport-debug",
                "2",
                "--server-host",
                "127.0.0.1",
                "--server-port",
                "2087",
                "--zmq-in-port",
                "5001",
                "--zmq-out-port",
                "5002",
                "--external-server",
            ]
        );
    }

    #[test]
    fn stdio_argv_ends_with_server_command() {
        let argv = args(TransportMode::Stdio {
            server_argv: vec!["clangd".to_string(), "--log=verbose".to_string()],
            server_log_file: Some(PathBuf::from("/tmp/server_c_1.log")),
        })
        .to_argv();
        assert_eq!(
            &argv[12..],
            &[
                "--stdio-server",
                "--server-log-file",
                "/tmp/server_c_1.log",
                "clangd",
                "--log=verbose"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_and_socket_error_fire_went_down_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let went_down: WentDownFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        });

        let mut transport = TransportProcess::new();
        assert_eq!(transport.state(), TransportState::NotStarted);
        let spec = SpawnSpec::new("sh", vec!["-c".to_string(), "exit 1".to_string()]);
        transport.start(&spec, went_down).unwrap();

        done_rx.recv().await.unwrap();
        transport.mark_dead();
        assert_eq!(transport.state(), TransportState::Dead);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_does_not_report_went_down() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut transport = TransportProcess::new();
        let spec = SpawnSpec::new("sleep", vec!["30".to_string()]);
        transport
            .start(
                &spec,
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(transport.is_alive());

        transport.terminate().await;
        transport.mark_dead();
        assert!(!transport.is_alive());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
