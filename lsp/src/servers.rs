use std::net::TcpListener;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use which::which;

use crate::error::LspError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2087;
pub const PYTHON_MODULE: &str = "pylsp";
const LOCALHOST: [&str; 2] = ["127.0.0.1", "localhost"];
const PORT_SEARCH_SPAN: u16 = 100;

/// How to reach the language server for one language.
///
/// `args` is a template; `{host}` and `{port}` are substituted when the
/// server command line is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub cmd: String,
    #[serde(default)]
    pub args: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub stdio: bool,
    #[serde(default = "empty_object")]
    pub configurations: Value,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl ServerSettings {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: String::new(),
            host: default_host(),
            port: DEFAULT_PORT,
            external: false,
            stdio: false,
            configurations: empty_object(),
        }
    }

    pub fn python_default(host: &str, port: u16, external: bool, stdio: bool) -> Self {
        let args = if is_local_host(host) && !stdio {
            "--host {host} --port {port} --tcp --check-parent-process"
        } else {
            "--check-parent-process"
        };
        Self {
            cmd: PYTHON_MODULE.to_string(),
            args: args.to_string(),
            host: host.to_string(),
            port,
            external,
            stdio,
            configurations: empty_object(),
        }
    }

    pub fn validate(&self) -> Result<(), LspError> {
        if self.external && self.stdio {
            return Err(LspError::Config(
                "a server using stdio communication cannot be external".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether moving from `old` to `new` needs a new client rather than a
    /// `workspace/didChangeConfiguration`.
    pub fn restart_required(old: &ServerSettings, new: &ServerSettings) -> bool {
        old.cmd != new.cmd
            || old.args != new.args
            || old.host != new.host
            || old.port != new.port
            || old.external != new.external
            || old.stdio != new.stdio
    }

    pub fn render_args(&self, host: &str, port: u16) -> Vec<String> {
        let rendered = self
            .args
            .replace("{host}", host)
            .replace("{port}", &port.to_string());
        if rendered.is_empty() {
            return Vec::new();
        }
        rendered.split(' ').map(str::to_string).collect()
    }
}

pub fn is_local_host(host: &str) -> bool {
    LOCALHOST.contains(&host)
}

/// Stdio servers found on `PATH` for languages without explicit settings.
pub(crate) fn autodetect_server(language: &str) -> Option<ServerSettings> {
    let stdio = |cmd: &str, args: &str| {
        which(cmd).ok().map(|_| ServerSettings {
            args: args.to_string(),
            stdio: true,
            ..ServerSettings::new(cmd)
        })
    };
    match language {
        "rust" => stdio("rust-analyzer", ""),
        "go" => stdio("gopls", ""),
        "c" | "cpp" => stdio("clangd", ""),
        "typescript" | "javascript" => stdio("typescript-language-server", "--stdio"),
        "bash" => stdio("bash-language-server", "start"),
        _ => None,
    }
}

pub(crate) fn python_executable() -> Option<PathBuf> {
    which("python3").or_else(|_| which("python")).ok()
}

/// First bindable port in `default_port..=default_port + 100`, else one the
/// OS picks.
pub fn select_port(host: &str, default_port: u16) -> u16 {
    let host = if is_local_host(host) { DEFAULT_HOST } else { host };
    let last = default_port.saturating_add(PORT_SEARCH_SPAN);
    for port in default_port..=last {
        if TcpListener::bind((host, port)).is_ok() {
            return port;
        }
    }
    TcpListener::bind((DEFAULT_HOST, 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(default_port)
}
