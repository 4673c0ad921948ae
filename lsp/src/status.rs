use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::servers::ServerSettings;

/// Health of a language as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Stopped,
    Running,
    Restarting,
    Down,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientStatus::Stopped => "stopped",
            ClientStatus::Running => "ready",
            ClientStatus::Restarting => "restarting",
            ClientStatus::Down => "down",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LspServerSource {
    Config,
    Builtin,
    Autodetect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LspLanguageStatus {
    pub language: String,
    pub status: ClientStatus,
    pub settings: ServerSettings,
    pub source: LspServerSource,
    pub running: bool,
    pub initialized: bool,
    pub restart_budget: u32,
    pub server_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LspStatus {
    pub root: PathBuf,
    pub project: Option<PathBuf>,
    pub debug_level: u8,
    pub auto_restart: bool,
    pub languages: Vec<LspLanguageStatus>,
}

pub fn render_lsp_status(status: &LspStatus) -> String {
    let mut lines = Vec::new();
    lines.push("## LSP status".to_string());
    lines.push(format!("- root: {}", status.root.display()));
    lines.push(format!(
        "- project: {}",
        status
            .project
            .as_ref()
            .map_or_else(|| "(none)".to_string(), |p| p.display().to_string())
    ));
    lines.push(format!("- debug level: {}", status.debug_level));
    if !status.auto_restart {
        lines.push("- note: automatic restart is disabled".to_string());
    }

    lines.push("- servers:".to_string());
    for lang in &status.languages {
        let running = if lang.running { "yes" } else { "no" };
        let source = match lang.source {
            LspServerSource::Config => "config",
            LspServerSource::Builtin => "builtin",
            LspServerSource::Autodetect => "autodetect",
        };

        let mut line = format!(
            "  - {}: status={}, running={running}, server={} ({source})",
            lang.language,
            lang.status,
            settings_display(&lang.settings)
        );
        if let Some(port) = lang.server_port {
            line.push_str(&format!(", port={port}"));
        }
        if lang.status == ClientStatus::Restarting {
            line.push_str(&format!(", attempts left={}", lang.restart_budget));
        }
        if lang.running && !lang.initialized {
            line.push_str(", initializing");
        }
        lines.push(line);
    }

    lines.join("\n")
}

fn settings_display(settings: &ServerSettings) -> String {
    let cmd = settings.cmd.trim();
    let mode = if settings.stdio {
        "stdio".to_string()
    } else if settings.external {
        format!("external {}:{}", settings.host, settings.port)
    } else {
        format!("tcp {}", settings.host)
    };
    if settings.args.is_empty() {
        return format!("`{cmd}` [{mode}]");
    }
    format!("`{cmd}` `{}` [{mode}]", settings.args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_languages_with_their_state() {
        let status = LspStatus {
            root: PathBuf::from("/conf/lsp_paths/root_path"),
            project: None,
            debug_level: 0,
            auto_restart: false,
            languages: vec![
                LspLanguageStatus {
                    language: "python".to_string(),
                    status: ClientStatus::Restarting,
                    settings: ServerSettings::python_default("127.0.0.1", 2087, false, false),
                    source: LspServerSource::Builtin,
                    running: true,
                    initialized: false,
                    restart_budget: 3,
                    server_port: Some(2088),
                },
                LspLanguageStatus {
                    language: "rust".to_string(),
                    status: ClientStatus::Down,
                    settings: ServerSettings {
                        stdio: true,
                        ..ServerSettings::new("rust-analyzer")
                    },
                    source: LspServerSource::Config,
                    running: false,
                    initialized: false,
                    restart_budget: 0,
                    server_port: None,
                },
            ],
        };

        assert_eq!(
            render_lsp_status(&status),
            [
                "## LSP status",
                "- root: /conf/lsp_paths/root_path",
                "- project: (none)",
                "- debug level: 0",
                "- note: automatic restart is disabled",
                "- servers:",
                "  - python: status=restarting, running=yes, server=`pylsp` `--host {host} --port {port} --tcp --check-parent-process` [tcp 127.0.0.1] (builtin), port=2088, attempts left=3, initializing",
                "  - rust: status=down, running=no, server=`rust-analyzer` [stdio] (config)",
            ]
            .join("\n")
        );
    }
}
