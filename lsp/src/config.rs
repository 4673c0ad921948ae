use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::LspError;
use crate::servers::DEFAULT_HOST;
use crate::servers::DEFAULT_PORT;
use crate::servers::ServerSettings;
use crate::servers::autodetect_server;
use crate::servers::python_executable;
use crate::status::LspServerSource;

pub const PYTHON: &str = "python";
const TRANSPORT_BINARY: &str = "spyder-lsp-transport";

/// Provider-wide settings, usually read from a TOML file.
///
/// ```toml
/// debug_level = 1
/// conf_dir = "/home/me/.config/spyder"
///
/// [servers.python]
/// cmd = "pylsp"
/// args = "--host {host} --port {port} --tcp"
///
/// [servers.rust]
/// cmd = "rust-analyzer"
/// stdio = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub servers: BTreeMap<String, ServerSettings>,
    pub conf_dir: PathBuf,
    pub debug_level: u8,
    pub dev_mode: bool,
    pub auto_restart: bool,
    pub show_lsp_down_warning: bool,
    pub max_restart_attempts: u32,
    pub time_between_restarts_ms: u64,
    pub time_heartbeat_ms: u64,
    pub transport_program: Option<PathBuf>,
    pub python_executable: Option<PathBuf>,
    pub extra_python_path: Vec<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            conf_dir: std::env::temp_dir().join("spyder-lsp"),
            debug_level: 0,
            dev_mode: false,
            auto_restart: true,
            show_lsp_down_warning: true,
            max_restart_attempts: 5,
            time_between_restarts_ms: 10_000,
            time_heartbeat_ms: 3_000,
            transport_program: None,
            python_executable: None,
            extra_python_path: Vec::new(),
        }
    }
}

impl ProviderConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, LspError> {
        let config: Self =
            toml::from_str(contents).map_err(|err| LspError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, LspError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), LspError> {
        if self.debug_level > 3 {
            return Err(LspError::Config(format!(
                "debug_level must be between 0 and 3, got {}",
                self.debug_level
            )));
        }
        for (name, period) in [
            ("time_between_restarts_ms", self.time_between_restarts_ms),
            ("time_heartbeat_ms", self.time_heartbeat_ms),
        ] {
            if period == 0 {
                return Err(LspError::Config(format!("{name} must be positive")));
            }
        }
        for (language, settings) in &self.servers {
            settings
                .validate()
                .map_err(|err| LspError::Config(format!("{language}: {err}")))?;
        }
        Ok(())
    }

    /// Python is always served; other languages only when configured.
    pub fn languages(&self) -> Vec<String> {
        let mut languages = vec![PYTHON.to_string()];
        languages.extend(
            self.servers
                .keys()
                .filter(|language| language.as_str() != PYTHON)
                .cloned(),
        );
        languages
    }

    pub fn settings_for(&self, language: &str) -> Option<ServerSettings> {
        self.resolve_settings(language).map(|(settings, _)| settings)
    }

    /// Settings for `language` together with where they came from.
    ///
    /// For python, `extra_python_path` is folded into the jedi plugin
    /// configuration so path changes reach the server without a restart.
    pub fn resolve_settings(&self, language: &str) -> Option<(ServerSettings, LspServerSource)> {
        let (mut settings, source) = if let Some(settings) = self.servers.get(language) {
            (settings.clone(), LspServerSource::Config)
        } else if language == PYTHON {
            let settings = ServerSettings::python_default(DEFAULT_HOST, DEFAULT_PORT, false, false);
            (settings, LspServerSource::Builtin)
        } else {
            (autodetect_server(language)?, LspServerSource::Autodetect)
        };

        if language == PYTHON && !self.extra_python_path.is_empty() {
            let paths = self
                .extra_python_path
                .iter()
                .map(|path| Value::String(path.display().to_string()))
                .collect();
            insert_at(
                &mut settings.configurations,
                &["pylsp", "plugins", "jedi", "extra_paths"],
                Value::Array(paths),
            );
        }
        Some((settings, source))
    }

    pub fn time_between_restarts(&self) -> Duration {
        Duration::from_millis(self.time_between_restarts_ms)
    }

    pub fn time_heartbeat(&self) -> Duration {
        Duration::from_millis(self.time_heartbeat_ms)
    }

    /// Explicit setting, then the binary installed next to ours, then `PATH`.
    pub fn transport_program(&self) -> PathBuf {
        if let Some(program) = &self.transport_program {
            return program.clone();
        }
        let sibling = std::env::current_exe().ok().and_then(|exe| {
            let dir = exe.parent()?;
            let candidate = dir.join(binary_name(TRANSPORT_BINARY));
            if candidate.is_file() {
                return Some(candidate);
            }
            // Test binaries live one level below the cargo target dir.
            let candidate = dir.parent()?.join(binary_name(TRANSPORT_BINARY));
            candidate.is_file().then_some(candidate)
        });
        sibling
            .or_else(|| which::which(TRANSPORT_BINARY).ok())
            .unwrap_or_else(|| PathBuf::from(TRANSPORT_BINARY))
    }

    pub fn python_executable(&self) -> PathBuf {
        self.python_executable
            .clone()
            .or_else(python_executable)
            .unwrap_or_else(|| PathBuf::from("python3"))
    }

    /// Empty workspace root used when no project is open.
    pub fn empty_root_path(&self) -> PathBuf {
        self.conf_dir.join("lsp_paths").join("root_path")
    }

    /// Working directory for the python server.
    pub fn python_server_cwd(&self) -> PathBuf {
        self.conf_dir.join("lsp_paths").join("cwd")
    }
}

fn insert_at(target: &mut Value, path: &[&str], leaf: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = target;
    for part in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), leaf);
    }
}

fn binary_name(name: &str) -> String {
    format!("{name}{}", std::env::consts::EXE_SUFFIX)
}
