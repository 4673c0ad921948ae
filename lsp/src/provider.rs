//! One [`LspClient`] per language, kept alive across crashes and
//! configuration changes.
//!
//! The provider is a single-owner event pump: clients, timers and response
//! callbacks only ever post events, and [`LspProvider::next_event`] applies
//! them one at a time.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ClientEvent;
use crate::client::ClientId;
use crate::client::ClientOptions;
use crate::client::DocumentSink;
use crate::client::LspClient;
use crate::client::ResponseCallback;
use crate::client::WorkspaceUpdateKind;
use crate::config::PYTHON;
use crate::config::ProviderConfig;
use crate::error::CallbackError;
use crate::error::LspError;
use crate::jsonrpc::RequestId;
use crate::logs;
use crate::servers::ServerSettings;
use crate::status::ClientStatus;
use crate::status::LspLanguageStatus;
use crate::status::LspServerSource;
use crate::status::LspStatus;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);
const MIN_TICK: Duration = Duration::from_millis(1);

/// Where the provider reports to the rest of the application.
///
/// Every method has a no-op default so sinks only implement what they
/// display.
pub trait ProviderSink: Send + Sync {
    fn on_initialize(&self, _language: &str, _capabilities: &Value) {}

    fn on_server_error(&self, _language: &str, _error: &str) {}

    fn on_went_down(&self, _language: &str) {}

    fn on_status_change(&self, _language: &str, _status: ClientStatus) {}

    fn on_response(&self, _req_id: u64, _response: &Value) {}

    /// An external server was not listening when its client was started.
    fn on_no_external_server(&self, _language: &str, _host: &str, _port: u16) {}

    /// The restart budget ran out; completions and diagnostics for
    /// `language` are gone until the application restarts.
    fn on_lsp_down(&self, _language: &str) {}

    /// Notifications and requests from the server that the client does not
    /// answer itself. Requests carry `id` and are answered with
    /// [`LspProvider::send_response`].
    fn on_server_message(
        &self,
        _language: &str,
        _method: &str,
        _id: Option<&RequestId>,
        _params: &Value,
    ) {
    }
}

#[derive(Debug, Clone)]
enum ProviderEvent {
    Client(ClientId, ClientEvent),
    RestartTick(String),
    Heartbeat(String),
    Response { req_id: u64, response: Value },
}

struct ClientRecord {
    status: ClientStatus,
    config: ServerSettings,
    source: LspServerSource,
    instance: Option<LspClient>,
    pending_registrations: Vec<(String, Arc<dyn DocumentSink>)>,
    restart_timer: Option<JoinHandle<()>>,
    heartbeat_timer: Option<JoinHandle<()>>,
    restart_budget: u32,
}

impl ClientRecord {
    fn abort_timers(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.heartbeat_timer.take() {
            timer.abort();
        }
    }
}

pub struct LspProvider {
    config: ProviderConfig,
    sink: Arc<dyn ProviderSink>,
    clients: BTreeMap<String, ClientRecord>,
    current_project: Option<PathBuf>,
    requests: HashSet<u64>,
    next_client_id: ClientId,
    show_no_external_server_warning: bool,
    closing: bool,

    client_tx: mpsc::UnboundedSender<(ClientId, ClientEvent)>,
    client_rx: mpsc::UnboundedReceiver<(ClientId, ClientEvent)>,
    event_tx: mpsc::UnboundedSender<ProviderEvent>,
    event_rx: mpsc::UnboundedReceiver<ProviderEvent>,
}

impl LspProvider {
    pub fn new(config: ProviderConfig, sink: Arc<dyn ProviderSink>) -> Self {
        match logs::cleanup_stale_logs(&config.conf_dir) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "removed stale LSP log files"),
            Err(err) => debug!("could not clean up LSP logs: {err}"),
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut provider = Self {
            config,
            sink,
            clients: BTreeMap::new(),
            current_project: None,
            requests: HashSet::new(),
            next_client_id: 1,
            show_no_external_server_warning: true,
            closing: false,
            client_tx,
            client_rx,
            event_tx,
            event_rx,
        };
        for language in provider.config.languages() {
            provider.ensure_record(&language);
        }
        provider
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn get_languages(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn status(&self, language: &str) -> Option<ClientStatus> {
        self.clients.get(language).map(|record| record.status)
    }

    pub fn client(&self, language: &str) -> Option<&LspClient> {
        self.clients.get(language)?.instance.as_ref()
    }

    pub fn lsp_status(&self) -> LspStatus {
        let languages = self
            .clients
            .iter()
            .map(|(language, record)| {
                let instance = record.instance.as_ref();
                LspLanguageStatus {
                    language: language.clone(),
                    status: record.status,
                    settings: record.config.clone(),
                    source: record.source,
                    running: instance.is_some(),
                    initialized: instance.is_some_and(LspClient::is_initialized),
                    restart_budget: record.restart_budget,
                    server_port: instance
                        .filter(|client| !client.settings().stdio)
                        .map(LspClient::server_port),
                }
            })
            .collect();
        LspStatus {
            root: self.root_path(),
            project: self.current_project.clone(),
            debug_level: self.config.debug_level,
            auto_restart: self.config.auto_restart,
            languages,
        }
    }

    /// Workspace handed to new clients: the open project, or an empty
    /// directory under the configuration folder.
    pub fn root_path(&self) -> PathBuf {
        self.current_project
            .clone()
            .unwrap_or_else(|| self.config.empty_root_path())
    }

    fn ensure_record(&mut self, language: &str) -> bool {
        if self.clients.contains_key(language) {
            return true;
        }
        let Some((config, source)) = self.config.resolve_settings(language) else {
            return false;
        };
        self.clients.insert(
            language.to_string(),
            ClientRecord {
                status: ClientStatus::Stopped,
                config,
                source,
                instance: None,
                pending_registrations: Vec::new(),
                restart_timer: None,
                heartbeat_timer: None,
                restart_budget: self.config.max_restart_attempts,
            },
        );
        true
    }

    fn set_status(&mut self, language: &str, status: ClientStatus) {
        let Some(record) = self.clients.get_mut(language) else {
            return;
        };
        if record.status == status {
            return;
        }
        debug!(language, from = %record.status, to = %status, "status change");
        record.status = status;
        self.sink.on_status_change(language, status);
    }

    fn is_running(&self, language: &str) -> bool {
        self.status(language) == Some(ClientStatus::Running)
    }

    fn running_client(&mut self, language: &str) -> Option<&mut LspClient> {
        self.clients.get_mut(language)?.instance.as_mut()
    }

    fn running_languages(&self) -> Vec<String> {
        self.clients
            .iter()
            .filter(|(_, record)| record.instance.is_some())
            .map(|(language, _)| language.clone())
            .collect()
    }

    fn language_of(&self, id: ClientId) -> Option<String> {
        self.clients
            .iter()
            .find(|(_, record)| {
                record
                    .instance
                    .as_ref()
                    .is_some_and(|client| client.id() == id)
            })
            .map(|(language, _)| language.clone())
    }

    fn spawn_ticker(&self, period: Duration, event: ProviderEvent) -> JoinHandle<()> {
        // `interval_at` panics on a zero period.
        let period = period.max(MIN_TICK);
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(event.clone()).is_err() {
                    break;
                }
            }
        })
    }

    // Client lifecycle

    /// Makes sure `language` has a started client. Returns whether one is
    /// running afterwards.
    pub async fn start_for(&mut self, language: &str) -> bool {
        if !self.ensure_record(language) {
            debug!(language, "no language server available");
            return false;
        }
        let Some(record) = self.clients.get(language) else {
            return false;
        };
        if record.instance.is_some() {
            return true;
        }
        let settings = record.config.clone();
        let restarting = record.restart_timer.is_some();

        if settings.external && !external_server_listening(&settings.host, settings.port).await {
            let err = LspError::Connectivity {
                host: settings.host.clone(),
                port: settings.port,
            };
            warn!(language, "{err}");
            if self.show_no_external_server_warning {
                self.show_no_external_server_warning = false;
                self.sink
                    .on_no_external_server(language, &settings.host, settings.port);
            }
            if !restarting {
                self.set_status(language, ClientStatus::Down);
            }
            return false;
        }

        let folder = self.root_path();
        if self.current_project.is_none() {
            if let Err(err) = std::fs::create_dir_all(&folder) {
                warn!(folder = %folder.display(), "cannot create empty workspace: {err}");
            }
        }

        info!("Starting LSP client for {language}...");
        let id = self.next_client_id;
        self.next_client_id += 1;
        let options = ClientOptions::from_config(&self.config);
        let mut client = match LspClient::new(
            id,
            language,
            settings,
            folder,
            options,
            self.client_tx.clone(),
        ) {
            Ok(client) => client,
            Err(err) => {
                self.start_failed(language, &err, restarting);
                return false;
            }
        };
        if let Err(err) = client.start().await {
            client.stop().await;
            self.start_failed(language, &err, restarting);
            return false;
        }

        let heartbeat = match self.clients.get(language) {
            Some(record) if record.heartbeat_timer.is_none() => Some(self.spawn_ticker(
                self.config.time_heartbeat(),
                ProviderEvent::Heartbeat(language.to_string()),
            )),
            _ => None,
        };
        let Some(record) = self.clients.get_mut(language) else {
            return false;
        };
        for (filename, sink) in record.pending_registrations.drain(..) {
            client.register_file(&filename, sink);
        }
        record.instance = Some(client);
        if heartbeat.is_some() {
            record.heartbeat_timer = heartbeat;
        }
        if !restarting {
            self.set_status(language, ClientStatus::Running);
        }
        true
    }

    fn start_failed(&mut self, language: &str, err: &LspError, restarting: bool) {
        warn!(language, "failed to start LSP client: {err}");
        self.sink.on_server_error(language, &err.to_string());
        if !restarting {
            self.set_status(language, ClientStatus::Down);
        }
    }

    pub async fn stop_for(&mut self, language: &str) {
        let Some(record) = self.clients.get_mut(language) else {
            return;
        };
        if let Some(timer) = record.heartbeat_timer.take() {
            timer.abort();
        }
        let was_running = record.status == ClientStatus::Running;
        let Some(mut client) = record.instance.take() else {
            return;
        };
        info!("Stopping LSP client for {language}...");
        client.stop().await;
        if was_running {
            self.set_status(language, ClientStatus::Stopped);
        }
    }

    pub async fn restart_client(&mut self, language: &str, settings: ServerSettings) -> bool {
        self.stop_for(language).await;
        if let Some(record) = self.clients.get_mut(language) {
            record.config = settings;
        }
        self.start_for(language).await
    }

    /// Stops clients whose language is not in `active`.
    pub async fn update_client_status(&mut self, active: &[String]) {
        for language in self.get_languages() {
            if !active.contains(&language) {
                self.stop_for(&language).await;
            }
        }
    }

    /// Sends `shutdown` and `exit` to every client, then stops them all.
    pub async fn shutdown(&mut self) {
        info!("Shutting down LSP provider...");
        self.closing = true;
        for record in self.clients.values_mut() {
            record.abort_timers();
        }

        let mut waiting = Vec::new();
        for language in self.running_languages() {
            if let Some(client) = self.running_client(&language) {
                if client.is_initialized() && client.shutdown().await.is_some() {
                    waiting.push(language);
                }
            }
        }

        let deadline = Instant::now() + SHUTDOWN_WAIT;
        while !waiting.is_empty() {
            match tokio::time::timeout_at(deadline, self.recv_event()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) | Err(_) => break,
            }
            waiting.retain(|language| {
                self.client(language)
                    .is_some_and(|client| !client.is_ready_to_close())
            });
        }
        if !waiting.is_empty() {
            debug!(?waiting, "servers did not acknowledge shutdown in time");
        }

        for language in self.running_languages() {
            if let Some(client) = self.running_client(&language) {
                client.exit().await;
            }
        }
        for language in self.get_languages() {
            self.stop_for(&language).await;
        }
        self.closing = false;
    }

    // Requests

    pub async fn send_request(
        &mut self,
        language: &str,
        method: &str,
        params: Value,
        req_id: u64,
    ) -> bool {
        self.send_request_with_cancel(language, method, params, req_id, None)
            .await
    }

    /// Sends a request whose response is reported through
    /// [`ProviderSink::on_response`] under `req_id`.
    ///
    /// When `language` is not running, or the request cannot be sent, an
    /// empty response is reported right away. A cancelled token drops the
    /// request silently.
    pub async fn send_request_with_cancel(
        &mut self,
        language: &str,
        method: &str,
        params: Value,
        req_id: u64,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        let events = self.event_tx.clone();
        let callback: ResponseCallback = Box::new(move |response| {
            let response = response.unwrap_or_else(|| json!({"params": []}));
            events
                .send(ProviderEvent::Response { req_id, response })
                .map_err(|_| CallbackError::target_gone("LSP provider"))
        });

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            debug!(method, req_id, "request cancelled before sending");
            return false;
        }
        let running = self.is_running(language);
        let sent = match self.running_client(language) {
            Some(client) if running => client
                .perform_request(method, params, Some(callback), cancel)
                .await
                .is_some(),
            _ => false,
        };
        if sent {
            self.requests.insert(req_id);
        } else {
            self.sink.on_response(req_id, &json!({}));
        }
        sent
    }

    pub async fn send_notification(&mut self, language: &str, method: &str, params: Value) -> bool {
        let running = self.is_running(language);
        match self.running_client(language) {
            Some(client) if running => client
                .perform_request(method, params, None, None)
                .await
                .is_some(),
            _ => false,
        }
    }

    /// Answers a request that reached the application through
    /// [`ProviderSink::on_server_message`].
    pub async fn send_response(&mut self, language: &str, id: RequestId, result: Value) -> bool {
        match self.running_client(language) {
            Some(client) => client.send_response(id, result).await,
            None => false,
        }
    }

    /// Sends to the language named by `params.language`, or to all of them.
    pub async fn broadcast_notification(&mut self, method: &str, params: Value) {
        if let Some(language) = params.get("language").and_then(Value::as_str) {
            let language = language.to_string();
            self.send_notification(&language, method, params).await;
            return;
        }
        for language in self.get_languages() {
            self.send_notification(&language, method, params.clone())
                .await;
        }
    }

    pub fn register_file(&mut self, language: &str, filename: &str, sink: Arc<dyn DocumentSink>) {
        let Some(record) = self.clients.get_mut(language) else {
            return;
        };
        match record.instance.as_mut() {
            Some(client) => client.register_file(filename, sink),
            None => record
                .pending_registrations
                .push((filename.to_string(), sink)),
        }
    }

    // Workspace and configuration

    /// Follows the open project. `projects` lists the projects still open,
    /// most recent last.
    pub async fn project_path_update(
        &mut self,
        path: &Path,
        kind: WorkspaceUpdateKind,
        projects: &[PathBuf],
    ) {
        match kind {
            WorkspaceUpdateKind::Addition => self.current_project = Some(path.to_path_buf()),
            WorkspaceUpdateKind::Deletion => {
                if self.current_project.as_deref() == Some(path) {
                    self.current_project = projects
                        .iter()
                        .rev()
                        .find(|project| project.as_path() != path)
                        .cloned();
                }
            }
        }

        let folder = self.root_path();
        for language in self.running_languages() {
            let Some(record) = self.clients.get_mut(&language) else {
                continue;
            };
            let Some(client) = record.instance.as_mut() else {
                continue;
            };
            if client.support_multiple_workspaces() && client.support_workspace_update() {
                client.send_workspace_folders_change(path, kind).await;
                continue;
            }
            debug!(language = %language, folder = %folder.display(), "workspace folders unsupported, restarting");
            client.set_folder(folder.clone());
            let settings = record.config.clone();
            self.restart_client(&language, settings).await;
        }
    }

    /// Applies a new configuration. Connection changes restart the client;
    /// a change limited to `configurations` is sent to the running server.
    pub async fn update_configuration(&mut self, config: ProviderConfig, python_only: bool) {
        self.config = config;
        self.show_no_external_server_warning = true;

        let languages = if python_only {
            vec![PYTHON.to_string()]
        } else {
            let mut languages = self.config.languages();
            for language in self.clients.keys() {
                if !languages.contains(language) {
                    languages.push(language.clone());
                }
            }
            languages
        };

        for language in languages {
            if !self.clients.contains_key(&language) {
                self.ensure_record(&language);
                continue;
            }
            let Some((new, source)) = self.config.resolve_settings(&language) else {
                continue;
            };
            let Some(record) = self.clients.get_mut(&language) else {
                continue;
            };
            record.source = source;
            let old = record.config.clone();
            let running = record.instance.is_some();

            if ServerSettings::restart_required(&old, &new) {
                if running || (old.external && !new.external) {
                    info!("Restarting {language} client after a configuration change");
                    self.restart_client(&language, new).await;
                } else {
                    record.config = new;
                }
                continue;
            }

            record.config = new.clone();
            if old.configurations != new.configurations {
                if let Some(client) = record.instance.as_mut() {
                    client.send_configurations(new.configurations).await;
                }
            }
        }
    }

    /// Reconfigures the python server when the interpreter search path
    /// changed.
    pub async fn python_path_update(&mut self, old: &[PathBuf], new: &[PathBuf]) {
        if old == new {
            return;
        }
        debug!("Update server's sys.path");
        let mut config = self.config.clone();
        config.extra_python_path = new.to_vec();
        self.update_configuration(config, true).await;
    }

    // Automatic restart

    async fn handle_went_down(&mut self, language: &str) {
        if self.closing {
            return;
        }
        self.sink.on_went_down(language);
        let Some(record) = self.clients.get(language) else {
            return;
        };
        if record.restart_timer.is_some() {
            return;
        }
        if !self.config.auto_restart {
            warn!(language, "LSP server is down and automatic restart is disabled");
            self.report_lsp_down(language).await;
            return;
        }

        info!("Automatic restart for {language}...");
        let timer = self.spawn_ticker(
            self.config.time_between_restarts(),
            ProviderEvent::RestartTick(language.to_string()),
        );
        let max_attempts = self.config.max_restart_attempts;
        let Some(record) = self.clients.get_mut(language) else {
            timer.abort();
            return;
        };
        if let Some(heartbeat) = record.heartbeat_timer.take() {
            heartbeat.abort();
        }
        record.restart_budget = max_attempts;
        record.restart_timer = Some(timer);
        self.set_status(language, ClientStatus::Restarting);
    }

    /// Restarts `language` now when `force` is set; otherwise runs one
    /// attempt of the automatic restart loop, giving up once the budget is
    /// spent.
    pub async fn restart_lsp(&mut self, language: &str, force: bool) {
        let Some(record) = self.clients.get_mut(language) else {
            return;
        };
        let settings = self
            .config
            .settings_for(language)
            .unwrap_or_else(|| record.config.clone());

        if force {
            info!("Manual restart for {language}...");
            self.set_status(language, ClientStatus::Restarting);
            self.restart_client(language, settings).await;
            return;
        }
        if record.restart_timer.is_none() {
            return;
        }

        let attempt = self
            .config
            .max_restart_attempts
            .saturating_sub(record.restart_budget)
            + 1;
        info!("Automatic restart attempt {attempt} for {language}...");
        record.restart_budget = record.restart_budget.saturating_sub(1);
        let exhausted = record.restart_budget == 0;
        self.set_status(language, ClientStatus::Restarting);
        self.restart_client(language, settings).await;

        if exhausted {
            info!("Restart failed!");
            self.report_lsp_down(language).await;
        }
    }

    async fn report_lsp_down(&mut self, language: &str) {
        if let Some(record) = self.clients.get_mut(language) {
            record.abort_timers();
        }
        self.stop_for(language).await;
        self.set_status(language, ClientStatus::Down);
        if self.config.show_lsp_down_warning {
            self.sink.on_lsp_down(language);
        }
    }

    fn on_client_initialized(&mut self, language: &str) {
        let max_attempts = self.config.max_restart_attempts;
        let Some(record) = self.clients.get_mut(language) else {
            return;
        };
        if record.restart_timer.is_none() {
            self.set_status(language, ClientStatus::Running);
            return;
        }

        // Only stdio servers can vanish behind a live transport.
        let healthy = record.instance.as_ref().is_some_and(|client| {
            client.stdio_pid().is_none() || client.is_stdio_alive()
        });
        if !healthy {
            return;
        }
        info!("Restart successful!");
        if let Some(timer) = record.restart_timer.take() {
            timer.abort();
        }
        record.restart_budget = max_attempts;
        self.set_status(language, ClientStatus::Running);
    }

    async fn check_heartbeat(&mut self, language: &str) {
        let running = self.is_running(language);
        let Some(client) = self.running_client(language) else {
            return;
        };
        // A dead client posts its went-down event itself.
        if client.is_down() {
            debug!(language, "heartbeat found the client down");
            return;
        }
        if !running {
            debug!(language, "heartbeat found the language not running");
            self.handle_went_down(language).await;
        }
    }

    // Event pump

    async fn recv_event(&mut self) -> Option<ProviderEvent> {
        tokio::select! {
            Some((id, event)) = self.client_rx.recv() => Some(ProviderEvent::Client(id, event)),
            Some(event) = self.event_rx.recv() => Some(event),
            else => None,
        }
    }

    /// Waits for and applies one event. Returns `false` once no more events
    /// can arrive.
    pub async fn next_event(&mut self) -> bool {
        match self.recv_event().await {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Processes events until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.recv_event() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::Client(id, event) => self.handle_client_event(id, event).await,
            ProviderEvent::RestartTick(language) => self.restart_lsp(&language, false).await,
            ProviderEvent::Heartbeat(language) => self.check_heartbeat(&language).await,
            ProviderEvent::Response { req_id, response } => {
                if self.requests.remove(&req_id) {
                    self.sink.on_response(req_id, &response);
                }
            }
        }
    }

    async fn handle_client_event(&mut self, id: ClientId, event: ClientEvent) {
        let Some(language) = self.language_of(id) else {
            debug!(id, "dropping event from a stopped client");
            return;
        };
        match event {
            ClientEvent::MessagesAvailable => {
                if let Some(client) = self.running_client(&language) {
                    client.on_messages_available().await;
                }
            }
            ClientEvent::Initialized(capabilities) => {
                self.sink.on_initialize(&language, &capabilities);
                self.on_client_initialized(&language);
            }
            ClientEvent::ServerError(error) => self.sink.on_server_error(&language, &error),
            ClientEvent::WentDown => self.handle_went_down(&language).await,
            ClientEvent::ServerMessage { method, id, params } => {
                self.sink
                    .on_server_message(&language, &method, id.as_ref(), &params);
            }
        }
    }
}

async fn external_server_listening(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.events()
                .iter()
                .filter(|event| event.starts_with(prefix))
                .count()
        }
    }

    impl ProviderSink for RecordingSink {
        fn on_server_error(&self, language: &str, _error: &str) {
            self.push(format!("server_error {language}"));
        }

        fn on_went_down(&self, language: &str) {
            self.push(format!("went_down {language}"));
        }

        fn on_status_change(&self, language: &str, status: ClientStatus) {
            self.push(format!("status {language} {status}"));
        }

        fn on_response(&self, req_id: u64, response: &Value) {
            self.push(format!("response {req_id} {response}"));
        }

        fn on_no_external_server(&self, language: &str, host: &str, port: u16) {
            self.push(format!("no_external_server {language} {host}:{port}"));
        }

        fn on_lsp_down(&self, language: &str) {
            self.push(format!("lsp_down {language}"));
        }
    }

    fn config(dir: &Path) -> ProviderConfig {
        ProviderConfig {
            conf_dir: dir.to_path_buf(),
            transport_program: Some(PathBuf::from("/nonexistent/spyder-lsp-transport")),
            ..ProviderConfig::default()
        }
    }

    #[tokio::test]
    async fn unreachable_external_server_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.servers.insert(
            "python".to_string(),
            ServerSettings {
                external: true,
                port: 65535,
                ..ServerSettings::new("ignored")
            },
        );
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(config, sink.clone());

        assert!(!provider.start_for("python").await);
        assert!(!provider.start_for("python").await);
        assert_eq!(provider.status("python"), Some(ClientStatus::Down));
        assert!(!provider.send_request("python", "textDocument/hover", json!({}), 17).await);

        assert_eq!(
            sink.events(),
            vec![
                "no_external_server python 127.0.0.1:65535",
                "status python down",
                "response 17 {}",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restart_budget_runs_out_after_five_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.servers.insert(
            "rust".to_string(),
            ServerSettings {
                stdio: true,
                ..ServerSettings::new("rust-analyzer")
            },
        );
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(config, sink.clone());

        let started = Instant::now();
        provider.handle_went_down("rust").await;
        assert_eq!(provider.status("rust"), Some(ClientStatus::Restarting));
        while provider.status("rust") != Some(ClientStatus::Down) {
            assert!(provider.next_event().await);
        }

        assert_eq!(started.elapsed(), Duration::from_secs(50));
        assert_eq!(sink.count("server_error rust"), 5);
        assert_eq!(sink.count("lsp_down rust"), 1);
        assert_eq!(
            sink.events().last().map(String::as_str),
            Some("lsp_down rust")
        );
        let record = provider.clients.get("rust").unwrap();
        assert!(record.restart_timer.is_none());
        assert!(record.heartbeat_timer.is_none());
        assert!(record.instance.is_none());
    }

    fn stdio_rust(dir: &Path) -> ProviderConfig {
        let mut config = config(dir);
        config.servers.insert(
            "rust".to_string(),
            ServerSettings {
                stdio: true,
                ..ServerSettings::new("rust-analyzer")
            },
        );
        config
    }

    /// Gives `language` a client that was never started, so it has no
    /// processes that could be found dead.
    fn attach_idle_client(provider: &mut LspProvider, language: &str) -> ClientId {
        let id = provider.next_client_id;
        provider.next_client_id += 1;
        let settings = provider.clients.get(language).unwrap().config.clone();
        let client = LspClient::new(
            id,
            language,
            settings,
            provider.root_path(),
            ClientOptions::from_config(&provider.config),
            provider.client_tx.clone(),
        )
        .unwrap();
        provider.clients.get_mut(language).unwrap().instance = Some(client);
        id
    }

    #[tokio::test(start_paused = true)]
    async fn zero_restart_period_still_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stdio_rust(dir.path());
        config.time_between_restarts_ms = 0;
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(config, sink.clone());

        provider.handle_went_down("rust").await;
        let pumped = tokio::time::timeout(Duration::from_secs(2), async {
            while provider.status("rust") != Some(ClientStatus::Down) {
                assert!(provider.next_event().await);
            }
        })
        .await;
        assert!(pumped.is_ok(), "{:?}", sink.events());
        assert_eq!(sink.count("server_error rust"), 5);
    }

    #[tokio::test]
    async fn requests_outside_running_get_an_empty_response() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(stdio_rust(dir.path()), sink.clone());

        provider.handle_went_down("rust").await;
        attach_idle_client(&mut provider, "rust");
        assert_eq!(provider.status("rust"), Some(ClientStatus::Restarting));
        assert!(!provider.send_request("rust", "textDocument/hover", json!({}), 17).await);
        assert!(!provider.send_notification("rust", "textDocument/didSave", json!({})).await);

        // Running, but the client has no channel to send through.
        provider.set_status("rust", ClientStatus::Running);
        assert!(!provider.send_request("rust", "textDocument/hover", json!({}), 18).await);

        assert_eq!(sink.count("response 17 {}"), 1);
        assert_eq!(sink.count("response 18 {}"), 1);
        assert!(provider.requests.is_empty());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(
            !provider
                .send_request_with_cancel("rust", "textDocument/hover", json!({}), 19, Some(&cancel))
                .await
        );
        assert_eq!(sink.count("response 19"), 0);
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn initialized_client_ends_the_restart_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(stdio_rust(dir.path()), sink.clone());

        provider.handle_went_down("rust").await;
        provider.clients.get_mut("rust").unwrap().restart_budget = 2;
        let id = attach_idle_client(&mut provider, "rust");
        provider
            .handle_event(ProviderEvent::Client(id, ClientEvent::Initialized(json!({}))))
            .await;

        assert_eq!(provider.status("rust"), Some(ClientStatus::Running));
        let record = provider.clients.get("rust").unwrap();
        assert!(record.restart_timer.is_none());
        assert_eq!(record.restart_budget, 5);
        assert_eq!(
            sink.events(),
            vec![
                "went_down rust",
                "status rust restarting",
                "status rust ready",
            ]
        );
        provider.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_restarts_a_client_that_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(stdio_rust(dir.path()), sink.clone());
        attach_idle_client(&mut provider, "rust");
        assert_eq!(provider.status("rust"), Some(ClientStatus::Stopped));

        provider
            .handle_event(ProviderEvent::Heartbeat("rust".to_string()))
            .await;
        assert_eq!(provider.status("rust"), Some(ClientStatus::Restarting));
        assert!(provider.clients.get("rust").unwrap().restart_timer.is_some());

        // The first restart tick replaces the client.
        let started = Instant::now();
        while sink.count("server_error rust") == 0 {
            assert!(provider.next_event().await);
        }
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(
            sink.events(),
            vec![
                "went_down rust",
                "status rust restarting",
                "server_error rust",
            ]
        );
        assert_eq!(provider.clients.get("rust").unwrap().restart_budget, 4);
        assert!(provider.client("rust").is_none());
    }

    #[tokio::test]
    async fn start_failure_outside_restart_marks_language_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.servers.insert(
            "rust".to_string(),
            ServerSettings {
                stdio: true,
                ..ServerSettings::new("rust-analyzer")
            },
        );
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(config, sink.clone());

        assert!(!provider.start_for("rust").await);
        assert_eq!(
            sink.events(),
            vec!["server_error rust", "status rust down"]
        );
        assert!(provider.client("rust").is_none());
    }

    #[tokio::test]
    async fn stopped_language_takes_new_settings_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config
            .servers
            .insert("rust".to_string(), ServerSettings::new("rust-analyzer"));
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(config.clone(), sink.clone());

        config.servers.insert(
            "rust".to_string(),
            ServerSettings {
                configurations: json!({"checkOnSave": false}),
                port: 3000,
                ..ServerSettings::new("rust-analyzer")
            },
        );
        provider.update_configuration(config, false).await;

        assert_eq!(provider.status("rust"), Some(ClientStatus::Stopped));
        let status = provider.lsp_status();
        let rust = status
            .languages
            .iter()
            .find(|lang| lang.language == "rust")
            .unwrap();
        assert_eq!(rust.settings.port, 3000);
        assert_eq!(rust.source, LspServerSource::Config);
        assert!(!rust.running);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn project_changes_move_the_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(config(dir.path()), sink);
        let empty_root = dir.path().join("lsp_paths").join("root_path");
        assert_eq!(provider.root_path(), empty_root);

        let first = PathBuf::from("/projects/first");
        let second = PathBuf::from("/projects/second");
        provider
            .project_path_update(&first, WorkspaceUpdateKind::Addition, &[first.clone()])
            .await;
        provider
            .project_path_update(
                &second,
                WorkspaceUpdateKind::Addition,
                &[first.clone(), second.clone()],
            )
            .await;
        assert_eq!(provider.root_path(), second);

        provider
            .project_path_update(&second, WorkspaceUpdateKind::Deletion, &[first.clone()])
            .await;
        assert_eq!(provider.root_path(), first);

        provider
            .project_path_update(&first, WorkspaceUpdateKind::Deletion, &[])
            .await;
        assert_eq!(provider.root_path(), empty_root);
        assert_eq!(provider.lsp_status().project, None);
    }

    struct NullSink;

    impl DocumentSink for NullSink {
        fn publish_diagnostics(&self, _params: &Value) -> Result<(), CallbackError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registrations_wait_for_a_client() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(config(dir.path()), sink);

        provider.register_file("python", "/tmp/a.py", Arc::new(NullSink));
        provider.register_file("cobol", "/tmp/a.cbl", Arc::new(NullSink));
        let record = provider.clients.get("python").unwrap();
        assert_eq!(record.pending_registrations.len(), 1);
        assert_eq!(provider.get_languages(), vec!["python"]);
    }

    #[tokio::test]
    async fn responses_are_reported_once_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut provider = LspProvider::new(config(dir.path()), sink.clone());
        provider.requests.insert(3);

        let response = json!({"items": []});
        for _ in 0..2 {
            provider
                .handle_event(ProviderEvent::Response {
                    req_id: 3,
                    response: response.clone(),
                })
                .await;
        }
        assert_eq!(sink.events(), vec![r#"response 3 {"items":[]}"#]);
    }
}
