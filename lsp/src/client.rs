use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dunce::canonicalize as normalize_path;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::capabilities::client_capabilities;
use crate::capabilities::default_server_capabilities;
use crate::capabilities::merge_server_capabilities;
use crate::capabilities::supports_multiple_workspaces;
use crate::capabilities::supports_workspace_update;
use crate::channel::MessageChannel;
use crate::config::PYTHON;
use crate::config::ProviderConfig;
use crate::error::CallbackError;
use crate::error::LspError;
use crate::jsonrpc::Message;
use crate::jsonrpc::MessageKind;
use crate::jsonrpc::RequestId;
use crate::jsonrpc::file_uri;
use crate::logs;
use crate::process::ChannelMode;
use crate::process::ProcessSupervisor;
use crate::process::Sink;
use crate::process::SpawnSpec;
use crate::process::kill_pid;
use crate::process::stdio_alive;
use crate::registry::Handler;
use crate::registry::MethodRegistry;
use crate::registry::methods;
use crate::servers::ServerSettings;
use crate::servers::select_port;
use crate::transport::TransportArgs;
use crate::transport::TransportMode;
use crate::transport::TransportProcess;

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub type ClientId = u64;

/// Invoked with the response of a request, or `None` when the server
/// answered with an error.
pub type ResponseCallback = Box<dyn FnOnce(Option<Value>) -> Result<(), CallbackError> + Send>;

/// Receives diagnostics for a file registered with [`LspClient::register_file`].
pub trait DocumentSink: Send + Sync {
    fn publish_diagnostics(&self, params: &Value) -> Result<(), CallbackError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The notifier fired; call [`LspClient::on_messages_available`].
    MessagesAvailable,
    /// `initialize` completed; carries the merged server capabilities.
    Initialized(Value),
    ServerError(String),
    WentDown,
    /// A server notification or request meant for the application.
    ServerMessage {
        method: String,
        id: Option<RequestId>,
        params: Value,
    },
}

pub type EventSender = mpsc::UnboundedSender<(ClientId, ClientEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceUpdateKind {
    Addition,
    Deletion,
}

/// The parts of [`ProviderConfig`] a client needs, frozen at creation.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub debug_level: u8,
    pub dev_mode: bool,
    pub conf_dir: PathBuf,
    pub transport_program: PathBuf,
    pub python_executable: PathBuf,
    pub extra_python_path: Vec<PathBuf>,
    pub python_cwd: PathBuf,
}

impl ClientOptions {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            debug_level: config.debug_level,
            dev_mode: config.dev_mode,
            conf_dir: config.conf_dir.clone(),
            transport_program: config.transport_program(),
            python_executable: config.python_executable(),
            extra_python_path: config.extra_python_path.clone(),
            python_cwd: config.python_server_cwd(),
        }
    }
}

/// One LSP session: the server and transport processes, the message channel
/// to the transport and the bookkeeping of in-flight requests.
pub struct LspClient {
    id: ClientId,
    language: String,
    settings: ServerSettings,
    options: ClientOptions,
    folder: PathBuf,
    server_host: String,
    server_port: u16,
    registry: MethodRegistry,
    events: EventSender,

    channel: Option<MessageChannel>,
    server: Option<ProcessSupervisor>,
    transport: TransportProcess,
    stdio_pid: Option<u32>,

    request_seq: u64,
    req_status: HashMap<u64, String>,
    req_reply: HashMap<u64, ResponseCallback>,
    watched_files: HashMap<String, Vec<Arc<dyn DocumentSink>>>,
    watched_folders: BTreeMap<String, Value>,
    server_capabilities: Map<String, Value>,

    initialized: bool,
    ready_to_close: bool,
    stopped: bool,
    server_unresponsive: bool,
    transport_unresponsive: bool,
    went_down: Arc<AtomicBool>,
}

impl LspClient {
    pub fn new(
        id: ClientId,
        language: &str,
        settings: ServerSettings,
        folder: PathBuf,
        options: ClientOptions,
        events: EventSender,
    ) -> Result<Self, LspError> {
        settings.validate()?;

        // The chosen port is never written back into `settings`, otherwise
        // the next configuration update would look like a restart.
        let server_port = if settings.external {
            settings.port
        } else {
            select_port(&settings.host, settings.port)
        };

        Ok(Self {
            id,
            language: language.to_string(),
            server_host: settings.host.clone(),
            server_port,
            settings,
            options,
            folder,
            registry: MethodRegistry::standard(),
            events,
            channel: None,
            server: None,
            transport: TransportProcess::new(),
            stdio_pid: None,
            request_seq: 1,
            req_status: HashMap::new(),
            req_reply: HashMap::new(),
            watched_files: HashMap::new(),
            watched_folders: BTreeMap::new(),
            server_capabilities: default_server_capabilities(),
            initialized: false,
            ready_to_close: false,
            stopped: false,
            server_unresponsive: false,
            transport_unresponsive: false,
            went_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn set_folder(&mut self, folder: PathBuf) {
        self.folder = folder;
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn stdio_pid(&self) -> Option<u32> {
        self.stdio_pid
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_ready_to_close(&self) -> bool {
        self.ready_to_close
    }

    pub fn server_capabilities(&self) -> &Map<String, Value> {
        &self.server_capabilities
    }

    pub fn next_request_id(&self) -> u64 {
        self.request_seq
    }

    pub fn pending_requests(&self) -> usize {
        self.req_status.len()
    }

    // Startup

    /// Binds the channel, then spawns the server and the transport.
    ///
    /// The channel must exist before either process starts because the
    /// transport is told its ports on the command line.
    pub async fn start(&mut self) -> Result<(), LspError> {
        self.open_channel().await?;
        self.start_server()?;
        self.start_transport()?;
        self.install_notifier();
        debug!(language = %self.language, "LSP client started");
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<(), LspError> {
        self.channel = Some(MessageChannel::open().await?);
        Ok(())
    }

    fn install_notifier(&self) {
        let Some(channel) = &self.channel else {
            return;
        };
        let events = self.events.clone();
        let id = self.id;
        channel.install_notifier(move || {
            let _ = events.send((id, ClientEvent::MessagesAvailable));
        });
    }

    fn went_down_callback(&self) -> Arc<dyn Fn() + Send + Sync> {
        let events = self.events.clone();
        let guard = Arc::clone(&self.went_down);
        let id = self.id;
        Arc::new(move || {
            if !guard.swap(true, Ordering::AcqRel) {
                let _ = events.send((id, ClientEvent::WentDown));
            }
        })
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send((self.id, event));
    }

    fn emit_went_down(&self) {
        (self.went_down_callback())();
    }

    fn is_python(&self) -> bool {
        self.language == PYTHON
    }

    fn log_file(&self, kind: &str) -> Option<PathBuf> {
        if self.options.debug_level == 0 {
            return None;
        }
        match logs::log_file(
            &self.options.conf_dir,
            kind,
            &self.language,
            std::process::id(),
        ) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(language = %self.language, "cannot create {kind} log file: {err}");
                None
            }
        }
    }

    pub fn server_argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if self.is_python() {
            argv.push(self.options.python_executable.display().to_string());
            argv.push("-m".to_string());
        }
        argv.push(self.settings.cmd.clone());
        argv.extend(
            self.settings
                .render_args(&self.server_host, self.server_port),
        );

        if self.is_python() && self.options.debug_level > 0 {
            if let Some(log) = self.log_file("server") {
                argv.push("--log-file".to_string());
                argv.push(log.display().to_string());
            }
            match self.options.debug_level {
                2 => argv.push("-v".to_string()),
                3 => argv.push("-vv".to_string()),
                _ => {}
            }
        }
        argv
    }

    pub fn transport_args(&self) -> TransportArgs {
        let (host_out_port, host_in_port) = self
            .channel
            .as_ref()
            .map(|channel| (channel.out_port(), channel.in_port()))
            .unwrap_or_default();
        let mode = if self.settings.stdio {
            TransportMode::Stdio {
                server_argv: self.server_argv(),
                server_log_file: self.log_file("server"),
            }
        } else {
            TransportMode::External
        };
        TransportArgs {
            folder: self.folder.clone(),
            debug_level: self.options.debug_level,
            server_host: self.server_host.clone(),
            server_port: self.server_port,
            host_out_port,
            host_in_port,
            mode,
        }
    }

    fn start_server(&mut self) -> Result<(), LspError> {
        if self.settings.external || self.settings.stdio {
            return Ok(());
        }

        let argv = self.server_argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(LspError::Config("empty server command".to_string()));
        };
        let mut spec = SpawnSpec::new(program, args.to_vec());
        spec.channel_mode = ChannelMode::Merged;
        spec.stdout = self.log_file("server").map_or(Sink::Discard, Sink::File);

        if self.options.dev_mode && !self.options.extra_python_path.is_empty() {
            let mut paths = self.options.extra_python_path.clone();
            if let Some(existing) = std::env::var_os("PYTHONPATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            if let Ok(joined) = std::env::join_paths(paths) {
                spec.env
                    .push(("PYTHONPATH".to_string(), joined.to_string_lossy().into_owned()));
            }
        }

        if self.is_python() {
            // An empty cwd keeps user files named like stdlib modules out of
            // the server's import path.
            std::fs::create_dir_all(&self.options.python_cwd)?;
            spec.cwd = Some(self.options.python_cwd.clone());
            if cfg!(windows) {
                if let Ok(profile) = std::env::var("USERPROFILE") {
                    spec.env.push(("USERPROFILE".to_string(), profile));
                }
            }
        }

        info!(language = %self.language, "Starting server: {}", spec.command_line());
        let went_down = self.went_down_callback();
        let server = ProcessSupervisor::spawn("server", &spec, move |_| went_down())?;
        self.server = Some(server);
        Ok(())
    }

    fn start_transport(&mut self) -> Result<(), LspError> {
        let args = self.transport_args().to_argv();
        let mut spec = SpawnSpec::new(&self.options.transport_program, args);
        let log = self.log_file("transport").map_or(Sink::Discard, Sink::File);
        if self.settings.stdio {
            spec.channel_mode = ChannelMode::Separate;
            spec.stderr = log;
        } else {
            spec.channel_mode = ChannelMode::Merged;
            spec.stdout = log;
        }
        let went_down = self.went_down_callback();
        self.transport.start(&spec, went_down)
    }

    // Teardown

    /// Disconnects the notifier and kills the transport and the server.
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        if !self.stopped {
            info!("Stopping {} client...", self.language);
        }
        self.stopped = true;
        if let Some(channel) = &self.channel {
            channel.remove_notifier();
        }
        self.transport.terminate().await;
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if let Some(server) = self.server.as_mut() {
            server.terminate().await;
        }
        if let Some(pid) = self.stdio_pid {
            if stdio_alive(pid) {
                kill_pid(pid);
            }
        }
    }

    // Health

    pub fn is_transport_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub fn is_server_alive(&self) -> bool {
        self.server.as_ref().is_some_and(ProcessSupervisor::is_alive)
    }

    /// Without a pid from the transport the best signal left is the
    /// transport itself.
    pub fn is_stdio_alive(&self) -> bool {
        if self.stopped {
            return false;
        }
        match self.stdio_pid {
            Some(pid) => stdio_alive(pid),
            None => self.is_transport_alive(),
        }
    }

    /// Checks every process this client depends on, emitting the went-down
    /// event the first time one of them is found dead.
    pub fn is_down(&mut self) -> bool {
        let mut is_down = false;

        if self.transport.pid().is_some() && !self.is_transport_alive() {
            debug!("Transport layer for {} is down!!", self.language);
            if !self.transport_unresponsive {
                self.transport_unresponsive = true;
                self.emit_went_down();
            }
            is_down = true;
        }

        if self.server.is_some() && !self.is_server_alive() {
            debug!("LSP server for {} is down!!", self.language);
            if !self.server_unresponsive {
                self.server_unresponsive = true;
                self.emit_went_down();
            }
            is_down = true;
        }

        if let Some(pid) = self.stdio_pid {
            if self.stopped || !stdio_alive(pid) {
                debug!(pid, "stdio server for {} is down!!", self.language);
                if !self.server_unresponsive {
                    self.server_unresponsive = true;
                    self.emit_went_down();
                }
                is_down = true;
            }
        }

        is_down
    }

    // Send path

    async fn send(&mut self, method: &str, params: Value, kind: MessageKind) -> Option<u64> {
        let id = self.request_seq;
        let msg = match kind {
            MessageKind::Request if id == u64::MAX => {
                warn!(method, "request ids are exhausted");
                return None;
            }
            MessageKind::Request => Message::request(id, method, params),
            MessageKind::Notification => Message::notification(method, params),
            MessageKind::Response => {
                warn!(method, "responses need the id of the server request");
                return None;
            }
        };
        self.deliver(msg).await?;
        if kind == MessageKind::Request {
            self.req_status.insert(id, method.to_string());
            self.request_seq += 1;
        }
        debug!(language = %self.language, method, id, "Perform request");
        Some(id)
    }

    /// Queues `msg`, retrying a full queue for up to a second.
    async fn deliver(&mut self, msg: Message) -> Option<()> {
        if self.is_down() {
            return None;
        }
        let channel = self.channel.as_ref()?;

        let started = Instant::now();
        loop {
            match channel.send(msg.clone()) {
                Ok(()) => return Some(()),
                Err(LspError::ChannelFull(_)) => {
                    if started.elapsed() >= SEND_TIMEOUT {
                        let err = LspError::ChannelFull(started.elapsed().as_millis());
                        warn!(language = %self.language, "{err}");
                        self.emit_went_down();
                        return None;
                    }
                    if self.initialized {
                        warn!("The send queue is full! Retrying...");
                    }
                    tokio::time::sleep(SEND_RETRY_INTERVAL).await;
                }
                Err(err) => {
                    warn!(language = %self.language, "cannot send to transport: {err}");
                    self.transport.mark_dead();
                    self.emit_went_down();
                    return None;
                }
            }
        }
    }

    /// Sends `method` through its registered sender.
    ///
    /// Returns the request id for requests, the current sequence number for
    /// notifications, and `None` when nothing was sent. `callback` is kept
    /// until the response arrives.
    pub async fn perform_request(
        &mut self,
        method: &str,
        params: Value,
        callback: Option<ResponseCallback>,
        cancel: Option<&CancellationToken>,
    ) -> Option<u64> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            debug!(method, "request cancelled before sending");
            return None;
        }
        let Some(kind) = self.registry.sender_for(method) else {
            debug!(method, "no sender registered");
            return None;
        };
        let id = self.send(method, params, kind).await?;
        if kind == MessageKind::Request {
            if let Some(callback) = callback {
                self.req_reply.insert(id, callback);
            }
        }
        Some(id)
    }

    pub async fn send_notification(&mut self, method: &str, params: Value) -> Option<u64> {
        self.send(method, params, MessageKind::Notification).await
    }

    /// Answers a server-originated request, echoing its id.
    pub async fn send_response(&mut self, id: RequestId, result: Value) -> bool {
        self.deliver(Message::response(id, result)).await.is_some()
    }

    pub async fn shutdown(&mut self) -> Option<u64> {
        self.send(methods::SHUTDOWN, json!({}), MessageKind::Request)
            .await
    }

    pub async fn exit(&mut self) -> Option<u64> {
        self.send(methods::EXIT, json!({}), MessageKind::Notification)
            .await
    }

    pub async fn send_configurations(&mut self, configurations: Value) -> Option<u64> {
        self.settings.configurations = configurations.clone();
        self.send(
            methods::WORKSPACE_CONFIGURATION_CHANGE,
            json!({"settings": configurations}),
            MessageKind::Notification,
        )
        .await
    }

    // Receive path

    /// Drains the channel and handles every message in transport order.
    pub async fn on_messages_available(&mut self) {
        let batch = match &self.channel {
            Some(channel) => {
                channel.disarm();
                channel.recv_available()
            }
            None => return,
        };
        match batch {
            Ok(messages) => {
                for msg in messages {
                    self.handle_message(msg).await;
                }
            }
            Err(err) => {
                warn!(language = %self.language, "{err}");
                self.transport.mark_dead();
            }
        }
        if let Some(channel) = &self.channel {
            channel.rearm();
        }
    }

    async fn handle_message(&mut self, msg: Message) {
        if let Some(method) = &msg.method {
            debug!("{} response: {}", self.language, method);
        }

        if let Some(error) = msg.error {
            debug!("{} Response error: {:?}", self.language, error);
            if self.is_python() && (self.options.debug_level > 0 || self.options.dev_mode) {
                let traceback = error
                    .data
                    .as_ref()
                    .and_then(|data| data.get("traceback"))
                    .map(|traceback| match traceback {
                        Value::Array(lines) => lines.iter().filter_map(Value::as_str).collect(),
                        Value::String(text) => text.clone(),
                        _ => String::new(),
                    });
                if let Some(traceback) = traceback {
                    self.emit(ClientEvent::ServerError(format!(
                        "{traceback}\n{}",
                        error.message
                    )));
                }
            }
            if let Some(id) = msg.id.as_ref().and_then(RequestId::as_number) {
                self.req_status.remove(&id);
                if let Some(callback) = self.req_reply.remove(&id) {
                    invoke_callback(id, callback, None);
                }
            }
            return;
        }

        if let Some(method) = msg.method {
            if method.starts_with('$') {
                return;
            }
            if let Some(id) = msg.id.as_ref().and_then(RequestId::as_number) {
                self.skip_past(id);
            }
            let params = msg.params.unwrap_or(Value::Null);
            match self.registry.handler_for(&method) {
                Some(handler) => self.dispatch(handler, method, msg.id, params).await,
                None => debug!(method = %method, "no handler registered"),
            }
            return;
        }

        if let Some(result) = msg.result {
            let Some(id) = msg.id.as_ref().and_then(RequestId::as_number) else {
                warn!(language = %self.language, "response without a usable id");
                return;
            };
            self.skip_past(id);
            let Some(method) = self.req_status.remove(&id) else {
                debug!(id, "response to an unknown request");
                return;
            };
            let callback = self.req_reply.remove(&id);
            match self.registry.handler_for(&method) {
                Some(Handler::Initialize) => self.process_server_capabilities(result).await,
                Some(Handler::Shutdown) => self.ready_to_close = true,
                _ => {
                    if let Some(callback) = callback {
                        invoke_callback(id, callback, Some(result));
                    }
                }
            }
        }
    }

    /// Keeps our request ids clear of ids the server has used.
    fn skip_past(&mut self, id: u64) {
        match id.checked_add(1) {
            Some(next) => self.request_seq = self.request_seq.max(next),
            None => {
                let err = LspError::Protocol(format!("request id {id} leaves no room for ours"));
                warn!(language = %self.language, "{err}");
            }
        }
    }

    async fn dispatch(
        &mut self,
        handler: Handler,
        method: String,
        id: Option<RequestId>,
        params: Value,
    ) {
        match handler {
            Handler::ServerReady => {
                self.stdio_pid = params
                    .get("pid")
                    .and_then(Value::as_u64)
                    .and_then(|pid| u32::try_from(pid).ok());
                self.initialize().await;
            }
            Handler::Initialize | Handler::Shutdown => {
                debug!(method = %method, "unexpected lifecycle message from server");
            }
            Handler::PublishDiagnostics => {
                self.publish_diagnostics(&params);
                self.forward(method, id, params);
            }
            Handler::WorkspaceConfiguration => {
                let result = self.configuration_items(&params);
                if let Some(id) = id {
                    self.send_response(id, result).await;
                }
            }
            Handler::WorkspaceFolders => {
                let folders: Vec<Value> = self.watched_folders.values().cloned().collect();
                if let Some(id) = id {
                    self.send_response(id, Value::Array(folders)).await;
                }
            }
            Handler::AcknowledgeAndForward => {
                if let Some(id) = id.clone() {
                    self.send_response(id, Value::Null).await;
                }
                self.forward(method, id, params);
            }
            Handler::Forward => self.forward(method, id, params),
        }
    }

    fn forward(&self, method: String, id: Option<RequestId>, params: Value) {
        self.emit(ClientEvent::ServerMessage { method, id, params });
    }

    // Lifecycle handlers

    async fn initialize(&mut self) {
        let root = normalize_path(&self.folder).unwrap_or_else(|_| self.folder.clone());
        let root_uri = file_uri(&root).ok().map(|uri| uri.to_string());
        let process_id = if self.settings.external {
            None
        } else {
            self.transport.pid()
        };
        let workspace_folders = root_uri.as_ref().map(|uri| {
            let entry = json!({"uri": uri, "name": folder_name(&root)});
            self.watched_folders
                .insert(root.display().to_string(), entry.clone());
            vec![entry]
        });
        let trace = if self.options.dev_mode {
            "verbose"
        } else {
            "messages"
        };
        let params = json!({
            "processId": process_id,
            "rootUri": root_uri,
            "rootPath": root.display().to_string(),
            "workspaceFolders": workspace_folders,
            "capabilities": client_capabilities(),
            "trace": trace,
            "clientInfo": {"name": "spyder-lsp", "version": env!("CARGO_PKG_VERSION")},
        });
        self.send(methods::INITIALIZE, params, MessageKind::Request)
            .await;
    }

    async fn process_server_capabilities(&mut self, result: Value) {
        let advertised = result.get("capabilities").cloned().unwrap_or(Value::Null);
        merge_server_capabilities(&mut self.server_capabilities, &advertised);

        // `initialized` has to be the first message after the response.
        self.initialized = true;
        self.send(methods::INITIALIZED, json!({}), MessageKind::Notification)
            .await;

        let configurations = self.settings.configurations.clone();
        self.send_configurations(configurations).await;

        self.emit(ClientEvent::Initialized(Value::Object(
            self.server_capabilities.clone(),
        )));
    }

    // Documents and workspace

    pub fn register_file(&mut self, filename: &str, sink: Arc<dyn DocumentSink>) {
        let key = watched_key(Path::new(filename));
        self.watched_files.entry(key).or_default().push(sink);
    }

    fn publish_diagnostics(&mut self, params: &Value) {
        let Some(path) = params
            .get("uri")
            .and_then(Value::as_str)
            .and_then(|uri| url::Url::parse(uri).ok())
            .and_then(|uri| uri.to_file_path().ok())
        else {
            return;
        };
        let Some(sinks) = self.watched_files.get(&watched_key(&path)) else {
            return;
        };
        for sink in sinks {
            if let Err(err) = sink.publish_diagnostics(params) {
                debug!(path = %path.display(), "dropping diagnostics: {err}");
            }
        }
    }

    fn configuration_items(&self, params: &Value) -> Value {
        let items = params
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let answers = items
            .iter()
            .map(|item| {
                let section = item.get("section").and_then(Value::as_str).unwrap_or("");
                section
                    .split('.')
                    .filter(|part| !part.is_empty())
                    .try_fold(&self.settings.configurations, |value, part| value.get(part))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect();
        Value::Array(answers)
    }

    pub fn support_multiple_workspaces(&self) -> bool {
        supports_multiple_workspaces(&self.server_capabilities)
    }

    pub fn support_workspace_update(&self) -> bool {
        supports_workspace_update(&self.server_capabilities)
    }

    pub async fn send_workspace_folders_change(
        &mut self,
        folder: &Path,
        kind: WorkspaceUpdateKind,
    ) -> Option<u64> {
        let uri = file_uri(folder).ok()?.to_string();
        let entry = json!({"uri": uri, "name": folder_name(folder)});
        let key = folder.display().to_string();
        let (added, removed) = match kind {
            WorkspaceUpdateKind::Addition => {
                self.watched_folders.insert(key, entry.clone());
                (vec![entry], Vec::new())
            }
            WorkspaceUpdateKind::Deletion => {
                self.watched_folders.remove(&key);
                (Vec::new(), vec![entry])
            }
        };
        self.send(
            methods::WORKSPACE_FOLDERS_CHANGE,
            json!({"event": {"added": added, "removed": removed}}),
            MessageKind::Notification,
        )
        .await
    }
}

fn invoke_callback(id: u64, callback: ResponseCallback, result: Option<Value>) {
    if let Err(err) = callback(result) {
        debug!(id, "response callback failed: {err}");
    }
}

fn folder_name(folder: &Path) -> String {
    folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.display().to_string())
}

fn watched_key(path: &Path) -> String {
    normalize_path(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}
