use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use spyder_lsp::ClientStatus;
use spyder_lsp::LspProvider;
use spyder_lsp::ProviderConfig;
use spyder_lsp::ProviderSink;
use spyder_lsp::ServerSettings;
use spyder_lsp::WorkspaceUpdateKind;
use spyder_lsp::jsonrpc::Message;
use spyder_lsp::jsonrpc::read_message;
use spyder_lsp::jsonrpc::write_message;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.snapshot().iter().filter(|seen| *seen == event).count()
    }

    fn contains(&self, event: &str) -> bool {
        self.count(event) > 0
    }
}

impl ProviderSink for Recorder {
    fn on_initialize(&self, language: &str, capabilities: &Value) {
        let sync = &capabilities["textDocumentSync"]["change"];
        self.push(format!("initialize {language} change={sync}"));
    }

    fn on_status_change(&self, language: &str, status: ClientStatus) {
        self.push(format!("status {language} {status}"));
    }

    fn on_response(&self, req_id: u64, response: &Value) {
        self.push(format!("response {req_id} {response}"));
    }
}

/// Answers `initialize` with `capabilities`, plus `shutdown` and
/// `textDocument/hover`, recording every method it receives.
async fn fake_server(methods: Arc<Recorder>, capabilities: Value) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve(stream, Arc::clone(&methods), capabilities.clone()));
        }
    });
    port
}

async fn serve(stream: TcpStream, methods: Arc<Recorder>, capabilities: Value) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    // Reachability probes close without sending anything.
    while let Ok(msg) = read_message(&mut reader).await {
        let Some(method) = msg.method.clone() else {
            continue;
        };
        methods.push(method.clone());
        let result = match method.as_str() {
            "initialize" => json!({"capabilities": capabilities}),
            "textDocument/hover" => json!({"contents": "docs"}),
            "shutdown" => Value::Null,
            _ => continue,
        };
        let Some(id) = msg.id.clone() else {
            continue;
        };
        write_message(&mut writer, &Message::response(id, result))
            .await
            .unwrap();
    }
}

async fn pump_until(provider: &mut LspProvider, sink: &Recorder, event: &str) {
    pump_until_count(provider, sink, event, 1).await;
}

async fn pump_until_count(provider: &mut LspProvider, sink: &Recorder, event: &str, times: usize) {
    let wait = async {
        while sink.count(event) < times {
            assert!(provider.next_event().await);
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("no {event:?} in {:?}", sink.snapshot()));
}

fn python_config(conf_dir: &Path, port: u16, configurations: Value) -> ProviderConfig {
    let mut config = ProviderConfig {
        conf_dir: conf_dir.to_path_buf(),
        transport_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_spyder-lsp-transport"))),
        ..ProviderConfig::default()
    };
    config.servers.insert(
        "python".to_string(),
        ServerSettings {
            external: true,
            port,
            configurations,
            ..ServerSettings::new("pylsp")
        },
    );
    config
}

fn pyflakes(enabled: bool) -> Value {
    json!({"pylsp": {"plugins": {"pyflakes": {"enabled": enabled}}}})
}

async fn wait_for_methods(methods: &Recorder, count: usize) -> Vec<String> {
    for _ in 0..100 {
        let seen = methods.snapshot();
        if seen.len() >= count {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    methods.snapshot()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_talks_to_external_server_through_transport() {
    let methods = Arc::new(Recorder::default());
    let port = fake_server(Arc::clone(&methods), json!({"textDocumentSync": 2})).await;

    let conf_dir = tempfile::tempdir().unwrap();
    let config = python_config(conf_dir.path(), port, pyflakes(true));

    let sink = Arc::new(Recorder::default());
    let mut provider = LspProvider::new(config, sink.clone());
    assert!(provider.start_for("python").await);
    assert_eq!(provider.status("python"), Some(ClientStatus::Running));

    pump_until(&mut provider, &sink, "initialize python change=2").await;
    assert_eq!(
        wait_for_methods(&methods, 3).await,
        vec![
            "initialize",
            "initialized",
            "workspace/didChangeConfiguration",
        ]
    );

    assert!(
        provider
            .send_request(
                "python",
                "textDocument/hover",
                json!({"textDocument": {"uri": "file:///tmp/a.py"}, "position": {"line": 0, "character": 0}}),
                7,
            )
            .await
    );
    pump_until(&mut provider, &sink, r#"response 7 {"contents":"docs"}"#).await;

    provider.shutdown().await;
    assert_eq!(provider.status("python"), Some(ClientStatus::Stopped));
    let seen = methods.snapshot();
    assert_eq!(seen.get(3).map(String::as_str), Some("textDocument/hover"));
    assert_eq!(seen.get(4).map(String::as_str), Some("shutdown"));
    assert!(provider.client("python").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configuration_changes_restart_only_for_connection_fields() {
    let methods = Arc::new(Recorder::default());
    let port = fake_server(Arc::clone(&methods), json!({"textDocumentSync": 2})).await;
    let other_methods = Arc::new(Recorder::default());
    let other_port = fake_server(Arc::clone(&other_methods), json!({"textDocumentSync": 2})).await;

    let conf_dir = tempfile::tempdir().unwrap();
    let mut config = python_config(conf_dir.path(), port, pyflakes(true));
    let sink = Arc::new(Recorder::default());
    let mut provider = LspProvider::new(config.clone(), sink.clone());
    assert!(provider.start_for("python").await);
    pump_until(&mut provider, &sink, "initialize python change=2").await;
    assert_eq!(wait_for_methods(&methods, 3).await.len(), 3);

    config.servers.get_mut("python").unwrap().configurations = pyflakes(false);
    provider.update_configuration(config.clone(), false).await;
    let seen = wait_for_methods(&methods, 4).await;
    assert_eq!(
        seen,
        vec![
            "initialize",
            "initialized",
            "workspace/didChangeConfiguration",
            "workspace/didChangeConfiguration",
        ]
    );
    assert_eq!(sink.count("status python stopped"), 0);

    config.servers.get_mut("python").unwrap().port = other_port;
    provider.update_configuration(config, false).await;
    assert_eq!(provider.status("python"), Some(ClientStatus::Running));
    pump_until_count(&mut provider, &sink, "initialize python change=2", 2).await;

    assert_eq!(sink.count("status python stopped"), 1);
    assert_eq!(sink.count("status python ready"), 2);
    assert_eq!(methods.count("initialize"), 1);
    assert_eq!(
        wait_for_methods(&other_methods, 3).await,
        vec![
            "initialize",
            "initialized",
            "workspace/didChangeConfiguration",
        ]
    );
    provider.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_workspace_server_gets_folder_changes_without_restart() {
    let methods = Arc::new(Recorder::default());
    let capabilities = json!({
        "textDocumentSync": 2,
        "workspace": {"workspaceFolders": {"supported": true, "changeNotifications": true}},
    });
    let port = fake_server(Arc::clone(&methods), capabilities).await;

    let conf_dir = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let sink = Arc::new(Recorder::default());
    let mut provider = LspProvider::new(
        python_config(conf_dir.path(), port, pyflakes(true)),
        sink.clone(),
    );
    assert!(provider.start_for("python").await);
    pump_until(&mut provider, &sink, "initialize python change=2").await;
    assert_eq!(wait_for_methods(&methods, 3).await.len(), 3);
    let before = sink.snapshot();

    let project = project.path().to_path_buf();
    provider
        .project_path_update(&project, WorkspaceUpdateKind::Addition, &[project.clone()])
        .await;

    let seen = wait_for_methods(&methods, 4).await;
    assert_eq!(seen.get(3).map(String::as_str), Some("workspace/didChangeWorkspaceFolders"));
    assert_eq!(methods.count("workspace/didChangeWorkspaceFolders"), 1);
    assert_eq!(methods.count("initialize"), 1);
    assert_eq!(sink.snapshot(), before);
    assert_eq!(provider.status("python"), Some(ClientStatus::Running));
    assert_eq!(provider.root_path(), project);
    provider.shutdown().await;
}
