use std::io;

use crate::jsonrpc::JsonRpcError;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("send queue to the transport stayed full for {0}ms")]
    ChannelFull(u128),
    #[error("message channel closed: {0}")]
    ChannelClosed(String),
    #[error("{kind} process exited")]
    ProcessExit { kind: &'static str },
    #[error("stdio server (pid {0}) is a zombie")]
    StdioZombie(u32),
    #[error("no language server listening at {host}:{port}")]
    Connectivity { host: String, port: u16 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("response callback failed: {0}")]
    Callback(#[from] CallbackError),
    #[error("server error: {0}")]
    ServerRuntime(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<JsonRpcError> for LspError {
    fn from(err: JsonRpcError) -> Self {
        match err {
            JsonRpcError::Io(err) => LspError::Io(err),
            JsonRpcError::Json(err) => LspError::Json(err),
            JsonRpcError::Protocol(msg) => LspError::Protocol(msg),
        }
    }
}

/// Returned by response callbacks and document sinks whose receiving end is gone.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn target_gone(what: &str) -> Self {
        Self(format!("{what} is no longer available"))
    }
}
