//! Static tables mapping LSP methods to the client's handlers and senders.

use std::collections::HashMap;

use crate::jsonrpc::MessageKind;

pub mod methods {
    pub const SERVER_READY: &str = "server_ready";
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";
    pub const CANCEL_REQUEST: &str = "$/cancelRequest";

    pub const WINDOW_SHOW_MESSAGE: &str = "window/showMessage";
    pub const WINDOW_SHOW_MESSAGE_REQUEST: &str = "window/showMessageRequest";
    pub const WINDOW_LOG_MESSAGE: &str = "window/logMessage";
    pub const CLIENT_REGISTER_CAPABILITY: &str = "client/registerCapability";
    pub const CLIENT_UNREGISTER_CAPABILITY: &str = "client/unregisterCapability";

    pub const WORKSPACE_FOLDERS: &str = "workspace/workspaceFolders";
    pub const WORKSPACE_FOLDERS_CHANGE: &str = "workspace/didChangeWorkspaceFolders";
    pub const WORKSPACE_CONFIGURATION: &str = "workspace/configuration";
    pub const WORKSPACE_CONFIGURATION_CHANGE: &str = "workspace/didChangeConfiguration";
    pub const WORKSPACE_WATCHED_FILES_UPDATE: &str = "workspace/didChangeWatchedFiles";
    pub const WORKSPACE_SYMBOL: &str = "workspace/symbol";
    pub const WORKSPACE_EXECUTE_COMMAND: &str = "workspace/executeCommand";
    pub const WORKSPACE_APPLY_EDIT: &str = "workspace/applyEdit";

    pub const DOCUMENT_PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
    pub const DOCUMENT_DID_OPEN: &str = "textDocument/didOpen";
    pub const DOCUMENT_DID_CHANGE: &str = "textDocument/didChange";
    pub const DOCUMENT_WILL_SAVE: &str = "textDocument/willSave";
    pub const DOCUMENT_WILL_SAVE_UNTIL: &str = "textDocument/willSaveWaitUntil";
    pub const DOCUMENT_DID_SAVE: &str = "textDocument/didSave";
    pub const DOCUMENT_DID_CLOSE: &str = "textDocument/didClose";
    pub const DOCUMENT_COMPLETION: &str = "textDocument/completion";
    pub const COMPLETION_RESOLVE: &str = "completionItem/resolve";
    pub const DOCUMENT_HOVER: &str = "textDocument/hover";
    pub const DOCUMENT_SIGNATURE: &str = "textDocument/signatureHelp";
    pub const DOCUMENT_REFERENCES: &str = "textDocument/references";
    pub const DOCUMENT_HIGHLIGHT: &str = "textDocument/documentHighlight";
    pub const DOCUMENT_SYMBOL: &str = "textDocument/documentSymbol";
    pub const DOCUMENT_FORMATTING: &str = "textDocument/formatting";
    pub const DOCUMENT_FOLDING_RANGE: &str = "textDocument/foldingRange";
    pub const DOCUMENT_RANGE_FORMATTING: &str = "textDocument/rangeFormatting";
    pub const DOCUMENT_ON_TYPE_FORMATTING: &str = "textDocument/onTypeFormatting";
    pub const DOCUMENT_DEFINITION: &str = "textDocument/definition";
    pub const DOCUMENT_CODE_ACTION: &str = "textDocument/codeAction";
    pub const DOCUMENT_CODE_LENS: &str = "textDocument/codeLens";
    pub const DOCUMENT_RENAME: &str = "textDocument/rename";
}

/// What the client does with an incoming message for a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// The transport is connected; start the `initialize` request.
    ServerReady,
    /// Response to `initialize`.
    Initialize,
    /// Response to `shutdown`.
    Shutdown,
    /// Fan diagnostics out to the documents registered for the file.
    PublishDiagnostics,
    /// Answer with the stored configurations.
    WorkspaceConfiguration,
    /// Answer with the watched folders.
    WorkspaceFolders,
    /// Answer `null` and let the application know.
    AcknowledgeAndForward,
    /// Hand to the application, which answers requests itself.
    Forward,
}

#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Handler>,
    senders: HashMap<String, MessageKind>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(mut self, method: &str, handler: Handler) -> Self {
        self.handlers.insert(method.to_string(), handler);
        self
    }

    pub fn sender(mut self, method: &str, kind: MessageKind) -> Self {
        self.senders.insert(method.to_string(), kind);
        self
    }

    pub fn handler_for(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).copied()
    }

    pub fn sender_for(&self, method: &str) -> Option<MessageKind> {
        self.senders.get(method).copied()
    }

    pub fn standard() -> Self {
        use methods::*;

        let requests = [
            INITIALIZE,
            SHUTDOWN,
            DOCUMENT_COMPLETION,
            COMPLETION_RESOLVE,
            DOCUMENT_HOVER,
            DOCUMENT_SIGNATURE,
            DOCUMENT_DEFINITION,
            DOCUMENT_REFERENCES,
            DOCUMENT_HIGHLIGHT,
            DOCUMENT_SYMBOL,
            DOCUMENT_FORMATTING,
            DOCUMENT_RANGE_FORMATTING,
            DOCUMENT_ON_TYPE_FORMATTING,
            DOCUMENT_CODE_ACTION,
            DOCUMENT_CODE_LENS,
            DOCUMENT_FOLDING_RANGE,
            DOCUMENT_RENAME,
            DOCUMENT_WILL_SAVE_UNTIL,
            WORKSPACE_SYMBOL,
            WORKSPACE_EXECUTE_COMMAND,
        ];
        let notifications = [
            INITIALIZED,
            EXIT,
            CANCEL_REQUEST,
            DOCUMENT_DID_OPEN,
            DOCUMENT_DID_CHANGE,
            DOCUMENT_WILL_SAVE,
            DOCUMENT_DID_SAVE,
            DOCUMENT_DID_CLOSE,
            WORKSPACE_WATCHED_FILES_UPDATE,
            WORKSPACE_CONFIGURATION_CHANGE,
            WORKSPACE_FOLDERS_CHANGE,
        ];

        let mut registry = Self::new()
            .handler(SERVER_READY, Handler::ServerReady)
            .handler(INITIALIZE, Handler::Initialize)
            .handler(SHUTDOWN, Handler::Shutdown)
            .handler(DOCUMENT_PUBLISH_DIAGNOSTICS, Handler::PublishDiagnostics)
            .handler(WORKSPACE_CONFIGURATION, Handler::WorkspaceConfiguration)
            .handler(WORKSPACE_FOLDERS, Handler::WorkspaceFolders)
            .handler(WORKSPACE_APPLY_EDIT, Handler::Forward)
            .handler(WINDOW_SHOW_MESSAGE, Handler::Forward)
            .handler(WINDOW_SHOW_MESSAGE_REQUEST, Handler::Forward)
            .handler(WINDOW_LOG_MESSAGE, Handler::Forward)
            .handler(CLIENT_REGISTER_CAPABILITY, Handler::AcknowledgeAndForward)
            .handler(CLIENT_UNREGISTER_CAPABILITY, Handler::AcknowledgeAndForward);
        for method in requests {
            registry = registry.sender(method, MessageKind::Request);
        }
        for method in notifications {
            registry = registry.sender(method, MessageKind::Notification);
        }
        registry
    }
}
