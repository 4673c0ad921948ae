//! Static client capabilities sent in `initialize` and the server capability
//! record the client keeps up to date from the `initialize` response.

use serde_json::Map;
use serde_json::Value;
use serde_json::json;

/// `TextDocumentSyncKind` values.
pub mod sync_kind {
    pub const NONE: i64 = 0;
    pub const FULL: i64 = 1;
    pub const INCREMENTAL: i64 = 2;
}

pub fn client_capabilities() -> Value {
    json!({
        "workspace": workspace_client_capabilities(),
        "textDocument": text_document_client_capabilities(),
    })
}

fn workspace_client_capabilities() -> Value {
    let symbol_kinds: Vec<u8> = (1..=26).collect();
    json!({
        "applyEdit": true,
        "workspaceEdit": {
            "documentChanges": true,
            "resourceOperations": ["create", "rename", "delete"],
            "failureHandling": "transactional",
        },
        "didChangeConfiguration": {"dynamicRegistration": true},
        "didChangeWatchedFiles": {"dynamicRegistration": true},
        "symbol": {"dynamicRegistration": true},
        "executeCommand": {
            "dynamicRegistration": true,
            "symbolKind": {"valueSet": symbol_kinds},
        },
        "workspaceFolders": true,
        "configuration": true,
    })
}

fn text_document_client_capabilities() -> Value {
    let dynamic = json!({"dynamicRegistration": true});
    json!({
        "synchronization": {
            "dynamicRegistration": true,
            "willSave": true,
            "willSaveWaitUntil": true,
            "didSave": true,
        },
        "completion": {
            "dynamicRegistration": true,
            "completionItem": {
                "snippetSupport": true,
                "documentationFormat": ["plaintext"],
            },
        },
        "hover": {
            "dynamicRegistration": true,
            "contentFormat": ["plaintext"],
        },
        "signatureHelp": {
            "dynamicRegistration": true,
            "signatureInformation": {"documentationFormat": ["plaintext"]},
        },
        "references": dynamic,
        "documentHighlight": dynamic,
        "documentSymbol": dynamic,
        "formatting": dynamic,
        "rangeFormatting": dynamic,
        "onTypeFormatting": dynamic,
        "definition": dynamic,
        "codeAction": dynamic,
        "codeLens": dynamic,
        "documentLink": dynamic,
        "rename": dynamic,
        "publishDiagnostics": {"relatedInformation": true},
    })
}

pub fn text_document_sync_options() -> Value {
    json!({
        "openClose": true,
        "change": sync_kind::NONE,
        "willSave": false,
        "willSaveWaitUntil": false,
        "save": {"includeText": true},
    })
}

/// What a server is assumed to support before it answers `initialize`.
pub fn default_server_capabilities() -> Map<String, Value> {
    let defaults = json!({
        "textDocumentSync": text_document_sync_options(),
        "hoverProvider": false,
        "completionProvider": {"resolveProvider": false, "triggerCharacters": []},
        "signatureHelpProvider": {"triggerCharacters": []},
        "definitionProvider": false,
        "referencesProvider": false,
        "documentHighlightProvider": false,
        "documentSymbolProvider": false,
        "workspaceSymbolProvider": false,
        "codeActionProvider": false,
        "codeLensProvider": {"resolveProvider": false},
        "documentFormattingProvider": false,
        "documentRangeFormattingProvider": false,
        "documentOnTypeFormattingProvider": {
            "firstTriggerCharacter": null,
            "moreTriggerCharacter": [],
        },
        "renameProvider": false,
        "documentLinkProvider": {"resolveProvider": false},
        "executeCommandProvider": {"commands": []},
        "workspace": {
            "workspaceFolders": {"supported": false, "changeNotifications": false},
        },
        "experimental": null,
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Rewrites `textDocumentSync` the way the client consumes it.
///
/// A bare `TextDocumentSyncKind` becomes the full options record with that
/// `change` kind; an explicit `null` drops the field so the default stays.
pub fn normalize_server_capabilities(caps: &mut Map<String, Value>) {
    match caps.get("textDocumentSync") {
        Some(Value::Number(kind)) => {
            let kind = kind.as_i64().unwrap_or(sync_kind::NONE);
            let mut options = text_document_sync_options();
            options["change"] = json!(kind);
            caps.insert("textDocumentSync".to_string(), options);
        }
        Some(Value::Null) => {
            caps.remove("textDocumentSync");
        }
        _ => {}
    }
}

/// Shallow merge of a server's advertised capabilities over `current`.
pub fn merge_server_capabilities(current: &mut Map<String, Value>, advertised: &Value) {
    let Some(advertised) = advertised.as_object() else {
        return;
    };
    let mut advertised = advertised.clone();
    normalize_server_capabilities(&mut advertised);
    for (key, value) in advertised {
        current.insert(key, value);
    }
}

fn workspace_folder_flag(caps: &Map<String, Value>, flag: &str) -> bool {
    caps.get("workspace")
        .and_then(|workspace| workspace.get("workspaceFolders"))
        .and_then(|folders| folders.get(flag))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn supports_multiple_workspaces(caps: &Map<String, Value>) -> bool {
    workspace_folder_flag(caps, "supported")
}

pub fn supports_workspace_update(caps: &Map<String, Value>) -> bool {
    workspace_folder_flag(caps, "changeNotifications")
}
