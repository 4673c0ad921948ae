use std::fmt;
use std::io;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl JsonRpcError {
    /// A body that failed to parse leaves the stream positioned at the next frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, JsonRpcError::Json(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl RequestId {
    pub fn as_number(&self) -> Option<u64> {
        match self {
            RequestId::Number(id) => Some(*id),
            RequestId::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(id) => write!(f, "{id}"),
            RequestId::String(id) => write!(f, "{id:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One record crossing the message channel or the server's native stream.
///
/// Every field is optional; [`Message::kind`] tells requests, responses and
/// notifications apart. `result` keeps an explicit `null` as `Some(Value::Null)`
/// so that "answered with null" and "no result field" stay distinct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

const JSONRPC_VERSION: &str = "2.0";

impl Message {
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(RequestId::Number(id)),
            method: Some(method.to_string()),
            params: Some(params),
            ..Self::default()
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            method: Some(method.to_string()),
            params: Some(params),
            ..Self::default()
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => Some(MessageKind::Request),
            (None, Some(_)) => Some(MessageKind::Notification),
            (Some(_), None) if self.result.is_some() || self.error.is_some() => {
                Some(MessageKind::Response)
            }
            _ => None,
        }
    }
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, JsonRpcError> {
    let content_len = read_content_length(reader).await?;
    let mut buf = vec![0u8; content_len];
    reader.read_exact(&mut buf).await?;
    let msg = serde_json::from_slice::<Message>(&buf)?;
    Ok(msg)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), JsonRpcError> {
    let json = serde_json::to_vec(msg)?;
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", json.len()).as_bytes())
        .await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_content_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, JsonRpcError> {
    let mut header = Vec::new();
    loop {
        let line = read_header_line(reader).await?;
        if line.is_empty() {
            break;
        }
        header.push(line);
        if header.len() > 128 {
            return Err(JsonRpcError::Protocol("too many headers".to_string()));
        }
    }

    for line in header {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let value = parts.next().unwrap_or_default().trim();
        if key == "content-length" {
            return value
                .parse::<usize>()
                .map_err(|_| JsonRpcError::Protocol(format!("invalid Content-Length: {value}")));
        }
    }

    Err(JsonRpcError::Protocol(
        "missing Content-Length header".to_string(),
    ))
}

async fn read_header_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, JsonRpcError> {
    let mut buf = Vec::new();
    loop {
        let b = reader.read_u8().await?;
        buf.push(b);
        if buf.len() > 16 * 1024 {
            return Err(JsonRpcError::Protocol("header line too long".to_string()));
        }
        if buf.ends_with(b"\n") {
            break;
        }
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub fn file_uri(path: &std::path::Path) -> Result<url::Url, JsonRpcError> {
    url::Url::from_file_path(path).map_err(|_| {
        JsonRpcError::Protocol(format!("failed to create file uri for {}", path.display()))
    })
}
