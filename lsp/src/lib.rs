pub mod capabilities;
mod channel;
mod client;
mod config;
mod error;
pub mod jsonrpc;
pub mod logs;
mod process;
mod provider;
pub mod registry;
mod servers;
mod status;
mod transport;

pub use crate::channel::MessageChannel;
pub use crate::client::ClientEvent;
pub use crate::client::ClientId;
pub use crate::client::ClientOptions;
pub use crate::client::DocumentSink;
pub use crate::client::EventSender;
pub use crate::client::LspClient;
pub use crate::client::ResponseCallback;
pub use crate::client::WorkspaceUpdateKind;
pub use crate::config::PYTHON;
pub use crate::config::ProviderConfig;
pub use crate::error::CallbackError;
pub use crate::error::LspError;
pub use crate::process::ChannelMode;
pub use crate::process::ProcessState;
pub use crate::process::ProcessSupervisor;
pub use crate::process::Sink;
pub use crate::process::SpawnSpec;
pub use crate::provider::LspProvider;
pub use crate::provider::ProviderSink;
pub use crate::servers::DEFAULT_HOST;
pub use crate::servers::DEFAULT_PORT;
pub use crate::servers::ServerSettings;
pub use crate::servers::select_port;
pub use crate::status::ClientStatus;
pub use crate::status::LspLanguageStatus;
pub use crate::status::LspServerSource;
pub use crate::status::LspStatus;
pub use crate::status::render_lsp_status;
pub use crate::transport::TransportArgs;
pub use crate::transport::TransportMode;
pub use crate::transport::TransportProcess;
pub use crate::transport::TransportState;
