//! Cardshare wire protocol: control message types and file metadata.

use serde::{Deserialize, Serialize};

/// Current protocol version. Carried in `RequestInfo` for diagnostics.
pub const PROTOCOL_VERSION: u8 = 1;

/// Metadata for the single file a session transfers. Immutable once sent by the uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    /// Authoritative byte length; completion is detected against it.
    pub size: u64,
    pub mime_type: String,
}

/// Diagnostic description of the requesting peer. Never used for protocol decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub browser_name: String,
    pub os_name: String,
}

/// All structured (non-binary) messages. Encoding is bincode; framing lives in the wire module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Downloader handshake: ask for the file metadata.
    RequestInfo {
        protocol_version: u8,
        client_meta: ClientMeta,
    },
    /// Uploader demands a password. `error` means the previous response was rejected.
    PasswordRequired { challenge: String, error: bool },
    /// Downloader answer to the latest challenge.
    UsePassword { response: String },
    /// File metadata; sent once authentication (if any) succeeds.
    Info { file: FileInfo },
    /// Begin streaming at a byte offset.
    Start { offset: u64 },
    /// Companion signal to the binary stream; `final_chunk` means no more binary frames follow.
    Chunk { final_chunk: bool },
    /// Cumulative bytes the downloader holds.
    ChunkAck { bytes_received: u64 },
    /// Downloader reassembled and accepted the file.
    Done,
    /// Fatal; terminates the session.
    Error { message: String },
}

impl ControlMessage {
    /// Short variant name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::RequestInfo { .. } => "request_info",
            ControlMessage::PasswordRequired { .. } => "password_required",
            ControlMessage::UsePassword { .. } => "use_password",
            ControlMessage::Info { .. } => "info",
            ControlMessage::Start { .. } => "start",
            ControlMessage::Chunk { .. } => "chunk",
            ControlMessage::ChunkAck { .. } => "chunk_ack",
            ControlMessage::Done => "done",
            ControlMessage::Error { .. } => "error",
        }
    }
}
