//! Cardshare transfer protocol: one file between two peers over an ordered, reliable channel.
//! Host-driven: no I/O; host passes channel events and caller operations, and receives actions.

pub mod auth;
pub mod chunk;
pub mod core;
pub mod downloader;
pub mod integrity;
pub mod monitor;
pub mod protocol;
pub mod uploader;
pub mod wire;

pub use chunk::{Artifact, DEFAULT_CHUNK_SIZE};
pub use crate::core::{Action, Config, SessionError};
pub use downloader::{DownloadState, DownloaderSession};
pub use protocol::{ClientMeta, ControlMessage, FileInfo, PROTOCOL_VERSION};
pub use uploader::{FileSource, UploadState, UploaderSession};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
