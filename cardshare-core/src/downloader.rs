//! Receiving side: request info, answer password challenges, drive the download, reassemble.

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::chunk::{Artifact, ReceiveBuffer};
use crate::core::{send, Action, Config, SessionError};
use crate::monitor::{Timeout, TransferMonitor};
use crate::protocol::{ClientMeta, ControlMessage, FileInfo, PROTOCOL_VERSION};
use crate::wire::{self, Frame};

pub const CONNECT_TIMEOUT_MESSAGE: &str = "connection timed out";
pub const STALLED_MESSAGE: &str = "transfer stalled";
pub const CLOSED_BY_PEER_MESSAGE: &str = "connection closed by peer";

/// Downloader phases. `Error` is reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Connecting,
    PasswordRequired,
    PasswordError,
    Ready,
    Downloading,
    Complete,
    Error,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Connecting => "connecting",
            DownloadState::PasswordRequired => "password-required",
            DownloadState::PasswordError => "password-error",
            DownloadState::Ready => "ready",
            DownloadState::Downloading => "downloading",
            DownloadState::Complete => "complete",
            DownloadState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Complete | DownloadState::Error)
    }

    fn awaiting_info(&self) -> bool {
        matches!(
            self,
            DownloadState::Connecting
                | DownloadState::PasswordRequired
                | DownloadState::PasswordError
        )
    }
}

/// One download over one channel. Host passes channel events and caller operations; session returns actions.
pub struct DownloaderSession {
    session_id: Uuid,
    config: Config,
    client_meta: ClientMeta,
    state: DownloadState,
    monitor: TransferMonitor,
    channel_open: bool,
    /// Latest unanswered challenge. Consumed by `submit_password`.
    challenge: Option<String>,
    file_info: Option<FileInfo>,
    buffer: Option<ReceiveBuffer>,
    bytes_downloaded: u64,
    error: Option<String>,
    artifact: Option<Artifact>,
}

impl DownloaderSession {
    pub fn new(config: Config, client_meta: ClientMeta) -> Self {
        let monitor = TransferMonitor::new(config.connect_timeout_ticks, config.stall_timeout_ticks);
        Self {
            session_id: Uuid::new_v4(),
            config,
            client_meta,
            state: DownloadState::Connecting,
            monitor,
            channel_open: false,
            challenge: None,
            file_info: None,
            buffer: None,
            bytes_downloaded: 0,
            error: None,
            artifact: None,
        }
    }

    /// Begin connecting: arms the connect timer and asks the host to open the channel.
    pub fn connect(&mut self) -> Vec<Action> {
        self.state = DownloadState::Connecting;
        self.monitor.arm_connect();
        info!(session_id = %self.session_id, "connecting");
        vec![Action::Open]
    }

    /// Channel opened: send the info request. The connect timer stays armed until the first reply.
    pub fn on_open(&mut self) -> Vec<Action> {
        if self.state != DownloadState::Connecting {
            warn!(session_id = %self.session_id, state = self.state.as_str(), "channel open ignored");
            return Vec::new();
        }
        self.channel_open = true;
        debug!(session_id = %self.session_id, "channel open, requesting info");
        let mut actions = Vec::new();
        send(
            &mut actions,
            ControlMessage::RequestInfo {
                protocol_version: PROTOCOL_VERSION,
                client_meta: self.client_meta.clone(),
            },
        );
        actions
    }

    /// Raw channel data: decode one frame and process it.
    pub fn on_data(&mut self, bytes: &[u8]) -> Result<Vec<Action>, SessionError> {
        let (frame, _consumed) = wire::decode_frame(bytes)?;
        Ok(self.on_frame(frame))
    }

    pub fn on_frame(&mut self, frame: Frame) -> Vec<Action> {
        if self.state.is_terminal() {
            debug!(session_id = %self.session_id, state = self.state.as_str(), "frame after session end ignored");
            return Vec::new();
        }
        self.monitor.cancel_connect();
        match frame {
            Frame::Control(msg) => self.on_control(msg),
            Frame::Binary(bytes) => self.on_chunk(bytes),
        }
    }

    fn on_control(&mut self, msg: ControlMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        match msg {
            ControlMessage::PasswordRequired { challenge, error } => {
                if !self.state.awaiting_info() {
                    warn!(session_id = %self.session_id, state = self.state.as_str(), "password challenge after info ignored");
                    return actions;
                }
                self.challenge = Some(challenge);
                self.state = if error {
                    info!(session_id = %self.session_id, "password rejected");
                    DownloadState::PasswordError
                } else {
                    info!(session_id = %self.session_id, "password required");
                    DownloadState::PasswordRequired
                };
            }
            ControlMessage::Info { file } => {
                if !self.state.awaiting_info() {
                    debug!(session_id = %self.session_id, state = self.state.as_str(), "duplicate info ignored");
                    return actions;
                }
                info!(
                    session_id = %self.session_id,
                    name = %file.name,
                    size = file.size,
                    mime_type = %file.mime_type,
                    "file info received"
                );
                self.challenge = None;
                self.file_info = Some(file);
                self.state = DownloadState::Ready;
            }
            ControlMessage::Chunk { final_chunk } => {
                if self.state != DownloadState::Downloading {
                    return self.abort("chunk signal before start");
                }
                if !final_chunk {
                    return actions;
                }
                let complete = match self.buffer.as_mut() {
                    Some(buffer) => {
                        buffer.mark_final();
                        debug!(
                            session_id = %self.session_id,
                            received = buffer.bytes_received(),
                            expected = buffer.expected(),
                            "final flag received"
                        );
                        buffer.is_complete()
                    }
                    None => return self.abort("chunk signal without receive buffer"),
                };
                if complete {
                    self.finalize(&mut actions);
                }
            }
            ControlMessage::Error { message } => {
                warn!(session_id = %self.session_id, %message, "peer reported error");
                return self.fail(message, true);
            }
            other => {
                return self.abort(format!("unexpected {} message", other.kind()));
            }
        }
        actions
    }

    fn on_chunk(&mut self, bytes: Bytes) -> Vec<Action> {
        if self.state != DownloadState::Downloading {
            return self.abort("binary data before start");
        }
        let Some(buffer) = self.buffer.as_mut() else {
            return self.abort("binary data without receive buffer");
        };
        let len = bytes.len();
        let total = match buffer.push(bytes) {
            Ok(total) => total,
            Err(e) => return self.abort(e.to_string()),
        };
        let complete = buffer.is_complete();
        self.bytes_downloaded = total;
        self.monitor.reset_stall();
        debug!(session_id = %self.session_id, len, total, "chunk received");

        let mut actions = Vec::new();
        send(
            &mut actions,
            ControlMessage::ChunkAck {
                bytes_received: total,
            },
        );
        if complete {
            self.finalize(&mut actions);
        }
        actions
    }

    fn finalize(&mut self, actions: &mut Vec<Action>) {
        self.monitor.cancel_all();
        let (Some(buffer), Some(file)) = (self.buffer.take(), self.file_info.clone()) else {
            return;
        };
        let artifact = buffer.reassemble(file);
        info!(
            session_id = %self.session_id,
            name = %artifact.info.name,
            bytes = artifact.bytes.len(),
            "download complete"
        );
        self.artifact = Some(artifact.clone());
        actions.push(Action::TransferComplete(artifact));
        send(actions, ControlMessage::Done);
        self.state = DownloadState::Complete;
    }

    /// Channel closed. Anything short of completion is a failure.
    pub fn on_close(&mut self) -> Vec<Action> {
        self.channel_open = false;
        match self.state {
            DownloadState::Complete => Vec::new(),
            DownloadState::Error => {
                self.monitor.cancel_all();
                Vec::new()
            }
            _ => self.fail(CLOSED_BY_PEER_MESSAGE, false),
        }
    }

    /// Transport-level error event.
    pub fn on_error(&mut self, message: &str) -> Vec<Action> {
        if self.state.is_terminal() {
            debug!(session_id = %self.session_id, %message, "transport error after session end");
            return Vec::new();
        }
        self.fail(message, true)
    }

    /// Answer the outstanding challenge. State changes only when the uploader replies.
    pub fn submit_password(&mut self, password: &str) -> Result<Vec<Action>, SessionError> {
        match self.state {
            DownloadState::PasswordRequired | DownloadState::PasswordError => {}
            state => {
                return Err(SessionError::InvalidState {
                    operation: "submit password",
                    state: state.as_str(),
                })
            }
        }
        let challenge = self.challenge.as_deref().ok_or(SessionError::NoChallenge)?;
        let response = auth::compute_response(password, challenge)?;
        self.challenge = None;
        debug!(session_id = %self.session_id, "submitting password response");
        let mut actions = Vec::new();
        send(&mut actions, ControlMessage::UsePassword { response });
        Ok(actions)
    }

    /// Start streaming from the beginning of the file. Only valid once `Ready`.
    pub fn start_download(&mut self) -> Result<Vec<Action>, SessionError> {
        let size = match (&self.state, &self.file_info) {
            (DownloadState::Ready, Some(file)) => file.size,
            (state, _) => {
                return Err(SessionError::InvalidState {
                    operation: "start download",
                    state: state.as_str(),
                })
            }
        };
        self.buffer = Some(ReceiveBuffer::new(size));
        self.bytes_downloaded = 0;
        self.monitor.reset_stall();
        self.state = DownloadState::Downloading;
        info!(session_id = %self.session_id, size, "download started");
        let mut actions = Vec::new();
        send(&mut actions, ControlMessage::Start { offset: 0 });
        Ok(actions)
    }

    /// Manual retry: drop everything from the previous attempt and connect again.
    pub fn reconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.channel_open {
            actions.push(Action::Close);
        }
        let previous = self.session_id;
        *self = Self::new(self.config.clone(), self.client_meta.clone());
        info!(session_id = %self.session_id, %previous, "reconnecting");
        actions.extend(self.connect());
        actions
    }

    /// Periodic tick: fire connect and stall timeouts.
    pub fn tick(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        for timeout in self.monitor.tick() {
            match (timeout, self.state) {
                (Timeout::Connect, DownloadState::Connecting) => {
                    actions.extend(self.fail(CONNECT_TIMEOUT_MESSAGE, true));
                }
                (Timeout::Stall, DownloadState::Downloading) => {
                    actions.extend(self.fail(STALLED_MESSAGE, true));
                }
                _ => {}
            }
        }
        actions
    }

    /// Protocol violation by the peer: tell it why, then fail.
    fn abort(&mut self, message: impl Into<String>) -> Vec<Action> {
        let message = message.into();
        let mut actions = Vec::new();
        send(
            &mut actions,
            ControlMessage::Error {
                message: message.clone(),
            },
        );
        actions.extend(self.fail(message, true));
        actions
    }

    /// Enter the error state and discard partial data.
    fn fail(&mut self, message: impl Into<String>, close: bool) -> Vec<Action> {
        let message = message.into();
        warn!(
            session_id = %self.session_id,
            state = self.state.as_str(),
            error = %message,
            "download failed"
        );
        self.monitor.cancel_all();
        self.buffer = None;
        self.challenge = None;
        self.error = Some(message);
        self.state = DownloadState::Error;
        if close {
            self.channel_open = false;
            vec![Action::Close]
        } else {
            Vec::new()
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        self.file_info.as_ref()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// Fraction of the file received, in `[0, 1]`. Zero until info arrives.
    pub fn progress(&self) -> f64 {
        match &self.file_info {
            Some(file) if file.size > 0 => self.bytes_downloaded as f64 / file.size as f64,
            Some(_) if self.state == DownloadState::Complete => 1.0,
            _ => 0.0,
        }
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }
}
