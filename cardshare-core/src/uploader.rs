//! Sending side: answer info requests, gate on a password, stream chunks under an in-flight budget.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::chunk;
use crate::core::{send, Action, Config, SessionError};
use crate::monitor::{Timeout, TransferMonitor};
use crate::protocol::{ControlMessage, FileInfo};
use crate::wire::{self, Frame};

pub const NO_REQUEST_MESSAGE: &str = "peer sent no request";
pub const STALLED_MESSAGE: &str = "transfer stalled";
pub const CLOSED_BY_PEER_MESSAGE: &str = "connection closed by peer";
pub const CANCELLED_MESSAGE: &str = "transfer cancelled by sender";

/// Random-access byte source for the file being served.
pub trait FileSource {
    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl<T: Read + Seek> FileSource for T {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }
}

/// Uploader phases. `AwaitingAuth` only occurs when a password is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    AwaitingAuth,
    Serving,
    Streaming,
    Done,
    Error,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Idle => "idle",
            UploadState::AwaitingAuth => "awaiting-auth",
            UploadState::Serving => "serving",
            UploadState::Streaming => "streaming",
            UploadState::Done => "done",
            UploadState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Error)
    }
}

/// One upload over one channel. Owns the source until the session ends.
pub struct UploaderSession<S> {
    session_id: Uuid,
    config: Config,
    file: FileInfo,
    source: Option<S>,
    password: Option<String>,
    /// Last issued challenge. Replaced on every issuance, consumed on every answer.
    challenge: Option<String>,
    state: UploadState,
    monitor: TransferMonitor,
    /// Next byte to send.
    next_offset: u64,
    /// Highest cumulative count acknowledged by the downloader.
    acked: u64,
    final_sent: bool,
    error: Option<String>,
}

impl<S: FileSource> UploaderSession<S> {
    /// An empty password means no password.
    pub fn new(file: FileInfo, source: S, password: Option<String>, config: Config) -> Self {
        let monitor = TransferMonitor::new(config.connect_timeout_ticks, config.stall_timeout_ticks);
        Self {
            session_id: Uuid::new_v4(),
            config,
            file,
            source: Some(source),
            password: password.filter(|p| !p.is_empty()),
            challenge: None,
            state: UploadState::Idle,
            monitor,
            next_offset: 0,
            acked: 0,
            final_sent: false,
            error: None,
        }
    }

    /// Channel accepted: wait for the peer's info request under the connect timer.
    pub fn on_open(&mut self) -> Vec<Action> {
        if self.state == UploadState::Idle {
            self.monitor.arm_connect();
            debug!(session_id = %self.session_id, "channel open, awaiting request");
        }
        Vec::new()
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
            Frame::Binary(_) => self.abort("unexpected binary frame"),
        }
    }

    fn on_control(&mut self, msg: ControlMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        match msg {
            ControlMessage::RequestInfo {
                protocol_version,
                client_meta,
            } => {
                info!(
                    session_id = %self.session_id,
                    protocol_version,
                    browser = %client_meta.browser_name,
                    os = %client_meta.os_name,
                    "info requested"
                );
                match self.state {
                    UploadState::Idle | UploadState::AwaitingAuth if self.password.is_some() => {
                        self.issue_challenge(&mut actions, false);
                    }
                    UploadState::Idle | UploadState::Serving => self.send_info(&mut actions),
                    _ => return self.abort("unexpected request_info message"),
                }
            }
            ControlMessage::UsePassword { response } => {
                if self.state != UploadState::AwaitingAuth {
                    return self.abort("unexpected use_password message");
                }
                let accepted = match (self.challenge.take(), self.password.as_deref()) {
                    (Some(challenge), Some(password)) => {
                        auth::verify_response(password, &challenge, &response)
                    }
                    _ => false,
                };
                if accepted {
                    info!(session_id = %self.session_id, "password accepted");
                    self.send_info(&mut actions);
                } else {
                    warn!(session_id = %self.session_id, "password rejected");
                    self.issue_challenge(&mut actions, true);
                }
            }
            ControlMessage::Start { offset } => {
                if self.state != UploadState::Serving {
                    return self.abort("start before file info");
                }
                if offset > self.file.size {
                    return self.abort(format!(
                        "offset {offset} beyond file size {}",
                        self.file.size
                    ));
                }
                info!(session_id = %self.session_id, offset, size = self.file.size, "streaming started");
                self.next_offset = offset;
                self.acked = offset;
                self.final_sent = false;
                self.state = UploadState::Streaming;
                self.monitor.reset_stall();
                self.pump(&mut actions);
            }
            ControlMessage::ChunkAck { bytes_received } => {
                if self.state != UploadState::Streaming {
                    debug!(session_id = %self.session_id, state = self.state.as_str(), "ack outside streaming ignored");
                    return actions;
                }
                if bytes_received > self.next_offset {
                    return self.abort(format!(
                        "ack for {bytes_received} bytes but only {} sent",
                        self.next_offset
                    ));
                }
                self.acked = self.acked.max(bytes_received);
                self.monitor.reset_stall();
                self.pump(&mut actions);
            }
            ControlMessage::Done => {
                if self.state != UploadState::Streaming || !self.final_sent {
                    return self.abort("done before transfer finished");
                }
                if self.acked < self.file.size {
                    return self.abort(format!(
                        "done after only {} of {} bytes acknowledged",
                        self.acked, self.file.size
                    ));
                }
                info!(session_id = %self.session_id, bytes = self.next_offset, "upload complete");
                self.monitor.cancel_all();
                self.source = None;
                self.state = UploadState::Done;
                actions.push(Action::Close);
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

    /// Replace any outstanding challenge with a fresh one and send it.
    fn issue_challenge(&mut self, actions: &mut Vec<Action>, error: bool) {
        let challenge = auth::issue_challenge();
        self.challenge = Some(challenge.clone());
        self.state = UploadState::AwaitingAuth;
        send(actions, ControlMessage::PasswordRequired { challenge, error });
    }

    fn send_info(&mut self, actions: &mut Vec<Action>) {
        self.challenge = None;
        self.state = UploadState::Serving;
        send(
            actions,
            ControlMessage::Info {
                file: self.file.clone(),
            },
        );
    }

    /// Send chunks until the file is exhausted or the in-flight budget is spent.
    fn pump(&mut self, actions: &mut Vec<Action>) {
        let size = self.file.size;
        while let Some(range) = chunk::next_chunk(self.next_offset, size, self.config.chunk_size) {
            let in_flight = self.next_offset.saturating_sub(self.acked);
            // Always allow one chunk when nothing is outstanding, so tiny budgets still progress.
            if in_flight > 0 && in_flight.saturating_add(range.byte_len()) > self.config.max_in_flight {
                debug!(session_id = %self.session_id, in_flight, "in-flight budget spent, pausing");
                return;
            }
            let Some(source) = self.source.as_mut() else {
                actions.extend(self.abort("file source released"));
                return;
            };
            let mut buf = vec![0u8; range.byte_len() as usize];
            if let Err(e) = source.read_at(range.start, &mut buf) {
                actions.extend(self.abort(format!("failed to read file: {e}")));
                return;
            }
            send(actions, Frame::Binary(Bytes::from(buf)));
            self.next_offset = range.end;
            self.monitor.reset_stall();
            debug!(session_id = %self.session_id, start = range.start, end = range.end, "chunk sent");
        }
        if self.next_offset == size && !self.final_sent {
            self.final_sent = true;
            send(actions, ControlMessage::Chunk { final_chunk: true });
        }
    }

    /// Channel closed. Anything short of `Done` is a failure.
    pub fn on_close(&mut self) -> Vec<Action> {
        match self.state {
            UploadState::Done | UploadState::Error => {
                self.monitor.cancel_all();
                Vec::new()
            }
            _ => self.fail(CLOSED_BY_PEER_MESSAGE, false),
        }
    }

    /// Transport-level error event.
    pub fn on_error(&mut self, message: &str) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.fail(message, true)
    }

    /// Host is shutting the upload down.
    pub fn stop(&mut self) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.abort(CANCELLED_MESSAGE)
    }

    /// Periodic tick: fire connect and stall timeouts.
    pub fn tick(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        for timeout in self.monitor.tick() {
            match (timeout, self.state) {
                (Timeout::Connect, UploadState::Idle) => {
                    actions.extend(self.fail(NO_REQUEST_MESSAGE, true));
                }
                (Timeout::Stall, UploadState::Streaming) => {
                    actions.extend(self.abort(STALLED_MESSAGE));
                }
                _ => {}
            }
        }
        actions
    }

    /// Tell the peer why, then fail.
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

    /// Enter the error state and release the source.
    fn fail(&mut self, message: impl Into<String>, close: bool) -> Vec<Action> {
        let message = message.into();
        warn!(
            session_id = %self.session_id,
            state = self.state.as_str(),
            error = %message,
            "upload failed"
        );
        self.monitor.cancel_all();
        self.source = None;
        self.challenge = None;
        self.error = Some(message);
        self.state = UploadState::Error;
        if close {
            vec![Action::Close]
        } else {
            Vec::new()
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn file_info(&self) -> &FileInfo {
        &self.file
    }

    pub fn bytes_sent(&self) -> u64 {
        self.next_offset
    }

    pub fn bytes_acked(&self) -> u64 {
        self.acked
    }
}
