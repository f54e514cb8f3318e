//! Host-driven API shared by both sessions: configuration, actions, errors.

use crate::auth::AuthError;
use crate::chunk::{Artifact, DEFAULT_CHUNK_SIZE};
use crate::wire::{Frame, FrameDecodeError};

/// Default ticks to wait for the channel to open and the first response to arrive.
pub const DEFAULT_CONNECT_TIMEOUT_TICKS: u64 = 15;

/// Default ticks without chunk traffic before a transfer is declared stalled.
pub const DEFAULT_STALL_TIMEOUT_TICKS: u64 = 30;

/// Default bytes the uploader may stream beyond the last acknowledgment.
pub const DEFAULT_MAX_IN_FLIGHT: u64 = 1024 * 1024; // 1 MiB

/// Session tuning. Timeouts are in host ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub connect_timeout_ticks: u64,
    pub stall_timeout_ticks: u64,
    /// Largest binary frame payload the uploader emits.
    pub chunk_size: usize,
    /// In-flight budget: unacknowledged bytes allowed on the channel.
    pub max_in_flight: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout_ticks: DEFAULT_CONNECT_TIMEOUT_TICKS,
            stall_timeout_ticks: DEFAULT_STALL_TIMEOUT_TICKS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Action for host to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open (or reopen) the channel to the peer.
    Open,
    /// Send one frame on the channel.
    Send(Frame),
    /// Close the channel. The session is finished with it.
    Close,
    /// Download finished; hand the artifact to the caller.
    TransferComplete(Artifact),
}

/// Caller misuse or undecodable input. Protocol failures are not errors here:
/// they move the session into its error state instead.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("no outstanding password challenge")]
    NoChallenge,
    #[error("failed to decode frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub(crate) fn send(actions: &mut Vec<Action>, frame: impl Into<Frame>) {
    actions.push(Action::Send(frame.into()));
}
