use std::fmt;

use serde::Serialize;

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Offering,
    AnsweringRemoteOffer,
    AwaitingRemoteAnswer,
    IceNegotiating,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Offering => "offering",
            ConnectionState::AnsweringRemoteOffer => "answering_remote_offer",
            ConnectionState::AwaitingRemoteAnswer => "awaiting_remote_answer",
            ConnectionState::IceNegotiating => "ice_negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// States in which a remote candidate may still be applied or buffered.
    pub fn accepts_remote_ice(self) -> bool {
        matches!(
            self,
            ConnectionState::Idle
                | ConnectionState::Offering
                | ConnectionState::AnsweringRemoteOffer
                | ConnectionState::AwaitingRemoteAnswer
                | ConnectionState::IceNegotiating
        )
    }

    /// A local offer exists (or is being produced) that a crossing remote
    /// offer collides with.
    pub fn has_local_offer(self) -> bool {
        matches!(
            self,
            ConnectionState::Offering | ConnectionState::AwaitingRemoteAnswer
        )
    }

    /// The session is mid-handshake or live; a new connect attempt must wait.
    pub fn is_busy(self) -> bool {
        !matches!(
            self,
            ConnectionState::Idle | ConnectionState::Failed | ConnectionState::Closed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
