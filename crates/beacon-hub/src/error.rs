//! Error types for the connection hub.
//!
//! Every failure in this subsystem is scoped to a single connection or a
//! single call; the hub's own tasks never terminate because of a client
//! error.

use std::fmt;
use thiserror::Error;

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur while upgrading, dispatching, or managing
/// connections.
#[derive(Debug, Error)]
pub enum HubError {
    /// The HTTP request could not be upgraded (bad handshake, origin check
    /// failed). Surfaced to the HTTP caller; no connection is created.
    #[error("upgrade rejected: {reason}")]
    UpgradeRejected {
        /// Why the upgrade was refused.
        reason: String,
    },

    /// A protocol violation on an established connection (oversized frame,
    /// malformed envelope). Closes the offending connection only.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A client's outbound buffer was full when a frame was pushed. The
    /// frame is dropped and the client is scheduled for eviction.
    #[error("slow consumer: outbound buffer full for client {client_id}")]
    SlowConsumer {
        /// The client whose buffer overflowed.
        client_id: String,
    },

    /// A send targeted a client or room that is not registered. Benign:
    /// the operation is a no-op.
    #[error("unknown target: {target}")]
    UnknownTarget {
        /// The id that was not found.
        target: String,
    },

    /// The connection is closed or the hub is no longer accepting work.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Optional close code from the peer.
        code: Option<u16>,
        /// Reason for closing.
        reason: String,
    },

    /// An outbound payload could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// An inbound envelope could not be deserialized.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),
}

impl HubError {
    /// Create a new upgrade rejection error.
    pub fn upgrade_rejected(reason: impl Into<String>) -> Self {
        Self::UpgradeRejected {
            reason: reason.into(),
        }
    }

    /// Create a new protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// Create a new slow consumer error.
    pub fn slow_consumer(client_id: impl Into<String>) -> Self {
        Self::SlowConsumer {
            client_id: client_id.into(),
        }
    }

    /// Create a new unknown target error.
    pub fn unknown_target(target: impl Into<String>) -> Self {
        Self::UnknownTarget {
            target: target.into(),
        }
    }

    /// Create a new connection closed error.
    pub fn connection_closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    /// Create a new encode error.
    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode(reason.into())
    }

    /// Create a new decode error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode(reason.into())
    }

    /// Get the close code if this is a connection closed error.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::ConnectionClosed { code, .. } => *code,
            _ => None,
        }
    }

    /// Check if this error ends the connection it occurred on.
    ///
    /// `UnknownTarget` and `Encode` are benign call-site errors; everything
    /// else means the connection is (or is about to be) gone.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnknownTarget { .. } | Self::Encode(_))
    }
}

/// Close codes the hub emits on outgoing close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away, e.g. hub shutdown (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Internal error (1011).
    InternalError = 1011,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::Protocol),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1011 => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Get the u16 value of this close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::GoingAway => "GoingAway",
            Self::Protocol => "Protocol",
            Self::PolicyViolation => "PolicyViolation",
            Self::MessageTooBig => "MessageTooBig",
            Self::InternalError => "InternalError",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_rejected() {
        let err = HubError::upgrade_rejected("origin not allowed");
        assert!(matches!(err, HubError::UpgradeRejected { .. }));
        assert!(err.to_string().contains("origin not allowed"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_slow_consumer_carries_client_id() {
        let err = HubError::slow_consumer("c42");
        assert!(err.to_string().contains("c42"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_target_not_fatal() {
        let err = HubError::unknown_target("nobody");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_connection_closed_code() {
        let err = HubError::connection_closed(Some(1001), "shutting down");
        assert_eq!(err.close_code(), Some(1001));
        assert_eq!(HubError::protocol("bad frame").close_code(), None);
    }

    #[test]
    fn test_close_code_round_trip() {
        assert_eq!(CloseCode::from_u16(1000), Some(CloseCode::Normal));
        assert_eq!(CloseCode::from_u16(1009), Some(CloseCode::MessageTooBig));
        assert_eq!(CloseCode::from_u16(4000), None);
        assert_eq!(CloseCode::GoingAway.as_u16(), 1001);
    }

    #[test]
    fn test_close_code_display() {
        assert_eq!(CloseCode::Normal.to_string(), "Normal (1000)");
        assert_eq!(CloseCode::MessageTooBig.to_string(), "MessageTooBig (1009)");
    }
}
