//! Error plumbing for the runtime. The base `NetworkError`/`ErrorType` split lives in `flux::shared`
//! and is reused verbatim here; this module layers the session and messaging errors on top of it,
//! per the propagation policy: components never panic on data received from the network.

pub use flux::shared::{Deserialize, ErrorType, ErrorUtils, NetworkError, NetworkResult, PayloadBatch, Serialize, SizedRead, SizedWrite};

use std::fmt;

/// Errors surfaced by the session state machine (`OnCloseSession`).
#[derive(Debug, Eq, PartialEq)]
pub enum SessionError {
    /// The handshake did not complete within the configured timeout.
    HandshakeTimeout,
    /// The peer went silent past the keepalive timeout.
    KeepaliveTimeout,
    /// A frame violated the session's pack-mode framing rules (bad length, oversize payload).
    ProtocolViolation,
    /// The password hash presented by the client didn't match.
    AuthenticationFailed,
    /// The underlying transport closed.
    TransportClosed(NetworkError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::HandshakeTimeout => write!(f, "session handshake timed out"),
            SessionError::KeepaliveTimeout => write!(f, "peer keepalive timed out"),
            SessionError::ProtocolViolation => write!(f, "session framing protocol violation"),
            SessionError::AuthenticationFailed => write!(f, "session password hash mismatch"),
            SessionError::TransportClosed(err) => write!(f, "underlying transport closed: {}", err),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<NetworkError> for SessionError {
    fn from(err: NetworkError) -> Self {
        SessionError::TransportClosed(err)
    }
}

/// Errors surfaced by the messaging layer (server/client/c2s).
#[derive(Debug, Eq, PartialEq)]
pub enum MsgError {
    /// The requesting user was rejected by `OnCheckUser`.
    UserRejected,
    /// The destination list on a message frame exceeded 255 entries or was malformed.
    BadDestinationList,
    /// The send queue for a destination exceeded its redline.
    Busy,
    /// A session-layer error propagated up from the underlying session.
    Session(SessionError),
}

impl fmt::Display for MsgError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MsgError::UserRejected => write!(f, "user rejected at messaging handshake"),
            MsgError::BadDestinationList => write!(f, "malformed destination user list"),
            MsgError::Busy => write!(f, "destination send queue over its redline"),
            MsgError::Session(err) => write!(f, "messaging session error: {}", err),
        }
    }
}

impl std::error::Error for MsgError {}

impl From<SessionError> for MsgError {
    fn from(err: SessionError) -> Self {
        MsgError::Session(err)
    }
}

impl From<NetworkError> for MsgError {
    fn from(err: NetworkError) -> Self {
        MsgError::Session(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_wraps_into_session_error() {
        let err: SessionError = NetworkError::Wait.into();
        assert_eq!(err, SessionError::TransportClosed(NetworkError::Wait));
        assert_eq!(err.to_string(), "underlying transport closed: operation would block, retry later");
    }

    #[test]
    fn test_session_error_wraps_into_msg_error() {
        let err: MsgError = SessionError::KeepaliveTimeout.into();
        assert_eq!(err, MsgError::Session(SessionError::KeepaliveTimeout));
        assert_eq!(err.to_string(), "messaging session error: peer keepalive timed out");
    }

    #[test]
    fn test_network_error_wraps_directly_into_msg_error() {
        let err: MsgError = NetworkError::Wait.into();
        assert_eq!(err, MsgError::Session(SessionError::TransportClosed(NetworkError::Wait)));
    }
}
