//! Error taxonomy for the relay core.

use thiserror::Error;

/// Relay errors.
///
/// Every variant except transport-level faults maps to a single `ERROR`
/// frame on the client connection; the connection stays open unless the
/// failure was an authentication failure.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad or expired token. Terminal for the connection attempt.
    #[error("Authentication failed")]
    AuthFailure,

    /// Protocol-order violation; the connection stays open and the
    /// client may still authenticate.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Room does not exist in the durable store.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Broker is disconnected or the call timed out. Retryable by the
    /// client.
    #[error("Message broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Store is unreachable or the call timed out. Retryable by the
    /// client.
    #[error("Message store unavailable: {0}")]
    StoreUnavailable(String),

    /// Malformed or otherwise unprocessable frame.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Convenience alias used throughout the relay core.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_subject() {
        let err = RelayError::RoomNotFound("nope".into());
        assert_eq!(err.to_string(), "Room not found: nope");

        let err = RelayError::BrokerUnavailable("not connected".into());
        assert!(err.to_string().contains("broker unavailable"));
    }
}
