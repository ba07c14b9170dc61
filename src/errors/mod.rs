/// Error taxonomy for the bus, the broker bridge and the service layer
///
/// Every failure that can reach a subscriber or a requester is a `BusError`.
/// The type is `Clone` because one connection-level failure is fanned out to
/// every subscriber of every channel mapped through that connection.
use thiserror::Error;

// =============================================================================
// MAIN ERROR TYPE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Connect/handshake/auth failure - fatal to that connection, never retried
    #[error("connection error ({endpoint}): {reason}")]
    ConnectionError { endpoint: String, reason: String },

    /// An established connection went away (remote close or local disconnect)
    #[error("connection lost ({endpoint}): {reason}")]
    ConnectionLost { endpoint: String, reason: String },

    /// Channel lookup failed in strict mode
    #[error("channel '{0}' does not exist")]
    ChannelNotFound(String),

    /// Exclusive channel creation hit an existing channel
    #[error("channel '{0}' already exists")]
    ChannelExists(String),

    /// Channel or destination is already bound to a different mapping
    #[error("mapping conflict on '{channel}': already mapped to '{existing}'")]
    MappingConflict { channel: String, existing: String },

    /// Subscriber buffer overflowed - messages were dropped for this subscriber only
    #[error("slow consumer on '{channel}': {dropped} message(s) dropped")]
    SlowConsumer { channel: String, dropped: u64 },

    /// Subscription closed before it delivered anything (e.g. channel teardown)
    #[error("subscription on '{0}' cancelled")]
    Cancelled(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// Synthetic terminal outcome emitted by the dispatcher deadline
    #[error("request {0} timed out")]
    RequestTimeout(String),

    /// Malformed or mistyped payload
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Scheduled producer could not generate a value for this tick
    #[error("generator failure: {0}")]
    GeneratorFailure(String),

    /// Downstream REST call failed (status 0 when no HTTP status was received)
    #[error("rest call failed ({status}): {message}")]
    RestFailure { status: u16, message: String },

    /// Transport-level send/subscribe failure on a live connection
    #[error("transport error: {0}")]
    Transport(String),
}

impl BusError {
    /// Numeric code carried by error Responses
    pub fn status_code(&self) -> i32 {
        match self {
            BusError::SerializationError(_) => 400,
            BusError::UnknownCommand(_) => 404,
            BusError::ChannelNotFound(_) => 404,
            BusError::ChannelExists(_) | BusError::MappingConflict { .. } => 409,
            BusError::SlowConsumer { .. } => 429,
            BusError::Cancelled(_) => 499,
            BusError::HandlerFailure(_) | BusError::GeneratorFailure(_) => 500,
            BusError::RestFailure { .. } => 502,
            BusError::ConnectionError { .. }
            | BusError::ConnectionLost { .. }
            | BusError::Transport(_) => 503,
            BusError::RequestTimeout(_) => 504,
        }
    }

    /// Connection-level failures affect every mapping of a connection
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            BusError::ConnectionError { .. } | BusError::ConnectionLost { .. }
        )
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::SerializationError(e.to_string())
    }
}

pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BusError::UnknownCommand("x".into()).status_code(), 404);
        assert_eq!(BusError::RequestTimeout("id".into()).status_code(), 504);
        assert_eq!(
            BusError::RestFailure {
                status: 503,
                message: "down".into()
            }
            .status_code(),
            502
        );
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: BusError = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert!(matches!(err, BusError::SerializationError(_)));
        assert!(!err.is_connection_failure());
    }
}
