//! Error definitions shared by the relay components

use crate::mqtt::transport::TransportError;
use thiserror::Error;

/// Outcome of a directive that did not complete as requested
///
/// `AlreadySubscribed` and `NotSubscribed` are no-op conditions. The dispatcher
/// renders them as warnings rather than failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The operation needs a live broker connection
    #[error("not connected to a broker")]
    NotConnected,

    /// A connection to the given broker is already up
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    /// Missing or malformed directive argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Broker URL with an unknown scheme or an unusable host/port
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    /// Broker rejected the request or the connection dropped
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Unexpected failure while handling a directive
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// True for conditions that leave state untouched and are reported as warnings
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            RelayError::AlreadySubscribed(_) | RelayError::NotSubscribed(_)
        )
    }
}
