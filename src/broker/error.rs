//! Errors surfaced by the broker adapter.

#[derive(Debug, thiserror::Error, Clone)]
pub enum BrokerError {
    /// A transport-level hiccup the adapter already retried and gave up on.
    #[error("broker transient error: {0}")]
    Transient(String),

    /// The broker is unreachable; callers surface this up as `BrokerUnavailable`.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A value stored under a key could not be decoded as expected.
    #[error("broker decode error: {0}")]
    Decode(String),
}
