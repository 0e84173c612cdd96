use thiserror::Error;

/// Failures reported by the radio layer
///
/// All of them are recoverable: the session returns to idle and the caller
/// decides whether to retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BleError {
    #[error("radio initialization failed: {0}")]
    RadioInit(String),

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("subscription failed: {0}")]
    Subscription(String),
}
