pub mod aggregator;
pub mod controller;

use thiserror::Error;

use crate::bluetooth::BleError;
use crate::models::{AverageResult, MeasurementSample, MonitoringSession};

pub use aggregator::{SampleAggregator, SharedAggregator};
pub use controller::{SessionController, SessionSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Monitoring,
    Completing,
    Aborted,
}

/// Why a session ended without a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    Disconnected,
    NotificationsClosed,
    ConnectFailed(BleError),
    SubscribeFailed(BleError),
}

/// Progress reported to the UI and chart collaborators
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// An accepted sample, in arrival order
    Sample(MeasurementSample),
    /// Monitoring window finished; None when too few samples arrived
    Completed(Option<AverageResult>),
    Aborted(AbortReason),
}

#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed {
        session: MonitoringSession,
        persisted: bool,
    },
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("not allowed while the session is {0:?}")]
    InvalidState(SessionState),

    #[error(transparent)]
    Ble(#[from] BleError),
}
