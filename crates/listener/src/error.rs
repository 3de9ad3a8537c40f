//! Listener error types

use crate::cancel::SubscriptionError;
use crate::capacity::DiskspaceError;
use crate::devices::DeviceError;
use crate::handler::TaskError;
use crate::queue::QueueError;

/// Errors surfaced by the task listener
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Diskspace(#[from] DiskspaceError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Task(#[from] TaskError),

    /// `connect` has not been called, or the listener was closed
    #[error("listener is not connected")]
    NotConnected,

    /// The worker is shutting down and accepts no new runs
    #[error("worker is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, ListenerError>;
