//! Task cancellation over the message bus
//!
//! The listener binds a [`Subscription`] to task-exception messages routed to
//! this worker and stops running tasks whose run was resolved as `canceled`.

mod bus;
mod events;
mod listener;
mod memory;

pub use bus::{MessageBus, Subscription, SubscriptionError};
pub use events::{
    CancellationEvent, ExceptionBinding, TaskExceptionMessage, TaskExceptionPayload, CANCELED,
    TASK_EXCEPTION_EXCHANGE,
};
pub use listener::{handle_message, CancelListener};
pub use memory::{BusOp, InMemoryBus, InMemorySubscription};
