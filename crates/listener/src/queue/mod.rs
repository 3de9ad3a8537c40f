//! Queue collaborators
//!
//! The listener claims work through a [`TaskQueue`] and fetches full task
//! definitions through a [`QueueService`]. Transport details live in the
//! implementations; [`InMemoryQueue`] backs tests and local embedding.

mod client;
mod memory;
mod types;

pub use client::{QueueError, QueueService, TaskQueue, TaskQueueFactory};
pub use memory::InMemoryQueue;
pub use types::{Capabilities, Claim, RunInfo, TaskDefinition, TaskPayload, TaskStatus};
