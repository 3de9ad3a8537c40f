//! Cancellation subscriber
//!
//! Consumes task-exception messages for this worker and stops the matching
//! running task when the queue resolved its run as `canceled`. A transport
//! error drops the subscriber; it is not reconnected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::{MessageBus, Subscription, SubscriptionError};
use super::events::{CancellationEvent, ExceptionBinding, TaskExceptionMessage};
use crate::registry::RunningTasks;

/// Live subscription to task-exception messages
pub struct CancelListener {
    subscription: Arc<dyn Subscription>,
    stop: CancellationToken,
    dropped: Arc<AtomicBool>,
}

impl CancelListener {
    /// Bind the subscription, resume delivery and start consuming
    ///
    /// A subscription that cannot be resumed is closed before the error is
    /// returned.
    pub async fn connect(
        bus: &dyn MessageBus,
        binding: &ExceptionBinding,
        running: Arc<RunningTasks>,
    ) -> Result<Arc<Self>, SubscriptionError> {
        let subscription = bus.subscribe(binding).await?;

        if let Err(e) = subscription.resume().await {
            if let Err(close_err) = subscription.close().await {
                warn!(error = %close_err, "Failed to close cancellation subscription");
            }
            return Err(e);
        }

        let listener = Arc::new(Self {
            subscription: Arc::clone(&subscription),
            stop: CancellationToken::new(),
            dropped: Arc::new(AtomicBool::new(false)),
        });

        tokio::spawn(Self::consume(
            subscription,
            listener.stop.clone(),
            Arc::clone(&listener.dropped),
            running,
        ));

        info!(
            exchange = binding.exchange(),
            routing_key = %binding.routing_key_pattern(),
            "Listening for task cancellations"
        );

        Ok(listener)
    }

    async fn consume(
        subscription: Arc<dyn Subscription>,
        stop: CancellationToken,
        dropped: Arc<AtomicBool>,
        running: Arc<RunningTasks>,
    ) {
        loop {
            let delivery = tokio::select! {
                _ = stop.cancelled() => break,
                delivery = subscription.recv() => delivery,
            };

            match delivery {
                Some(Ok(message)) => {
                    handle_message(&running, &message).await;
                }
                Some(Err(e)) => {
                    error!(
                        alert_operator = true,
                        error = %e,
                        "Cancellation subscription failed, no longer listening for cancellations"
                    );
                    dropped.store(true, Ordering::Release);
                    if let Err(e) = subscription.close().await {
                        warn!(error = %e, "Failed to close cancellation subscription");
                    }
                    break;
                }
                None => break,
            }
        }

        debug!("Cancellation consumer stopped");
    }

    /// Stop delivery until `resume`
    pub async fn pause(&self) -> Result<(), SubscriptionError> {
        self.subscription.pause().await
    }

    pub async fn resume(&self) -> Result<(), SubscriptionError> {
        self.subscription.resume().await
    }

    /// Stop consuming and close the subscription
    pub async fn close(&self) -> Result<(), SubscriptionError> {
        self.stop.cancel();
        self.subscription.close().await
    }

    /// Whether a transport error dropped this subscriber
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Stop the run a message refers to, if it is a cancellation of a run held here
///
/// Returns true when a running task was canceled.
pub async fn handle_message(running: &RunningTasks, message: &TaskExceptionMessage) -> bool {
    let Some(event) = CancellationEvent::from_message(message) else {
        debug!(
            task_id = %message.payload.status.task_id,
            run_id = message.payload.run_id,
            "Task exception without matching run status, ignoring"
        );
        return false;
    };

    if !event.is_cancellation() {
        debug!(
            task_id = %event.task_id,
            run_id = event.run_id,
            reason = event.reason_resolved.as_deref().unwrap_or("none"),
            "Task exception is not a cancellation, ignoring"
        );
        return false;
    }

    running.cancel(&event).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{BusOp, InMemoryBus};
    use crate::devices::DeviceLeases;
    use crate::handler::{TaskError, TaskHandler};
    use crate::registry::{RunKey, RunningTaskState};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct NotifyingHandler {
        canceled: Notify,
    }

    #[async_trait]
    impl TaskHandler for NotifyingHandler {
        fn task_id(&self) -> &str {
            "abc"
        }

        fn run_id(&self) -> u32 {
            0
        }

        async fn start(&self) -> Result<(), TaskError> {
            Ok(())
        }

        async fn cancel(&self, _reason: &str) {
            self.canceled.notify_one();
        }

        async fn abort(&self, _reason: &str) {}
    }

    fn binding() -> ExceptionBinding {
        ExceptionBinding {
            worker_id: "w".into(),
            worker_type: "t".into(),
            worker_group: "g".into(),
            provisioner_id: "p".into(),
        }
    }

    fn running_with(handler: Arc<NotifyingHandler>) -> Arc<RunningTasks> {
        let running = Arc::new(RunningTasks::new(1));
        running.increment_pending();
        running.insert(Arc::new(RunningTaskState::new(
            RunKey::new("abc", 0),
            handler,
            DeviceLeases::new(),
        )));
        running
    }

    #[tokio::test]
    async fn test_handle_message_ignores_other_reasons() {
        let handler = Arc::new(NotifyingHandler {
            canceled: Notify::new(),
        });
        let running = running_with(handler);

        let message = TaskExceptionMessage::resolved("abc", 0, "deadline-exceeded");
        assert!(!handle_message(&running, &message).await);
        assert_eq!(running.len(), 1);

        let message = TaskExceptionMessage::resolved("abc", 0, "canceled");
        assert!(handle_message(&running, &message).await);
        assert!(running.is_empty());
        assert!(running.is_idle());
    }

    #[tokio::test]
    async fn test_connect_resumes_and_cancels() {
        let bus = InMemoryBus::new();
        let handler = Arc::new(NotifyingHandler {
            canceled: Notify::new(),
        });
        let running = running_with(Arc::clone(&handler));

        let listener = CancelListener::connect(&bus, &binding(), Arc::clone(&running))
            .await
            .unwrap();
        assert_eq!(
            bus.ops(),
            vec![BusOp::Bind("primary.*.*.g.w.p.t.*.*.#".into()), BusOp::Resume]
        );

        bus.publish(TaskExceptionMessage::resolved("abc", 0, "canceled"));
        tokio::time::timeout(Duration::from_secs(1), handler.canceled.notified())
            .await
            .unwrap();

        listener.close().await.unwrap();
        assert!(!listener.is_dropped());
    }

    #[tokio::test]
    async fn test_resume_failure_closes_subscription() {
        let bus = InMemoryBus::new();
        bus.fail_next_resume("channel closed");
        let running = Arc::new(RunningTasks::new(1));

        let result = CancelListener::connect(&bus, &binding(), running).await;
        assert!(matches!(result, Err(SubscriptionError::Transport(_))));
        assert_eq!(bus.open_subscriptions(), 0);
        assert_eq!(
            bus.ops(),
            vec![BusOp::Bind("primary.*.*.g.w.p.t.*.*.#".into()), BusOp::Close]
        );
    }

    #[tokio::test]
    async fn test_transport_error_drops_listener() {
        let bus = InMemoryBus::new();
        let running = Arc::new(RunningTasks::new(1));
        let listener = CancelListener::connect(&bus, &binding(), running)
            .await
            .unwrap();

        bus.publish_error("connection reset");

        tokio::time::timeout(Duration::from_secs(1), async {
            while !listener.is_dropped() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(bus.open_subscriptions(), 0);
        assert_eq!(bus.ops().last(), Some(&BusOp::Close));
    }
}
