//! In-memory message bus for testing

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::bus::{MessageBus, Subscription, SubscriptionError};
use super::events::{ExceptionBinding, TaskExceptionMessage};

/// Operation performed against the bus, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    /// Subscription bound with this routing-key pattern
    Bind(String),
    Pause,
    Resume,
    Close,
}

type Delivery = Result<TaskExceptionMessage, SubscriptionError>;

/// In-memory bus
///
/// Every published delivery goes to every open subscription. Subscriptions
/// start paused, like a freshly bound consumer.
#[derive(Default)]
pub struct InMemoryBus {
    subscriptions: Mutex<Vec<Arc<InMemorySubscription>>>,
    ops: Arc<Mutex<Vec<BusOp>>>,
    bind_failure: Mutex<Option<String>>,
    resume_failure: Arc<Mutex<Option<String>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message to every subscription
    pub fn publish(&self, message: TaskExceptionMessage) {
        self.deliver(Ok(message));
    }

    /// Deliver a transport error to every subscription
    pub fn publish_error(&self, message: impl Into<String>) {
        self.deliver(Err(SubscriptionError::Transport(message.into())));
    }

    /// Make the next `subscribe` fail
    pub fn fail_next_bind(&self, message: impl Into<String>) {
        *self.bind_failure.lock() = Some(message.into());
    }

    /// Make the next `resume` on any subscription fail with a transport error
    pub fn fail_next_resume(&self, message: impl Into<String>) {
        *self.resume_failure.lock() = Some(message.into());
    }

    /// Every operation performed so far
    pub fn ops(&self) -> Vec<BusOp> {
        self.ops.lock().clone()
    }

    /// Number of subscriptions that have not been closed
    pub fn open_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|s| !s.closed.is_cancelled())
            .count()
    }

    fn deliver(&self, delivery: Delivery) {
        for subscription in self.subscriptions.lock().iter() {
            let _ = subscription.tx.send(delivery.clone());
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(
        &self,
        binding: &ExceptionBinding,
    ) -> Result<Arc<dyn Subscription>, SubscriptionError> {
        if let Some(message) = self.bind_failure.lock().take() {
            return Err(SubscriptionError::Bind(message));
        }

        self.ops.lock().push(BusOp::Bind(binding.routing_key_pattern()));

        let (tx, rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(true);
        let subscription = Arc::new(InMemorySubscription {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            paused,
            closed: CancellationToken::new(),
            ops: Arc::clone(&self.ops),
            resume_failure: Arc::clone(&self.resume_failure),
        });

        self.subscriptions.lock().push(Arc::clone(&subscription));
        Ok(subscription)
    }
}

/// Subscription handed out by [`InMemoryBus`]
pub struct InMemorySubscription {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    paused: watch::Sender<bool>,
    closed: CancellationToken,
    ops: Arc<Mutex<Vec<BusOp>>>,
    resume_failure: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn recv(&self) -> Option<Delivery> {
        let mut paused = self.paused.subscribe();

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            delivery = async {
                paused.wait_for(|p| !*p).await.ok()?;
                self.rx.lock().await.recv().await
            } => delivery,
        }
    }

    async fn pause(&self) -> Result<(), SubscriptionError> {
        if self.closed.is_cancelled() {
            return Err(SubscriptionError::Closed);
        }
        self.ops.lock().push(BusOp::Pause);
        self.paused.send_replace(true);
        Ok(())
    }

    async fn resume(&self) -> Result<(), SubscriptionError> {
        if self.closed.is_cancelled() {
            return Err(SubscriptionError::Closed);
        }
        if let Some(message) = self.resume_failure.lock().take() {
            return Err(SubscriptionError::Transport(message));
        }
        self.ops.lock().push(BusOp::Resume);
        self.paused.send_replace(false);
        Ok(())
    }

    async fn close(&self) -> Result<(), SubscriptionError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.ops.lock().push(BusOp::Close);
        self.closed.cancel();
        Ok(())
    }
}
