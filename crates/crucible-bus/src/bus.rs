use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crucible_core::SubscriptionId;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};

use crate::message::{Message, Selector};

/// Anything that can receive messages delivered by the [`MessageBus`].
///
/// Implementations run concurrently with each other; a slow or panicking
/// `handle` only affects delivery to that one subscriber.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handles one delivered message. Errors are logged by the bus and do
    /// not stop delivery to other subscribers or to this subscriber's next
    /// message.
    async fn handle(&self, message: Message) -> Result<(), String>;
}

/// A subscriber driven by an async closure, for ad-hoc subscriptions in
/// tests and small integrations that don't want to define a named type.
pub struct FnSubscriber<F>(pub F);

#[async_trait]
impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(Message) -> Result<(), String> + Send + Sync,
{
    async fn handle(&self, message: Message) -> Result<(), String> {
        (self.0)(message)
    }
}

struct Registration {
    subscriber: Arc<dyn Subscriber>,
    sender: mpsc::Sender<Message>,
}

/// Default per-subscriber mailbox capacity. Generous relative to one
/// workflow's message volume (nine stages times up to seven Agents) so an
/// ordinary run never blocks; a caller that wants to exercise or tune the
/// backpressure point can use [`MessageBus::with_capacity`].
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// In-process topic-based publish/subscribe bus.
///
/// Subscriptions are keyed by [`Selector`]. `publish` looks up every
/// selector a message matches (its type, the wildcard, and its receiver if
/// addressed) and forwards the message once to each matching subscriber's
/// dedicated delivery queue, so per-subscriber FIFO ordering is preserved
/// even though subscribers are driven concurrently with one another. Each
/// queue is bounded: once a subscriber falls behind and its mailbox fills,
/// `publish` blocks until the subscriber's pump task drains room for the
/// next message, so a stalled subscriber applies backpressure to publishers
/// rather than the bus silently growing without bound.
pub struct MessageBus {
    index: RwLock<HashMap<Selector, Vec<SubscriptionId>>>,
    registrations: RwLock<HashMap<SubscriptionId, Registration>>,
    queue_capacity: usize,
}

impl MessageBus {
    /// Creates an empty bus with the default per-subscriber mailbox
    /// capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates an empty bus whose per-subscriber mailboxes hold at most
    /// `capacity` messages before `publish` blocks the publisher.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
            registrations: RwLock::new(HashMap::new()),
            queue_capacity: capacity.max(1),
        }
    }

    /// Registers a subscriber under the given selector. Returns a handle
    /// usable with [`MessageBus::unsubscribe`].
    ///
    /// Spawns one pump task that drains the subscriber's private queue in
    /// order. `publish` only blocks once this subscriber's mailbox is full.
    pub async fn subscribe(&self, selector: Selector, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = crucible_core::new_id();
        let (tx, mut rx) = mpsc::channel::<Message>(self.queue_capacity);

        {
            let mut registrations = self.registrations.write().await;
            registrations.insert(
                id,
                Registration {
                    subscriber: subscriber.clone(),
                    sender: tx,
                },
            );
        }
        {
            let mut index = self.index.write().await;
            index.entry(selector).or_default().push(id);
        }

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = subscriber.handle(message).await {
                    error!(subscription = %id, error = %err, "subscriber callback failed");
                }
            }
        });

        id
    }

    /// Removes a subscription. Dropping the sender half (by removing the
    /// registration) causes the subscriber's pump task to exit once its
    /// queue drains.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.registrations.write().await.remove(&id);
        let mut index = self.index.write().await;
        for ids in index.values_mut() {
            ids.retain(|existing| *existing != id);
        }
    }

    /// Publishes a message. Looks up every selector the message matches and
    /// forwards a clone to each matching subscriber's queue, blocking for
    /// any subscriber whose mailbox is currently full. Delivery to a
    /// dropped-but-not-yet-unsubscribed subscriber is silently skipped.
    pub async fn publish(&self, message: Message) {
        let selectors = message.matching_selectors();

        let senders: Vec<mpsc::Sender<Message>> = {
            let index = self.index.read().await;
            let registrations = self.registrations.read().await;

            let mut targets: Vec<SubscriptionId> = Vec::new();
            for selector in selectors {
                if let Some(ids) = index.get(&selector) {
                    for id in ids {
                        if !targets.contains(id) {
                            targets.push(*id);
                        }
                    }
                }
            }

            info!(
                message_type = %message.message_type,
                receiver = ?message.receiver,
                subscriber_count = targets.len(),
                "publishing message"
            );

            targets.into_iter().filter_map(|id| registrations.get(&id).map(|r| r.sender.clone())).collect()
        };

        // Locks are released before sending: a bounded mailbox can make this
        // await pending until its subscriber's pump task drains it, and that
        // must not hold `index`/`registrations` locked against concurrent
        // subscribe/unsubscribe/publish calls in the meantime.
        for sender in senders {
            let _ = sender.send(message.clone()).await;
        }
    }

    /// Number of live subscriptions, for diagnostics and tests.
    pub async fn subscription_count(&self) -> usize {
        self.registrations.read().await.len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, Participant};
    use crucible_core::AgentRole;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    struct CountingSubscriber {
        count: Arc<AtomicUsize>,
        order: Arc<tokio::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Subscriber for CountingSubscriber {
        async fn handle(&self, message: Message) -> Result<(), String> {
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            if let Some(serde_json::Value::Number(seq)) = message.payload.get("seq") {
                self.order
                    .lock()
                    .await
                    .push(seq.as_u64().unwrap_or(0) as usize);
            }
            let _ = n;
            Ok(())
        }
    }

    #[tokio::test]
    async fn wildcard_subscriber_receives_every_message() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sub = Arc::new(CountingSubscriber { count: count.clone(), order });
        bus.subscribe(Selector::Wildcard, sub).await;

        bus.publish(Message::new(MessageType::StageStart, Participant::Workflow, None))
            .await;
        bus.publish(Message::new(MessageType::TaskComplete, Participant::Workflow, None))
            .await;

        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn receiver_selector_only_matches_addressed_messages() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sub = Arc::new(CountingSubscriber { count: count.clone(), order });
        bus.subscribe(Selector::Receiver(AgentRole::Developer), sub)
            .await;

        bus.publish(Message::new(
            MessageType::TaskAssigned,
            Participant::Workflow,
            Some(AgentRole::Developer),
        ))
        .await;
        bus.publish(Message::new(
            MessageType::TaskAssigned,
            Participant::Workflow,
            Some(AgentRole::TestEngineer),
        ))
        .await;

        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_subscriber_delivery_is_fifo() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sub = Arc::new(CountingSubscriber { count: count.clone(), order: order.clone() });
        bus.subscribe(Selector::Wildcard, sub).await;

        for i in 0..20u64 {
            let msg = Message::new(MessageType::StageStart, Participant::Workflow, None)
                .with_payload("seq", serde_json::json!(i));
            bus.publish(msg).await;
        }

        sleep(Duration::from_millis(50)).await;
        let observed = order.lock().await.clone();
        let expected: Vec<usize> = (0..20).collect();
        assert_eq!(observed, expected);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sub = Arc::new(CountingSubscriber { count: count.clone(), order });
        let id = bus.subscribe(Selector::Wildcard, sub).await;
        bus.unsubscribe(id).await;

        bus.publish(Message::new(MessageType::StageStart, Participant::Workflow, None))
            .await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscription_count().await, 0);
    }

    struct FailingSubscriber;

    #[async_trait]
    impl Subscriber for FailingSubscriber {
        async fn handle(&self, _message: Message) -> Result<(), String> {
            Err("boom".to_string())
        }
    }

    struct GatedSubscriber {
        gate: Arc<tokio::sync::Notify>,
        started: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Subscriber for GatedSubscriber {
        async fn handle(&self, _message: Message) -> Result<(), String> {
            self.started.notify_one();
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_blocks_once_a_subscriber_mailbox_saturates() {
        let bus = MessageBus::with_capacity(1);
        let gate = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(tokio::sync::Notify::new());
        let sub = Arc::new(GatedSubscriber { gate: gate.clone(), started: started.clone() });
        bus.subscribe(Selector::Wildcard, sub).await;

        // Delivered immediately, then the pump task blocks inside `handle`.
        bus.publish(Message::new(MessageType::StageStart, Participant::Workflow, None)).await;
        started.notified().await;

        // The mailbox (capacity 1) is now empty but the subscriber is busy,
        // so this one fills it without blocking.
        bus.publish(Message::new(MessageType::StageStart, Participant::Workflow, None)).await;

        // A third message has nowhere to go until the first `handle` call
        // returns and the pump task drains the mailbox.
        let publish_third = bus.publish(Message::new(MessageType::StageStart, Participant::Workflow, None));
        tokio::pin!(publish_third);
        tokio::select! {
            _ = &mut publish_third => panic!("publish should block while the subscriber's mailbox is saturated"),
            _ = sleep(Duration::from_millis(30)) => {}
        }

        gate.notify_one();
        publish_third.await;
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let bus = MessageBus::new();
        bus.subscribe(Selector::Wildcard, Arc::new(FailingSubscriber)).await;

        let count = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sub = Arc::new(CountingSubscriber { count: count.clone(), order });
        bus.subscribe(Selector::Wildcard, sub).await;

        bus.publish(Message::new(MessageType::StageStart, Participant::Workflow, None))
            .await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
