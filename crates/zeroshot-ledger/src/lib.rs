//! The in-memory, append-only, cluster-scoped message ledger.
//!
//! A queryable log rather than a plain broadcast channel: every message
//! ever published stays around for `query`/`findLast`/`count`/`since`,
//! and subscribers are plain callbacks invoked synchronously, in
//! registration order, before `publish` returns.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::Level;
use zeroshot_observability::{emit_event, ObservabilityEvent, ProcessKind};
use zeroshot_types::{Message, MessageFilter};

pub type Subscriber = Arc<dyn Fn(&Message) + Send + Sync>;

struct Subscription {
    id: u64,
    callback: Subscriber,
}

struct LedgerState {
    messages: Vec<Message>,
    last_timestamp_ms: i64,
}

/// One cluster's message bus. A `Ledger` is created alongside its cluster
/// and lives exactly as long as it — there is no cross-cluster sharing.
pub struct Ledger {
    cluster_id: String,
    state: RwLock<LedgerState>,
    subscribers: RwLock<Vec<Subscription>>,
    next_subscription_id: AtomicU64,
}

/// Returned by `subscribe`; dropping it does nothing — call `unsubscribe`
/// explicitly to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl Ledger {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            state: RwLock::new(LedgerState {
                messages: Vec::new(),
                last_timestamp_ms: 0,
            }),
            subscribers: RwLock::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub async fn subscribe(&self, callback: Subscriber) -> SubscriptionId {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscribers.write().await;
        subs.push(Subscription { id, callback });
        SubscriptionId(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscribers.write().await;
        subs.retain(|sub| sub.id != id.0);
    }

    /// Stamp `timestamp` if unset (monotone-nondecreasing per cluster),
    /// append, then synchronously notify every subscriber in registration
    /// order. A subscriber panic is caught and logged so it never blocks
    /// delivery to the others, but is re-raised once fan-out completes —
    /// it signals an invariant violation in the engine itself, not a
    /// recoverable per-message failure.
    pub async fn publish(&self, mut message: Message) -> Message {
        message.cluster_id = self.cluster_id.clone();
        {
            let mut state = self.state.write().await;
            let now = chrono::Utc::now().timestamp_millis();
            let stamped = message.timestamp.unwrap_or(now).max(state.last_timestamp_ms);
            message.timestamp = Some(stamped);
            state.last_timestamp_ms = stamped;
            state.messages.push(message.clone());
        }

        let subscribers: Vec<Subscriber> = {
            let subs = self.subscribers.read().await;
            subs.iter().map(|sub| sub.callback.clone()).collect()
        };

        let mut first_panic = None;
        for callback in subscribers {
            let result = catch_unwind(AssertUnwindSafe(|| callback(&message)));
            if let Err(payload) = result {
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "ledger.subscriber.panic",
                        component: "zeroshot.ledger",
                        cluster_id: Some(&self.cluster_id),
                        agent_id: None,
                        task_id: None,
                        status: Some("panicked"),
                        error_code: None,
                        detail: Some(&message.topic),
                    },
                );
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
        }
        if let Some(payload) = first_panic {
            std::panic::resume_unwind(payload);
        }

        message
    }

    pub async fn query(&self, filter: &MessageFilter) -> Vec<Message> {
        let state = self.state.read().await;
        let matching: Vec<Message> = state
            .messages
            .iter()
            .filter(|msg| filter.matches(msg))
            .cloned()
            .collect();
        match filter.limit {
            Some(limit) if matching.len() > limit => {
                matching[matching.len() - limit..].to_vec()
            }
            _ => matching,
        }
    }

    pub async fn find_last(&self, filter: &MessageFilter) -> Option<Message> {
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .rev()
            .find(|msg| filter.matches(msg))
            .cloned()
    }

    pub async fn count(&self, filter: &MessageFilter) -> usize {
        let state = self.state.read().await;
        state.messages.iter().filter(|msg| filter.matches(msg)).count()
    }

    pub async fn since(&self, timestamp: i64) -> Vec<Message> {
        let filter = MessageFilter::for_cluster(self.cluster_id.clone()).with_since(timestamp);
        self.query(&filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use zeroshot_types::{MessageContent, Receiver};

    fn sample(topic: &str, sender: &str) -> Message {
        Message::new(
            "c1",
            topic,
            sender,
            Receiver::Broadcast,
            MessageContent::text("hi"),
        )
    }

    #[tokio::test]
    async fn publish_stamps_and_is_visible_to_subscribers_in_order() {
        let ledger = Ledger::new("c1");
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let order_a = order.clone();
        ledger
            .subscribe(Arc::new(move |msg: &Message| {
                let order_a = order_a.clone();
                let topic = msg.topic.clone();
                tokio::spawn(async move {
                    order_a.lock().await.push(format!("a:{topic}"));
                });
            }))
            .await;
        let order_b = order.clone();
        ledger
            .subscribe(Arc::new(move |msg: &Message| {
                let order_b = order_b.clone();
                let topic = msg.topic.clone();
                tokio::spawn(async move {
                    order_b.lock().await.push(format!("b:{topic}"));
                });
            }))
            .await;

        let stamped = ledger.publish(sample("ISSUE_OPENED", "system")).await;
        assert!(stamped.timestamp.is_some());

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let seen = order.lock().await;
        assert_eq!(seen.as_slice(), ["a:ISSUE_OPENED", "b:ISSUE_OPENED"]);
    }

    #[tokio::test]
    async fn query_since_is_strictly_greater_than() {
        let ledger = Ledger::new("c1");
        let mut m1 = sample("T", "s");
        m1.timestamp = Some(100);
        ledger.publish(m1).await;
        let mut m2 = sample("T", "s");
        m2.timestamp = Some(200);
        ledger.publish(m2).await;

        let since_100 = ledger.since(100).await;
        assert_eq!(since_100.len(), 1);
        assert_eq!(since_100[0].timestamp, Some(200));
    }

    #[tokio::test]
    async fn query_limit_keeps_most_recent_n() {
        let ledger = Ledger::new("c1");
        for i in 0..5 {
            let mut msg = sample("T", "s");
            msg.timestamp = Some(i);
            ledger.publish(msg).await;
        }
        let filter = MessageFilter::for_cluster("c1").with_topic("T").with_limit(2);
        let result = ledger.query(&filter).await;
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].timestamp, Some(3));
        assert_eq!(result[1].timestamp, Some(4));
    }

    #[tokio::test]
    async fn timestamps_are_monotone_nondecreasing_per_cluster() {
        let ledger = Ledger::new("c1");
        let mut last = 0;
        for _ in 0..3 {
            let stamped = ledger.publish(sample("T", "s")).await;
            let ts = stamped.timestamp.unwrap();
            assert!(ts >= last);
            last = ts;
        }
    }

    #[tokio::test]
    async fn subscriber_panic_does_not_block_other_subscribers() {
        let ledger = Arc::new(Ledger::new("c1"));
        let hit = Arc::new(AtomicUsize::new(0));
        ledger
            .subscribe(Arc::new(|_msg: &Message| {
                panic!("boom");
            }))
            .await;
        let hit2 = hit.clone();
        ledger
            .subscribe(Arc::new(move |_msg: &Message| {
                hit2.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let ledger_for_publish = ledger.clone();
        let outcome = tokio::spawn(async move {
            ledger_for_publish.publish(sample("T", "s")).await;
        })
        .await;
        assert!(outcome.is_err());
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
