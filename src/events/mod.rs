//! Typed in-process publish/subscribe bus.
//!
//! Publishing never blocks the caller: each topic is a bounded broadcast
//! ring, and a subscriber that falls behind loses the oldest events for
//! that subscriber only, counted on its drop counter. One worker task per
//! subscription invokes the handler in publish order; handler failures and
//! panics are logged and the subscription stays alive.

use crate::models::{DomainEvent, EventEnvelope, Topic};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct EventBus {
    topics: Arc<HashMap<Topic, broadcast::Sender<EventEnvelope>>>,
    all: broadcast::Sender<EventEnvelope>,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(topic_capacity: usize) -> Self {
        let capacity = topic_capacity.max(16);
        let mut topics = HashMap::new();
        for topic in Topic::CONCRETE {
            let (tx, _) = broadcast::channel(capacity);
            topics.insert(topic, tx);
        }
        let (all, _) = broadcast::channel(capacity);
        Self {
            topics: Arc::new(topics),
            all,
            seq: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fan an event out to its topic and to `*`. Never blocks; returns the
    /// stamped envelope.
    pub fn publish(&self, event: DomainEvent) -> EventEnvelope {
        let envelope = EventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: chrono::Utc::now(),
            event,
        };
        if let Some(tx) = self.topics.get(&envelope.event.topic()) {
            // send only fails with zero receivers, which is fine
            let _ = tx.send(envelope.clone());
        }
        let _ = self.all.send(envelope.clone());
        debug!(seq = envelope.seq, kind = envelope.event.kind(), "event published");
        envelope
    }

    /// Raw receiver for a topic, used by the SSE layer. Lag handling is the
    /// caller's responsibility.
    pub fn subscribe_raw(&self, topic: Topic) -> broadcast::Receiver<EventEnvelope> {
        match topic {
            Topic::All => self.all.subscribe(),
            concrete => self
                .topics
                .get(&concrete)
                .expect("all concrete topics exist")
                .subscribe(),
        }
    }

    /// Subscribe a handler on a private worker task. The handler runs
    /// sequentially per subscription; errors and panics are logged with the
    /// event sequence number and do not unsubscribe.
    pub fn subscribe<F, Fut>(&self, topic: Topic, name: &str, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let mut rx = self.subscribe_raw(topic);
        let (stop_tx, mut stop_rx) = oneshot::channel::<u64>();
        let dropped = self.dropped.clone();
        let name = name.to_string();
        let worker_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut drain_to: Option<u64> = None;
            loop {
                match drain_to {
                    None => {
                        tokio::select! {
                            target = &mut stop_rx => {
                                drain_to = Some(target.unwrap_or(0));
                            }
                            received = rx.recv() => {
                                match received {
                                    Ok(envelope) => {
                                        deliver(&worker_name, &handler, envelope).await;
                                    }
                                    Err(broadcast::error::RecvError::Lagged(n)) => {
                                        dropped.fetch_add(n, Ordering::Relaxed);
                                        warn!(subscriber = %worker_name, lost = n, "subscriber lagged, oldest events dropped");
                                    }
                                    Err(broadcast::error::RecvError::Closed) => break,
                                }
                            }
                        }
                    }
                    // Unsubscribing: drain already-published events up to the
                    // sequence captured at unsubscribe time, then exit.
                    Some(target) => match rx.try_recv() {
                        Ok(envelope) if envelope.seq <= target => {
                            deliver(&worker_name, &handler, envelope).await;
                        }
                        Ok(_) => break,
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            dropped.fetch_add(n, Ordering::Relaxed);
                        }
                        Err(_) => break,
                    },
                }
            }
            debug!(subscriber = %worker_name, "subscriber worker exited");
        });

        Subscription {
            name,
            stop: Some(stop_tx),
            seq: self.seq.clone(),
            handle,
        }
    }

    /// Highest sequence number assigned so far.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Events lost to lagged subscribers since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn deliver<F, Fut>(name: &str, handler: &F, envelope: EventEnvelope)
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = crate::Result<()>> + Send,
{
    let seq = envelope.seq;
    let kind = envelope.event.kind();
    match std::panic::AssertUnwindSafe(handler(envelope))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(subscriber = %name, seq, kind, error = %e, "event handler failed");
        }
        Err(_) => {
            error!(subscriber = %name, seq, kind, "event handler panicked");
        }
    }
}

/// Handle to an active subscription. Dropping it aborts the worker;
/// `unsubscribe` drains queued events up to the current sequence first.
pub struct Subscription {
    name: String,
    stop: Option<oneshot::Sender<u64>>,
    seq: Arc<AtomicU64>,
    handle: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drain up to the current sequence number, then release the worker.
    pub async fn unsubscribe(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(self.seq.load(Ordering::SeqCst));
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use std::sync::Mutex;

    fn status_event(task_id: &str) -> DomainEvent {
        DomainEvent::TaskStatusChanged {
            task_id: task_id.to_string(),
            from: TaskStatus::Pending,
            to: TaskStatus::Assigned,
        }
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotonic() {
        let bus = EventBus::new(64);
        let a = bus.publish(status_event("t1"));
        let b = bus.publish(status_event("t2"));
        let c = bus.publish(DomainEvent::TaskCompleted { task_id: "t3".into() });
        assert!(a.seq < b.seq && b.seq < c.seq);
        assert_eq!(bus.current_seq(), c.seq);
    }

    #[tokio::test]
    async fn subscriber_receives_topic_events_in_order() {
        let bus = EventBus::new(64);
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe(Topic::Tasks, "test", move |envelope| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(envelope.seq);
                Ok(())
            }
        });

        let first = bus.publish(status_event("t1")).seq;
        let second = bus.publish(status_event("t2")).seq;
        // proposals topic event must not reach a tasks subscriber
        bus.publish(DomainEvent::ProposalSubmitted {
            task_id: "t1".into(),
            proposal_id: "p1".into(),
            agent_id: "a1".into(),
            confidence: 0.9,
        });

        sub.unsubscribe().await;
        assert_eq!(*seen.lock().unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn wildcard_subscriber_sees_everything() {
        let bus = EventBus::new(64);
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let sub = bus.subscribe(Topic::All, "all", move |_| {
            let sink = sink.clone();
            async move {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(status_event("t1"));
        bus.publish(DomainEvent::ProposalSubmitted {
            task_id: "t1".into(),
            proposal_id: "p1".into(),
            agent_id: "a1".into(),
            confidence: 0.5,
        });

        sub.unsubscribe().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_failure_does_not_unsubscribe() {
        let bus = EventBus::new(64);
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let sub = bus.subscribe(Topic::Tasks, "flaky", move |_| {
            let sink = sink.clone();
            async move {
                if sink.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(crate::QuorumError::Timeout {
                        message: "simulated".into(),
                    })
                } else {
                    Ok(())
                }
            }
        });

        bus.publish(status_event("t1"));
        bus.publish(status_event("t2"));
        sub.unsubscribe().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_without_stalling_publisher() {
        let bus = EventBus::new(16);
        // No worker attached: the raw receiver just fills up.
        let mut rx = bus.subscribe_raw(Topic::Tasks);
        for i in 0..64 {
            bus.publish(status_event(&format!("t{i}")));
        }
        // First recv reports the lag; subsequent recvs yield newest events.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
    }
}
