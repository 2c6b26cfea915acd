//! Metrics derived from the event stream.
//!
//! The recorder subscribes to `*`, counts every event kind, mirrors each
//! envelope into the append-only audit log, and flushes counter deltas to
//! the metrics time series on a fixed interval. The same flush enforces the
//! audit-log retention cap.

use crate::{
    config::MetricsConfig,
    events::{EventBus, Subscription},
    models::{EventEnvelope, Topic},
    store::{MetricPoint, Store},
    Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Default)]
struct Counters {
    current: HashMap<String, u64>,
    flushed: HashMap<String, u64>,
}

pub struct MetricsRecorder {
    store: Store,
    bus: EventBus,
    config: MetricsConfig,
    counters: Mutex<Counters>,
}

impl MetricsRecorder {
    pub fn new(store: Store, bus: EventBus, config: MetricsConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            config,
            counters: Mutex::new(Counters::default()),
        })
    }

    /// Attach to the bus and start the flush loop. The returned handles are
    /// kept by the caller for shutdown.
    pub fn spawn(self: &Arc<Self>) -> (Subscription, tokio::task::JoinHandle<()>) {
        let recorder = Arc::clone(self);
        let subscription = self.bus.subscribe(Topic::All, "metrics-recorder", move |envelope| {
            let recorder = Arc::clone(&recorder);
            async move { recorder.on_event(envelope).await }
        });

        let recorder = Arc::clone(self);
        let flusher = tokio::spawn(async move {
            let interval =
                std::time::Duration::from_secs(recorder.config.flush_interval_secs.max(1));
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = recorder.flush().await {
                    warn!(error = %e, "metrics flush failed");
                }
            }
        });

        (subscription, flusher)
    }

    async fn on_event(&self, envelope: EventEnvelope) -> Result<()> {
        {
            let mut counters = self.counters.lock().expect("counters mutex");
            *counters
                .current
                .entry(envelope.event.kind().to_string())
                .or_insert(0) += 1;
        }
        self.store.append_event(&envelope).await
    }

    /// Record per-kind deltas since the previous flush and trim the audit
    /// log to its retention cap.
    pub async fn flush(&self) -> Result<()> {
        let deltas: Vec<(String, u64)> = {
            let mut counters = self.counters.lock().expect("counters mutex");
            let mut deltas = Vec::new();
            for (kind, total) in counters.current.clone() {
                let previous = counters.flushed.get(&kind).copied().unwrap_or(0);
                if total > previous {
                    deltas.push((kind.clone(), total - previous));
                    counters.flushed.insert(kind, total);
                }
            }
            deltas
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let tags = HashMap::new();
        for (kind, delta) in deltas {
            self.store
                .record_metric(&format!("events.{kind}"), &tags, delta as f64, now_ms)
                .await?;
        }
        self.store
            .record_metric("bus.dropped", &tags, self.bus.dropped() as f64, now_ms)
            .await?;

        let removed = self
            .store
            .trim_events_log(self.config.events_log_retention)
            .await?;
        if removed > 0 {
            debug!(removed, "trimmed audit log");
        }
        Ok(())
    }

    /// Current totals per event kind, for the dashboard snapshot.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().expect("counters mutex").current.clone()
    }

    pub async fn query(
        &self,
        name: &str,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: u64,
    ) -> Result<Vec<MetricPoint>> {
        self.store
            .query_metric(name, since_ms, until_ms, bucket_secs)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DomainEvent;

    #[tokio::test]
    async fn counts_events_and_mirrors_audit_log() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new(64);
        let recorder = MetricsRecorder::new(store.clone(), bus.clone(), MetricsConfig::default());
        let (subscription, flusher) = recorder.spawn();

        bus.publish(DomainEvent::TaskCompleted { task_id: "t1".into() });
        bus.publish(DomainEvent::TaskCompleted { task_id: "t2".into() });
        bus.publish(DomainEvent::TaskFailed {
            task_id: "t3".into(),
            reason: "boom".into(),
        });

        subscription.unsubscribe().await;
        flusher.abort();

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.get("task_completed"), Some(&2));
        assert_eq!(snapshot.get("task_failed"), Some(&1));

        let history = store.events_for_task("t1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn flush_records_deltas_once() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new(64);
        let recorder = MetricsRecorder::new(store.clone(), bus.clone(), MetricsConfig::default());
        let (subscription, flusher) = recorder.spawn();

        bus.publish(DomainEvent::TaskCompleted { task_id: "t1".into() });
        subscription.unsubscribe().await;
        flusher.abort();

        recorder.flush().await.unwrap();
        recorder.flush().await.unwrap();

        let points = store
            .query_metric(
                "events.task_completed",
                0,
                chrono::Utc::now().timestamp_millis() + 1,
                3600,
            )
            .await
            .unwrap();
        let total: f64 = points.iter().map(|p| p.sum).sum();
        assert_eq!(total, 1.0);
    }
}
