//! Error Bus (C2): a process-wide topic publishing structured error records.
//!
//! Publication is non-blocking and best-effort (`SPEC_FULL.md` §4.2): a
//! publish that would block because a subscriber is lagging is dropped and
//! counted rather than awaited, and the same failure is always also emitted
//! through `tracing` so it is never silently lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Severity;
use crate::time_provider::SharedTimeProvider;

/// A structured error record published on the bus.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorRecord {
    /// Name of the agent or component that raised the error.
    pub source_agent: String,
    /// Free-text classification (e.g. `"dependency_timeout"`).
    pub kind: String,
    /// Severity band.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary structured context (agent name, model id, request id, ...).
    pub context: serde_json::Value,
    /// Unix milliseconds at which the error occurred.
    pub occurred_at_ms: u64,
    /// Request id, when the error is attributable to a specific request.
    pub request_id: Option<String>,
}

/// The Error Bus: a broadcast channel with a fixed-size replay buffer.
pub struct ErrorBus {
    sender: broadcast::Sender<ErrorRecord>,
    dropped: AtomicU64,
    time: SharedTimeProvider,
}

impl ErrorBus {
    /// Creates a new bus with the given subscriber buffer capacity.
    #[must_use]
    pub fn new(capacity: usize, time: SharedTimeProvider) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender,
            dropped: AtomicU64::new(0),
            time,
        })
    }

    /// Publishes a record. Never awaits; a full or subscriber-less channel
    /// simply means the record reaches nobody but is still traced.
    pub fn publish(&self, mut record: ErrorRecord) {
        record.occurred_at_ms = self
            .time
            .now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        match record.severity {
            Severity::Critical => {
                tracing::error!(source = %record.source_agent, kind = %record.kind, "{}", record.message);
            }
            Severity::Error => {
                tracing::error!(source = %record.source_agent, kind = %record.kind, "{}", record.message);
            }
            Severity::Warn => {
                tracing::warn!(source = %record.source_agent, kind = %record.kind, "{}", record.message);
            }
            Severity::Info => {
                tracing::info!(source = %record.source_agent, kind = %record.kind, "{}", record.message);
            }
        }

        if self.sender.send(record).is_err() {
            // No active subscribers; count it, don't treat as fatal.
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribes to future error records.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorRecord> {
        self.sender.subscribe()
    }

    /// Count of publishes that found zero live subscribers.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    fn sample_record(severity: Severity) -> ErrorRecord {
        ErrorRecord {
            source_agent: "asr".to_string(),
            kind: "probe_failure".to_string(),
            severity,
            message: "probe timed out".to_string(),
            context: serde_json::json!({}),
            occurred_at_ms: 0,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_record() {
        let bus = ErrorBus::new(16, test_time_provider());
        let mut rx = bus.subscribe();
        bus.publish(sample_record(Severity::Warn));
        let record = rx.recv().await.unwrap();
        assert_eq!(record.source_agent, "asr");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_counts_as_dropped_not_panicked() {
        let bus = ErrorBus::new(16, test_time_provider());
        bus.publish(sample_record(Severity::Info));
        assert_eq!(bus.dropped_count(), 1);
    }
}
