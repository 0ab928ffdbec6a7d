//! Accounting of envelopes and items the pipeline had to drop.
//!
//! Counts are reported to the server piggybacked on the next outgoing
//! envelope as a `client_report` item, then reset.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::envelope::{Envelope, EnvelopeItem, ItemType};
use crate::rate_limit::DataCategory;

/// Why something was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// Work queue full or dispatcher closed
    QueueOverflow,
    /// Evicted from the disk cache to respect its capacity
    CacheOverflow,
    /// Suppressed by a server rate limit
    RateLimitBackoff,
    /// Rejected by the sender without a retry
    NetworkError,
    /// Dropped by an event processor
    EventProcessor,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::QueueOverflow => "queue_overflow",
            DiscardReason::CacheOverflow => "cache_overflow",
            DiscardReason::RateLimitBackoff => "ratelimit_backoff",
            DiscardReason::NetworkError => "network_error",
            DiscardReason::EventProcessor => "event_processor",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DiscardReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl Serialize for DataCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One line of a client report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscardedEvents {
    pub reason: DiscardReason,
    pub category: DataCategory,
    pub quantity: u64,
}

/// Payload of a `client_report` item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientReport {
    pub timestamp: DateTime<Utc>,
    pub discarded_events: Vec<DiscardedEvents>,
}

impl ClientReport {
    pub fn to_item(&self) -> Result<EnvelopeItem, serde_json::Error> {
        EnvelopeItem::json(ItemType::ClientReport, self)
    }
}

/// Counters of lost items keyed by reason and category.
#[derive(Debug, Default)]
pub struct DiscardTracker {
    counts: Mutex<HashMap<(DiscardReason, DataCategory), u64>>,
    overflow: AtomicU64,
}

impl DiscardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reason: DiscardReason, category: DataCategory, quantity: u64) {
        if quantity == 0 {
            return;
        }
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry((reason, category)).or_insert(0) += quantity;
    }

    /// Record every item of `envelope` as lost.
    pub fn record_envelope(&self, reason: DiscardReason, envelope: &Envelope) {
        for item in envelope.items() {
            self.record(reason, DataCategory::from_item_type(&item.item_type), 1);
        }
        if reason == DiscardReason::QueueOverflow {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Envelopes rejected because the work queue was saturated or closed.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn count(&self, reason: DiscardReason, category: DataCategory) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(reason, category))
            .copied()
            .unwrap_or(0)
    }

    /// Take all pending counts as a report, leaving the counters empty.
    ///
    /// `None` when nothing was lost since the last report.
    pub fn take_report(&self, timestamp: DateTime<Utc>) -> Option<ClientReport> {
        let counts = std::mem::take(&mut *self.counts.lock().unwrap_or_else(PoisonError::into_inner));
        if counts.is_empty() {
            return None;
        }

        let mut discarded_events: Vec<DiscardedEvents> = counts
            .into_iter()
            .map(|((reason, category), quantity)| DiscardedEvents {
                reason,
                category,
                quantity,
            })
            .collect();
        discarded_events.sort_by_key(|e| (e.reason.as_str(), e.category.as_str()));

        Some(ClientReport {
            timestamp,
            discarded_events,
        })
    }

    /// Put back the counts of a report that never reached the server.
    pub fn restore(&self, report: &ClientReport) {
        for event in &report.discarded_events {
            self.record(event.reason, event.category, event.quantity);
        }
    }

    /// Copy of all counters.
    pub fn snapshot(&self) -> HashMap<(DiscardReason, DataCategory), u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_envelope_counts_items() {
        let tracker = DiscardTracker::new();
        let envelope = Envelope::new()
            .with_item(EnvelopeItem::new(ItemType::Event, b"{}".to_vec()))
            .with_item(EnvelopeItem::new(ItemType::Attachment, b"x".to_vec()));

        tracker.record_envelope(DiscardReason::QueueOverflow, &envelope);
        tracker.record_envelope(DiscardReason::QueueOverflow, &envelope);

        assert_eq!(tracker.count(DiscardReason::QueueOverflow, DataCategory::Error), 2);
        assert_eq!(
            tracker.count(DiscardReason::QueueOverflow, DataCategory::Attachment),
            2
        );
        assert_eq!(tracker.overflow_count(), 2);
        assert_eq!(tracker.snapshot().len(), 2);
    }

    #[test]
    fn test_take_report_resets_counters() {
        let tracker = DiscardTracker::new();
        tracker.record(DiscardReason::RateLimitBackoff, DataCategory::Error, 2);
        tracker.record(DiscardReason::CacheOverflow, DataCategory::Attachment, 1);

        let now = Utc::now();
        let report = tracker.take_report(now).unwrap();
        assert_eq!(report.timestamp, now);
        assert_eq!(
            report.discarded_events,
            vec![
                DiscardedEvents {
                    reason: DiscardReason::CacheOverflow,
                    category: DataCategory::Attachment,
                    quantity: 1,
                },
                DiscardedEvents {
                    reason: DiscardReason::RateLimitBackoff,
                    category: DataCategory::Error,
                    quantity: 2,
                },
            ]
        );
        assert!(tracker.snapshot().is_empty());
        assert!(tracker.take_report(now).is_none());

        tracker.restore(&report);
        assert_eq!(tracker.count(DiscardReason::RateLimitBackoff, DataCategory::Error), 2);
    }

    #[test]
    fn test_report_item_payload() {
        let tracker = DiscardTracker::new();
        tracker.record(DiscardReason::RateLimitBackoff, DataCategory::ProfileChunkUi, 3);

        let item = tracker.take_report(Utc::now()).unwrap().to_item().unwrap();
        assert_eq!(item.item_type, ItemType::ClientReport);

        let payload: serde_json::Value = serde_json::from_slice(&item.payload).unwrap();
        assert_eq!(
            payload["discarded_events"],
            serde_json::json!([
                {"reason": "ratelimit_backoff", "category": "profile_chunk_ui", "quantity": 3}
            ])
        );
        assert!(payload["timestamp"].is_string());
    }

    #[test]
    fn test_zero_quantity_is_not_recorded() {
        let tracker = DiscardTracker::new();
        tracker.record(DiscardReason::NetworkError, DataCategory::Error, 0);
        assert!(tracker.snapshot().is_empty());
        assert_eq!(tracker.overflow_count(), 0);
    }
}
