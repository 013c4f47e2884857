//! Waiting queue
//!
//! Rooms that could not be assigned an agent wait here. Ordering is
//! priority descending, then enqueue time ascending. A periodic sweep
//! drops entries older than the configured timeout; position and ETA are
//! O(n) scans.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Queue priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Vip,
}

/// One waiting room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub tenant_id: String,
    pub room_id: Uuid,
    pub priority: Priority,
    pub department: Option<String>,
    pub required_skills: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    pub customer_info: Value,
}

/// In-process waiting queue.
pub struct WaitingQueue {
    entries: Mutex<Vec<QueueEntry>>,
    timeout: Duration,
    /// Assumed handling time per queued room, for ETA math
    avg_handle_secs: u64,
}

impl WaitingQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            timeout,
            avg_handle_secs: 180,
        }
    }

    /// Add a room. Re-enqueueing an already waiting room updates its entry
    /// without resetting its position clock.
    pub async fn enqueue(&self, mut entry: QueueEntry) {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.iter_mut().find(|e| e.room_id == entry.room_id) {
            entry.enqueued_at = existing.enqueued_at;
            *existing = entry;
        } else {
            entries.push(entry);
        }
        chatforge_common::metrics::record_queue_depth(entries.len());
    }

    fn sort(entries: &mut [QueueEntry]) {
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        });
    }

    /// Pop the highest-priority entry for a tenant.
    pub async fn dequeue(&self, tenant: &str) -> Option<QueueEntry> {
        let mut entries = self.entries.lock().await;
        Self::sort(&mut entries);
        let idx = entries.iter().position(|e| e.tenant_id == tenant)?;
        let entry = entries.remove(idx);
        chatforge_common::metrics::record_queue_depth(entries.len());
        Some(entry)
    }

    /// Remove a room from the queue (assignment happened elsewhere, or the
    /// room closed). Idempotent.
    pub async fn remove(&self, room_id: Uuid) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.room_id != room_id);
        chatforge_common::metrics::record_queue_depth(entries.len());
        before != entries.len()
    }

    /// Zero-based position of a room in its tenant's queue.
    pub async fn position(&self, tenant: &str, room_id: Uuid) -> Option<usize> {
        let mut entries = self.entries.lock().await.clone();
        Self::sort(&mut entries);
        entries
            .iter()
            .filter(|e| e.tenant_id == tenant)
            .position(|e| e.room_id == room_id)
    }

    /// Rough wait estimate for a room.
    pub async fn eta(&self, tenant: &str, room_id: Uuid) -> Option<Duration> {
        let position = self.position(tenant, room_id).await?;
        Some(Duration::from_secs(self.avg_handle_secs * (position as u64 + 1)))
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop entries older than the timeout, returning them so callers can
    /// notify the affected rooms.
    pub async fn sweep_expired(&self) -> Vec<QueueEntry> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.timeout).unwrap_or(ChronoDuration::seconds(600));

        let mut entries = self.entries.lock().await;
        let (expired, kept): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| e.enqueued_at < cutoff);
        *entries = kept;
        chatforge_common::metrics::record_queue_depth(entries.len());

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired waiting-queue entries dropped");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tenant: &str, priority: Priority) -> QueueEntry {
        QueueEntry {
            tenant_id: tenant.to_string(),
            room_id: Uuid::new_v4(),
            priority,
            department: None,
            required_skills: Vec::new(),
            enqueued_at: Utc::now(),
            customer_info: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let queue = WaitingQueue::new(Duration::from_secs(600));

        let normal_1 = entry("acme", Priority::Normal);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let normal_2 = entry("acme", Priority::Normal);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let vip = entry("acme", Priority::Vip);

        queue.enqueue(normal_1.clone()).await;
        queue.enqueue(normal_2.clone()).await;
        queue.enqueue(vip.clone()).await;

        assert_eq!(queue.dequeue("acme").await.unwrap().room_id, vip.room_id);
        assert_eq!(queue.dequeue("acme").await.unwrap().room_id, normal_1.room_id);
        assert_eq!(queue.dequeue("acme").await.unwrap().room_id, normal_2.room_id);
        assert!(queue.dequeue("acme").await.is_none());
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let queue = WaitingQueue::new(Duration::from_secs(600));
        queue.enqueue(entry("a", Priority::Normal)).await;

        assert!(queue.dequeue("b").await.is_none());
        assert!(queue.dequeue("a").await.is_some());
    }

    #[tokio::test]
    async fn position_and_eta() {
        let queue = WaitingQueue::new(Duration::from_secs(600));
        let first = entry("acme", Priority::Normal);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = entry("acme", Priority::Normal);

        queue.enqueue(first.clone()).await;
        queue.enqueue(second.clone()).await;

        assert_eq!(queue.position("acme", first.room_id).await, Some(0));
        assert_eq!(queue.position("acme", second.room_id).await, Some(1));
        assert!(queue.eta("acme", second.room_id).await.unwrap() > queue.eta("acme", first.room_id).await.unwrap());
        assert_eq!(queue.position("acme", Uuid::new_v4()).await, None);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let queue = WaitingQueue::new(Duration::from_secs(600));
        let e = entry("acme", Priority::Normal);
        queue.enqueue(e.clone()).await;

        assert!(queue.remove(e.room_id).await);
        assert!(!queue.remove(e.room_id).await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired() {
        let queue = WaitingQueue::new(Duration::from_millis(30));

        let mut old = entry("acme", Priority::Normal);
        old.enqueued_at = Utc::now() - ChronoDuration::seconds(10);
        let fresh = entry("acme", Priority::Normal);

        queue.enqueue(old.clone()).await;
        queue.enqueue(fresh.clone()).await;

        let expired = queue.sweep_expired().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].room_id, old.room_id);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn reenqueue_keeps_original_clock() {
        let queue = WaitingQueue::new(Duration::from_secs(600));
        let mut e = entry("acme", Priority::Normal);
        e.enqueued_at = Utc::now() - ChronoDuration::seconds(30);
        queue.enqueue(e.clone()).await;

        let mut bumped = e.clone();
        bumped.priority = Priority::High;
        bumped.enqueued_at = Utc::now();
        queue.enqueue(bumped).await;

        assert_eq!(queue.len().await, 1);
        let out = queue.dequeue("acme").await.unwrap();
        assert_eq!(out.priority, Priority::High);
        assert!(out.enqueued_at <= e.enqueued_at);
    }
}
