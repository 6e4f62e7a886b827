//! QueueStore contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nh_common::{DeadLetterItem, NotificationChannel, QueueItem, QueueStats, StoreError};

/// Acknowledgement for one successful per-channel enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueAck {
    pub item_id: String,
    /// Queue key the item landed in, e.g. `email:critical`.
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of one channel's enqueue within a multi-channel add. The
/// multi-channel call is not atomic; callers must inspect each outcome and
/// treat failed channels as retry candidates.
#[derive(Debug)]
pub struct EnqueueResult {
    pub channel: NotificationChannel,
    pub outcome: std::result::Result<EnqueueAck, StoreError>,
}

/// Durable, priority-partitioned FIFO queues per channel, plus a dead-letter
/// store and an in-flight processing set.
///
/// Every method mutating a queue, the processing set, or the dead-letter
/// store is atomic with respect to concurrent callers. Store failures are
/// surfaced as [`StoreError`] and must never be swallowed.
#[async_trait]
pub trait QueueStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Enqueue a copy of `item` into each channel's queue for the item's
    /// priority. Each per-channel enqueue is atomic; the call as a whole is
    /// not, and partial success is reported per channel.
    async fn add_to_queue(
        &self,
        channels: &[NotificationChannel],
        item: QueueItem<T>,
    ) -> Vec<EnqueueResult>;

    /// Pop the oldest due item from the first non-empty priority queue,
    /// scanning priorities in fixed precedence order. The returned item is
    /// moved into the processing set with a fresh `last_attempt_at`. Items
    /// whose `next_attempt_at` is still in the future are skipped.
    async fn get_from_queue(
        &self,
        channel: NotificationChannel,
    ) -> Result<Option<QueueItem<T>>, StoreError>;

    /// Release a successfully delivered item from the processing set.
    async fn ack(&self, channel: NotificationChannel, item_id: &str) -> Result<(), StoreError>;

    /// Return a failed item to the tail of its priority queue for a later
    /// attempt, removing it from the processing set. The caller is expected
    /// to have already bumped `attempt_count` and set `next_attempt_at`.
    async fn requeue_for_retry(
        &self,
        channel: NotificationChannel,
        item: QueueItem<T>,
    ) -> Result<(), StoreError>;

    /// Append an item to the dead-letter store, annotated with its
    /// originating queue and the failure reason, and drop it from the
    /// processing set.
    async fn move_to_dead_letter(
        &self,
        channel: NotificationChannel,
        item: QueueItem<T>,
        reason: &str,
    ) -> Result<(), StoreError>;

    /// Move items older than their priority's TTL to the dead-letter store
    /// with reason "TTL exceeded". Returns the number of items moved.
    async fn cleanup_expired_items(
        &self,
        channel: NotificationChannel,
    ) -> Result<usize, StoreError>;

    /// Reinsert processing-set items whose `last_attempt_at` predates
    /// `now - processing_timeout` into the tail of their priority queue.
    /// Returns the number of items reclaimed.
    async fn requeue_stuck_items(
        &self,
        channel: NotificationChannel,
    ) -> Result<usize, StoreError>;

    /// Operator entry point: drain up to `batch_size` dead-letter items back
    /// into their priority queues with reset attempt counts. Returns the
    /// number of items reprocessed.
    async fn reprocess_dead_letters(
        &self,
        channel: NotificationChannel,
        batch_size: usize,
    ) -> Result<usize, StoreError>;

    /// Snapshot of per-priority sizes and rolling rates, dead-letter state,
    /// and the processing-set size.
    async fn get_queue_stats(
        &self,
        channel: NotificationChannel,
    ) -> Result<QueueStats, StoreError>;

    /// Read-only view of the newest dead-letter entries, for operators.
    async fn dead_letters(
        &self,
        channel: NotificationChannel,
        limit: usize,
    ) -> Result<Vec<DeadLetterItem<T>>, StoreError>;
}
