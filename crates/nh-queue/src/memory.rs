//! In-memory queue store
//!
//! Per-channel state is built once at construction; all mutation goes
//! through per-structure locks, so each store operation is atomic on the
//! structure it touches. Priority queues are plain FIFO deques consulted in
//! fixed precedence order, not a heap.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, warn};

use nh_common::{
    DeadLetterItem, DlqStats, NotificationChannel, Priority, PriorityQueueStats, QueueItem,
    QueueSettings, QueueStats, StoreError,
};

use crate::store::{EnqueueAck, EnqueueResult, QueueStore};

/// Rolling window backing the processing/error rates in queue stats.
const RATE_WINDOW: Duration = Duration::from_secs(60);

fn slot(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Medium => 2,
        Priority::Low => 3,
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptEvent {
    at: Instant,
    errored: bool,
}

struct PriorityQueueState<T> {
    items: Mutex<VecDeque<QueueItem<T>>>,
    attempts: Mutex<VecDeque<AttemptEvent>>,
}

impl<T> PriorityQueueState<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(VecDeque::new()),
        }
    }

    fn record_attempt(&self, errored: bool) {
        let mut attempts = self.attempts.lock();
        let now = Instant::now();
        attempts.push_back(AttemptEvent { at: now, errored });
        while attempts
            .front()
            .is_some_and(|e| now.duration_since(e.at) > RATE_WINDOW)
        {
            attempts.pop_front();
        }
    }

    /// (attempts in window, errored fraction)
    fn rates(&self) -> (f64, f64) {
        let mut attempts = self.attempts.lock();
        let now = Instant::now();
        while attempts
            .front()
            .is_some_and(|e| now.duration_since(e.at) > RATE_WINDOW)
        {
            attempts.pop_front();
        }
        let total = attempts.len();
        if total == 0 {
            return (0.0, 0.0);
        }
        let errored = attempts.iter().filter(|e| e.errored).count();
        (total as f64, errored as f64 / total as f64)
    }
}

struct ChannelState<T> {
    queues: [PriorityQueueState<T>; 4],
    processing: DashMap<String, QueueItem<T>>,
    dead_letters: Mutex<VecDeque<DeadLetterItem<T>>>,
}

impl<T> ChannelState<T> {
    fn new() -> Self {
        Self {
            queues: std::array::from_fn(|_| PriorityQueueState::new()),
            processing: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::new()),
        }
    }
}

/// In-process [`QueueStore`] implementation.
pub struct MemoryQueueStore<T> {
    settings: Arc<QueueSettings>,
    channels: HashMap<NotificationChannel, ChannelState<T>>,
}

impl<T> MemoryQueueStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(settings: Arc<QueueSettings>) -> Self {
        let channels = NotificationChannel::ALL
            .iter()
            .map(|channel| (*channel, ChannelState::new()))
            .collect();
        Self { settings, channels }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn state(&self, channel: NotificationChannel) -> Result<&ChannelState<T>, StoreError> {
        self.channels
            .get(&channel)
            .ok_or(StoreError::UnknownChannel(channel))
    }

    fn queue_key(channel: NotificationChannel, priority: Priority) -> String {
        format!("{}:{}", channel, priority)
    }

    fn publish_queue_gauge(channel: NotificationChannel, priority: Priority, len: usize) {
        gauge!(
            "queue_size",
            "channel" => channel.as_str(),
            "priority" => priority.as_str()
        )
        .set(len as f64);
    }

    fn publish_processing_gauge(&self, channel: NotificationChannel, state: &ChannelState<T>) {
        gauge!("queue_processing_items", "channel" => channel.as_str())
            .set(state.processing.len() as f64);
    }

    /// Append to the dead-letter store. The store is append-only and never
    /// evicts; crossing the configured threshold is reported, not enforced.
    fn push_dead_letter(
        &self,
        channel: NotificationChannel,
        state: &ChannelState<T>,
        item: QueueItem<T>,
        reason: &str,
    ) {
        let priority = item.priority;
        let entry = DeadLetterItem {
            original_queue: Self::queue_key(channel, priority),
            failed_at: Utc::now(),
            reason: reason.to_string(),
            item,
        };

        let mut dlq = state.dead_letters.lock();
        dlq.push_back(entry);
        let len = dlq.len();
        drop(dlq);

        counter!(
            "queue_dead_letter_total",
            "channel" => channel.as_str(),
            "priority" => priority.as_str()
        )
        .increment(1);
        gauge!("queue_dlq_size", "channel" => channel.as_str()).set(len as f64);

        if len > self.settings.dlq.max_size {
            warn!(
                channel = %channel,
                size = len,
                max_size = self.settings.dlq.max_size,
                "Dead-letter store over configured threshold"
            );
            counter!("queue_dlq_overflow_total", "channel" => channel.as_str()).increment(1);
        }
    }
}

#[async_trait]
impl<T> QueueStore<T> for MemoryQueueStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn add_to_queue(
        &self,
        channels: &[NotificationChannel],
        item: QueueItem<T>,
    ) -> Vec<EnqueueResult> {
        let mut results = Vec::with_capacity(channels.len());

        for channel in channels {
            let outcome = match self.state(*channel) {
                Ok(state) => {
                    let queue = &state.queues[slot(item.priority)];
                    let mut items = queue.items.lock();
                    items.push_back(item.clone());
                    let len = items.len();
                    drop(items);

                    Self::publish_queue_gauge(*channel, item.priority, len);
                    debug!(
                        channel = %channel,
                        priority = %item.priority,
                        item_id = %item.id,
                        queue_size = len,
                        "Item enqueued"
                    );

                    Ok(EnqueueAck {
                        item_id: item.id.clone(),
                        queue: Self::queue_key(*channel, item.priority),
                        enqueued_at: Utc::now(),
                    })
                }
                Err(e) => Err(e),
            };

            results.push(EnqueueResult {
                channel: *channel,
                outcome,
            });
        }

        results
    }

    async fn get_from_queue(
        &self,
        channel: NotificationChannel,
    ) -> Result<Option<QueueItem<T>>, StoreError> {
        let state = self.state(channel)?;
        let now = Utc::now();

        for priority in Priority::ordered() {
            let queue = &state.queues[slot(priority)];
            let mut items = queue.items.lock();

            // Oldest due item; entries with a future next_attempt_at stay put.
            let position = items
                .iter()
                .position(|item| item.next_attempt_at.map_or(true, |due| due <= now));

            if let Some(position) = position {
                if let Some(mut item) = items.remove(position) {
                    let len = items.len();
                    drop(items);

                    item.last_attempt_at = Some(now);
                    state.processing.insert(item.id.clone(), item.clone());

                    Self::publish_queue_gauge(channel, priority, len);
                    self.publish_processing_gauge(channel, state);

                    return Ok(Some(item));
                }
            }
        }

        Ok(None)
    }

    async fn ack(&self, channel: NotificationChannel, item_id: &str) -> Result<(), StoreError> {
        let state = self.state(channel)?;

        let Some((_, item)) = state.processing.remove(item_id) else {
            return Err(StoreError::UnknownItem {
                channel,
                item_id: item_id.to_string(),
            });
        };

        state.queues[slot(item.priority)].record_attempt(false);
        self.publish_processing_gauge(channel, state);
        Ok(())
    }

    async fn requeue_for_retry(
        &self,
        channel: NotificationChannel,
        item: QueueItem<T>,
    ) -> Result<(), StoreError> {
        let state = self.state(channel)?;

        // If maintenance already reclaimed the item as stuck, a copy is back
        // in the queue; re-adding here would duplicate it.
        if state.processing.remove(&item.id).is_none() {
            warn!(
                channel = %channel,
                item_id = %item.id,
                "Retry requeue skipped: item no longer in processing set"
            );
            return Ok(());
        }

        let priority = item.priority;
        state.queues[slot(priority)].record_attempt(true);

        let queue = &state.queues[slot(priority)];
        let mut items = queue.items.lock();
        items.push_back(item);
        let len = items.len();
        drop(items);

        Self::publish_queue_gauge(channel, priority, len);
        self.publish_processing_gauge(channel, state);
        Ok(())
    }

    async fn move_to_dead_letter(
        &self,
        channel: NotificationChannel,
        item: QueueItem<T>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let state = self.state(channel)?;

        if state.processing.remove(&item.id).is_none() {
            warn!(
                channel = %channel,
                item_id = %item.id,
                "Dead-lettering item that was not in the processing set"
            );
        }

        state.queues[slot(item.priority)].record_attempt(true);
        self.push_dead_letter(channel, state, item, reason);
        self.publish_processing_gauge(channel, state);
        Ok(())
    }

    async fn cleanup_expired_items(
        &self,
        channel: NotificationChannel,
    ) -> Result<usize, StoreError> {
        let state = self.state(channel)?;
        let now = Utc::now();
        let batch_budget = self.settings.maintenance.cleanup_batch_size;
        let mut moved = 0;

        for priority in Priority::ordered() {
            if moved >= batch_budget {
                break;
            }
            let ttl = self.settings.priorities.get(priority).ttl;
            let queue = &state.queues[slot(priority)];

            // Bounded per run; anything left over is picked up next cycle.
            let expired: Vec<QueueItem<T>> = {
                let mut items = queue.items.lock();
                let mut keep = VecDeque::with_capacity(items.len());
                let mut expired = Vec::new();
                while let Some(item) = items.pop_front() {
                    if moved + expired.len() < batch_budget && item.age(now) > ttl {
                        expired.push(item);
                    } else {
                        keep.push_back(item);
                    }
                }
                *items = keep;
                Self::publish_queue_gauge(channel, priority, items.len());
                expired
            };

            for item in expired {
                debug!(
                    channel = %channel,
                    priority = %priority,
                    item_id = %item.id,
                    "Expiring item past TTL"
                );
                self.push_dead_letter(channel, state, item, "TTL exceeded");
                moved += 1;
            }
        }

        Ok(moved)
    }

    async fn requeue_stuck_items(
        &self,
        channel: NotificationChannel,
    ) -> Result<usize, StoreError> {
        let state = self.state(channel)?;
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.settings.processing_timeout)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let stuck_ids: Vec<String> = state
            .processing
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .last_attempt_at
                    .map_or(true, |at| at < now - timeout)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut requeued = 0;
        for id in stuck_ids {
            if let Some((_, item)) = state.processing.remove(&id) {
                let priority = item.priority;
                let queue = &state.queues[slot(priority)];
                let mut items = queue.items.lock();
                items.push_back(item);
                let len = items.len();
                drop(items);

                Self::publish_queue_gauge(channel, priority, len);
                warn!(
                    channel = %channel,
                    priority = %priority,
                    item_id = %id,
                    "Requeued stuck item"
                );
                requeued += 1;
            }
        }

        if requeued > 0 {
            self.publish_processing_gauge(channel, state);
        }
        Ok(requeued)
    }

    async fn reprocess_dead_letters(
        &self,
        channel: NotificationChannel,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let state = self.state(channel)?;

        let batch: Vec<DeadLetterItem<T>> = {
            let mut dlq = state.dead_letters.lock();
            let take = batch_size.min(dlq.len());
            let batch = dlq.drain(..take).collect();
            gauge!("queue_dlq_size", "channel" => channel.as_str()).set(dlq.len() as f64);
            batch
        };

        let mut reprocessed = 0;
        for entry in batch {
            let mut item = entry.item;
            item.attempt_count = 0;
            item.next_attempt_at = None;

            let priority = item.priority;
            let queue = &state.queues[slot(priority)];
            let mut items = queue.items.lock();
            items.push_back(item);
            let len = items.len();
            drop(items);

            Self::publish_queue_gauge(channel, priority, len);
            reprocessed += 1;
        }

        if reprocessed > 0 {
            debug!(channel = %channel, count = reprocessed, "Reprocessed dead-letter items");
        }
        Ok(reprocessed)
    }

    async fn get_queue_stats(
        &self,
        channel: NotificationChannel,
    ) -> Result<QueueStats, StoreError> {
        let state = self.state(channel)?;
        let mut priority_queues = HashMap::new();

        for priority in Priority::ordered() {
            let queue = &state.queues[slot(priority)];
            let (size, oldest_created_at) = {
                let items = queue.items.lock();
                (items.len(), items.front().map(|item| item.created_at))
            };
            let (processing_rate, error_rate) = queue.rates();

            priority_queues.insert(
                priority,
                PriorityQueueStats {
                    size,
                    oldest_created_at,
                    processing_rate,
                    error_rate,
                },
            );
        }

        let dlq = {
            let dead_letters = state.dead_letters.lock();
            let cutoff = Utc::now()
                - chrono::Duration::from_std(RATE_WINDOW)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            let recent_failures = dead_letters
                .iter()
                .rev()
                .take_while(|entry| entry.failed_at >= cutoff)
                .count();
            DlqStats {
                size: dead_letters.len(),
                oldest_failed_at: dead_letters.front().map(|entry| entry.failed_at),
                recent_failures,
            }
        };

        Ok(QueueStats {
            priority_queues,
            dlq,
            processing_items: state.processing.len(),
        })
    }

    async fn dead_letters(
        &self,
        channel: NotificationChannel,
        limit: usize,
    ) -> Result<Vec<DeadLetterItem<T>>, StoreError> {
        let state = self.state(channel)?;
        let dlq = state.dead_letters.lock();
        Ok(dlq.iter().rev().take(limit).cloned().collect())
    }
}
