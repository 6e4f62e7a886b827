//! Dispatcher - producer-facing admission path
//!
//! Producers hand a notification to the dispatcher, which applies rate
//! limiting, consults the per-channel circuit breaker, and fans the item out
//! to each target channel's queue. The multi-channel enqueue is not atomic:
//! the caller gets one outcome per channel and decides what to do with the
//! ones that failed.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, warn};

use nh_common::{
    Notification, NotificationChannel, NotificationStatus, QueueItem, QueueSettings, StoreError,
};
use nh_queue::{EnqueueAck, QueueStore};
use nh_ratelimit::{RateLimitAlgorithm, RateLimitConfig, RateLimitInfo, RateLimiter};

use crate::health::HealthMonitor;
use crate::repository::NotificationRepository;

#[derive(Debug)]
pub enum ChannelOutcome {
    /// The channel's queue accepted the item.
    Queued(EnqueueAck),
    /// The channel's circuit is open; delivery was not attempted.
    CircuitOpen,
    /// The channel's store rejected the enqueue.
    StoreFailed(StoreError),
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Accepted {
        channels: Vec<(NotificationChannel, ChannelOutcome)>,
    },
    RateLimited(RateLimitInfo),
}

pub struct Dispatcher {
    store: Arc<dyn QueueStore<Notification>>,
    repository: Arc<dyn NotificationRepository>,
    monitor: Arc<HealthMonitor>,
    limiter: Arc<RateLimiter>,
    settings: Arc<QueueSettings>,
    algorithm: RateLimitAlgorithm,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore<Notification>>,
        repository: Arc<dyn NotificationRepository>,
        monitor: Arc<HealthMonitor>,
        limiter: Arc<RateLimiter>,
        settings: Arc<QueueSettings>,
    ) -> Self {
        Self {
            store,
            repository,
            monitor,
            limiter,
            settings,
            algorithm: RateLimitAlgorithm::SlidingWindow,
        }
    }

    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub async fn dispatch(&self, caller: &str, notification: Notification) -> DispatchOutcome {
        let rate_settings = &self.settings.priorities.get(notification.priority).rate_limit;
        let config = RateLimitConfig::new(
            self.algorithm,
            std::time::Duration::from_secs(rate_settings.window_seconds),
            rate_settings.max_requests,
        )
        .with_prefix("dispatch");

        let info = self.limiter.check(caller, notification.priority.as_str(), &config);
        if !info.is_allowed() {
            return DispatchOutcome::RateLimited(info);
        }

        let mut outcomes = Vec::with_capacity(notification.channels.len());
        let mut deliverable = Vec::new();

        for channel in &notification.channels {
            if self.monitor.is_circuit_closed(*channel) {
                deliverable.push(*channel);
            } else {
                // Fail fast instead of queueing into a known-unhealthy
                // channel.
                warn!(
                    channel = %channel,
                    notification_id = %notification.id,
                    "Channel circuit open, rejecting"
                );
                counter!("dispatch_circuit_rejections_total", "channel" => channel.as_str())
                    .increment(1);
                outcomes.push((*channel, ChannelOutcome::CircuitOpen));
            }
        }

        if !deliverable.is_empty() {
            let item = QueueItem::new(notification.clone(), notification.priority);
            let results = self.store.add_to_queue(&deliverable, item).await;

            let mut any_queued = false;
            for result in results {
                let outcome = match result.outcome {
                    Ok(ack) => {
                        any_queued = true;
                        ChannelOutcome::Queued(ack)
                    }
                    Err(e) => {
                        error!(
                            channel = %result.channel,
                            notification_id = %notification.id,
                            error = %e,
                            "Enqueue failed"
                        );
                        ChannelOutcome::StoreFailed(e)
                    }
                };
                outcomes.push((result.channel, outcome));
            }

            if any_queued {
                if let Err(e) = self
                    .repository
                    .transition(&notification.id, NotificationStatus::Queued, None)
                    .await
                {
                    error!(
                        notification_id = %notification.id,
                        error = %e,
                        "Failed to mark notification as queued"
                    );
                }
                debug!(
                    notification_id = %notification.id,
                    priority = %notification.priority,
                    "Notification queued"
                );
            }
        }

        DispatchOutcome::Accepted { channels: outcomes }
    }

    /// Operator entry point: drain one configured batch of dead-letter items
    /// back into the channel's live queues.
    pub async fn reprocess_dead_letters(
        &self,
        channel: NotificationChannel,
    ) -> Result<usize, StoreError> {
        self.store
            .reprocess_dead_letters(channel, self.settings.dlq.processing_batch_size)
            .await
    }
}
