//! WorkerPool - per-channel worker loops with retry and dead-lettering
//!
//! One pool per channel. `start()` spawns `worker_concurrency[priority]`
//! independent loops per priority; every loop drains the channel's queue
//! store (which serves strict priority order), invokes the injected channel
//! sender under a bounded timeout, and applies the retry policy on failure.
//! The only synchronization point between loops is the store's atomic
//! dequeue, so the loops need no locks of their own.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashSet;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use nh_common::{
    DeliveryError, Notification, NotificationChannel, NotificationStatus, NotifyHubError,
    QueueItem, QueueSettings, Result, StoreError,
};
use nh_queue::QueueStore;

use crate::repository::NotificationRepository;
use crate::retry::{RetryDecision, RetryPolicy, MAX_ATTEMPTS_REASON, VALIDATION_REASON};
use crate::sender::ChannelSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Everything a worker loop needs, cloned per spawned task.
#[derive(Clone)]
struct WorkerContext {
    channel: NotificationChannel,
    store: Arc<dyn QueueStore<Notification>>,
    sender: Arc<dyn ChannelSender>,
    repository: Arc<dyn NotificationRepository>,
    settings: Arc<QueueSettings>,
    running: Arc<AtomicBool>,
    in_flight: Arc<DashSet<String>>,
    active_workers: Arc<AtomicU32>,
}

pub struct WorkerPool {
    channel: NotificationChannel,
    store: Arc<dyn QueueStore<Notification>>,
    sender: Arc<dyn ChannelSender>,
    repository: Arc<dyn NotificationRepository>,
    settings: Arc<QueueSettings>,
    state: Mutex<PoolState>,
    running: Arc<AtomicBool>,
    in_flight: Arc<DashSet<String>>,
    active_workers: Arc<AtomicU32>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        channel: NotificationChannel,
        store: Arc<dyn QueueStore<Notification>>,
        sender: Arc<dyn ChannelSender>,
        repository: Arc<dyn NotificationRepository>,
        settings: Arc<QueueSettings>,
    ) -> Self {
        Self {
            channel,
            store,
            sender,
            repository,
            settings,
            state: Mutex::new(PoolState::Stopped),
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(DashSet::new()),
            active_workers: Arc::new(AtomicU32::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn channel(&self) -> NotificationChannel {
        self.channel
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Spawn the worker loops. A startup failure marks the pool `Failed`
    /// and is not retried automatically.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == PoolState::Running || *state == PoolState::Starting {
                warn!(channel = %self.channel, "Worker pool already running");
                return Ok(());
            }
            *state = PoolState::Starting;
        }

        let start = Instant::now();

        if let Err(e) = self.validate() {
            *self.state.lock() = PoolState::Failed;
            error!(channel = %self.channel, error = %e, "Worker pool startup failed");
            return Err(e);
        }

        self.running.store(true, Ordering::SeqCst);

        let mut spawned = 0;
        let mut handles = self.handles.lock();
        for priority in nh_common::Priority::ordered() {
            let concurrency = self.settings.priorities.get(priority).worker_concurrency;
            for index in 0..concurrency {
                let ctx = WorkerContext {
                    channel: self.channel,
                    store: self.store.clone(),
                    sender: self.sender.clone(),
                    repository: self.repository.clone(),
                    settings: self.settings.clone(),
                    running: self.running.clone(),
                    in_flight: self.in_flight.clone(),
                    active_workers: self.active_workers.clone(),
                };
                handles.push(tokio::spawn(async move {
                    debug!(
                        channel = %ctx.channel,
                        priority = %priority,
                        worker = index,
                        "Worker loop started"
                    );
                    Self::run_worker(ctx).await;
                }));
                spawned += 1;
            }
        }
        drop(handles);

        *self.state.lock() = PoolState::Running;
        gauge!("worker_pool_active", "channel" => self.channel.as_str()).set(spawned as f64);
        histogram!("worker_pool_initialization_seconds", "channel" => self.channel.as_str())
            .record(start.elapsed().as_secs_f64());
        info!(channel = %self.channel, workers = spawned, "Worker pool started");
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sender.channel() != self.channel {
            return Err(NotifyHubError::Pool(format!(
                "sender for {} injected into {} pool",
                self.sender.channel(),
                self.channel
            )));
        }

        let total: usize = nh_common::Priority::ordered()
            .iter()
            .map(|p| self.settings.priorities.get(*p).worker_concurrency)
            .sum();
        if total == 0 {
            return Err(NotifyHubError::Pool(
                "worker concurrency is zero for every priority".to_string(),
            ));
        }
        Ok(())
    }

    /// Cooperative stop: prevents new dequeues, then waits for loops to
    /// finish their in-flight work. Never aborts an in-flight send; a send
    /// that never returns is recovered later by `requeue_stuck_items`.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != PoolState::Running {
                return;
            }
            *state = PoolState::Stopping;
        }

        info!(channel = %self.channel, "Worker pool stopping");
        self.running.store(false, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }

        self.in_flight.clear();
        gauge!("worker_pool_active", "channel" => self.channel.as_str()).set(0.0);
        *self.state.lock() = PoolState::Stopped;
        info!(channel = %self.channel, "Worker pool stopped");
    }

    async fn run_worker(ctx: WorkerContext) {
        while ctx.running.load(Ordering::SeqCst) {
            match ctx.store.get_from_queue(ctx.channel).await {
                Ok(Some(item)) => {
                    let item_id = item.id.clone();

                    // A stuck item reclaimed by maintenance can be handed to
                    // a second loop while the first still holds it.
                    if !ctx.in_flight.insert(item_id.clone()) {
                        warn!(
                            channel = %ctx.channel,
                            item_id = %item_id,
                            "Duplicate item already in flight, skipping"
                        );
                        continue;
                    }

                    ctx.active_workers.fetch_add(1, Ordering::SeqCst);
                    Self::process_item(&ctx, item).await;
                    ctx.active_workers.fetch_sub(1, Ordering::SeqCst);
                    ctx.in_flight.remove(&item_id);
                }
                Ok(None) => {
                    tokio::time::sleep(ctx.settings.idle_poll_interval).await;
                }
                Err(e) => {
                    error!(channel = %ctx.channel, error = %e, "Dequeue failed");
                    counter!(
                        "notification_worker_errors_total",
                        "channel" => ctx.channel.as_str(),
                        "kind" => "store"
                    )
                    .increment(1);
                    tokio::time::sleep(ctx.settings.idle_poll_interval).await;
                }
            }
        }
    }

    async fn process_item(ctx: &WorkerContext, item: QueueItem<Notification>) {
        let notification_id = item.data.id.clone();
        let priority = item.priority;

        if let Err(e) = ctx
            .repository
            .transition(&notification_id, NotificationStatus::Sending, None)
            .await
        {
            error!(
                channel = %ctx.channel,
                notification_id = %notification_id,
                error = %e,
                "Failed to mark notification as sending"
            );
        }

        let start = Instant::now();
        let outcome = match tokio::time::timeout(
            ctx.settings.processing_timeout,
            ctx.sender.send(&item.data),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout {
                elapsed: ctx.settings.processing_timeout,
            }),
        };

        histogram!(
            "notification_processing_duration_seconds",
            "channel" => ctx.channel.as_str(),
            "priority" => priority.as_str(),
            "success" => if outcome.is_ok() { "true" } else { "false" }
        )
        .record(start.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => {
                match ctx.store.ack(ctx.channel, &item.id).await {
                    Ok(()) => {}
                    Err(StoreError::UnknownItem { .. }) => {
                        // Reclaimed as stuck mid-send; the queued copy will be
                        // delivered again (at-least-once).
                        warn!(
                            channel = %ctx.channel,
                            item_id = %item.id,
                            "Delivered item was already reclaimed from the processing set"
                        );
                    }
                    Err(e) => {
                        error!(channel = %ctx.channel, item_id = %item.id, error = %e, "Ack failed");
                        counter!(
                            "notification_worker_errors_total",
                            "channel" => ctx.channel.as_str(),
                            "kind" => "store"
                        )
                        .increment(1);
                    }
                }

                if let Err(e) = ctx
                    .repository
                    .transition(&notification_id, NotificationStatus::Delivered, None)
                    .await
                {
                    error!(
                        channel = %ctx.channel,
                        notification_id = %notification_id,
                        error = %e,
                        "Failed to mark notification as delivered"
                    );
                }

                counter!(
                    "notifications_processed_total",
                    "channel" => ctx.channel.as_str(),
                    "priority" => priority.as_str(),
                    "status" => "success"
                )
                .increment(1);
                debug!(
                    channel = %ctx.channel,
                    notification_id = %notification_id,
                    "Notification delivered"
                );
            }
            Err(err) => Self::handle_failure(ctx, item, err).await,
        }
    }

    async fn handle_failure(
        ctx: &WorkerContext,
        mut item: QueueItem<Notification>,
        err: DeliveryError,
    ) {
        let notification_id = item.data.id.clone();
        let priority = item.priority;
        let config = ctx.settings.priorities.get(priority);

        counter!(
            "notification_worker_errors_total",
            "channel" => ctx.channel.as_str(),
            "kind" => err.code()
        )
        .increment(1);

        // Validation failures are permanent and do not consume the retry
        // budget.
        if !err.is_retryable() {
            item.record_error(err.to_string(), Some(err.code().to_string()));
            if let Err(e) = ctx
                .store
                .move_to_dead_letter(ctx.channel, item, VALIDATION_REASON)
                .await
            {
                error!(channel = %ctx.channel, error = %e, "Dead-letter move failed");
            }
            Self::mark_failed(ctx, &notification_id, &err.to_string()).await;
            counter!(
                "notifications_processed_total",
                "channel" => ctx.channel.as_str(),
                "priority" => priority.as_str(),
                "status" => "validation_failed"
            )
            .increment(1);
            return;
        }

        item.attempt_count += 1;
        let code = match &err {
            DeliveryError::Transient { code: Some(code), .. } => code.clone(),
            other => other.code().to_string(),
        };
        item.record_error(err.to_string(), Some(code));

        match RetryPolicy::decide(item.attempt_count, config) {
            RetryDecision::DeadLetter => {
                warn!(
                    channel = %ctx.channel,
                    notification_id = %notification_id,
                    attempts = item.attempt_count,
                    "Retry budget exhausted, dead-lettering"
                );
                if let Err(e) = ctx
                    .store
                    .move_to_dead_letter(ctx.channel, item, MAX_ATTEMPTS_REASON)
                    .await
                {
                    error!(channel = %ctx.channel, error = %e, "Dead-letter move failed");
                }
                Self::mark_failed(
                    ctx,
                    &notification_id,
                    &format!("{}: {}", MAX_ATTEMPTS_REASON, err),
                )
                .await;
                counter!(
                    "notifications_processed_total",
                    "channel" => ctx.channel.as_str(),
                    "priority" => priority.as_str(),
                    "status" => "moved_to_dlq"
                )
                .increment(1);
            }
            RetryDecision::Retry { delay } => {
                item.next_attempt_at =
                    Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
                debug!(
                    channel = %ctx.channel,
                    notification_id = %notification_id,
                    attempt = item.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling retry"
                );
                if let Err(e) = ctx.store.requeue_for_retry(ctx.channel, item).await {
                    error!(channel = %ctx.channel, error = %e, "Retry requeue failed");
                }
                counter!(
                    "notifications_processed_total",
                    "channel" => ctx.channel.as_str(),
                    "priority" => priority.as_str(),
                    "status" => "retrying"
                )
                .increment(1);
            }
        }
    }

    async fn mark_failed(ctx: &WorkerContext, notification_id: &str, message: &str) {
        if let Err(e) = ctx
            .repository
            .transition(
                notification_id,
                NotificationStatus::Failed,
                Some(message.to_string()),
            )
            .await
        {
            error!(
                channel = %ctx.channel,
                notification_id = %notification_id,
                error = %e,
                "Failed to mark notification as failed"
            );
        }
    }
}
