//! End-to-end tests for the dispatch engine: worker pools draining the
//! in-memory store, retry/dead-letter flows, circuit breaker transitions,
//! and the dispatcher admission path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use nh_common::{
    DeliveryError, Notification, NotificationChannel, NotificationContent, NotificationStatus,
    NotifyHubError, Priority, QueueItem, QueueSettings, Recipient,
};
use nh_dispatch::{
    ChannelOutcome, ChannelSender, DispatchOutcome, Dispatcher, HealthMonitor,
    MaintenanceScheduler, NotificationRepository, PoolState, WorkerPool, MAX_ATTEMPTS_REASON,
    VALIDATION_REASON,
};
use nh_queue::{MemoryQueueStore, QueueStore};
use nh_ratelimit::{NoBypass, RateLimitAlgorithm, RateLimiter};

const CHANNEL: NotificationChannel = NotificationChannel::Email;

/// Sender that fails a scripted number of initial attempts.
struct ScriptedSender {
    channel: NotificationChannel,
    failures: Vec<DeliveryErrorKind>,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

#[derive(Clone, Copy)]
enum DeliveryErrorKind {
    Transient,
    Validation,
    Hang,
}

impl ScriptedSender {
    fn new(channel: NotificationChannel, failures: Vec<DeliveryErrorKind>) -> Self {
        Self {
            channel,
            failures,
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.failures.get(attempt) {
            Some(DeliveryErrorKind::Transient) => Err(DeliveryError::transient("provider 503")),
            Some(DeliveryErrorKind::Validation) => {
                Err(DeliveryError::validation("missing destination"))
            }
            Some(DeliveryErrorKind::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
            None => {
                self.delivered.lock().push(notification.id.clone());
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct RecordingRepository {
    transitions: Mutex<Vec<(String, NotificationStatus, Option<String>)>>,
}

impl RecordingRepository {
    fn statuses(&self, notification_id: &str) -> Vec<NotificationStatus> {
        self.transitions
            .lock()
            .iter()
            .filter(|(id, _, _)| id == notification_id)
            .map(|(_, status, _)| *status)
            .collect()
    }

    fn last_error(&self, notification_id: &str) -> Option<String> {
        self.transitions
            .lock()
            .iter()
            .rev()
            .find(|(id, _, _)| id == notification_id)
            .and_then(|(_, _, error)| error.clone())
    }
}

#[async_trait]
impl NotificationRepository for RecordingRepository {
    async fn transition(
        &self,
        notification_id: &str,
        status: NotificationStatus,
        error: Option<String>,
    ) -> Result<(), NotifyHubError> {
        self.transitions
            .lock()
            .push((notification_id.to_string(), status, error));
        Ok(())
    }
}

fn fast_settings() -> QueueSettings {
    let mut settings = QueueSettings::default();
    for priority in Priority::ordered() {
        let config = match priority {
            Priority::Critical => &mut settings.priorities.critical,
            Priority::High => &mut settings.priorities.high,
            Priority::Medium => &mut settings.priorities.medium,
            Priority::Low => &mut settings.priorities.low,
        };
        config.backoff_delay = Duration::from_millis(10);
        config.max_backoff_delay = Duration::from_millis(40);
        config.worker_concurrency = 1;
    }
    settings.processing_timeout = Duration::from_millis(500);
    settings.idle_poll_interval = Duration::from_millis(20);
    settings
}

fn notification(channels: Vec<NotificationChannel>, priority: Priority) -> Notification {
    let recipients = channels
        .iter()
        .map(|channel| Recipient {
            id: "user-1".to_string(),
            channel: *channel,
            destination: "user@example.com".to_string(),
            metadata: None,
        })
        .collect();
    Notification::new(
        channels,
        recipients,
        NotificationContent {
            subject: Some("hello".to_string()),
            body: "body".to_string(),
            template_id: None,
            template_data: None,
        },
        priority,
    )
}

async fn enqueue(
    store: &MemoryQueueStore<Notification>,
    channel: NotificationChannel,
    priority: Priority,
) -> Notification {
    let n = notification(vec![channel], priority);
    let item = QueueItem::new(n.clone(), priority);
    let results = store.add_to_queue(&[channel], item).await;
    assert!(results[0].outcome.is_ok());
    n
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn wait_for_dlq_size(
    store: &Arc<MemoryQueueStore<Notification>>,
    expected: usize,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let size = store
            .get_queue_stats(CHANNEL)
            .await
            .map(|s| s.dlq.size)
            .unwrap_or(0);
        if size == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn worker_delivers_and_acks() {
    let settings = Arc::new(fast_settings());
    let store = Arc::new(MemoryQueueStore::new(settings.clone()));
    let sender = Arc::new(ScriptedSender::new(CHANNEL, vec![]));
    let repository = Arc::new(RecordingRepository::default());

    let n = enqueue(&store, CHANNEL, Priority::High).await;

    let pool = WorkerPool::new(
        CHANNEL,
        store.clone(),
        sender.clone(),
        repository.clone(),
        settings,
    );
    pool.start().await.unwrap();
    assert_eq!(pool.state(), PoolState::Running);

    assert!(wait_for(|| sender.delivered_count() == 1, Duration::from_secs(3)).await);
    pool.stop().await;
    assert_eq!(pool.state(), PoolState::Stopped);

    let stats = store.get_queue_stats(CHANNEL).await.unwrap();
    assert_eq!(stats.processing_items, 0);
    assert_eq!(stats.priority_queues[&Priority::High].size, 0);

    assert_eq!(
        repository.statuses(&n.id),
        vec![NotificationStatus::Sending, NotificationStatus::Delivered]
    );
}

#[tokio::test]
async fn failed_delivery_retries_then_succeeds() {
    let settings = Arc::new(fast_settings());
    let store = Arc::new(MemoryQueueStore::new(settings.clone()));
    let sender = Arc::new(ScriptedSender::new(
        CHANNEL,
        vec![DeliveryErrorKind::Transient],
    ));
    let repository = Arc::new(RecordingRepository::default());

    let n = enqueue(&store, CHANNEL, Priority::Medium).await;

    let pool = WorkerPool::new(
        CHANNEL,
        store.clone(),
        sender.clone(),
        repository.clone(),
        settings,
    );
    pool.start().await.unwrap();

    assert!(wait_for(|| sender.delivered_count() == 1, Duration::from_secs(3)).await);
    pool.stop().await;

    assert_eq!(sender.attempts(), 2);
    assert_eq!(
        repository.statuses(&n.id).last(),
        Some(&NotificationStatus::Delivered)
    );
}

#[tokio::test]
async fn exhausted_retries_reach_dead_letter_store() {
    let mut settings = fast_settings();
    settings.priorities.high.max_attempts = 2;
    let settings = Arc::new(settings);

    let store = Arc::new(MemoryQueueStore::new(settings.clone()));
    let sender = Arc::new(ScriptedSender::new(
        CHANNEL,
        vec![DeliveryErrorKind::Transient; 10],
    ));
    let repository = Arc::new(RecordingRepository::default());

    let n = enqueue(&store, CHANNEL, Priority::High).await;

    let pool = WorkerPool::new(
        CHANNEL,
        store.clone(),
        sender.clone(),
        repository.clone(),
        settings,
    );
    pool.start().await.unwrap();

    assert!(wait_for_dlq_size(&store, 1, Duration::from_secs(3)).await);
    pool.stop().await;

    // attempt_count advanced by exactly one per failed attempt, and the item
    // dead-lettered at max_attempts.
    assert_eq!(sender.attempts(), 2);

    let entries = store.dead_letters(CHANNEL, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, MAX_ATTEMPTS_REASON);
    assert_eq!(entries[0].item.attempt_count, 2);
    assert_eq!(entries[0].item.errors.len(), 2);

    let stats = store.get_queue_stats(CHANNEL).await.unwrap();
    assert_eq!(stats.priority_queues[&Priority::High].size, 0);
    assert_eq!(stats.processing_items, 0);

    assert_eq!(
        repository.statuses(&n.id).last(),
        Some(&NotificationStatus::Failed)
    );
    assert!(repository
        .last_error(&n.id)
        .unwrap()
        .contains(MAX_ATTEMPTS_REASON));
}

#[tokio::test]
async fn validation_failure_is_terminal_without_retries() {
    let settings = Arc::new(fast_settings());
    let store = Arc::new(MemoryQueueStore::new(settings.clone()));
    let sender = Arc::new(ScriptedSender::new(
        CHANNEL,
        vec![DeliveryErrorKind::Validation; 10],
    ));
    let repository = Arc::new(RecordingRepository::default());

    let n = enqueue(&store, CHANNEL, Priority::Medium).await;

    let pool = WorkerPool::new(
        CHANNEL,
        store.clone(),
        sender.clone(),
        repository.clone(),
        settings,
    );
    pool.start().await.unwrap();

    assert!(wait_for_dlq_size(&store, 1, Duration::from_secs(3)).await);
    pool.stop().await;

    // One attempt only: validation failures bypass the retry budget.
    assert_eq!(sender.attempts(), 1);

    let entries = store.dead_letters(CHANNEL, 10).await.unwrap();
    assert_eq!(entries[0].reason, VALIDATION_REASON);

    assert_eq!(
        repository.statuses(&n.id).last(),
        Some(&NotificationStatus::Failed)
    );
}

#[tokio::test]
async fn send_timeout_consumes_one_retry_attempt() {
    let mut settings = fast_settings();
    settings.processing_timeout = Duration::from_millis(100);
    let settings = Arc::new(settings);

    let store = Arc::new(MemoryQueueStore::new(settings.clone()));
    let sender = Arc::new(ScriptedSender::new(CHANNEL, vec![DeliveryErrorKind::Hang]));
    let repository = Arc::new(RecordingRepository::default());

    enqueue(&store, CHANNEL, Priority::Medium).await;

    let pool = WorkerPool::new(
        CHANNEL,
        store.clone(),
        sender.clone(),
        repository.clone(),
        settings,
    );
    pool.start().await.unwrap();

    assert!(wait_for(|| sender.delivered_count() == 1, Duration::from_secs(3)).await);
    pool.stop().await;

    assert_eq!(sender.attempts(), 2);
}

#[tokio::test]
async fn pool_start_fails_on_mismatched_sender() {
    let settings = Arc::new(fast_settings());
    let store: Arc<MemoryQueueStore<Notification>> =
        Arc::new(MemoryQueueStore::new(settings.clone()));
    let sender = Arc::new(ScriptedSender::new(NotificationChannel::Sms, vec![]));
    let repository = Arc::new(RecordingRepository::default());

    let pool = WorkerPool::new(CHANNEL, store, sender, repository, settings);
    assert!(pool.start().await.is_err());
    assert_eq!(pool.state(), PoolState::Failed);
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_closes_after_recovery() {
    let mut settings = fast_settings();
    settings.health_check.circuit_breaker_threshold = 3;
    settings.health_check.circuit_breaker_recovery_time = Duration::from_millis(150);
    let settings = Arc::new(settings);

    let store: Arc<MemoryQueueStore<Notification>> =
        Arc::new(MemoryQueueStore::new(settings.clone()));
    let monitor = Arc::new(HealthMonitor::new(store.clone(), settings));

    // A queued item with no processing activity reads as stalled.
    enqueue(&store, CHANNEL, Priority::Medium).await;

    for _ in 0..2 {
        let report = monitor.check_health(CHANNEL).await;
        assert!(!report.healthy);
        assert!(monitor.is_circuit_closed(CHANNEL));
    }

    monitor.check_health(CHANNEL).await;
    assert!(!monitor.is_circuit_closed(CHANNEL));

    // Drain the queue; the channel is healthy again.
    let item = store.get_from_queue(CHANNEL).await.unwrap().unwrap();
    store.ack(CHANNEL, &item.id).await.unwrap();

    let report = monitor.check_health(CHANNEL).await;
    assert!(report.healthy);
    // Close is deferred, not immediate.
    assert!(!monitor.is_circuit_closed(CHANNEL));

    assert!(
        wait_for(
            || monitor.is_circuit_closed(CHANNEL),
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test]
async fn deferred_close_revalidates_health_at_fire_time() {
    let mut settings = fast_settings();
    settings.health_check.circuit_breaker_threshold = 1;
    settings.health_check.circuit_breaker_recovery_time = Duration::from_millis(150);
    for priority in Priority::ordered() {
        let config = match priority {
            Priority::Critical => &mut settings.priorities.critical,
            Priority::High => &mut settings.priorities.high,
            Priority::Medium => &mut settings.priorities.medium,
            Priority::Low => &mut settings.priorities.low,
        };
        config.max_error_rate = 0.4;
    }
    let settings = Arc::new(settings);

    let store: Arc<MemoryQueueStore<Notification>> =
        Arc::new(MemoryQueueStore::new(settings.clone()));
    let monitor = Arc::new(HealthMonitor::new(store.clone(), settings));

    // Open the circuit via a stalled queue.
    enqueue(&store, CHANNEL, Priority::Medium).await;
    monitor.check_health(CHANNEL).await;
    assert!(!monitor.is_circuit_closed(CHANNEL));

    // Recover, scheduling a deferred close.
    let item = store.get_from_queue(CHANNEL).await.unwrap().unwrap();
    store.ack(CHANNEL, &item.id).await.unwrap();
    let report = monitor.check_health(CHANNEL).await;
    assert!(report.healthy);

    // Degrade again before the recovery timer fires: one success and one
    // error put the rolling error rate at 0.5, over the 0.4 threshold.
    enqueue(&store, CHANNEL, Priority::Medium).await;
    let mut failing = store.get_from_queue(CHANNEL).await.unwrap().unwrap();
    failing.attempt_count += 1;
    store.requeue_for_retry(CHANNEL, failing).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        !monitor.is_circuit_closed(CHANNEL),
        "circuit must not close onto a channel that degraded during recovery"
    );
}

#[tokio::test]
async fn maintenance_scheduler_expires_and_reclaims() {
    let mut settings = fast_settings();
    settings.priorities.medium.ttl = Duration::from_millis(50);
    settings.priorities.critical.ttl = Duration::from_secs(10);
    settings.processing_timeout = Duration::from_millis(80);
    settings.maintenance.interval = Duration::from_millis(100);
    settings.health_check.interval = Duration::from_secs(30);
    let settings = Arc::new(settings);

    let store: Arc<MemoryQueueStore<Notification>> =
        Arc::new(MemoryQueueStore::new(settings.clone()));
    let monitor = Arc::new(HealthMonitor::new(store.clone(), settings.clone()));

    // One item that will expire, one that will get stuck in processing.
    let expiring = enqueue(&store, CHANNEL, Priority::Medium).await;
    let stuck = enqueue(&store, CHANNEL, Priority::Critical).await;
    let checked_out = store.get_from_queue(CHANNEL).await.unwrap().unwrap();
    assert_eq!(checked_out.data.id, stuck.id);

    let scheduler = MaintenanceScheduler::start(
        store.clone(),
        monitor,
        settings,
        vec![CHANNEL],
    );

    assert!(wait_for_dlq_size(&store, 1, Duration::from_secs(3)).await);
    let entries = store.dead_letters(CHANNEL, 10).await.unwrap();
    assert_eq!(entries[0].reason, "TTL exceeded");
    assert_eq!(entries[0].item.data.id, expiring.id);

    // The stuck checkout is reclaimed into its priority queue.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let stats = store.get_queue_stats(CHANNEL).await.unwrap();
        if stats.processing_items == 0
            && stats.priority_queues[&Priority::Critical].size == 1
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stuck item was not reclaimed in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    scheduler.shutdown();
}

#[tokio::test]
async fn dispatcher_rate_limits_and_fans_out() {
    let mut settings = fast_settings();
    settings.priorities.critical.rate_limit.max_requests = 2;
    settings.priorities.critical.rate_limit.window_seconds = 60;
    let settings = Arc::new(settings);

    let store: Arc<MemoryQueueStore<Notification>> =
        Arc::new(MemoryQueueStore::new(settings.clone()));
    let monitor = Arc::new(HealthMonitor::new(store.clone(), settings.clone()));
    let limiter = Arc::new(RateLimiter::new(Arc::new(NoBypass)));
    let repository = Arc::new(RecordingRepository::default());

    let dispatcher = Dispatcher::new(
        store.clone(),
        repository.clone(),
        monitor,
        limiter,
        settings,
    )
    .with_algorithm(RateLimitAlgorithm::FixedWindow);

    let channels = vec![NotificationChannel::Email, NotificationChannel::Sms];

    for _ in 0..2 {
        let n = notification(channels.clone(), Priority::Critical);
        let id = n.id.clone();
        match dispatcher.dispatch("caller-1", n).await {
            DispatchOutcome::Accepted { channels } => {
                assert_eq!(channels.len(), 2);
                assert!(channels
                    .iter()
                    .all(|(_, outcome)| matches!(outcome, ChannelOutcome::Queued(_))));
            }
            DispatchOutcome::RateLimited(info) => {
                panic!("unexpected rate limit: {:?}", info)
            }
        }
        assert_eq!(repository.statuses(&id), vec![NotificationStatus::Queued]);
    }

    let third = dispatcher
        .dispatch("caller-1", notification(channels, Priority::Critical))
        .await;
    assert!(matches!(third, DispatchOutcome::RateLimited(info) if info.remaining < 0));

    let email_stats = store.get_queue_stats(NotificationChannel::Email).await.unwrap();
    let sms_stats = store.get_queue_stats(NotificationChannel::Sms).await.unwrap();
    assert_eq!(email_stats.priority_queues[&Priority::Critical].size, 2);
    assert_eq!(sms_stats.priority_queues[&Priority::Critical].size, 2);
}

#[tokio::test]
async fn dispatcher_reprocesses_dead_letters_in_batches() {
    let mut settings = fast_settings();
    settings.dlq.processing_batch_size = 1;
    let settings = Arc::new(settings);

    let store: Arc<MemoryQueueStore<Notification>> =
        Arc::new(MemoryQueueStore::new(settings.clone()));
    let monitor = Arc::new(HealthMonitor::new(store.clone(), settings.clone()));
    let limiter = Arc::new(RateLimiter::new(Arc::new(NoBypass)));
    let repository = Arc::new(RecordingRepository::default());

    for _ in 0..2 {
        enqueue(&store, CHANNEL, Priority::Medium).await;
        let item = store.get_from_queue(CHANNEL).await.unwrap().unwrap();
        store
            .move_to_dead_letter(CHANNEL, item, MAX_ATTEMPTS_REASON)
            .await
            .unwrap();
    }

    let dispatcher = Dispatcher::new(store.clone(), repository, monitor, limiter, settings);

    // One configured batch per call.
    assert_eq!(dispatcher.reprocess_dead_letters(CHANNEL).await.unwrap(), 1);
    let stats = store.get_queue_stats(CHANNEL).await.unwrap();
    assert_eq!(stats.dlq.size, 1);
    assert_eq!(stats.priority_queues[&Priority::Medium].size, 1);

    assert_eq!(dispatcher.reprocess_dead_letters(CHANNEL).await.unwrap(), 1);
    assert_eq!(dispatcher.reprocess_dead_letters(CHANNEL).await.unwrap(), 0);
}

#[tokio::test]
async fn dispatcher_short_circuits_open_channels() {
    let mut settings = fast_settings();
    settings.health_check.circuit_breaker_threshold = 1;
    let settings = Arc::new(settings);

    let store: Arc<MemoryQueueStore<Notification>> =
        Arc::new(MemoryQueueStore::new(settings.clone()));
    let monitor = Arc::new(HealthMonitor::new(store.clone(), settings.clone()));
    let limiter = Arc::new(RateLimiter::new(Arc::new(NoBypass)));
    let repository = Arc::new(RecordingRepository::default());

    // Open the email circuit.
    enqueue(&store, CHANNEL, Priority::Low).await;
    monitor.check_health(CHANNEL).await;
    assert!(!monitor.is_circuit_closed(CHANNEL));
    assert!(monitor.is_circuit_closed(NotificationChannel::Sms));

    let dispatcher = Dispatcher::new(
        store.clone(),
        repository,
        monitor,
        limiter,
        settings,
    );

    let outcome = dispatcher
        .dispatch(
            "caller-1",
            notification(
                vec![NotificationChannel::Email, NotificationChannel::Sms],
                Priority::Medium,
            ),
        )
        .await;

    let DispatchOutcome::Accepted { channels } = outcome else {
        panic!("expected accepted outcome");
    };
    let email = channels
        .iter()
        .find(|(c, _)| *c == NotificationChannel::Email)
        .unwrap();
    let sms = channels
        .iter()
        .find(|(c, _)| *c == NotificationChannel::Sms)
        .unwrap();
    assert!(matches!(email.1, ChannelOutcome::CircuitOpen));
    assert!(matches!(sms.1, ChannelOutcome::Queued(_)));
}
