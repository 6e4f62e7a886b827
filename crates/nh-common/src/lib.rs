use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Channels & Priorities
// ============================================================================

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    Webhook,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 4] = [
        NotificationChannel::Email,
        NotificationChannel::Sms,
        NotificationChannel::Push,
        NotificationChannel::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
            NotificationChannel::Push => "push",
            NotificationChannel::Webhook => "webhook",
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue priority. Dequeue scans priorities in the fixed precedence order
/// returned by [`Priority::ordered`]; within a priority level ordering is
/// FIFO by enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// All priorities, highest precedence first.
    pub const fn ordered() -> [Priority; 4] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Notification Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub channel: NotificationChannel,
    /// Email address, phone number, device token, or webhook URL.
    pub destination: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationContent {
    pub subject: Option<String>,
    pub body: String,
    pub template_id: Option<String>,
    pub template_data: Option<serde_json::Value>,
}

/// The notification payload that flows through the queues. The queue layer
/// treats it as opaque data; only the dispatch layer inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub channels: Vec<NotificationChannel>,
    pub recipients: Vec<Recipient>,
    pub content: NotificationContent,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(
        channels: Vec<NotificationChannel>,
        recipients: Vec<Recipient>,
        content: NotificationContent,
        priority: Priority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channels,
            recipients,
            content,
            priority,
            created_at: Utc::now(),
            scheduled_at: None,
            metadata: None,
        }
    }
}

/// Status of the backing notification record. The core writes `Queued`,
/// `Sending`, and the terminal states; `Pending` is set at creation by the
/// record owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Sending,
    Delivered,
    Failed,
}

// ============================================================================
// Queue Item Types
// ============================================================================

/// One failed-attempt record. The `errors` history on a queue item is
/// append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptError {
    pub message: String,
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An item in a priority queue. At any time an item lives in exactly one of:
/// a priority queue, the processing set, or the dead-letter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem<T> {
    pub id: String,
    pub data: T,
    pub priority: Priority,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When set, the item is not eligible for dequeue before this instant.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub errors: Vec<AttemptError>,
}

impl<T> QueueItem<T> {
    pub fn new(data: T, priority: Priority) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            data,
            priority,
            attempt_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>, code: Option<String>) {
        self.errors.push(AttemptError {
            message: message.into(),
            code,
            timestamp: Utc::now(),
        });
    }

    /// Age since enqueue, saturating at zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A queue item that exhausted its retries or expired. Entry into the
/// dead-letter store is terminal unless an operator reprocesses the item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterItem<T> {
    pub item: QueueItem<T>,
    pub original_queue: String,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub window_seconds: u64,
    pub max_requests: u32,
}

/// Per-(channel, priority) queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub max_size: usize,
    /// Errored fraction of attempts in the rolling window, 0.0..=1.0.
    pub max_error_rate: f64,
    pub max_attempts: u32,
    pub backoff_delay: Duration,
    pub max_backoff_delay: Duration,
    pub ttl: Duration,
    pub worker_concurrency: usize,
    pub rate_limit: RateLimitSettings,
}

/// One config per priority level, always fully populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityMatrix {
    pub critical: PriorityConfig,
    pub high: PriorityConfig,
    pub medium: PriorityConfig,
    pub low: PriorityConfig,
}

impl PriorityMatrix {
    pub fn get(&self, priority: Priority) -> &PriorityConfig {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }
}

impl Default for PriorityMatrix {
    fn default() -> Self {
        Self {
            critical: PriorityConfig {
                max_size: 1_000,
                max_error_rate: 0.10,
                max_attempts: 5,
                backoff_delay: Duration::from_secs(1),
                max_backoff_delay: Duration::from_secs(60),
                ttl: Duration::from_secs(60 * 60),
                worker_concurrency: 4,
                rate_limit: RateLimitSettings {
                    window_seconds: 60,
                    max_requests: 120,
                },
            },
            high: PriorityConfig {
                max_size: 2_000,
                max_error_rate: 0.15,
                max_attempts: 4,
                backoff_delay: Duration::from_secs(2),
                max_backoff_delay: Duration::from_secs(120),
                ttl: Duration::from_secs(2 * 60 * 60),
                worker_concurrency: 3,
                rate_limit: RateLimitSettings {
                    window_seconds: 60,
                    max_requests: 90,
                },
            },
            medium: PriorityConfig {
                max_size: 5_000,
                max_error_rate: 0.25,
                max_attempts: 3,
                backoff_delay: Duration::from_secs(5),
                max_backoff_delay: Duration::from_secs(300),
                ttl: Duration::from_secs(6 * 60 * 60),
                worker_concurrency: 2,
                rate_limit: RateLimitSettings {
                    window_seconds: 60,
                    max_requests: 60,
                },
            },
            low: PriorityConfig {
                max_size: 10_000,
                max_error_rate: 0.25,
                max_attempts: 3,
                backoff_delay: Duration::from_secs(10),
                max_backoff_delay: Duration::from_secs(600),
                ttl: Duration::from_secs(24 * 60 * 60),
                worker_concurrency: 1,
                rate_limit: RateLimitSettings {
                    window_seconds: 60,
                    max_requests: 30,
                },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Alerting threshold. The store never evicts past this size; the health
    /// monitor raises an ERROR issue instead.
    pub max_size: usize,
    pub processing_batch_size: usize,
    pub retry_after: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            processing_batch_size: 50,
            retry_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    pub cleanup_batch_size: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            cleanup_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    /// Consecutive unhealthy checks before the circuit opens.
    pub circuit_breaker_threshold: u32,
    /// Delay before an open circuit becomes eligible to close again.
    pub circuit_breaker_recovery_time: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            circuit_breaker_threshold: 5,
            circuit_breaker_recovery_time: Duration::from_secs(60),
        }
    }
}

/// Full configuration surface of the queueing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub priorities: PriorityMatrix,
    pub dlq: DlqConfig,
    pub maintenance: MaintenanceConfig,
    pub health_check: HealthCheckConfig,
    pub max_processing_items: usize,
    /// Bound on one delivery attempt; items checked out longer than this are
    /// considered stuck and reclaimed by maintenance.
    pub processing_timeout: Duration,
    /// Worker idle wait when a queue is empty.
    pub idle_poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            priorities: PriorityMatrix::default(),
            dlq: DlqConfig::default(),
            maintenance: MaintenanceConfig::default(),
            health_check: HealthCheckConfig::default(),
            max_processing_items: 500,
            processing_timeout: Duration::from_secs(30),
            idle_poll_interval: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Stats Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityQueueStats {
    pub size: usize,
    pub oldest_created_at: Option<DateTime<Utc>>,
    /// Completed attempts (success or failure) in the rolling window.
    pub processing_rate: f64,
    /// Errored fraction of attempts in the rolling window, 0.0..=1.0.
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub size: usize,
    pub oldest_failed_at: Option<DateTime<Utc>>,
    /// Dead-letter arrivals within the rolling window.
    pub recent_failures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub priority_queues: HashMap<Priority, PriorityQueueStats>,
    pub dlq: DlqStats,
    pub processing_items: usize,
}

// ============================================================================
// Health Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueSeverity {
    Warning,
    Error,
}

/// Metric that triggered a health issue. Drives the bounded recovery action
/// chosen by the maintenance scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthMetric {
    QueueSize,
    ProcessingRate,
    ErrorRate,
    DlqSize,
    ProcessingItems,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub severity: IssueSeverity,
    pub message: String,
    pub priority: Option<Priority>,
    pub metric: HealthMetric,
    pub threshold: Option<f64>,
    pub observed: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub queue_sizes: HashMap<Priority, usize>,
    pub dlq_size: usize,
    pub processing_items: usize,
    pub error_rate: f64,
    pub processing_rate: f64,
}

/// Result of one health check. `healthy` is true iff no ERROR-level issue
/// is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub metrics: HealthMetrics,
    pub issues: Vec<HealthIssue>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Infrastructure failure on the queue backing store. Always propagated to
/// the caller; a swallowed store error risks losing the item.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("queue store failure: {0}")]
    Backend(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(NotificationChannel),

    #[error("item {item_id} not found in {channel} processing set")]
    UnknownItem {
        channel: NotificationChannel,
        item_id: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of a single delivery attempt, as classified by a channel sender.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Retryable provider/transport failure. Consumes one retry attempt.
    #[error("transient delivery failure: {message}")]
    Transient {
        message: String,
        code: Option<String>,
    },

    /// Non-retryable payload problem. Fails the notification permanently
    /// without consuming the retry budget.
    #[error("validation failure: {message}")]
    Validation { message: String },

    /// Send did not complete within the processing timeout. Treated the same
    /// as a transient failure.
    #[error("delivery timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

impl DeliveryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            code: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Validation { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Transient { .. } => "TRANSIENT",
            DeliveryError::Validation { .. } => "VALIDATION",
            DeliveryError::Timeout { .. } => "TIMEOUT",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyHubError {
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("notification repository error: {0}")]
    Repository(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, NotifyHubError>;
