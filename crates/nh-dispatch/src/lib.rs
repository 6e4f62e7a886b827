//! NotifyHub dispatch engine
//!
//! This crate provides the worker-concurrency core on top of `nh-queue`:
//! - WorkerPool: per-channel worker loops draining the queue store
//! - RetryPolicy: backoff schedule and dead-letter decision
//! - HealthMonitor: per-channel health checks and circuit breaker
//! - MaintenanceScheduler: periodic cleanup/requeue and health cycles
//! - Dispatcher: producer-facing admission (rate limit, circuit, enqueue)
//! - ChannelSender / NotificationRepository: injected collaborator traits

pub mod dispatcher;
pub mod health;
pub mod maintenance;
pub mod pool;
pub mod repository;
pub mod retry;
pub mod sender;

pub use dispatcher::{ChannelOutcome, DispatchOutcome, Dispatcher};
pub use health::HealthMonitor;
pub use maintenance::MaintenanceScheduler;
pub use pool::{PoolState, WorkerPool};
pub use repository::NotificationRepository;
pub use retry::{RetryDecision, RetryPolicy, MAX_ATTEMPTS_REASON, VALIDATION_REASON};
pub use sender::ChannelSender;

pub use nh_common::Result;
