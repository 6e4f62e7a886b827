//! NotifyHub Dispatcher
//!
//! Runs the queueing engine end to end: an in-memory queue store, one worker
//! pool per notification channel, the maintenance scheduler, and a
//! Prometheus metrics endpoint. Channel senders here are development
//! placeholders that log instead of calling a provider; production
//! deployments inject real transports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nh_common::{
    DeliveryError, Notification, NotificationChannel, NotificationStatus, NotifyHubError,
    QueueSettings,
};
use nh_dispatch::{
    ChannelSender, HealthMonitor, MaintenanceScheduler, NotificationRepository, WorkerPool,
};
use nh_queue::MemoryQueueStore;
use nh_ratelimit::{NoBypass, RateLimiter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting NotifyHub Dispatcher");

    // 1. Metrics exporter
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9090);
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
    {
        error!(error = %e, "Failed to install Prometheus exporter, continuing without metrics");
    } else {
        info!(port = metrics_port, "Prometheus metrics endpoint ready");
    }

    // 2. Settings
    let settings = Arc::new(load_settings());

    // 3. Core components
    let store = Arc::new(MemoryQueueStore::<Notification>::new(settings.clone()));
    let monitor = Arc::new(HealthMonitor::new(store.clone(), settings.clone()));
    let repository = Arc::new(TracingRepository);

    let limiter = Arc::new(RateLimiter::new(Arc::new(NoBypass)));
    let sweep_interval = Duration::from_secs(
        std::env::var("RATE_LIMIT_SWEEP_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600),
    );
    let sweep_handle = limiter.spawn_cleanup(sweep_interval);

    // 4. Worker pools, one per channel
    let mut pools = Vec::new();
    for channel in NotificationChannel::ALL {
        let sender = Arc::new(LoggingSender { channel });
        let pool = Arc::new(WorkerPool::new(
            channel,
            store.clone(),
            sender,
            repository.clone(),
            settings.clone(),
        ));
        if let Err(e) = pool.start().await {
            error!(channel = %channel, error = %e, "Worker pool failed to start");
            continue;
        }
        pools.push(pool);
    }

    // 5. Maintenance scheduler
    let scheduler = MaintenanceScheduler::start(
        store.clone(),
        monitor.clone(),
        settings.clone(),
        NotificationChannel::ALL.to_vec(),
    );

    info!(pools = pools.len(), "NotifyHub Dispatcher started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    scheduler.shutdown();
    for pool in &pools {
        pool.stop().await;
    }
    sweep_handle.abort();

    info!("NotifyHub Dispatcher shutdown complete");
    Ok(())
}

/// Load queue settings, with a few env overrides on top of the defaults.
fn load_settings() -> QueueSettings {
    let mut settings = QueueSettings::default();

    if let Some(secs) = env_u64("MAINTENANCE_INTERVAL") {
        settings.maintenance.interval = Duration::from_secs(secs);
    }
    if let Some(secs) = env_u64("HEALTH_CHECK_INTERVAL") {
        settings.health_check.interval = Duration::from_secs(secs);
    }
    if let Some(secs) = env_u64("PROCESSING_TIMEOUT") {
        settings.processing_timeout = Duration::from_secs(secs);
    }
    if let Some(threshold) = env_u64("CIRCUIT_BREAKER_THRESHOLD") {
        settings.health_check.circuit_breaker_threshold = threshold as u32;
    }
    if let Some(secs) = env_u64("CIRCUIT_BREAKER_RECOVERY_TIME") {
        settings.health_check.circuit_breaker_recovery_time = Duration::from_secs(secs);
    }

    settings
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Development sender: logs the delivery instead of calling a provider.
struct LoggingSender {
    channel: NotificationChannel,
}

#[async_trait]
impl ChannelSender for LoggingSender {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        info!(
            channel = %self.channel,
            notification_id = %notification.id,
            recipients = notification.recipients.len(),
            "Delivering notification (dev sender)"
        );
        Ok(())
    }
}

/// Development repository: logs status transitions instead of persisting.
struct TracingRepository;

#[async_trait]
impl NotificationRepository for TracingRepository {
    async fn transition(
        &self,
        notification_id: &str,
        status: NotificationStatus,
        error: Option<String>,
    ) -> Result<(), NotifyHubError> {
        info!(
            notification_id = %notification_id,
            status = ?status,
            error = ?error,
            "Notification status transition"
        );
        Ok(())
    }
}
