//! MaintenanceScheduler - periodic queue upkeep
//!
//! Two independent cycles per scheduler:
//! - Maintenance: expire items past their TTL, then reclaim stuck
//!   processing-set entries, per channel
//! - Health: run the channel health check and apply bounded recovery
//!   actions per issue metric
//!
//! Both cycles continue past per-channel failures; one channel's error
//! never halts the scheduler or the other channels. Recovery actions are
//! idempotent, so re-running them against a healthy channel is a no-op.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use nh_common::{HealthMetric, IssueSeverity, Notification, NotificationChannel, QueueSettings};
use nh_queue::QueueStore;

use crate::health::HealthMonitor;

pub struct MaintenanceScheduler {
    shutdown_tx: broadcast::Sender<()>,
}

impl MaintenanceScheduler {
    /// Start both cycles for the given channels.
    pub fn start(
        store: Arc<dyn QueueStore<Notification>>,
        monitor: Arc<HealthMonitor>,
        settings: Arc<QueueSettings>,
        channels: Vec<NotificationChannel>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Maintenance cycle
        {
            let store = store.clone();
            let channels = channels.clone();
            let interval = settings.maintenance.interval;
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            Self::run_maintenance(&store, &channels).await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Maintenance cycle shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Health-check cycle
        {
            let store = store.clone();
            let monitor = monitor.clone();
            let channels = channels.clone();
            let interval = settings.health_check.interval;
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            Self::run_health_checks(&store, &monitor, &channels).await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Health-check cycle shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!(channels = channels.len(), "Maintenance scheduler started");
        Self { shutdown_tx }
    }

    pub fn shutdown(&self) {
        info!("Maintenance scheduler shutting down");
        let _ = self.shutdown_tx.send(());
    }

    async fn run_maintenance(
        store: &Arc<dyn QueueStore<Notification>>,
        channels: &[NotificationChannel],
    ) {
        debug!("Starting maintenance cycle");

        for channel in channels {
            counter!("queue_maintenance_runs_total", "channel" => channel.as_str(), "operation" => "cleanup")
                .increment(1);
            let cleanup_start = Instant::now();
            match store.cleanup_expired_items(*channel).await {
                Ok(count) if count > 0 => {
                    info!(channel = %channel, count, "Cleaned expired items");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(channel = %channel, error = %e, "Cleanup of expired items failed");
                }
            }
            histogram!("queue_maintenance_duration_seconds", "channel" => channel.as_str(), "operation" => "cleanup")
                .record(cleanup_start.elapsed().as_secs_f64());

            counter!("queue_maintenance_runs_total", "channel" => channel.as_str(), "operation" => "requeue")
                .increment(1);
            let requeue_start = Instant::now();
            match store.requeue_stuck_items(*channel).await {
                Ok(count) if count > 0 => {
                    info!(channel = %channel, count, "Requeued stuck items");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(channel = %channel, error = %e, "Requeue of stuck items failed");
                }
            }
            histogram!("queue_maintenance_duration_seconds", "channel" => channel.as_str(), "operation" => "requeue")
                .record(requeue_start.elapsed().as_secs_f64());
        }
    }

    async fn run_health_checks(
        store: &Arc<dyn QueueStore<Notification>>,
        monitor: &Arc<HealthMonitor>,
        channels: &[NotificationChannel],
    ) {
        debug!("Starting health-check cycle");

        for channel in channels {
            let report = monitor.check_health(*channel).await;
            if report.healthy {
                continue;
            }

            warn!(
                channel = %channel,
                issues = report.issues.len(),
                "Queue health issues detected"
            );

            for issue in report
                .issues
                .iter()
                .filter(|i| i.severity == IssueSeverity::Error)
            {
                match issue.metric {
                    HealthMetric::ProcessingRate => {
                        // Stalled processing usually means stuck checkouts.
                        match store.requeue_stuck_items(*channel).await {
                            Ok(count) => {
                                counter!("queue_recovery_actions_total", "channel" => channel.as_str(), "action" => "requeue_stalled")
                                    .increment(1);
                                if count > 0 {
                                    info!(channel = %channel, count, "Recovered stalled items");
                                }
                            }
                            Err(e) => {
                                error!(channel = %channel, error = %e, "Stalled-queue recovery failed");
                            }
                        }
                    }
                    HealthMetric::DlqSize => {
                        // Flag for operator batch reprocessing; never drain
                        // automatically.
                        counter!("queue_recovery_actions_total", "channel" => channel.as_str(), "action" => "flag_dlq_reprocessing")
                            .increment(1);
                        info!(
                            channel = %channel,
                            observed = ?issue.observed,
                            "Dead-letter store over threshold, flagged for reprocessing"
                        );
                    }
                    HealthMetric::ErrorRate => {
                        counter!("queue_recovery_actions_total", "channel" => channel.as_str(), "action" => "error_rate_alert")
                            .increment(1);
                        warn!(
                            channel = %channel,
                            error_rate = ?issue.observed,
                            "High error rate detected"
                        );
                    }
                    _ => {
                        warn!(channel = %channel, metric = ?issue.metric, "Unhandled health issue");
                    }
                }
            }
        }
    }
}
