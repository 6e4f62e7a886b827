//! HealthMonitor - per-channel health checks and circuit breaker
//!
//! Health is computed from queue-store statistics against the configured
//! thresholds. Each channel carries a circuit that opens after a run of
//! consecutive unhealthy checks; a healthy check while open schedules one
//! deferred close that re-evaluates health at fire time before flipping
//! state, so a circuit never closes onto a channel that degraded again
//! during the recovery window.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use nh_common::{
    HealthIssue, HealthMetric, HealthMetrics, HealthReport, IssueSeverity, Notification,
    NotificationChannel, Priority, QueueSettings, QueueStats,
};
use nh_queue::QueueStore;

#[derive(Debug)]
struct CircuitState {
    closed: bool,
    error_streak: u32,
    close_pending: bool,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            closed: true,
            error_streak: 0,
            close_pending: false,
        }
    }
}

pub struct HealthMonitor {
    store: Arc<dyn QueueStore<Notification>>,
    settings: Arc<QueueSettings>,
    circuits: DashMap<NotificationChannel, CircuitState>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn QueueStore<Notification>>, settings: Arc<QueueSettings>) -> Self {
        let circuits = DashMap::new();
        for channel in NotificationChannel::ALL {
            circuits.insert(channel, CircuitState::new());
        }
        Self {
            store,
            settings,
            circuits,
        }
    }

    /// Read contract for dispatch paths: deliveries to a channel whose
    /// circuit is open should be short-circuited, not attempted.
    pub fn is_circuit_closed(&self, channel: NotificationChannel) -> bool {
        self.circuits
            .get(&channel)
            .map(|c| c.closed)
            .unwrap_or(false)
    }

    /// Run one health check for a channel and update its circuit state.
    pub async fn check_health(self: &Arc<Self>, channel: NotificationChannel) -> HealthReport {
        let stats = match self.store.get_queue_stats(channel).await {
            Ok(stats) => stats,
            Err(e) => {
                // A store failure says nothing about delivery health; report
                // unhealthy but leave the circuit untouched.
                error!(channel = %channel, error = %e, "Health check failed to read stats");
                return HealthReport {
                    healthy: false,
                    metrics: HealthMetrics {
                        queue_sizes: HashMap::new(),
                        dlq_size: 0,
                        processing_items: 0,
                        error_rate: 0.0,
                        processing_rate: 0.0,
                    },
                    issues: vec![HealthIssue {
                        severity: IssueSeverity::Error,
                        message: format!("health check failed: {e}"),
                        priority: None,
                        metric: HealthMetric::System,
                        threshold: None,
                        observed: None,
                    }],
                };
            }
        };

        let report = self.evaluate(channel, &stats);
        self.publish_metrics(channel, &report);
        self.update_circuit(channel, !report.healthy);
        report
    }

    /// Pure issue computation from a stats snapshot.
    fn evaluate(&self, channel: NotificationChannel, stats: &QueueStats) -> HealthReport {
        let mut issues = Vec::new();
        let mut queue_sizes = HashMap::new();
        let mut total_attempts = 0.0;
        let mut total_errored = 0.0;

        for priority in Priority::ordered() {
            let Some(queue_stats) = stats.priority_queues.get(&priority) else {
                continue;
            };
            queue_sizes.insert(priority, queue_stats.size);
            total_attempts += queue_stats.processing_rate;
            total_errored += queue_stats.processing_rate * queue_stats.error_rate;

            let config = self.settings.priorities.get(priority);

            if queue_stats.size > config.max_size {
                issues.push(HealthIssue {
                    severity: IssueSeverity::Warning,
                    message: "queue size exceeded threshold".to_string(),
                    priority: Some(priority),
                    metric: HealthMetric::QueueSize,
                    threshold: Some(config.max_size as f64),
                    observed: Some(queue_stats.size as f64),
                });
            }

            if queue_stats.processing_rate == 0.0 && queue_stats.size > 0 {
                issues.push(HealthIssue {
                    severity: IssueSeverity::Error,
                    message: "queue processing stalled".to_string(),
                    priority: Some(priority),
                    metric: HealthMetric::ProcessingRate,
                    threshold: None,
                    observed: Some(queue_stats.size as f64),
                });
            }

            if queue_stats.error_rate > config.max_error_rate {
                issues.push(HealthIssue {
                    severity: IssueSeverity::Error,
                    message: "high error rate detected".to_string(),
                    priority: Some(priority),
                    metric: HealthMetric::ErrorRate,
                    threshold: Some(config.max_error_rate),
                    observed: Some(queue_stats.error_rate),
                });
            }
        }

        if stats.dlq.size > self.settings.dlq.max_size {
            issues.push(HealthIssue {
                severity: IssueSeverity::Error,
                message: "dead-letter store size exceeded threshold".to_string(),
                priority: None,
                metric: HealthMetric::DlqSize,
                threshold: Some(self.settings.dlq.max_size as f64),
                observed: Some(stats.dlq.size as f64),
            });
        }

        if stats.processing_items > self.settings.max_processing_items {
            issues.push(HealthIssue {
                severity: IssueSeverity::Warning,
                message: "too many items in processing state".to_string(),
                priority: None,
                metric: HealthMetric::ProcessingItems,
                threshold: Some(self.settings.max_processing_items as f64),
                observed: Some(stats.processing_items as f64),
            });
        }

        let healthy = !issues.iter().any(|i| i.severity == IssueSeverity::Error);
        let error_rate = if total_attempts > 0.0 {
            total_errored / total_attempts
        } else {
            0.0
        };

        HealthReport {
            healthy,
            metrics: HealthMetrics {
                queue_sizes,
                dlq_size: stats.dlq.size,
                processing_items: stats.processing_items,
                error_rate,
                processing_rate: total_attempts,
            },
            issues,
        }
    }

    fn publish_metrics(&self, channel: NotificationChannel, report: &HealthReport) {
        let warnings = report
            .issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .count();
        let errors = report.issues.len() - warnings;

        gauge!("queue_health_issues", "channel" => channel.as_str(), "severity" => "warning")
            .set(warnings as f64);
        gauge!("queue_health_issues", "channel" => channel.as_str(), "severity" => "error")
            .set(errors as f64);
        gauge!("queue_circuit_closed", "channel" => channel.as_str())
            .set(if self.is_circuit_closed(channel) { 1.0 } else { 0.0 });
    }

    fn update_circuit(self: &Arc<Self>, channel: NotificationChannel, has_errors: bool) {
        let mut schedule_close = false;

        {
            let Some(mut circuit) = self.circuits.get_mut(&channel) else {
                return;
            };

            if has_errors {
                circuit.error_streak += 1;
                if circuit.closed
                    && circuit.error_streak >= self.settings.health_check.circuit_breaker_threshold
                {
                    circuit.closed = false;
                    warn!(
                        channel = %channel,
                        streak = circuit.error_streak,
                        "Circuit breaker opened"
                    );
                    counter!("queue_circuit_transitions_total", "channel" => channel.as_str(), "state" => "open")
                        .increment(1);
                    gauge!("queue_circuit_closed", "channel" => channel.as_str()).set(0.0);
                }
            } else {
                circuit.error_streak = 0;
                if !circuit.closed && !circuit.close_pending {
                    circuit.close_pending = true;
                    schedule_close = true;
                }
            }
        }

        if schedule_close {
            let monitor = self.clone();
            let recovery = self.settings.health_check.circuit_breaker_recovery_time;
            tokio::spawn(async move {
                tokio::time::sleep(recovery).await;
                monitor.try_deferred_close(channel).await;
            });
        }
    }

    /// Fires after the recovery window. Health is re-evaluated here; the
    /// circuit closes only if the channel is still clean.
    async fn try_deferred_close(self: Arc<Self>, channel: NotificationChannel) {
        let still_healthy = match self.store.get_queue_stats(channel).await {
            Ok(stats) => self.evaluate(channel, &stats).healthy,
            Err(e) => {
                error!(channel = %channel, error = %e, "Deferred close health re-check failed");
                false
            }
        };

        let Some(mut circuit) = self.circuits.get_mut(&channel) else {
            return;
        };
        circuit.close_pending = false;

        if !circuit.closed && still_healthy {
            circuit.closed = true;
            info!(channel = %channel, "Circuit breaker closed");
            counter!("queue_circuit_transitions_total", "channel" => channel.as_str(), "state" => "closed")
                .increment(1);
            gauge!("queue_circuit_closed", "channel" => channel.as_str()).set(1.0);
        } else if !circuit.closed {
            debug!(
                channel = %channel,
                "Deferred circuit close aborted: channel unhealthy again"
            );
        }
    }
}
