//! # Sync Scheduler
//!
//! Background task driving two periodic sweeps over connections: a data sync that
//! refreshes the widget cache for every enabled widget, and a health check that probes
//! each connection and raises a one-time critical notification for long error runs.
//! Work within a sweep is sequential and never aborts the loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::connection_service::ConnectionService;
use crate::error::IntegrationError;
use crate::events::{EventBus, IntegrationEvent};
use crate::models::SyncStatus;
use crate::models::connection;

/// Background scheduler service.
#[derive(Clone)]
pub struct SyncScheduler {
    config: Arc<AppConfig>,
    service: ConnectionService,
    events: EventBus,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub connections_polled: u64,
    pub synced: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthStats {
    pub checked: u64,
    pub healthy: u64,
    pub unhealthy: u64,
    pub critical_notified: u64,
}

impl SyncScheduler {
    pub fn new(config: Arc<AppConfig>, service: ConnectionService, events: EventBus) -> Self {
        Self {
            config,
            service,
            events,
        }
    }

    /// Run until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            sync_interval_seconds = self.config.scheduler.sync_interval_seconds,
            health_interval_seconds = self.config.scheduler.health_interval_seconds,
            "Starting sync scheduler"
        );
        let mut sync_tick = interval(std::time::Duration::from_secs(
            self.config.scheduler.sync_interval_seconds,
        ));
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health_tick = interval(std::time::Duration::from_secs(
            self.config.scheduler.health_interval_seconds,
        ));
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sync_tick.tick() => {
                    let started = std::time::Instant::now();
                    if let Err(err) = self.sync_due(Utc::now()).await {
                        error!(error = %err, "Sync sweep failed");
                    }
                    histogram!("sync_scheduler_tick_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
                _ = health_tick.tick() => {
                    if let Err(err) = self.health_check_all(Utc::now()).await {
                        error!(error = %err, "Health sweep failed");
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Syncs every CONNECTED connection whose own interval has elapsed.
    #[instrument(skip(self))]
    pub async fn sync_due(&self, now: DateTime<Utc>) -> Result<SyncStats, IntegrationError> {
        let candidates = self.service.repository().find_sync_candidates(now).await?;
        let mut stats = SyncStats {
            connections_polled: candidates.len() as u64,
            ..SyncStats::default()
        };
        gauge!("sync_scheduler_due_connections").set(stats.connections_polled as f64);

        for connection in candidates {
            match self.sync_connection(&connection, now).await {
                Ok(updated) if updated.sync_state() == SyncStatus::Synced => stats.synced += 1,
                Ok(_) => stats.failed += 1,
                Err(err) => {
                    stats.failed += 1;
                    error!(connection_id = %connection.id, error = %err, "Sync bookkeeping failed");
                }
            }
        }

        counter!("sync_completed_total").increment(stats.synced);
        counter!("sync_failed_total").increment(stats.failed);
        info!(
            polled = stats.connections_polled,
            synced = stats.synced,
            failed = stats.failed,
            "Sync sweep complete"
        );
        Ok(stats)
    }

    /// Fetches every enabled widget into the cache and records SYNCED or FAILED.
    ///
    /// Provider failures end up on the connection; only bookkeeping errors are returned.
    pub async fn sync_connection(
        &self,
        connection: &connection::Model,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, IntegrationError> {
        let repo = self.service.repository();
        let connection = repo
            .set_sync_state(connection.id, SyncStatus::Syncing, None, now)
            .await?;

        let failure = match self.fetch_enabled_widgets(&connection, now).await {
            Ok(count) => {
                debug!(connection_id = %connection.id, widgets = count, "Connection synced");
                None
            }
            Err(err) => {
                warn!(
                    connection_id = %connection.id,
                    provider = %connection.provider_slug,
                    error = %err,
                    "Connection sync failed"
                );
                Some(err.to_string())
            }
        };

        match failure {
            None => repo.set_sync_state(connection.id, SyncStatus::Synced, None, now).await,
            Some(message) => {
                repo.set_sync_state(connection.id, SyncStatus::Failed, Some(&message), now)
                    .await
            }
        }
    }

    async fn fetch_enabled_widgets(
        &self,
        connection: &connection::Model,
        now: DateTime<Utc>,
    ) -> Result<usize, IntegrationError> {
        let connector = self
            .service
            .registry()
            .get(&connection.provider_slug)
            .ok_or_else(|| IntegrationError::unknown_provider(&connection.provider_slug))?;

        let widgets = connection.enabled_widget_ids();
        for widget_id in &widgets {
            self.service
                .fetch_widget(connector.as_ref(), connection, widget_id, &json!({}), now)
                .await?;
        }
        Ok(widgets.len())
    }

    /// Probes every CONNECTED or ERROR connection.
    #[instrument(skip(self))]
    pub async fn health_check_all(&self, now: DateTime<Utc>) -> Result<HealthStats, IntegrationError> {
        let connections = self.service.repository().find_for_health_check().await?;
        let mut stats = HealthStats {
            checked: connections.len() as u64,
            ..HealthStats::default()
        };

        for connection in connections {
            let current = match self.service.probe(&connection, now).await {
                Ok(outcome) if outcome.healthy => {
                    stats.healthy += 1;
                    continue;
                }
                Ok(outcome) => outcome.connection,
                Err(err) => {
                    stats.unhealthy += 1;
                    warn!(connection_id = %connection.id, error = %err, "Health probe failed");
                    continue;
                }
            };
            stats.unhealthy += 1;
            warn!(
                connection_id = %current.id,
                provider = %current.provider_slug,
                last_error = ?current.last_error,
                "Connection unhealthy"
            );

            match self.notify_if_critical(&current, now).await {
                Ok(true) => stats.critical_notified += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(
                        connection_id = %current.id,
                        error = %err,
                        "Failed to record critical health notification"
                    );
                }
            }
        }

        counter!("health_check_unhealthy_total").increment(stats.unhealthy);
        info!(
            checked = stats.checked,
            healthy = stats.healthy,
            unhealthy = stats.unhealthy,
            critical = stats.critical_notified,
            "Health sweep complete"
        );
        Ok(stats)
    }

    /// Emits the critical notification once per error run past the threshold.
    async fn notify_if_critical(
        &self,
        connection: &connection::Model,
        now: DateTime<Utc>,
    ) -> Result<bool, IntegrationError> {
        let Some(error_since) = connection.error_since else {
            return Ok(false);
        };
        if connection.critical_notified_at.is_some()
            || now - error_since < self.config.scheduler.critical_threshold()
        {
            return Ok(false);
        }

        self.service
            .repository()
            .mark_critical_notified(connection.id, now)
            .await?;
        error!(
            connection_id = %connection.id,
            workspace_id = %connection.workspace_id,
            provider = %connection.provider_slug,
            %error_since,
            "Connection has been failing past the critical threshold"
        );
        self.events.publish(IntegrationEvent::HealthCritical {
            connection_id: connection.id,
            workspace_id: connection.workspace_id,
            provider: connection.provider_slug.clone(),
            error_since,
            last_error: connection.last_error.clone(),
        });
        counter!("health_critical_notifications_total").increment(1);
        Ok(true)
    }
}
