//! # Token Refresh Service
//!
//! Background task with two independent sweeps: a refresh pass over connections whose
//! access token expires within the lookahead window, and a fallback pass that marks
//! tokens already past expiry as EXPIRED (and drops stale OAuth states).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::connection_service::RECONNECT_MESSAGE;
use crate::connectors::Registry;
use crate::error::IntegrationError;
use crate::events::{EventBus, IntegrationEvent};
use crate::models::ConnectionStatus;
use crate::models::connection;
use crate::repositories::{ConnectionRepository, OAuthStateRepository};

/// Background token refresh service
#[derive(Clone)]
pub struct TokenRefreshService {
    config: Arc<AppConfig>,
    registry: Arc<Registry>,
    connections: ConnectionRepository,
    states: OAuthStateRepository,
    events: EventBus,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshStats {
    pub connections_polled: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExpirySweepStats {
    pub connections_expired: u64,
    pub states_deleted: u64,
}

impl TokenRefreshService {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<Registry>,
        connections: ConnectionRepository,
        states: OAuthStateRepository,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            connections,
            states,
            events,
        }
    }

    /// Run both sweeps until the shutdown token fires. A sweep in progress is never
    /// interrupted.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_seconds = self.config.token_refresh.interval_seconds,
            expiry_sweep_seconds = self.config.token_refresh.expiry_sweep_seconds,
            "Starting token refresh service"
        );
        let mut refresh_tick = interval(self.config.token_refresh.interval());
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut expiry_tick = interval(self.config.token_refresh.expiry_sweep_interval());
        expiry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Token refresh service shutdown requested");
                    break;
                }
                _ = refresh_tick.tick() => {
                    let started = std::time::Instant::now();
                    if let Err(err) = self.refresh_due(Utc::now()).await {
                        error!(error = %err, "Token refresh sweep failed");
                    }
                    histogram!("token_refresh_tick_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
                _ = expiry_tick.tick() => {
                    if let Err(err) = self.expire_overdue(Utc::now()).await {
                        error!(error = %err, "Token expiry sweep failed");
                    }
                }
            }
        }

        info!("Token refresh service stopped");
    }

    /// Refreshes every CONNECTED connection whose token expires within the lookahead.
    /// Connections are handled one at a time; a failure is recorded and not retried
    /// within the pass.
    #[instrument(skip(self))]
    pub async fn refresh_due(&self, now: DateTime<Utc>) -> Result<RefreshStats, IntegrationError> {
        let due = self
            .connections
            .find_due_for_refresh(now, self.config.token_refresh.lookahead())
            .await?;
        let mut stats = RefreshStats {
            connections_polled: due.len() as u64,
            ..RefreshStats::default()
        };

        for connection in due {
            match self.refresh_one(&connection, now).await {
                Ok(true) => stats.refreshes_succeeded += 1,
                Ok(false) => stats.skipped += 1,
                Err(err) => {
                    stats.refreshes_failed += 1;
                    warn!(
                        connection_id = %connection.id,
                        provider = %connection.provider_slug,
                        error = %err,
                        "Token refresh failed; connection marked expired"
                    );
                    self.mark_expired(&connection, now).await;
                }
            }
        }

        counter!("token_refresh_attempts_total")
            .increment(stats.refreshes_succeeded + stats.refreshes_failed);
        counter!("token_refresh_success_total").increment(stats.refreshes_succeeded);
        counter!("token_refresh_failure_total").increment(stats.refreshes_failed);
        info!(
            polled = stats.connections_polled,
            succeeded = stats.refreshes_succeeded,
            failed = stats.refreshes_failed,
            skipped = stats.skipped,
            "Token refresh sweep complete"
        );
        Ok(stats)
    }

    /// `Ok(false)` when there was nothing to refresh with.
    async fn refresh_one(
        &self,
        connection: &connection::Model,
        now: DateTime<Utc>,
    ) -> Result<bool, IntegrationError> {
        let Some(connector) = self.registry.get(&connection.provider_slug) else {
            debug!(provider = %connection.provider_slug, "No connector registered; skipping refresh");
            return Ok(false);
        };
        let Some(refresh_token) = self
            .connections
            .decrypt_tokens(connection)?
            .and_then(|tokens| tokens.refresh_token)
        else {
            return Ok(false);
        };

        let started = std::time::Instant::now();
        let refreshed = connector
            .refresh_token(&refresh_token)
            .await
            .map_err(|e| IntegrationError::from_connector(&connection.provider_slug, e))?;
        let labels = vec![("provider", connection.provider_slug.clone())];
        histogram!("token_refresh_latency_ms", &labels)
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        self.connections
            .update_tokens(connection.id, &refreshed, now)
            .await?;
        debug!(connection_id = %connection.id, expires_at = ?refreshed.expires_at, "Token refreshed");
        Ok(true)
    }

    async fn mark_expired(&self, connection: &connection::Model, now: DateTime<Utc>) {
        match self
            .connections
            .mark_failed(connection.id, ConnectionStatus::Expired, RECONNECT_MESSAGE, now)
            .await
        {
            Ok(updated) => self.events.publish(IntegrationEvent::ConnectionStatusChanged {
                connection_id: updated.id,
                workspace_id: updated.workspace_id,
                provider: updated.provider_slug,
                status: ConnectionStatus::Expired,
                reason: Some(RECONNECT_MESSAGE.to_string()),
            }),
            Err(err) => {
                error!(connection_id = %connection.id, error = %err, "Failed to record refresh failure")
            }
        }
    }

    /// Marks CONNECTED rows already past expiry as EXPIRED and deletes OAuth states
    /// that expired more than one TTL ago.
    #[instrument(skip(self))]
    pub async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ExpirySweepStats, IntegrationError> {
        let connections_expired = self
            .connections
            .expire_overdue(now, RECONNECT_MESSAGE)
            .await?;
        let states_deleted = self
            .states
            .delete_expired_before(now - self.config.oauth_state_ttl())
            .await?;

        counter!("token_expiry_marked_total").increment(connections_expired);
        if connections_expired > 0 {
            info!(connections_expired, "Marked overdue connections as expired");
        }
        if states_deleted > 0 {
            debug!(states_deleted, "Deleted stale OAuth states");
        }
        Ok(ExpirySweepStats {
            connections_expired,
            states_deleted,
        })
    }
}
