//! Health checks for readiness and liveness probes
//!
//! Component checks never block on the engine: a poisoned lock or a failed
//! invariant check is reported, not propagated.

use crate::service::app::AppState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value: 2 healthy, 1 degraded, 0 unhealthy
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Set when not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub participants_waiting: usize,
    pub active_conversations: usize,
    pub connected_participants: usize,
    pub known_participants: usize,
    pub active_sessions: usize,
    pub conversations_created: u64,
    pub conversations_expired: u64,
    pub conversations_skipped: u64,
    pub conversations_abandoned: u64,
    pub messages_relayed: u64,
    pub messages_dropped: u64,
    pub uptime_info: String,
}

impl HealthCheck {
    /// Full health check: running flag, components and statistics
    pub async fn check(app_state: Arc<AppState>) -> Result<Self> {
        let mut checks = vec![Self::check_service_running(&app_state).await];
        checks.extend(Self::check_components(&app_state));

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));

        Ok(HealthCheck {
            status,
            service: app_state.config().service.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats: Self::gather_service_stats(&app_state),
        })
    }

    /// Engine, invariant and session store checks; usable before the service starts
    pub fn check_components(app_state: &AppState) -> Vec<ComponentCheck> {
        vec![
            Self::check_pairing_engine(app_state),
            Self::check_invariants(app_state),
            Self::check_session_store(app_state),
        ]
    }

    pub async fn liveness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if app_state.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness: running and the engine answers
    pub async fn readiness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if !app_state.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }
        Ok(Self::check_pairing_engine(&app_state).status)
    }

    async fn check_service_running(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = if app_state.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_pairing_engine(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match app_state.engine().get_stats() {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!("Pairing engine unreachable: {}", e);
                (HealthStatus::Unhealthy, Some(e.to_string()))
            }
        };

        ComponentCheck {
            name: "pairing_engine".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_invariants(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match app_state.engine().check_invariants() {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e) => (HealthStatus::Degraded, Some(e.to_string())),
        };

        ComponentCheck {
            name: "placement_invariants".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_session_store(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match app_state.sessions().session_count() {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        };

        ComponentCheck {
            name: "session_store".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn gather_service_stats(app_state: &AppState) -> ServiceStats {
        let uptime_info = format!("Up {}s", app_state.uptime().as_secs());
        let active_sessions = app_state.sessions().session_count().unwrap_or_default();

        match app_state.engine().get_stats() {
            Ok(stats) => ServiceStats {
                participants_waiting: stats.participants_waiting,
                active_conversations: stats.active_conversations,
                connected_participants: stats.connected_participants,
                known_participants: stats.known_participants,
                active_sessions,
                conversations_created: stats.conversations_created,
                conversations_expired: stats.conversations_expired,
                conversations_skipped: stats.conversations_skipped,
                conversations_abandoned: stats.conversations_abandoned,
                messages_relayed: stats.messages_relayed,
                messages_dropped: stats.messages_dropped,
                uptime_info,
            },
            Err(e) => {
                debug!("Failed to get pairing stats for health check: {}", e);
                ServiceStats {
                    active_sessions,
                    uptime_info,
                    ..Default::default()
                }
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
