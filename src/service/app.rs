//! Main application state and service coordination
//!
//! `AppState` owns the pairing engine, the session store and the metrics
//! collector, and runs the chat API, the health server and the maintenance
//! tasks around them.

use crate::config::{validate_config, AppConfig};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector};
use crate::pairing::{EngineConfig, PairingEngine};
use crate::service::health::{HealthCheck, HealthStatus};
use crate::session::InMemorySessionStore;
use crate::transport::{create_router, ApiState};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Server error: {message}")]
    Server { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,

    engine: PairingEngine,
    sessions: InMemorySessionStore,
    metrics: Arc<MetricsCollector>,

    health_server: Mutex<Option<Arc<HealthServer>>>,
    http_shutdown: broadcast::Sender<()>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,

    is_running: Arc<RwLock<bool>>,
    started_at: Instant,
}

impl AppState {
    /// Build every component; nothing is bound or spawned until `start`
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing ephemeral-chat service");
        validate_config(&config).map_err(|e| ServiceError::Configuration {
            message: e.to_string(),
        })?;

        let metrics = Arc::new(MetricsCollector::new().map_err(|e| {
            ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            }
        })?);

        let engine = PairingEngine::new(EngineConfig::from(&config.pairing), metrics.clone());
        let sessions = InMemorySessionStore::new(&config.session);
        info!(
            "Pairing engine ready: round={}s, skip cooldown={}s, disconnect policy={}",
            config.pairing.round_duration_seconds,
            config.pairing.skip_cooldown_seconds,
            config.pairing.disconnect_policy
        );

        let (http_shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config,
            engine,
            sessions,
            metrics,
            health_server: Mutex::new(None),
            http_shutdown,
            background_tasks: Mutex::new(Vec::new()),
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        })
    }

    /// Start the chat API, the health server and the background tasks
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting ephemeral-chat service");

        *self.is_running.write().await = true;

        self.start_health_server().await;
        if let Err(e) = self.start_http_server().await {
            *self.is_running.write().await = false;
            return Err(e);
        }
        self.start_background_tasks().await;

        info!("✅ Ephemeral-chat service started successfully");
        Ok(())
    }

    /// Stop accepting work, stop tasks and cancel round timers
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of ephemeral-chat service");

        *self.is_running.write().await = false;

        if self.http_shutdown.send(()).is_err() {
            debug!("Chat API was not running");
        }
        if let Some(server) = self.health_server.lock().await.take() {
            server.stop();
        }

        self.stop_background_tasks().await;

        let cancelled = self
            .engine
            .shutdown()
            .map_err(|e| ServiceError::BackgroundTask {
                message: format!("Failed to stop pairing engine: {}", e),
            })?;
        info!("Cancelled {} round timers", cancelled);

        match self.engine.get_stats() {
            Ok(stats) => info!("Final pairing statistics: {:?}", stats),
            Err(e) => warn!("Failed to get final stats: {}", e),
        }

        info!("✅ Ephemeral-chat service shutdown completed");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub(crate) async fn set_running(&self, running: bool) {
        *self.is_running.write().await = running;
    }

    pub fn engine(&self) -> &PairingEngine {
        &self.engine
    }

    pub fn sessions(&self) -> &InMemorySessionStore {
        &self.sessions
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Shared state for the chat API router
    pub fn api_state(&self) -> ApiState {
        ApiState::new(
            self.engine.clone(),
            self.sessions.clone(),
            self.metrics.clone(),
            self.config.service.public_base_url.clone(),
        )
    }

    async fn start_health_server(self: &Arc<Self>) {
        let health_config = HealthServerConfig {
            port: self.config.service.metrics_port,
            host: self.config.service.http_host.clone(),
        };
        let server = Arc::new(
            HealthServer::new(health_config, self.metrics.clone()).with_app_state(self.clone()),
        );
        *self.health_server.lock().await = Some(server.clone());

        let handle = tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Health server failed: {:#}", e);
            }
        });
        self.background_tasks.lock().await.push(handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!(
            "✅ Health server started on port {}",
            self.config.service.metrics_port
        );
    }

    async fn start_http_server(&self) -> Result<(), ServiceError> {
        let addr = self.config.http_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServiceError::Server {
                message: format!("Failed to bind chat API to {}: {}", addr, e),
            })?;
        info!("Chat API listening on http://{}", addr);

        let app = create_router(self.api_state());
        let mut shutdown_rx = self.http_shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                    info!("Chat API shutdown signal received");
                })
                .await;
            match result {
                Ok(()) => info!("Chat API stopped"),
                Err(e) => error!("Chat API failed: {}", e),
            }
        });
        self.background_tasks.lock().await.push(handle);
        Ok(())
    }

    async fn start_background_tasks(&self) {
        info!("Starting background maintenance tasks...");

        let cleanup_task = {
            let engine = self.engine.clone();
            let sessions = self.sessions.clone();
            let cleanup_interval = self.config.cleanup_interval();
            let max_idle = self.config.pairing.stale_waiting();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(cleanup_interval);
                info!(
                    "Cleanup task started ({}s interval)",
                    cleanup_interval.as_secs()
                );

                while *is_running.read().await {
                    interval.tick().await;

                    match engine.prune_stale_waiting(max_idle) {
                        Ok(pruned) if !pruned.is_empty() => {
                            info!("Pruned {} stale waiters", pruned.len())
                        }
                        Ok(_) => debug!("Cleanup check completed - no stale waiters"),
                        Err(e) => warn!("Stale waiter cleanup failed: {}", e),
                    }

                    if let Err(e) = engine.heal_invariants() {
                        error!("Invariant repair incomplete: {}", e);
                    }

                    if let Err(e) = sessions.purge_expired() {
                        warn!("Session purge failed: {}", e);
                    }
                }

                info!("Cleanup task stopped");
            })
        };

        let metrics_task = {
            let engine = self.engine.clone();
            let metrics = self.metrics.clone();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(15));

                while *is_running.read().await {
                    interval.tick().await;

                    match engine.get_stats() {
                        Ok(stats) => {
                            debug!(
                                "Updating metrics - waiting: {}, conversations: {}, connected: {}",
                                stats.participants_waiting,
                                stats.active_conversations,
                                stats.connected_participants
                            );
                            metrics.update_from_pairing_stats(&stats);
                        }
                        Err(e) => warn!("Failed to get pairing stats for metrics update: {}", e),
                    }
                }
            })
        };

        let health_metrics_task = {
            let metrics = self.metrics.clone();
            let is_running = self.is_running.clone();
            let started_at = self.started_at;
            let engine = self.engine.clone();
            let sessions = self.sessions.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));

                while *is_running.read().await {
                    interval.tick().await;

                    metrics
                        .service()
                        .uptime_seconds
                        .set(started_at.elapsed().as_secs() as i64);

                    let engine_ok = engine.get_stats().is_ok();
                    let invariants_ok = engine.check_invariants().is_ok();
                    let sessions_ok = sessions.session_count().is_ok();
                    metrics.update_component_health("pairing_engine", engine_ok);
                    metrics.update_component_health("placement_invariants", invariants_ok);
                    metrics.update_component_health("session_store", sessions_ok);

                    let status = match (engine_ok && sessions_ok, invariants_ok) {
                        (false, _) => HealthStatus::Unhealthy,
                        (true, false) => HealthStatus::Degraded,
                        (true, true) => HealthStatus::Healthy,
                    };
                    metrics.update_health_status(status.as_gauge());
                }
            })
        };

        let mut tasks = self.background_tasks.lock().await;
        tasks.push(cleanup_task);
        tasks.push(metrics_task);
        tasks.push(health_metrics_task);
        info!("3 background maintenance tasks started");
    }

    async fn stop_background_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().await.drain(..).collect();
        if tasks.is_empty() {
            info!("No background tasks to stop");
            return;
        }

        let grace = self.config.shutdown_timeout().min(Duration::from_secs(1));
        info!("Stopping {} background tasks...", tasks.len());
        for task in tasks {
            // Servers drain on their shutdown signal; maintenance loops are aborted
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                debug!("Background task did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("✅ Background tasks stopped");
    }

    /// One-line summary for periodic logging
    pub async fn summary(self: &Arc<Self>) -> String {
        match HealthCheck::check(self.clone()).await {
            Ok(health) => format!(
                "{} - {} waiting, {} conversations, {} connected",
                health.status,
                health.stats.participants_waiting,
                health.stats.active_conversations,
                health.stats.connected_participants
            ),
            Err(e) => format!("health check failed: {}", e),
        }
    }
}
