//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the ephemeral-chat pairing
//! service using Prometheus metrics.

use crate::pairing::PairingStats;
use crate::types::TeardownReason;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the pairing service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Connection and session metrics
    connection_metrics: ConnectionMetrics,

    /// Waiting queue metrics
    queue_metrics: QueueMetrics,

    /// Conversation lifecycle metrics
    conversation_metrics: ConversationMetrics,

    /// Message relay metrics
    relay_metrics: RelayMetrics,

    /// Performance metrics
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// HTTP API requests by route and status
    pub http_requests_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Connection and session metrics
#[derive(Clone)]
pub struct ConnectionMetrics {
    /// Participants with a live connection
    pub connected_participants: IntGauge,

    /// Connections bound to a participant
    pub connections_opened_total: IntCounter,

    /// Connections evicted by a newer one for the same participant
    pub connections_replaced_total: IntCounter,

    /// Connections that went away
    pub disconnects_total: IntCounter,

    /// Session tokens issued, by kind
    pub sessions_issued_total: IntCounterVec,
}

/// Waiting queue metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Participants currently waiting
    pub participants_waiting: IntGauge,

    /// Total enqueue operations
    pub enqueued_total: IntCounter,

    /// Time spent waiting before being paired
    pub queue_wait_time_seconds: Histogram,

    /// Waiters removed for staying disconnected too long
    pub stale_waiters_pruned_total: IntCounter,
}

/// Conversation lifecycle metrics
#[derive(Clone)]
pub struct ConversationMetrics {
    /// Conversations currently active
    pub active_conversations: IntGauge,

    /// Total conversations created
    pub conversations_created_total: IntCounter,

    /// Conversations torn down, by reason
    pub conversations_closed_total: IntCounterVec,

    /// Skips rejected by the cooldown
    pub skips_rate_limited_total: IntCounter,

    /// How long conversations lasted, by teardown reason
    pub conversation_lifetime_seconds: HistogramVec,
}

/// Message relay metrics
#[derive(Clone)]
pub struct RelayMetrics {
    /// Chat messages forwarded to a peer
    pub messages_relayed_total: IntCounter,

    /// Chat messages dropped, by reason
    pub messages_dropped_total: IntCounterVec,

    /// Server notifications that found no live connection, by kind
    pub notifications_undelivered_total: IntCounterVec,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Matchmaker pass duration
    pub matchmaker_pass_duration: Histogram,

    /// Pairs formed per matchmaker pass
    pub pairs_per_pass: Histogram,

    /// Engine operation durations
    pub engine_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let connection_metrics = ConnectionMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let conversation_metrics = ConversationMetrics::new(&registry)?;
        let relay_metrics = RelayMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            connection_metrics,
            queue_metrics,
            conversation_metrics,
            relay_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Get service metrics
    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Get connection metrics
    pub fn connection(&self) -> &ConnectionMetrics {
        &self.connection_metrics
    }

    /// Get queue metrics
    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    /// Get conversation metrics
    pub fn conversation(&self) -> &ConversationMetrics {
        &self.conversation_metrics
    }

    /// Get relay metrics
    pub fn relay(&self) -> &RelayMetrics {
        &self.relay_metrics
    }

    /// Get performance metrics
    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Refresh gauges from engine stats
    pub fn update_from_pairing_stats(&self, stats: &PairingStats) {
        self.queue_metrics
            .participants_waiting
            .set(stats.participants_waiting as i64);

        self.conversation_metrics
            .active_conversations
            .set(stats.active_conversations as i64);

        self.connection_metrics
            .connected_participants
            .set(stats.connected_participants as i64);
    }

    /// Record a connection being bound
    pub fn record_connected(&self, replaced_previous: bool) {
        self.connection_metrics.connections_opened_total.inc();
        if replaced_previous {
            self.connection_metrics.connections_replaced_total.inc();
        }
    }

    /// Record a connection going away
    pub fn record_disconnected(&self) {
        self.connection_metrics.disconnects_total.inc();
    }

    /// Record a session token being issued
    pub fn record_session_issued(&self, kind: &str) {
        self.connection_metrics
            .sessions_issued_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Record a participant entering the waiting queue
    pub fn record_enqueued(&self) {
        self.queue_metrics.enqueued_total.inc();
    }

    /// Record a pair being formed, with how long each side waited
    pub fn record_paired(&self, waits: [Duration; 2]) {
        self.conversation_metrics.conversations_created_total.inc();
        for wait in waits {
            self.queue_metrics
                .queue_wait_time_seconds
                .observe(wait.as_secs_f64());
        }
    }

    /// Record a conversation teardown
    pub fn record_conversation_closed(&self, reason: TeardownReason, lifetime: Duration) {
        self.conversation_metrics
            .conversations_closed_total
            .with_label_values(&[reason.as_str()])
            .inc();

        self.conversation_metrics
            .conversation_lifetime_seconds
            .with_label_values(&[reason.as_str()])
            .observe(lifetime.as_secs_f64());
    }

    /// Record a skip rejected by the cooldown
    pub fn record_skip_rate_limited(&self) {
        self.conversation_metrics.skips_rate_limited_total.inc();
    }

    /// Record a chat message forwarded to a peer
    pub fn record_message_relayed(&self) {
        self.relay_metrics.messages_relayed_total.inc();
    }

    /// Record a chat message being dropped
    pub fn record_message_dropped(&self, reason: &str) {
        self.relay_metrics
            .messages_dropped_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Record a notification that could not be handed to a connection
    pub fn record_notification_undelivered(&self, kind: &str) {
        self.relay_metrics
            .notifications_undelivered_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Record stale waiters removed from the queue
    pub fn record_stale_waiters_pruned(&self, count: usize) {
        self.queue_metrics
            .stale_waiters_pruned_total
            .inc_by(count as u64);
    }

    /// Record a matchmaker pass
    pub fn record_matchmaker_pass(&self, duration: Duration, pairs: usize) {
        self.performance_metrics
            .matchmaker_pass_duration
            .observe(duration.as_secs_f64());
        self.performance_metrics
            .pairs_per_pass
            .observe(pairs as f64);
    }

    /// Record engine operation duration
    pub fn record_engine_operation(&self, operation: &str, duration: Duration) {
        self.performance_metrics
            .engine_operation_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Record an HTTP API request
    pub fn record_http_request(&self, route: &str, status: u16) {
        self.service_metrics
            .http_requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("ephemeral_chat_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "ephemeral_chat_http_requests_total",
                "Total HTTP API requests",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let health_status = IntGauge::new(
            "ephemeral_chat_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("ephemeral_chat_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            http_requests_total,
            health_status,
            component_health,
        })
    }
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let connected_participants = IntGauge::new(
            "ephemeral_chat_connected_participants",
            "Participants with a live connection",
        )?;
        registry.register(Box::new(connected_participants.clone()))?;

        let connections_opened_total = IntCounter::new(
            "ephemeral_chat_connections_opened_total",
            "Total connections bound",
        )?;
        registry.register(Box::new(connections_opened_total.clone()))?;

        let connections_replaced_total = IntCounter::new(
            "ephemeral_chat_connections_replaced_total",
            "Connections evicted by a newer connection",
        )?;
        registry.register(Box::new(connections_replaced_total.clone()))?;

        let disconnects_total =
            IntCounter::new("ephemeral_chat_disconnects_total", "Total disconnects")?;
        registry.register(Box::new(disconnects_total.clone()))?;

        let sessions_issued_total = IntCounterVec::new(
            Opts::new(
                "ephemeral_chat_sessions_issued_total",
                "Session tokens issued",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(sessions_issued_total.clone()))?;

        Ok(Self {
            connected_participants,
            connections_opened_total,
            connections_replaced_total,
            disconnects_total,
            sessions_issued_total,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let participants_waiting = IntGauge::new(
            "ephemeral_chat_participants_waiting",
            "Participants currently waiting for a partner",
        )?;
        registry.register(Box::new(participants_waiting.clone()))?;

        let enqueued_total =
            IntCounter::new("ephemeral_chat_enqueued_total", "Total enqueue operations")?;
        registry.register(Box::new(enqueued_total.clone()))?;

        let queue_wait_time_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ephemeral_chat_queue_wait_time_seconds",
                "Time spent waiting before being paired",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(queue_wait_time_seconds.clone()))?;

        let stale_waiters_pruned_total = IntCounter::new(
            "ephemeral_chat_stale_waiters_pruned_total",
            "Disconnected waiters removed from the queue",
        )?;
        registry.register(Box::new(stale_waiters_pruned_total.clone()))?;

        Ok(Self {
            participants_waiting,
            enqueued_total,
            queue_wait_time_seconds,
            stale_waiters_pruned_total,
        })
    }
}

impl ConversationMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let active_conversations = IntGauge::new(
            "ephemeral_chat_active_conversations",
            "Conversations currently active",
        )?;
        registry.register(Box::new(active_conversations.clone()))?;

        let conversations_created_total = IntCounter::new(
            "ephemeral_chat_conversations_created_total",
            "Total conversations created",
        )?;
        registry.register(Box::new(conversations_created_total.clone()))?;

        let conversations_closed_total = IntCounterVec::new(
            Opts::new(
                "ephemeral_chat_conversations_closed_total",
                "Total conversations torn down",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(conversations_closed_total.clone()))?;

        let skips_rate_limited_total = IntCounter::new(
            "ephemeral_chat_skips_rate_limited_total",
            "Skips rejected by the cooldown",
        )?;
        registry.register(Box::new(skips_rate_limited_total.clone()))?;

        let conversation_lifetime_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ephemeral_chat_conversation_lifetime_seconds",
                "Conversation lifetime in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 180.0, 300.0]),
            &["reason"],
        )?;
        registry.register(Box::new(conversation_lifetime_seconds.clone()))?;

        Ok(Self {
            active_conversations,
            conversations_created_total,
            conversations_closed_total,
            skips_rate_limited_total,
            conversation_lifetime_seconds,
        })
    }
}

impl RelayMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let messages_relayed_total = IntCounter::new(
            "ephemeral_chat_messages_relayed_total",
            "Chat messages forwarded to a peer",
        )?;
        registry.register(Box::new(messages_relayed_total.clone()))?;

        let messages_dropped_total = IntCounterVec::new(
            Opts::new(
                "ephemeral_chat_messages_dropped_total",
                "Chat messages dropped",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(messages_dropped_total.clone()))?;

        let notifications_undelivered_total = IntCounterVec::new(
            Opts::new(
                "ephemeral_chat_notifications_undelivered_total",
                "Notifications that found no live connection",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(notifications_undelivered_total.clone()))?;

        Ok(Self {
            messages_relayed_total,
            messages_dropped_total,
            notifications_undelivered_total,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let matchmaker_pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ephemeral_chat_matchmaker_pass_duration_seconds",
                "Matchmaker pass duration",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        registry.register(Box::new(matchmaker_pass_duration.clone()))?;

        let pairs_per_pass = Histogram::with_opts(
            HistogramOpts::new(
                "ephemeral_chat_pairs_per_pass",
                "Pairs formed per matchmaker pass",
            )
            .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 50.0, 100.0]),
        )?;
        registry.register(Box::new(pairs_per_pass.clone()))?;

        let engine_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ephemeral_chat_engine_operation_duration_seconds",
                "Engine operation duration",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.005, 0.01, 0.05, 0.1]),
            &["operation"],
        )?;
        registry.register(Box::new(engine_operation_duration.clone()))?;

        Ok(Self {
            matchmaker_pass_duration,
            pairs_per_pass,
            engine_operation_duration,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    fn render(collector: &MetricsCollector) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&collector.registry().gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");

        let _service = collector.service();
        let _connection = collector.connection();
        let _queue = collector.queue();
        let _conversation = collector.conversation();
        let _relay = collector.relay();
        let _performance = collector.performance();
    }

    #[test]
    fn test_independent_registries() {
        // Each collector owns its registry, so two can coexist in one process
        let first = MetricsCollector::new().unwrap();
        let second = MetricsCollector::new().unwrap();
        first.record_enqueued();
        assert_eq!(first.queue().enqueued_total.get(), 1);
        assert_eq!(second.queue().enqueued_total.get(), 0);
    }

    #[test]
    fn test_pairing_lifecycle_recording() {
        let collector = MetricsCollector::new().unwrap();

        collector.record_connected(false);
        collector.record_connected(true);
        collector.record_paired([Duration::from_millis(20), Duration::from_secs(2)]);
        collector.record_conversation_closed(TeardownReason::Skipped, Duration::from_secs(42));
        collector.record_skip_rate_limited();

        assert_eq!(collector.connection().connections_opened_total.get(), 2);
        assert_eq!(collector.connection().connections_replaced_total.get(), 1);
        assert_eq!(
            collector.conversation().conversations_created_total.get(),
            1
        );
        assert_eq!(
            collector
                .conversation()
                .conversations_closed_total
                .with_label_values(&["skipped"])
                .get(),
            1
        );
        assert_eq!(collector.conversation().skips_rate_limited_total.get(), 1);
    }

    #[test]
    fn test_gauges_follow_stats() {
        let collector = MetricsCollector::new().unwrap();
        let stats = PairingStats {
            participants_waiting: 3,
            active_conversations: 2,
            connected_participants: 7,
            ..Default::default()
        };

        collector.update_from_pairing_stats(&stats);

        assert_eq!(collector.queue().participants_waiting.get(), 3);
        assert_eq!(collector.conversation().active_conversations.get(), 2);
        assert_eq!(collector.connection().connected_participants.get(), 7);
    }

    #[test]
    fn test_relay_and_health_recording() {
        let collector = MetricsCollector::new().unwrap();

        collector.record_message_relayed();
        collector.record_message_dropped("unknown_conversation");
        collector.record_notification_undelivered("paired");
        collector.update_health_status(2);
        collector.update_component_health("pairing_engine", true);
        collector.record_http_request("/ping", 200);

        let text = render(&collector);
        assert!(text.contains("ephemeral_chat_messages_relayed_total 1"));
        assert!(text.contains("ephemeral_chat_health_status 2"));
        assert!(text.contains("unknown_conversation"));
    }

    #[test]
    fn test_metrics_timer() {
        let collector = MetricsCollector::new().expect("Failed to create metrics collector");
        let timer = collector.start_timer();

        std::thread::sleep(Duration::from_millis(10));
        let duration = timer.elapsed();

        assert!(duration >= Duration::from_millis(10));

        let final_duration = timer.stop();
        assert!(final_duration >= Duration::from_millis(10));
    }
}
