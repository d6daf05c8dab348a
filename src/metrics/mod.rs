//! Metrics and monitoring for the ephemeral chat service
//!
//! Prometheus collectors live in `collector`; `health` serves them together
//! with the liveness, readiness and stats endpoints.

pub mod collector;
pub mod health;

pub use collector::{
    ConnectionMetrics, ConversationMetrics, MetricsCollector, MetricsTimer, PerformanceMetrics,
    QueueMetrics, RelayMetrics, ServiceMetrics,
};
pub use health::{HealthServer, HealthServerConfig};
