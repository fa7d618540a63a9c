use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::broker::Broker,
    models::health::{ComponentHealth, HealthCheckResponse, HealthStatus},
    services::redelivery::RedeliveryTracker,
};

const MESSAGE_BROKER: &str = "message_broker";
const REDELIVERY_TRACKER: &str = "redelivery_tracker";

pub struct HealthChecker {
    broker: Arc<dyn Broker>,
    tracker: Arc<dyn RedeliveryTracker>,
}

impl HealthChecker {
    pub fn new(broker: Arc<dyn Broker>, tracker: Arc<dyn RedeliveryTracker>) -> Self {
        Self { broker, tracker }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert(MESSAGE_BROKER.to_string(), self.check_broker().await);
        checks.insert(REDELIVERY_TRACKER.to_string(), self.check_tracker().await);

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_broker(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.broker.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, broker = self.broker.name(), "Broker health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, broker = self.broker.name(), "Broker health check failed");
                ComponentHealth::unhealthy(format!("Health check failed: {}", e))
            }
        }
        .with_backend(self.broker.name())
    }

    // Losing the tracker only disables the redelivery cap.
    async fn check_tracker(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.tracker.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, tracker = self.tracker.name(), "Redelivery tracker health check passed");
                ComponentHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, tracker = self.tracker.name(), "Redelivery tracker health check failed");
                ComponentHealth::degraded(format!("Health check failed: {}", e))
            }
        }
        .with_backend(self.tracker.name())
    }
}

fn determine_overall_status(checks: &HashMap<String, ComponentHealth>) -> HealthStatus {
    let has_unhealthy = checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy);

    let has_degraded = checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded);

    if has_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
