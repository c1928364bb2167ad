//! Health gate
//!
//! [`HealthGate::wait_healthy`] is the single polling contract used for every
//! service: poll every `interval`, succeed on the first poll the service's
//! [`HealthCheck`](crate::catalog::HealthCheck) accepts, give up after
//! `max_attempts` consecutive bad polls. Connection errors and unexpected
//! status codes are both just bad polls.

pub mod mock;
pub mod prober;

pub use mock::ScriptedProber;
pub use prober::{HttpProber, ProbeError, ProbeResponse, Prober};

use crate::catalog::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
    TimedOut,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }

    pub fn is_failure(self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Health wait for '{service}' cancelled")]
    Cancelled { service: String },
}

pub struct HealthGate {
    prober: Arc<dyn Prober>,
}

impl HealthGate {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Polls until healthy, `max_attempts` consecutive bad polls
    /// (`TimedOut`), or cancellation. Bounded by `max_attempts * interval`
    /// plus the prober's own timeout per poll.
    pub async fn wait_healthy(
        &self,
        spec: &ServiceSpec,
        max_attempts: u32,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<HealthStatus, GateError> {
        let check = &spec.health_check;
        let max_attempts = max_attempts.max(1);
        let cancelled = || GateError::Cancelled {
            service: spec.name.clone(),
        };

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                result = self.prober.probe(&check.url) => result,
            };

            match result {
                Ok(response) if check.accepts(response.status, &response.body) => {
                    info!(service = %spec.name, attempt, "Service healthy");
                    return Ok(HealthStatus::Healthy);
                }
                Ok(response) => {
                    debug!(
                        service = %spec.name,
                        attempt,
                        max_attempts,
                        status = response.status,
                        "Health poll rejected"
                    );
                }
                Err(e) => {
                    debug!(service = %spec.name, attempt, max_attempts, error = %e, "Health poll failed");
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(cancelled()),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        warn!(
            service = %spec.name,
            url = %check.url,
            max_attempts,
            "Service did not become healthy"
        );
        Ok(HealthStatus::TimedOut)
    }
}
