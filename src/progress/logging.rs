//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use tracing::{debug, info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::TransitionStarted {
                from,
                to,
                to_start,
                to_stop,
            } => {
                info!(from = %from, to = %to, to_start, to_stop, "Starting transition");
            }
            ProgressEvent::BackupCreated {
                id,
                resources,
                partial,
            } => {
                if *partial {
                    warn!(backup = %id, resources, "Backup created but partial");
                } else {
                    info!(backup = %id, resources, "Backup created");
                }
            }
            ProgressEvent::TierStarted {
                tier,
                index,
                total,
                services,
            } => {
                info!(
                    tier,
                    progress = format!("{}/{}", index, total),
                    services = %services.join(", "),
                    "Starting tier"
                );
            }
            ProgressEvent::ServiceStarted { service, handle } => {
                debug!(service = %service, handle = %handle, "Service launched");
            }
            ProgressEvent::ServiceHealth {
                service,
                status,
                elapsed,
            } => {
                if status.is_healthy() {
                    info!(
                        service = %service,
                        elapsed_ms = elapsed.as_millis(),
                        "Service healthy"
                    );
                } else {
                    warn!(
                        service = %service,
                        status = %status,
                        elapsed_ms = elapsed.as_millis(),
                        "Service failed health gate"
                    );
                }
            }
            ProgressEvent::ServiceFailed { service, error } => {
                warn!(service = %service, error = %error, "Service failed to launch");
            }
            ProgressEvent::RoutingApplied {
                proxy_mode_enabled,
                migrated_routes,
            } => {
                info!(
                    proxy_mode = proxy_mode_enabled,
                    migrated_routes, "Routing switched"
                );
            }
            ProgressEvent::ServiceStopped { service } => {
                info!(service = %service, "Service stopped");
            }
            ProgressEvent::TransitionComplete { phase, total_time } => {
                info!(
                    phase = %phase,
                    total_time_ms = total_time.as_millis(),
                    "Transition complete"
                );
            }
            ProgressEvent::TransitionFailed { target, error } => {
                warn!(target = %target, error = %error, "Transition failed");
            }
            ProgressEvent::RollbackStarted { from } => {
                info!(from = %from, "Starting rollback");
            }
            ProgressEvent::RollbackStep { step, ok } => {
                if *ok {
                    info!(step = %step, "Rollback step complete");
                } else {
                    warn!(step = %step, "Rollback step failed, continuing");
                }
            }
            ProgressEvent::RollbackComplete { total_time } => {
                info!(total_time_ms = total_time.as_millis(), "Rollback complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::state::MigrationPhase;
    use std::time::Duration;

    #[test]
    fn test_logging_handler_accepts_every_event() {
        let handler = LoggingHandler;
        let events = vec![
            ProgressEvent::TransitionStarted {
                from: MigrationPhase::Prepared,
                to: MigrationPhase::Phase1,
                to_start: 2,
                to_stop: 0,
            },
            ProgressEvent::BackupCreated {
                id: "20260101T000000000Z".to_string(),
                resources: 2,
                partial: true,
            },
            ProgressEvent::TierStarted {
                tier: 0,
                index: 1,
                total: 2,
                services: vec!["auth".to_string(), "sample".to_string()],
            },
            ProgressEvent::ServiceHealth {
                service: "sample".to_string(),
                status: HealthStatus::TimedOut,
                elapsed: Duration::from_secs(60),
            },
            ProgressEvent::RollbackStep {
                step: "restore".to_string(),
                ok: false,
            },
        ];

        for event in &events {
            handler.on_progress(event);
        }
    }
}
