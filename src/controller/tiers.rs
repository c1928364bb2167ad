//! Tier-by-tier service bring-up and tear-down
//!
//! Within a tier services are launched one after another and then health-gated
//! concurrently. The next tier starts only when every service of the current
//! one is healthy. Tear-down runs the other way round, highest tier first.

use crate::catalog::{Catalog, ServiceSpec};
use crate::context::RolloutContext;
use crate::health::{GateError, HealthStatus};
use crate::launcher::Handle;
use crate::progress::ProgressEvent;
use crate::state::{PhaseState, ServiceState, StateError};
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BringUp {
    Complete,
    /// Failing service -> health status or launch error
    Failed(BTreeMap<String, String>),
    Cancelled,
}

/// Services whose recorded handle is still alive. Dead handles are cleared
/// from `state` so they are started again.
pub async fn observe_running(ctx: &RolloutContext, state: &mut PhaseState) -> BTreeSet<String> {
    let mut running = BTreeSet::new();
    for (name, service) in state.services.iter_mut() {
        let Some(handle) = &service.handle else {
            continue;
        };
        if ctx.launcher.is_running(handle).await {
            running.insert(name.clone());
        } else {
            debug!(service = %name, handle = %handle, "Recorded service no longer running");
            service.handle = None;
            service.health = HealthStatus::Unknown;
        }
    }
    state.services.retain(|_, s| s.handle.is_some());
    running
}

pub async fn bring_up(
    ctx: &RolloutContext,
    services: &[&ServiceSpec],
    state: &mut PhaseState,
    cancel: &CancellationToken,
) -> Result<BringUp, StateError> {
    let tiers = Catalog::tier_order(services);
    let total = tiers.len();

    for (index, (tier, members)) in tiers.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(BringUp::Cancelled);
        }
        ctx.emit(ProgressEvent::TierStarted {
            tier,
            index: index + 1,
            total,
            services: members.iter().map(|s| s.name.clone()).collect(),
        });

        let mut failed = BTreeMap::new();
        let mut launched: Vec<(&ServiceSpec, Handle)> = Vec::new();

        for spec in members.iter().copied() {
            if cancel.is_cancelled() {
                ctx.persist(state)?;
                return Ok(BringUp::Cancelled);
            }
            state.services.insert(
                spec.name.clone(),
                ServiceState {
                    handle: None,
                    health: HealthStatus::Unknown,
                    tier: spec.tier,
                },
            );

            match ctx.launcher.start(spec).await {
                Ok(handle) => {
                    ctx.emit(ProgressEvent::ServiceStarted {
                        service: spec.name.clone(),
                        handle: handle.to_string(),
                    });
                    if let Some(service) = state.services.get_mut(&spec.name) {
                        service.handle = Some(handle.clone());
                        service.health = HealthStatus::Starting;
                    }
                    launched.push((spec, handle));
                }
                Err(e) => {
                    ctx.emit(ProgressEvent::ServiceFailed {
                        service: spec.name.clone(),
                        error: e.to_string(),
                    });
                    state.services.remove(&spec.name);
                    failed.insert(spec.name.clone(), e.to_string());
                }
            }
        }
        ctx.persist(state)?;

        let gates = launched.iter().map(|(spec, handle)| async move {
            let started = Instant::now();
            let result = ctx
                .gate
                .wait_healthy(spec, ctx.settings.max_attempts, ctx.settings.interval, cancel)
                .await;
            let status = match result {
                Ok(HealthStatus::TimedOut) if !ctx.launcher.is_running(handle).await => {
                    Ok(HealthStatus::Unhealthy)
                }
                other => other,
            };
            (*spec, status, started.elapsed())
        });

        let mut cancelled = false;
        for (spec, status, elapsed) in join_all(gates).await {
            match status {
                Ok(status) => {
                    ctx.emit(ProgressEvent::ServiceHealth {
                        service: spec.name.clone(),
                        status,
                        elapsed,
                    });
                    if let Some(service) = state.services.get_mut(&spec.name) {
                        service.health = status;
                    }
                    if !status.is_healthy() {
                        failed.insert(spec.name.clone(), status.to_string());
                    }
                }
                Err(GateError::Cancelled { .. }) => cancelled = true,
            }
        }
        ctx.persist(state)?;

        if !failed.is_empty() {
            warn!(tier, failed = ?failed.keys().collect::<Vec<_>>(), "Tier did not come up");
            return Ok(BringUp::Failed(failed));
        }
        if cancelled {
            return Ok(BringUp::Cancelled);
        }
    }

    Ok(BringUp::Complete)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TearDown {
    pub stopped: Vec<String>,
    /// Service -> stop error
    pub failed: BTreeMap<String, String>,
    pub cancelled: bool,
}

/// Stops `names`, consumers before the services they depend on. Stopped
/// services are dropped from `state`; failures keep their entry so the
/// handle stays visible as drift.
pub async fn tear_down(
    ctx: &RolloutContext,
    names: &[String],
    state: &mut PhaseState,
    cancel: &CancellationToken,
) -> TearDown {
    let mut ordered: Vec<(u32, &String)> = names
        .iter()
        .map(|name| (state.services.get(name).map(|s| s.tier).unwrap_or(0), name))
        .collect();
    ordered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let mut outcome = TearDown::default();
    for (_, name) in ordered {
        if cancel.is_cancelled() {
            warn!("Cancelled, leaving remaining services running");
            outcome.cancelled = true;
            break;
        }
        let Some(handle) = state.handle(name).cloned() else {
            continue;
        };
        match ctx.launcher.stop(&handle, ctx.settings.stop_timeout).await {
            Ok(()) => {
                state.services.remove(name);
                ctx.emit(ProgressEvent::ServiceStopped {
                    service: name.clone(),
                });
                outcome.stopped.push(name.clone());
            }
            Err(e) => {
                warn!(service = %name, error = %e, "Failed to stop service");
                outcome.failed.insert(name.clone(), e.to_string());
            }
        }
    }
    outcome
}
