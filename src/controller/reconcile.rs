use crate::controller::actions::{ActionKind, ActionRegistry, Outcome, SopAction};
use crate::controller::clock::Clock;
use crate::controller::cluster::{ClusterApi, ClusterError, ObjectKey};
use crate::crd::sop::{Phase, Sop, SopStatus};
use crate::server::metrics::{SharedMetrics, UNKNOWN_ACTION};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("SOP missing namespace")]
    MissingNamespace,
}

pub struct Context {
    pub cluster: Arc<dyn ClusterApi>,
    pub registry: ActionRegistry,
    pub clock: Arc<dyn Clock>,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
    /// Fixed delay used for every requeue
    pub requeue_delay: Duration,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        registry: ActionRegistry,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
        requeue_delay: Duration,
    ) -> Self {
        Context {
            cluster,
            registry,
            clock,
            metrics,
            requeue_delay,
        }
    }
}

/// Metric labels and requeue decision for one pass
struct PassResult {
    action: String,
    result: &'static str,
    requeue: Option<Duration>,
}

impl PassResult {
    fn done(action: &str, result: &'static str) -> Self {
        PassResult {
            action: action.to_string(),
            result,
            requeue: None,
        }
    }

    fn requeue(action: &str, result: &'static str, delay: Duration) -> Self {
        PassResult {
            action: action.to_string(),
            result,
            requeue: Some(delay),
        }
    }
}

/// Reconcile the SOP identified by `key`
///
/// 1. Fetches the SOP (gone → nothing to do)
/// 2. Skips SOPs already `complete`
/// 3. Resolves `spec.identifier` in the action registry (unknown → log only)
/// 4. One-shot actions run once with no phase change and no requeue
/// 5. Verified actions mark the SOP `in progress`, run, and either mark it
///    `complete` or ask to be polled again after the fixed delay
///
/// Never fails: every error is logged and turned into a requeue decision.
///
/// # Returns
/// * `Some(delay)` - run again after `delay`
/// * `None` - wait for the next change to the SOP
pub async fn reconcile_procedure(key: &ObjectKey, ctx: &Context) -> Option<Duration> {
    let start_time = Instant::now();

    let pass = run_pass(key, ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation(
            &pass.action,
            pass.result,
            start_time.elapsed().as_secs_f64(),
        );
    }

    pass.requeue
}

async fn run_pass(key: &ObjectKey, ctx: &Context) -> PassResult {
    let sop = match ctx.cluster.get_procedure(key).await {
        Ok(Some(sop)) => sop,
        Ok(None) => {
            debug!(sop = %key, "SOP not found, nothing to reconcile");
            return PassResult::done(UNKNOWN_ACTION, "not_found");
        }
        Err(e) => {
            error!(sop = %key, error = %e, "Failed to read SOP");
            return PassResult::requeue(UNKNOWN_ACTION, "read_error", ctx.requeue_delay);
        }
    };

    let identifier = sop.spec.identifier.clone();
    let phase = sop.phase();

    let resolved = ctx.registry.resolve(&identifier);

    if phase.is_terminal() {
        debug!(sop = %key, identifier = %identifier, "SOP already complete");
        // Metric labels only ever carry registered identifiers
        let label = resolved
            .as_ref()
            .map_or(UNKNOWN_ACTION, |action| action.identifier());
        return PassResult::done(label, "already_complete");
    }

    info!(sop = %key, identifier = %identifier, phase = %phase, "Reconciling SOP");

    let Some(action) = resolved else {
        error!(
            sop = %key,
            identifier = %identifier,
            known = ?ctx.registry.identifiers(),
            "Unknown SOP identifier"
        );
        return PassResult::done(UNKNOWN_ACTION, "unknown_identifier");
    };

    match action.kind() {
        ActionKind::OneShot => {
            let outcome = action.execute(ctx.cluster.as_ref()).await;
            info!(sop = %key, identifier = %identifier, outcome = %outcome, "SOP action executed");
            PassResult::done(&identifier, "executed")
        }
        ActionKind::VerifiedRollout => verify_rollout(key, sop, action.as_ref(), ctx).await,
    }
}

async fn verify_rollout(
    key: &ObjectKey,
    sop: Sop,
    action: &dyn SopAction,
    ctx: &Context,
) -> PassResult {
    let identifier = action.identifier().to_string();
    let mut sop = sop;

    // Persist in progress before executing so later passes observe it
    if sop.phase() != Phase::InProgress {
        let message = format!("Running {}", identifier);
        match write_phase(ctx, &sop, Phase::InProgress, message).await {
            Ok(updated) => sop = updated,
            Err(e) => warn!(
                sop = %key,
                error = %e,
                "Failed to mark SOP in progress, continuing"
            ),
        }
    }

    match action.execute(ctx.cluster.as_ref()).await {
        Outcome::Ready => {
            let message = format!("{} completed", identifier);
            match write_phase(ctx, &sop, Phase::Complete, message).await {
                Ok(_) => {
                    info!(sop = %key, identifier = %identifier, "SOP complete");
                    PassResult::done(&identifier, "complete")
                }
                Err(e) => {
                    error!(
                        sop = %key,
                        error = %e,
                        "Failed to mark SOP complete, will verify again"
                    );
                    PassResult::requeue(&identifier, "write_failed", ctx.requeue_delay)
                }
            }
        }
        Outcome::NotYetReady => {
            info!(
                sop = %key,
                identifier = %identifier,
                requeue_after = ?ctx.requeue_delay,
                "SOP not ready yet, requeueing"
            );
            PassResult::requeue(&identifier, "requeued", ctx.requeue_delay)
        }
        Outcome::Failed(reason) => {
            warn!(
                sop = %key,
                identifier = %identifier,
                reason = %reason,
                requeue_after = ?ctx.requeue_delay,
                "SOP action failed, requeueing"
            );
            PassResult::requeue(&identifier, "failed", ctx.requeue_delay)
        }
    }
}

/// Persist a forward phase transition
///
/// Returns the SOP as stored afterwards. A non-forward transition is skipped.
async fn write_phase(
    ctx: &Context,
    sop: &Sop,
    phase: Phase,
    message: String,
) -> Result<Sop, ClusterError> {
    let current = sop.phase();
    if !current.can_advance_to(phase) {
        warn!(
            sop = ?sop.name_any(),
            from = %current,
            to = %phase,
            "Refusing non-forward phase transition"
        );
        return Ok(sop.clone());
    }

    let status = SopStatus {
        phase,
        message: Some(message),
        last_transition_time: Some(ctx.clock.now().to_rfc3339()),
    };

    let updated = ctx.cluster.patch_procedure_status(sop, &status).await?;
    info!(sop = ?sop.name_any(), from = %current, to = %phase, "SOP phase updated");
    Ok(updated)
}

/// Reconcile entry point for `kube::runtime::Controller`
pub async fn reconcile(sop: Arc<Sop>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = sop.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let key = ObjectKey::new(&namespace, &sop.name_any());

    Ok(match reconcile_procedure(&key, &ctx).await {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

/// Error policy for the controller
///
/// Uses `warn!` since reconciliation errors trigger a retry after the fixed delay.
pub fn error_policy(sop: Arc<Sop>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(sop = ?sop.name_any(), error = %error, "Reconcile error (will retry)");
    Action::requeue(ctx.requeue_delay)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "reconcile_test.rs"]
mod tests;
