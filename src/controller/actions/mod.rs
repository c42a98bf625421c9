//! SOP actions and the registry that maps identifiers to them
//!
//! Each procedure a SOP can request implements the `SopAction` trait:
//! - BackupRequestAction: one-shot backup requests ("3scale-backup", "amq-backup")
//! - RollingImageVerificationAction: pre-pulls an image on every worker node and
//!   polls until all of them report the pull ("rhsso-upgrade")
//!
//! The reconciler only ever talks to the registry, so adding a procedure is a
//! registration, not a change to the reconcile loop.

pub mod backup;
pub mod image_pull;

use crate::config::ControllerConfig;
use crate::controller::cluster::ClusterApi;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of a single `execute` pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The procedure has finished
    Ready,
    /// Still converging; poll again later
    NotYetReady,
    /// The pass failed for the given reason
    Failed(String),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Ready => f.write_str("ready"),
            Outcome::NotYetReady => f.write_str("not yet ready"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// How the reconciler tracks an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Executed once per dispatch; no phase tracking, no requeue
    OneShot,
    /// Drives the SOP through in progress → complete, polled via requeue
    VerifiedRollout,
}

/// A procedure the controller can run on behalf of a SOP
///
/// Implementations must be idempotent: the same SOP may be dispatched many
/// times, and concurrently from more than one controller process.
#[async_trait]
pub trait SopAction: Send + Sync {
    /// Identifier matched against `spec.identifier`
    fn identifier(&self) -> &str;

    fn kind(&self) -> ActionKind;

    /// Run one pass. Store failures are reported as `Outcome::Failed`.
    async fn execute(&self, cluster: &dyn ClusterApi) -> Outcome;
}

/// Lookup table from identifier to action
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn SopAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock actions
    pub fn standard(config: &ControllerConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(backup::BackupRequestAction::three_scale()));
        registry.register(Arc::new(backup::BackupRequestAction::amq()));
        registry.register(Arc::new(image_pull::RollingImageVerificationAction::new(
            image_pull::RHSSO_UPGRADE,
            config.verification.clone(),
        )));
        registry
    }

    /// Register an action under its identifier, replacing any previous one
    pub fn register(&mut self, action: Arc<dyn SopAction>) {
        self.actions.insert(action.identifier().to_string(), action);
    }

    pub fn resolve(&self, identifier: &str) -> Option<Arc<dyn SopAction>> {
        self.actions.get(identifier).cloned()
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }
}
