use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// SOP is a Custom Resource describing a standard operating procedure to run
/// against the cluster
///
/// The controller picks an action by `spec.identifier` and records progress in
/// `status.phase`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "app.integreatly.org",
    version = "v1alpha1",
    kind = "SOP",
    root = "Sop",
    plural = "sops",
    namespaced,
    status = "SopStatus",
    printcolumn = r#"{"name":"Identifier", "type":"string", "jsonPath":".spec.identifier"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct SopSpec {
    /// Name of the procedure to run (e.g. "rhsso-upgrade")
    pub identifier: String,
}

/// Phase of a SOP
///
/// Serialized as the literal strings `""`, `"in progress"` and `"complete"`.
/// Phases only ever move forward.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
pub enum Phase {
    /// Not yet picked up by the controller
    #[default]
    #[serde(rename = "")]
    Pending,
    /// A verified action is running and being polled
    #[serde(rename = "in progress")]
    InProgress,
    /// Terminal. The SOP is never dispatched again.
    #[serde(rename = "complete")]
    Complete,
}

impl Phase {
    /// Literal value as stored on the resource
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "",
            Phase::InProgress => "in progress",
            Phase::Complete => "complete",
        }
    }

    /// Whether moving from `self` to `next` is a forward transition
    pub fn can_advance_to(&self, next: Phase) -> bool {
        next > *self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => f.write_str("pending"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Status of the SOP
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SopStatus {
    /// Current phase ("", "in progress", "complete")
    #[serde(default)]
    pub phase: Phase,

    /// Human-readable message for the last transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the phase last changed (RFC3339 format)
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Sop {
    /// Current phase, treating a missing status as Pending
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "sop_test.rs"]
mod tests;
