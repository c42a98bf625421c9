pub mod actions;
pub mod cleanup;
pub mod clock;
pub mod cluster;
pub mod reconcile;

pub use reconcile::{error_policy, reconcile, reconcile_procedure, Context, ReconcileError};
