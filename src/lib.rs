//! SOP operator
//!
//! Watches `SOP` custom resources and runs the procedure each one names,
//! tracking progress in `status.phase`.

pub mod config;
pub mod controller;
pub mod crd;
pub mod server;
