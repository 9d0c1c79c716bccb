//! # Cadence Gateway
//!
//! Admin HTTP API: sending controls, manual worker triggers, enrollment
//! status changes, suppression entries, and the queue/audit views polled by
//! the CRM UI.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
