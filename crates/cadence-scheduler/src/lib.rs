//! # Cadence Scheduler
//!
//! The periodic workers that turn enrollments into delivered email.
//!
//! ## Architecture
//! ```text
//! engine (tokio interval loops)
//!   ├── SendQueueWorker   every 60s   claim → gates → render → dispatch → audit
//!   ├── ReplyWorker       every 300s  poll inboxes → correlate → mark replied
//!   └── FollowUpPlanner   every 300s  SENT step n → queue step n+1 (delayed)
//! ```
//!
//! The outbound send queue is the only dispatch path. Follow-ups are queue
//! items like any other, so the lease claim is the single guard against
//! sending the same recipient/step twice.

pub mod engine;
pub mod planner;
pub mod render;
pub mod reply;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::{spawn_planner, spawn_reply_worker, spawn_send_worker};
pub use planner::{FollowUpPlanner, PlannerReport};
pub use reply::{ReplyReport, ReplyWorker};
pub use worker::{SendQueueWorker, TickOptions, TickReport};

/// Lease owner id: `{hostname}-{pid}-{short uuid}`.
pub fn worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into());
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &short[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_is_unique_per_call() {
        let a = worker_id();
        let b = worker_id();
        assert_ne!(a, b);
        assert!(a.contains(&format!("-{}-", std::process::id())));
    }
}
