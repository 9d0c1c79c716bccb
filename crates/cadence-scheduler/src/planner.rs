//! Follow-up planner: once step n is SENT, queue step n+1 for the same
//! recipient a randomized number of days later.
//!
//! Follow-ups go through the send queue like everything else, so they are
//! subject to the same gates, lease and reply cancellation. Nothing is
//! queued past step 0 until multi-step sending is switched on.

use cadence_core::config::FollowUpConfig;
use cadence_core::error::Result;
use cadence_db::CadenceDb;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;

const CANDIDATE_LIMIT: u32 = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlannerReport {
    pub queued: u32,
    /// Enrollments moved to COMPLETED.
    pub completed: u32,
}

pub struct FollowUpPlanner {
    db: Arc<CadenceDb>,
    config: FollowUpConfig,
    multi_step_enabled: bool,
}

impl FollowUpPlanner {
    pub fn new(db: Arc<CadenceDb>, config: FollowUpConfig) -> Self {
        Self {
            db,
            config,
            multi_step_enabled: false,
        }
    }

    /// Mirror the send worker's `multi_step_enabled` switch.
    pub fn with_multi_step(mut self, enabled: bool) -> Self {
        self.multi_step_enabled = enabled;
        self
    }

    pub fn tick<R: Rng>(&self, rng: &mut R, now: DateTime<Utc>) -> Result<PlannerReport> {
        let (min, max) = self.config.delay_bounds_minutes();
        let mut report = PlannerReport::default();

        let candidates = if self.multi_step_enabled {
            self.db.follow_up_candidates(CANDIDATE_LIMIT)?
        } else {
            Vec::new()
        };
        for c in candidates {
            let due = c.sent_at + Duration::minutes(rng.gen_range(min..=max));
            let queued = self.db.enqueue_item(
                &c.tenant_id,
                &c.enrollment_id,
                &c.recipient_email,
                c.step_index + 1,
                Some(due),
                now,
            )?;
            if queued {
                report.queued += 1;
                tracing::debug!(
                    "🗓️ Step {} for {} due {}",
                    c.step_index + 1,
                    c.recipient_email,
                    due.to_rfc3339()
                );
            }
        }

        report.completed = self.db.complete_finished_enrollments(now)? as u32;
        if report.queued > 0 || report.completed > 0 {
            tracing::info!(
                "🗓️ Planner: queued {} follow-up(s), completed {} enrollment(s)",
                report.queued,
                report.completed
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Fixture, live_controls, t0, worker_config};
    use crate::worker::TickOptions;
    use cadence_core::config::WorkerConfig;
    use cadence_core::types::{EnrollmentStatus, QueueStatus};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn planner(fx: &Fixture) -> FollowUpPlanner {
        FollowUpPlanner::new(fx.db.clone(), FollowUpConfig::default()).with_multi_step(true)
    }

    #[tokio::test]
    async fn test_queues_next_step_within_delay_bounds() {
        let fx = Fixture::new(&["a@x.com", "b@x.com"]);
        fx.worker("w1", worker_config())
            .tick(&live_controls(), TickOptions::default(), t0())
            .await
            .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let report = planner(&fx).tick(&mut rng, t0()).unwrap();
        assert_eq!(report.queued, 2);
        assert_eq!(report.completed, 0);

        for item in fx.items().into_iter().filter(|i| i.step_index == 1) {
            assert_eq!(item.status, QueueStatus::Queued);
            let due = item.scheduled_for.unwrap();
            assert!(due >= t0() + Duration::days(2));
            assert!(due <= t0() + Duration::days(4));
        }

        // Idempotent: the successor exists now.
        let again = planner(&fx).tick(&mut rng, t0()).unwrap();
        assert_eq!(again.queued, 0);
    }

    #[tokio::test]
    async fn test_replied_recipient_gets_no_followup() {
        let fx = Fixture::new(&["a@x.com", "b@x.com"]);
        fx.worker("w1", worker_config())
            .tick(&live_controls(), TickOptions::default(), t0())
            .await
            .unwrap();
        fx.db.mark_recipient_replied(&fx.enrollment_id, "a@x.com", t0()).unwrap();

        let report = planner(&fx).tick(&mut StdRng::seed_from_u64(1), t0()).unwrap();
        assert_eq!(report.queued, 1);
        assert!(
            !fx.items()
                .iter()
                .any(|i| i.recipient_email == "a@x.com" && i.step_index == 1)
        );
    }

    #[tokio::test]
    async fn test_enrollment_completes_after_last_step() {
        let fx = Fixture::new(&["a@x.com"]);
        let config = WorkerConfig {
            multi_step_enabled: true,
            ..worker_config()
        };
        let worker = fx.worker("w1", config);
        let mut rng = StdRng::seed_from_u64(3);

        worker.tick(&live_controls(), TickOptions::default(), t0()).await.unwrap();
        planner(&fx).tick(&mut rng, t0()).unwrap();

        let later = t0() + Duration::days(5);
        worker.tick(&live_controls(), TickOptions::default(), later).await.unwrap();
        assert_eq!(fx.transport.sent_count(), 2);

        let report = planner(&fx).tick(&mut rng, later).unwrap();
        assert_eq!(report.queued, 0);
        assert_eq!(report.completed, 1);
        let enrollment = fx.db.get_enrollment(&fx.enrollment_id).unwrap().unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_nothing_queued_while_multi_step_disabled() {
        let fx = Fixture::new(&["a@x.com"]);
        fx.worker("w1", worker_config())
            .tick(&live_controls(), TickOptions::default(), t0())
            .await
            .unwrap();

        let disabled = FollowUpPlanner::new(fx.db.clone(), FollowUpConfig::default());
        let report = disabled.tick(&mut StdRng::seed_from_u64(5), t0()).unwrap();
        assert_eq!(report, PlannerReport::default());
        assert!(fx.items().iter().all(|i| i.step_index == 0));

        let enrollment = fx.db.get_enrollment(&fx.enrollment_id).unwrap().unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
    }
}
