//! Background loops for the scheduler workers.
//! Uses tokio::interval; each loop runs forever and never lets one failed
//! tick stop the next.

use cadence_core::config::SendingControls;
use cadence_db::CadenceDb;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::planner::FollowUpPlanner;
use crate::reply::ReplyWorker;
use crate::worker::{SendQueueWorker, TickOptions};

/// Run the send queue worker every `tick_secs`.
///
/// Sending controls are re-read from the database on every tick, falling back
/// to `defaults` for keys that were never saved.
pub async fn spawn_send_worker(
    worker: Arc<SendQueueWorker>,
    db: Arc<CadenceDb>,
    defaults: SendingControls,
) {
    let every = worker.config().tick_secs.max(1);
    tracing::info!("📬 Send worker {} started (every {}s)", worker.worker_id(), every);

    let mut interval = tokio::time::interval(Duration::from_secs(every));
    loop {
        interval.tick().await;

        let controls = match db.load_sending_controls(&defaults) {
            Ok(controls) => controls,
            Err(e) => {
                tracing::error!("❌ Could not load sending controls: {e}");
                continue;
            }
        };
        if let Err(e) = worker.tick(&controls, TickOptions::default(), Utc::now()).await {
            tracing::error!("❌ Send tick failed: {e}");
        }
    }
}

/// Run reply detection every `tick_secs`.
pub async fn spawn_reply_worker(worker: Arc<ReplyWorker>, tick_secs: u64) {
    let every = tick_secs.max(1);
    tracing::info!("📨 Reply worker started (every {}s)", every);

    let mut interval = tokio::time::interval(Duration::from_secs(every));
    loop {
        interval.tick().await;
        if let Err(e) = worker.tick(Utc::now()).await {
            tracing::error!("❌ Reply pass failed: {e}");
        }
    }
}

/// Run the follow-up planner every `tick_secs`.
pub async fn spawn_planner(planner: Arc<FollowUpPlanner>, tick_secs: u64) {
    let every = tick_secs.max(1);
    tracing::info!("🗓️ Follow-up planner started (every {}s)", every);

    let mut interval = tokio::time::interval(Duration::from_secs(every));
    loop {
        interval.tick().await;
        if let Err(e) = planner.tick(&mut rand::thread_rng(), Utc::now()) {
            tracing::error!("❌ Planner tick failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Fixture, live_controls, worker_config};
    use cadence_core::config::WorkerConfig;

    #[tokio::test(start_paused = true)]
    async fn test_send_loop_uses_saved_controls() {
        let fx = Fixture::new(&["bob@x.com"]);
        fx.db.save_sending_controls(&live_controls(), Utc::now()).unwrap();
        let config = WorkerConfig {
            tick_secs: 1,
            ..worker_config()
        };
        let worker = Arc::new(fx.worker("w1", config));

        let handle = tokio::spawn(spawn_send_worker(worker, fx.db.clone(), SendingControls::default()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.abort();

        assert_eq!(fx.transport.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_closed_defaults_send_nothing() {
        let fx = Fixture::new(&["bob@x.com"]);
        let worker = Arc::new(fx.worker("w1", worker_config()));

        let handle = tokio::spawn(spawn_send_worker(worker, fx.db.clone(), SendingControls::default()));
        tokio::time::sleep(Duration::from_secs(90)).await;
        handle.abort();

        assert_eq!(fx.transport.sent_count(), 0);
        let item = &fx.items()[0];
        assert_eq!(item.status, cadence_core::types::QueueStatus::Queued);
        assert!(item.scheduled_for.is_some());
    }
}
