//! Shared fixtures for scheduler tests.

use crate::worker::SendQueueWorker;
use cadence_channels::MemoryTransport;
use cadence_core::config::{SendingControls, WorkerConfig};
use cadence_core::types::{
    AuditEvent, AuditEventType, MailboxCredentials, NewRecipient, QueueItem, SenderIdentity,
};
use cadence_db::CadenceDb;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;

/// Monday 2026-03-02 10:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
}

/// `sid-1` for tenant `t1`, always-open UTC window, 50/day.
pub fn identity() -> SenderIdentity {
    SenderIdentity {
        id: "sid-1".into(),
        tenant_id: "t1".into(),
        email: "sales@acme.test".into(),
        display_name: Some("Acme Sales".into()),
        send_window_time_zone: "UTC".into(),
        send_window_hours_start: 0,
        send_window_hours_end: 24,
        daily_send_limit: 50,
        is_active: true,
        mailbox: MailboxCredentials::default(),
    }
}

/// Everything switched on with `t1` as the canary tenant.
pub fn live_controls() -> SendingControls {
    SendingControls {
        sending_enabled: true,
        live_sending_enabled: true,
        canary_tenant_id: Some("t1".into()),
        canary_sender_identity_id: None,
    }
}

/// Full batch, every claimed item live.
pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        batch_size: 50,
        live_send_cap: 50,
        ..Default::default()
    }
}

pub struct Fixture {
    pub db: Arc<CadenceDb>,
    pub transport: Arc<MemoryTransport>,
    pub sequence_id: String,
    pub enrollment_id: String,
}

impl Fixture {
    /// Tenant `t1`, [`identity`], a two-step sequence and one enrollment.
    pub fn new(emails: &[&str]) -> Self {
        Self::build(identity(), emails, true)
    }

    pub fn with_identity(identity: SenderIdentity, emails: &[&str]) -> Self {
        Self::build(identity, emails, true)
    }

    /// Same as [`Fixture::new`] but the sequence has no step templates.
    pub fn without_steps(emails: &[&str]) -> Self {
        Self::build(identity(), emails, false)
    }

    /// Same as [`Fixture::new`] on a database file at `path`.
    pub fn on_disk(path: &Path, emails: &[&str]) -> Self {
        Self::build_in(CadenceDb::open(path).unwrap(), identity(), emails, true)
    }

    fn build(identity: SenderIdentity, emails: &[&str], with_steps: bool) -> Self {
        Self::build_in(CadenceDb::open_in_memory().unwrap(), identity, emails, with_steps)
    }

    fn build_in(db: CadenceDb, identity: SenderIdentity, emails: &[&str], with_steps: bool) -> Self {
        db.create_tenant("t1", "Acme").unwrap();
        db.upsert_sender_identity(&identity, t0()).unwrap();
        let seq = db.create_sequence("t1", "Intro", Some(&identity.id), t0()).unwrap();
        if with_steps {
            db.add_sequence_step(&seq.id, 1, "Quick question", "<p>Hi {{firstName}}</p>", None)
                .unwrap();
            db.add_sequence_step(&seq.id, 2, "Following up", "<p>Bumping this</p>", None)
                .unwrap();
        }
        let recipients: Vec<NewRecipient> = emails.iter().map(|e| NewRecipient::email(e)).collect();
        let enrollment = db
            .create_enrollment("t1", &seq.id, "Batch 1", &recipients, t0())
            .unwrap();
        Self {
            db: Arc::new(db),
            transport: Arc::new(MemoryTransport::new()),
            sequence_id: seq.id,
            enrollment_id: enrollment.id,
        }
    }

    pub fn worker(&self, worker_id: &str, config: WorkerConfig) -> SendQueueWorker {
        SendQueueWorker::new(self.db.clone(), self.transport.clone(), config).with_worker_id(worker_id)
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.db.list_queue_for_enrollment(&self.enrollment_id).unwrap()
    }

    pub fn audit(&self) -> Vec<AuditEvent> {
        self.db.list_audit_for_enrollment(&self.enrollment_id).unwrap()
    }

    pub fn audit_types(&self) -> Vec<AuditEventType> {
        self.audit().into_iter().map(|e| e.event_type).collect()
    }
}
