//! # Cadence DB
//!
//! SQLite schema and data access for the outbound send scheduler.
//!
//! One `CadenceDb` wraps one connection. Several worker processes may open the
//! same file concurrently: WAL mode plus a busy timeout keeps them from
//! tripping over each other, and the queue claim is a conditional single-row
//! `UPDATE` so no cross-process lock is needed.
//!
//! All timestamps are stored as UTC epoch milliseconds.

mod audit;
mod controls;
mod directory;
mod enrollments;
mod queue;
mod sends;
mod suppression;

pub use queue::{ClaimRequest, EnrollmentQueueStatus, FollowUpCandidate, QueueCounts, Resolution};
pub use sends::{DailySlot, InboundRecorded, NewInbound, ReplyTarget};

use cadence_core::error::{CadenceError, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Cadence database handle.
pub struct CadenceDb {
    conn: Mutex<Connection>,
}

impl CadenceDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| CadenceError::db("DB open", e))?;

        // WAL lets several worker processes share the file; busy_timeout makes a
        // racing writer wait instead of failing with "database is locked".
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| CadenceError::db("DB pragma", e))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Open a private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::Database(format!("Lock poisoned: {e}")))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sender_identities (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                email TEXT NOT NULL,
                display_name TEXT,
                send_window_time_zone TEXT NOT NULL DEFAULT 'UTC',
                send_window_hours_start INTEGER NOT NULL DEFAULT 9,
                send_window_hours_end INTEGER NOT NULL DEFAULT 17,
                daily_send_limit INTEGER NOT NULL DEFAULT 50,
                is_active INTEGER NOT NULL DEFAULT 1,
                smtp_host TEXT NOT NULL DEFAULT '',
                smtp_port INTEGER NOT NULL DEFAULT 587,
                imap_host TEXT NOT NULL DEFAULT '',
                imap_port INTEGER NOT NULL DEFAULT 993,
                username TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                sender_identity_id TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sequence_steps (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL,
                step_order INTEGER NOT NULL,       -- 1-based
                subject TEXT NOT NULL,
                html_body TEXT NOT NULL,
                text_body TEXT,
                UNIQUE(sequence_id, step_order)
            );

            CREATE TABLE IF NOT EXISTS enrollments (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS enrollment_recipients (
                id TEXT PRIMARY KEY,
                enrollment_id TEXT NOT NULL,
                email TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                company TEXT,
                job_title TEXT,
                phone TEXT,
                external_id TEXT,
                replied_at INTEGER,
                reply_count INTEGER NOT NULL DEFAULT 0,
                bounced_at INTEGER,
                UNIQUE(enrollment_id, email)
            );

            CREATE TABLE IF NOT EXISTS outbound_send_queue (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                enrollment_id TEXT NOT NULL,
                recipient_email TEXT NOT NULL,
                step_index INTEGER NOT NULL,       -- 0-based
                status TEXT NOT NULL DEFAULT 'QUEUED',
                scheduled_for INTEGER,
                locked_at INTEGER,
                locked_by TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                sent_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(enrollment_id, recipient_email, step_index)
            );
            CREATE INDEX IF NOT EXISTS idx_queue_claim
                ON outbound_send_queue (status, scheduled_for);

            CREATE TABLE IF NOT EXISTS outbound_sends (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                queue_item_id TEXT NOT NULL UNIQUE,
                sender_identity_id TEXT NOT NULL,
                enrollment_id TEXT NOT NULL,
                recipient_email TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                subject TEXT NOT NULL,
                provider_message_id TEXT,
                thread_id TEXT,
                sent_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sends_identity_time
                ON outbound_sends (sender_identity_id, sent_at);
            CREATE INDEX IF NOT EXISTS idx_sends_thread
                ON outbound_sends (sender_identity_id, thread_id);
            CREATE INDEX IF NOT EXISTS idx_sends_message
                ON outbound_sends (provider_message_id);

            CREATE TABLE IF NOT EXISTS send_slot_reservations (
                queue_item_id TEXT PRIMARY KEY,
                sender_identity_id TEXT NOT NULL,
                reserved_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_identity_time
                ON send_slot_reservations (sender_identity_id, reserved_at);

            CREATE TABLE IF NOT EXISTS inbound_messages (
                sender_identity_id TEXT NOT NULL,
                provider_message_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                thread_id TEXT,
                from_email TEXT NOT NULL,
                to_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                body_preview TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                correlated_send_id TEXT,
                correlation TEXT,                  -- header, thread, heuristic
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (sender_identity_id, provider_message_id)
            );

            CREATE TABLE IF NOT EXISTS suppression_entries (
                tenant_id TEXT NOT NULL,
                type TEXT NOT NULL,                -- email, domain
                value TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, type, value)
            );

            CREATE TABLE IF NOT EXISTS enrollment_audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                enrollment_id TEXT NOT NULL,
                recipient_email TEXT NOT NULL,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}',
                occurred_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_enrollment
                ON enrollment_audit_events (enrollment_id, id);

            -- The audit trail is append-only.
            CREATE TRIGGER IF NOT EXISTS audit_no_update
                BEFORE UPDATE ON enrollment_audit_events
                BEGIN SELECT RAISE(ABORT, 'audit events are append-only'); END;
            CREATE TRIGGER IF NOT EXISTS audit_no_delete
                BEFORE DELETE ON enrollment_audit_events
                BEGIN SELECT RAISE(ABORT, 'audit events are append-only'); END;

            CREATE TABLE IF NOT EXISTS platform_configs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL
            );
        ",
        )
        .map_err(|e| CadenceError::db("Migration", e))?;
        Ok(())
    }
}

// ─── Row helpers ──────────────────────────────────────────

pub(crate) fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

/// Parse a TEXT column into a `FromStr` domain enum inside a row mapper.
pub(crate) fn parse_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = CadenceError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use cadence_core::types::{MailboxCredentials, NewRecipient, SenderIdentity};
    use chrono::TimeZone;

    pub fn temp_db() -> CadenceDb {
        CadenceDb::open_in_memory().unwrap()
    }

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    pub fn identity(tenant_id: &str) -> SenderIdentity {
        SenderIdentity {
            id: "sid-1".into(),
            tenant_id: tenant_id.into(),
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

    /// Tenant `t1`, identity `sid-1`, a one-step sequence and an enrollment
    /// with the given recipients. Returns the enrollment id.
    pub fn seed(db: &CadenceDb, emails: &[&str]) -> String {
        db.create_tenant("t1", "Acme").unwrap();
        db.upsert_sender_identity(&identity("t1"), t0()).unwrap();
        let seq = db.create_sequence("t1", "Intro", Some("sid-1"), t0()).unwrap();
        db.add_sequence_step(&seq.id, 1, "Hi {{firstName}}", "<p>Hello</p>", None)
            .unwrap();
        let recipients: Vec<NewRecipient> = emails.iter().map(|e| NewRecipient::email(e)).collect();
        db.create_enrollment("t1", &seq.id, "Batch 1", &recipients, t0())
            .unwrap()
            .id
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::t0;
    use super::*;

    #[test]
    fn test_open_and_migrate_twice() {
        let dir = std::env::temp_dir().join(format!("cadence-db-migrate-{}", new_id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cadence.db");
        drop(CadenceDb::open(&path).unwrap());
        // Re-opening runs the idempotent migrations again.
        let db = CadenceDb::open(&path).unwrap();
        assert!(db.recent_audit(10).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_ms_round_trip() {
        let now = t0();
        assert_eq!(from_ms(to_ms(now)), now);
        assert_eq!(opt_from_ms(None), None);
    }
}
