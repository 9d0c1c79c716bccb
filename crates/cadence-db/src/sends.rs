//! Outbound send log and inbound message records.
//!
//! `outbound_sends` is both the daily-cap counter and the correlation target
//! for reply detection; `inbound_messages` de-duplicates polled mail.
//! `send_slot_reservations` holds cap slots taken by items still in flight.

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{AuditEvent, OutboundSend, normalize_email};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::audit::insert_audit;
use crate::enrollments::apply_reply;
use crate::{CadenceDb, from_ms, to_ms};

const SEND_SELECT: &str = "SELECT id, tenant_id, queue_item_id, sender_identity_id, enrollment_id, \
     recipient_email, step_index, subject, provider_message_id, thread_id, sent_at FROM outbound_sends";

fn row_to_send(row: &rusqlite::Row) -> rusqlite::Result<OutboundSend> {
    Ok(OutboundSend {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        queue_item_id: row.get(2)?,
        sender_identity_id: row.get(3)?,
        enrollment_id: row.get(4)?,
        recipient_email: row.get(5)?,
        step_index: row.get(6)?,
        subject: row.get(7)?,
        provider_message_id: row.get(8)?,
        thread_id: row.get(9)?,
        sent_at: from_ms(row.get(10)?),
    })
}

/// An inbound message as recorded after correlation.
#[derive(Debug, Clone)]
pub struct NewInbound {
    pub sender_identity_id: String,
    pub provider_message_id: String,
    pub tenant_id: String,
    pub thread_id: Option<String>,
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    pub body_preview: String,
    pub received_at: DateTime<Utc>,
    pub correlated_send_id: Option<String>,
    /// `header`, `thread` or `heuristic`.
    pub correlation: Option<String>,
}

/// The recipient an inbound message replies to, with the audit row for
/// either outcome.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    pub enrollment_id: String,
    pub recipient_email: String,
    pub replied_at: DateTime<Utc>,
    pub first_reply: AuditEvent,
    pub additional_reply: AuditEvent,
}

/// What [`CadenceDb::record_inbound`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRecorded {
    /// Already recorded by an earlier poll; nothing changed.
    Duplicate,
    /// Stored without a reply target.
    Stored,
    FirstReply,
    AdditionalReply,
}

fn insert_inbound_row(conn: &Connection, msg: &NewInbound, now: DateTime<Utc>) -> Result<bool> {
    let n = conn
        .execute(
            "INSERT OR IGNORE INTO inbound_messages
             (sender_identity_id, provider_message_id, tenant_id, thread_id, from_email,
              to_email, subject, body_preview, received_at, correlated_send_id, correlation,
              recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                msg.sender_identity_id,
                msg.provider_message_id,
                msg.tenant_id,
                msg.thread_id,
                normalize_email(&msg.from_email),
                msg.to_email,
                msg.subject,
                msg.body_preview,
                to_ms(msg.received_at),
                msg.correlated_send_id,
                msg.correlation,
                to_ms(now),
            ],
        )
        .map_err(|e| CadenceError::db("Insert inbound", e))?;
    Ok(n == 1)
}

/// Result of [`CadenceDb::reserve_daily_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySlot {
    pub granted: bool,
    /// Sends plus open reservations counted against today's limit, excluding
    /// the caller's own item.
    pub used: u32,
}

/// Drop the cap reservation held for a queue item.
pub(crate) fn release_daily_slot(conn: &Connection, queue_item_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM send_slot_reservations WHERE queue_item_id = ?1",
        params![queue_item_id],
    )
    .map_err(|e| CadenceError::db("Release daily slot", e))?;
    Ok(())
}

impl CadenceDb {
    /// Take one of the identity's sends for the day starting at `day_start`.
    ///
    /// Counting and reserving happen under one write lock, so two workers
    /// racing for the last slot cannot both get it. The reservation is
    /// released when the item is resolved; a recorded send takes its place.
    pub fn reserve_daily_slot(
        &self,
        sender_identity_id: &str,
        queue_item_id: &str,
        day_start: DateTime<Utc>,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<DailySlot> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CadenceError::db("Begin reserve", e))?;
        let used: u32 = tx
            .query_row(
                "SELECT
                   (SELECT COUNT(*) FROM outbound_sends
                     WHERE sender_identity_id = ?1 AND sent_at >= ?2)
                 + (SELECT COUNT(*) FROM send_slot_reservations
                     WHERE sender_identity_id = ?1 AND reserved_at >= ?2 AND queue_item_id != ?3)",
                params![sender_identity_id, to_ms(day_start), queue_item_id],
                |row| row.get(0),
            )
            .map_err(|e| CadenceError::db("Count daily slots", e))?;
        let granted = used < limit;
        if granted {
            tx.execute(
                "INSERT INTO send_slot_reservations (queue_item_id, sender_identity_id, reserved_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(queue_item_id) DO UPDATE SET
                   sender_identity_id = excluded.sender_identity_id,
                   reserved_at = excluded.reserved_at",
                params![queue_item_id, sender_identity_id, to_ms(now)],
            )
            .map_err(|e| CadenceError::db("Reserve daily slot", e))?;
        } else {
            release_daily_slot(&tx, queue_item_id)?;
        }
        tx.commit().map_err(|e| CadenceError::db("Commit reserve", e))?;
        Ok(DailySlot { granted, used })
    }

    pub fn find_send_by_queue_item(&self, queue_item_id: &str) -> Result<Option<OutboundSend>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{SEND_SELECT} WHERE queue_item_id = ?1"),
            params![queue_item_id],
            row_to_send,
        )
        .optional()
        .map_err(|e| CadenceError::db("Find send", e))
    }

    /// Send recorded under a provider message id, scoped to an identity.
    pub fn find_send_by_message_id(
        &self,
        sender_identity_id: &str,
        message_id: &str,
    ) -> Result<Option<OutboundSend>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "{SEND_SELECT} WHERE sender_identity_id = ?1 AND provider_message_id = ?2
                 ORDER BY sent_at DESC LIMIT 1"
            ),
            params![sender_identity_id, message_id],
            row_to_send,
        )
        .optional()
        .map_err(|e| CadenceError::db("Find send by message id", e))
    }

    /// Latest send in a provider thread for an identity.
    pub fn find_send_by_thread(
        &self,
        sender_identity_id: &str,
        thread_id: &str,
    ) -> Result<Option<OutboundSend>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "{SEND_SELECT} WHERE sender_identity_id = ?1 AND thread_id = ?2
                 ORDER BY sent_at DESC LIMIT 1"
            ),
            params![sender_identity_id, thread_id],
            row_to_send,
        )
        .optional()
        .map_err(|e| CadenceError::db("Find send by thread", e))
    }

    /// Latest send from an identity to a recipient.
    pub fn latest_send_to(
        &self,
        sender_identity_id: &str,
        recipient_email: &str,
    ) -> Result<Option<OutboundSend>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "{SEND_SELECT} WHERE sender_identity_id = ?1 AND recipient_email = ?2
                 ORDER BY sent_at DESC LIMIT 1"
            ),
            params![sender_identity_id, normalize_email(recipient_email)],
            row_to_send,
        )
        .optional()
        .map_err(|e| CadenceError::db("Latest send", e))
    }

    /// Record an inbound message. Returns false if it was already recorded.
    pub fn insert_inbound(&self, msg: &NewInbound, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        insert_inbound_row(&conn, msg, now)
    }

    /// Record an inbound message and, when it answers a send, the recipient's
    /// reply state and audit row. All or nothing: a failure leaves the
    /// message unrecorded so the next poll retries it.
    pub fn record_inbound(
        &self,
        msg: &NewInbound,
        reply: Option<&ReplyTarget>,
        now: DateTime<Utc>,
    ) -> Result<InboundRecorded> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| CadenceError::db("Begin inbound", e))?;
        if !insert_inbound_row(&tx, msg, now)? {
            return Ok(InboundRecorded::Duplicate);
        }
        let recorded = match reply {
            None => InboundRecorded::Stored,
            Some(target) => {
                let first = apply_reply(&tx, &target.enrollment_id, &target.recipient_email, target.replied_at)?;
                if first {
                    insert_audit(&tx, &target.first_reply)?;
                    InboundRecorded::FirstReply
                } else {
                    insert_audit(&tx, &target.additional_reply)?;
                    InboundRecorded::AdditionalReply
                }
            }
        };
        tx.commit().map_err(|e| CadenceError::db("Commit inbound", e))?;
        Ok(recorded)
    }

    pub fn inbound_exists(&self, sender_identity_id: &str, provider_message_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM inbound_messages
                            WHERE sender_identity_id = ?1 AND provider_message_id = ?2)",
            params![sender_identity_id, provider_message_id],
            |row| row.get(0),
        )
        .map_err(|e| CadenceError::db("Check inbound", e))
    }
}
