//! Outbound send queue: lease-based claim and conditional resolution.
//!
//! A claim is a per-row compare-and-set: the `UPDATE` repeats the
//! claimability predicate in its `WHERE` clause, so when two workers race for
//! the same row exactly one of them sees `changes() == 1`. Every resolution
//! is likewise conditional on `status = 'LOCKED' AND locked_by = <worker>`;
//! a worker whose lease was taken over gets `false` back and must not touch
//! the item again.

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{AuditEvent, OutboundSend, QueueItem, QueueStatus, normalize_email};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::audit::insert_audit;
use crate::sends::release_daily_slot;
use crate::{CadenceDb, from_ms, new_id, opt_from_ms, parse_col, to_ms};

const QUEUE_SELECT: &str = "SELECT id, tenant_id, enrollment_id, recipient_email, step_index, \
     status, scheduled_for, locked_at, locked_by, attempt_count, failure_count, sent_at, \
     last_error, created_at FROM outbound_send_queue";

/// Claimability predicate. `?1` = now, `?2` = lease expiry (now - lease).
const CLAIMABLE: &str = "(scheduled_for IS NULL OR scheduled_for <= ?1) AND (\
     (status = 'QUEUED' AND (locked_at IS NULL OR locked_at < ?2)) \
     OR (status = 'LOCKED' AND locked_at < ?2))";

/// SENT items whose recipient may still receive the next step and for which
/// that step is defined but not yet queued. Expects aliases `q` and `e`.
const FOLLOW_UP_PENDING: &str = "q.status = 'SENT'
     AND EXISTS (SELECT 1 FROM enrollment_recipients r
                 WHERE r.enrollment_id = q.enrollment_id AND r.email = q.recipient_email
                   AND r.replied_at IS NULL AND r.bounced_at IS NULL)
     AND EXISTS (SELECT 1 FROM sequence_steps s
                 WHERE s.sequence_id = e.sequence_id AND s.step_order = q.step_index + 2)
     AND NOT EXISTS (SELECT 1 FROM outbound_send_queue n
                     WHERE n.enrollment_id = q.enrollment_id
                       AND n.recipient_email = q.recipient_email
                       AND n.step_index = q.step_index + 1)";

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        enrollment_id: row.get(2)?,
        recipient_email: row.get(3)?,
        step_index: row.get(4)?,
        status: parse_col(row, 5)?,
        scheduled_for: opt_from_ms(row.get(6)?),
        locked_at: opt_from_ms(row.get(7)?),
        locked_by: row.get(8)?,
        attempt_count: row.get(9)?,
        failure_count: row.get(10)?,
        sent_at: opt_from_ms(row.get(11)?),
        last_error: row.get(12)?,
        created_at: from_ms(row.get(13)?),
    })
}

fn load_item(conn: &Connection, id: &str) -> Result<Option<QueueItem>> {
    conn.query_row(&format!("{QUEUE_SELECT} WHERE id = ?1"), params![id], row_to_item)
        .optional()
        .map_err(|e| CadenceError::db("Get queue item", e))
}

/// Parameters of one claim call.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: String,
    pub batch_size: u32,
    pub lease: Duration,
    pub now: DateTime<Utc>,
}

/// How a claimed item leaves the LOCKED state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Back to QUEUED. `retry_at` defers the next claim; `count_failure`
    /// bumps the transport failure counter.
    Requeue {
        reason: String,
        retry_at: Option<DateTime<Utc>>,
        count_failure: bool,
    },
    Sent,
    Failed {
        error: String,
        count_failure: bool,
    },
    Skipped {
        reason: String,
    },
}

/// Per-status item counts for one enrollment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: u32,
    pub locked: u32,
    pub sent: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Per-recipient queue view for UI polling.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentQueueStatus {
    pub enrollment_id: String,
    pub counts: QueueCounts,
    pub items: Vec<QueueItem>,
}

/// A sent step whose successor should be queued.
#[derive(Debug, Clone)]
pub struct FollowUpCandidate {
    pub queue_item_id: String,
    pub tenant_id: String,
    pub enrollment_id: String,
    pub recipient_email: String,
    /// Index of the step that was sent.
    pub step_index: u32,
    pub sent_at: DateTime<Utc>,
}

/// Conditional status update for a lease holder. Returns rows changed.
fn apply_resolution(
    conn: &Connection,
    worker_id: &str,
    item_id: &str,
    resolution: &Resolution,
    now: DateTime<Utc>,
) -> Result<usize> {
    let now_ms = to_ms(now);
    let res = match resolution {
        Resolution::Requeue {
            reason,
            retry_at,
            count_failure,
        } => conn.execute(
            "UPDATE outbound_send_queue
             SET status = 'QUEUED', locked_at = NULL, locked_by = NULL,
                 scheduled_for = COALESCE(?1, scheduled_for), last_error = ?2,
                 failure_count = failure_count + ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'LOCKED' AND locked_by = ?6",
            params![
                retry_at.map(to_ms),
                reason,
                *count_failure as i32,
                now_ms,
                item_id,
                worker_id
            ],
        ),
        Resolution::Sent => conn.execute(
            "UPDATE outbound_send_queue
             SET status = 'SENT', sent_at = ?1, locked_at = NULL, locked_by = NULL,
                 last_error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'LOCKED' AND locked_by = ?3",
            params![now_ms, item_id, worker_id],
        ),
        Resolution::Failed {
            error,
            count_failure,
        } => conn.execute(
            "UPDATE outbound_send_queue
             SET status = 'FAILED', locked_at = NULL, locked_by = NULL, last_error = ?1,
                 failure_count = failure_count + ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'LOCKED' AND locked_by = ?5",
            params![error, *count_failure as i32, now_ms, item_id, worker_id],
        ),
        Resolution::Skipped { reason } => conn.execute(
            "UPDATE outbound_send_queue
             SET status = 'SKIPPED', locked_at = NULL, locked_by = NULL, last_error = ?1,
                 updated_at = ?2
             WHERE id = ?3 AND status = 'LOCKED' AND locked_by = ?4",
            params![reason, now_ms, item_id, worker_id],
        ),
    };
    let changed = res.map_err(|e| CadenceError::db("Resolve queue item", e))?;
    // A SENT item keeps its slot: it was dispatched today either way.
    if changed == 1 && !matches!(resolution, Resolution::Sent) {
        release_daily_slot(conn, item_id)?;
    }
    Ok(changed)
}

impl CadenceDb {
    // ── Claim ───────────────────────────────────────────────

    /// Claim up to `batch_size` due items for `worker_id`.
    ///
    /// Due means: not scheduled in the future, QUEUED or holding an expired
    /// lease, and belonging to an ACTIVE enrollment. Each claimed item has
    /// `attempt_count` incremented. Order is `scheduled_for`, then `created_at`.
    pub fn claim_batch(&self, req: &ClaimRequest) -> Result<Vec<QueueItem>> {
        let now_ms = to_ms(req.now);
        let expiry_ms = to_ms(req.now - req.lease);
        let conn = self.conn()?;

        let candidates: Vec<String> = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT id FROM outbound_send_queue
                     WHERE {CLAIMABLE}
                       AND enrollment_id IN (SELECT id FROM enrollments WHERE status = 'ACTIVE')
                     ORDER BY scheduled_for ASC, created_at ASC
                     LIMIT ?3"
                ))
                .map_err(|e| CadenceError::db("Prepare claim", e))?;
            stmt.query_map(params![now_ms, expiry_ms, req.batch_size], |row| row.get(0))
                .map_err(|e| CadenceError::db("Select claimable", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| CadenceError::db("Scan claimable", e))?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE outbound_send_queue
                         SET status = 'LOCKED', locked_at = ?1, locked_by = ?3,
                             attempt_count = attempt_count + 1, updated_at = ?1
                         WHERE id = ?4 AND {CLAIMABLE}"
                    ),
                    params![now_ms, expiry_ms, req.worker_id, id],
                )
                .map_err(|e| CadenceError::db("Claim queue item", e))?;
            // Another worker won the row between SELECT and UPDATE.
            if changed != 1 {
                continue;
            }
            if let Some(item) = load_item(&conn, &id)? {
                claimed.push(item);
            }
        }

        if !claimed.is_empty() {
            tracing::debug!("🔒 {} claimed {} queue item(s)", req.worker_id, claimed.len());
        }
        Ok(claimed)
    }

    // ── Resolution ──────────────────────────────────────────

    /// Resolve a claimed item and append `audit` in the same transaction.
    /// Returns false if `worker_id` no longer holds the lease.
    pub fn resolve_item(
        &self,
        worker_id: &str,
        item_id: &str,
        resolution: &Resolution,
        audit: Option<&AuditEvent>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| CadenceError::db("Begin resolve", e))?;
        if apply_resolution(&tx, worker_id, item_id, resolution, now)? != 1 {
            tracing::warn!("⚠️ Lease lost on queue item {item_id} ({worker_id})");
            return Ok(false);
        }
        if let Some(event) = audit {
            insert_audit(&tx, event)?;
        }
        tx.commit().map_err(|e| CadenceError::db("Commit resolve", e))?;
        Ok(true)
    }

    pub fn requeue(
        &self,
        worker_id: &str,
        item_id: &str,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
        audit: Option<&AuditEvent>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let resolution = Resolution::Requeue {
            reason: reason.to_string(),
            retry_at,
            count_failure: false,
        };
        self.resolve_item(worker_id, item_id, &resolution, audit, now)
    }

    pub fn mark_sent(&self, worker_id: &str, item_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.resolve_item(worker_id, item_id, &Resolution::Sent, None, now)
    }

    pub fn mark_failed(
        &self,
        worker_id: &str,
        item_id: &str,
        error: &str,
        audit: Option<&AuditEvent>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let resolution = Resolution::Failed {
            error: error.to_string(),
            count_failure: false,
        };
        self.resolve_item(worker_id, item_id, &resolution, audit, now)
    }

    pub fn mark_skipped(
        &self,
        worker_id: &str,
        item_id: &str,
        reason: &str,
        audit: Option<&AuditEvent>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let resolution = Resolution::Skipped {
            reason: reason.to_string(),
        };
        self.resolve_item(worker_id, item_id, &resolution, audit, now)
    }

    /// Mark SENT, record the outbound send and its audit row atomically.
    pub fn complete_send(
        &self,
        worker_id: &str,
        send: &OutboundSend,
        audit: &AuditEvent,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| CadenceError::db("Begin complete", e))?;
        if apply_resolution(&tx, worker_id, &send.queue_item_id, &Resolution::Sent, send.sent_at)? != 1 {
            tracing::warn!(
                "⚠️ Lease lost before recording send of {} ({worker_id})",
                send.queue_item_id
            );
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO outbound_sends
             (id, tenant_id, queue_item_id, sender_identity_id, enrollment_id, recipient_email,
              step_index, subject, provider_message_id, thread_id, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                send.id,
                send.tenant_id,
                send.queue_item_id,
                send.sender_identity_id,
                send.enrollment_id,
                send.recipient_email,
                send.step_index,
                send.subject,
                send.provider_message_id,
                send.thread_id,
                to_ms(send.sent_at),
            ],
        )
        .map_err(|e| CadenceError::db("Record outbound send", e))?;
        release_daily_slot(&tx, &send.queue_item_id)?;
        insert_audit(&tx, audit)?;
        tx.commit().map_err(|e| CadenceError::db("Commit complete", e))?;
        Ok(true)
    }

    // ── Unclaimed transitions ───────────────────────────────

    /// QUEUED items whose recipient has replied or bounced, with the reason.
    pub fn stopped_recipient_items(&self, limit: u32) -> Result<Vec<(QueueItem, &'static str)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT q.id, q.tenant_id, q.enrollment_id, q.recipient_email, q.step_index,
                        q.status, q.scheduled_for, q.locked_at, q.locked_by, q.attempt_count,
                        q.failure_count, q.sent_at, q.last_error, q.created_at,
                        r.replied_at IS NOT NULL
                 FROM outbound_send_queue q
                 JOIN enrollment_recipients r
                   ON r.enrollment_id = q.enrollment_id AND r.email = q.recipient_email
                 WHERE q.status = 'QUEUED'
                   AND (r.replied_at IS NOT NULL OR r.bounced_at IS NOT NULL)
                 ORDER BY q.created_at
                 LIMIT ?1",
            )
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let item = row_to_item(row)?;
                let replied: bool = row.get(14)?;
                Ok((item, if replied { "replied" } else { "bounced" }))
            })
            .map_err(|e| CadenceError::db("Query stopped items", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CadenceError::db("Scan stopped items", e))?;
        Ok(rows)
    }

    /// QUEUED → SKIPPED for an item nobody holds. Returns false if the item
    /// was claimed or resolved in the meantime.
    pub fn skip_queued_item(
        &self,
        item_id: &str,
        reason: &str,
        audit: Option<&AuditEvent>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| CadenceError::db("Begin skip", e))?;
        let changed = tx
            .execute(
                "UPDATE outbound_send_queue SET status = 'SKIPPED', last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'QUEUED'",
                params![reason, to_ms(now), item_id],
            )
            .map_err(|e| CadenceError::db("Skip queue item", e))?;
        if changed != 1 {
            return Ok(false);
        }
        if let Some(event) = audit {
            insert_audit(&tx, event)?;
        }
        tx.commit().map_err(|e| CadenceError::db("Commit skip", e))?;
        Ok(true)
    }

    /// Queue a step for a recipient. Returns false if that step is already queued.
    pub fn enqueue_item(
        &self,
        tenant_id: &str,
        enrollment_id: &str,
        recipient_email: &str,
        step_index: u32,
        scheduled_for: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO outbound_send_queue
                 (id, tenant_id, enrollment_id, recipient_email, step_index, status,
                  scheduled_for, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'QUEUED', ?6, ?7, ?7)",
                params![
                    new_id(),
                    tenant_id,
                    enrollment_id,
                    normalize_email(recipient_email),
                    step_index,
                    scheduled_for.map(to_ms),
                    to_ms(now)
                ],
            )
            .map_err(|e| CadenceError::db("Enqueue item", e))?;
        Ok(n == 1)
    }

    // ── Follow-ups ──────────────────────────────────────────

    /// Sent steps in ACTIVE enrollments that still have a successor to queue.
    pub fn follow_up_candidates(&self, limit: u32) -> Result<Vec<FollowUpCandidate>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT q.id, q.tenant_id, q.enrollment_id, q.recipient_email, q.step_index,
                        q.sent_at
                 FROM outbound_send_queue q
                 JOIN enrollments e ON e.id = q.enrollment_id
                 WHERE e.status = 'ACTIVE' AND q.sent_at IS NOT NULL AND {FOLLOW_UP_PENDING}
                 ORDER BY q.sent_at
                 LIMIT ?1"
            ))
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(FollowUpCandidate {
                    queue_item_id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    enrollment_id: row.get(2)?,
                    recipient_email: row.get(3)?,
                    step_index: row.get(4)?,
                    sent_at: from_ms(row.get(5)?),
                })
            })
            .map_err(|e| CadenceError::db("Query follow-ups", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CadenceError::db("Scan follow-ups", e))?;
        Ok(rows)
    }

    /// ACTIVE → COMPLETED for enrollments with nothing left to send.
    pub fn complete_finished_enrollments(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                &format!(
                    "UPDATE enrollments SET status = 'COMPLETED', updated_at = ?1
                     WHERE status = 'ACTIVE'
                       AND EXISTS (SELECT 1 FROM outbound_send_queue q
                                   WHERE q.enrollment_id = enrollments.id)
                       AND NOT EXISTS (SELECT 1 FROM outbound_send_queue q
                                       WHERE q.enrollment_id = enrollments.id
                                         AND q.status IN ('QUEUED', 'LOCKED'))
                       AND NOT EXISTS (SELECT 1 FROM outbound_send_queue q
                                       JOIN enrollments e ON e.id = q.enrollment_id
                                       WHERE q.enrollment_id = enrollments.id
                                         AND {FOLLOW_UP_PENDING})"
                ),
                params![to_ms(now)],
            )
            .map_err(|e| CadenceError::db("Complete enrollments", e))?;
        Ok(n)
    }

    // ── Reads ───────────────────────────────────────────────

    pub fn get_queue_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let conn = self.conn()?;
        load_item(&conn, id)
    }

    pub fn list_queue_for_enrollment(&self, enrollment_id: &str) -> Result<Vec<QueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{QUEUE_SELECT} WHERE enrollment_id = ?1 ORDER BY recipient_email, step_index"
            ))
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map(params![enrollment_id], row_to_item)
            .map_err(|e| CadenceError::db("Query queue", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CadenceError::db("Scan queue", e))?;
        Ok(rows)
    }

    /// Counts plus every item of an enrollment.
    pub fn queue_status(&self, enrollment_id: &str) -> Result<EnrollmentQueueStatus> {
        Ok(EnrollmentQueueStatus {
            enrollment_id: enrollment_id.to_string(),
            counts: self.queue_counts(enrollment_id)?,
            items: self.list_queue_for_enrollment(enrollment_id)?,
        })
    }

    pub fn queue_counts(&self, enrollment_id: &str) -> Result<QueueCounts> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM outbound_send_queue
                 WHERE enrollment_id = ?1 GROUP BY status",
            )
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map(params![enrollment_id], |row| {
                Ok((parse_col::<QueueStatus>(row, 0)?, row.get::<_, u32>(1)?))
            })
            .map_err(|e| CadenceError::db("Count queue", e))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, n) = row.map_err(|e| CadenceError::db("Scan counts", e))?;
            match status {
                QueueStatus::Queued => counts.queued = n,
                QueueStatus::Locked => counts.locked = n,
                QueueStatus::Sent => counts.sent = n,
                QueueStatus::Failed => counts.failed = n,
                QueueStatus::Skipped => counts.skipped = n,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DailySlot;
    use crate::test_support::{seed, t0, temp_db};
    use cadence_core::types::{AuditEventType, EnrollmentStatus};
    use std::collections::HashSet;

    fn req(worker: &str, batch: u32, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            worker_id: worker.into(),
            batch_size: batch,
            lease: Duration::seconds(300),
            now,
        }
    }

    #[test]
    fn test_claim_locks_and_counts_attempts() {
        let db = temp_db();
        seed(&db, &["a@x.com", "b@x.com", "c@x.com"]);

        let items = db.claim_batch(&req("w1", 2, t0())).unwrap();
        assert_eq!(items.len(), 2);
        for item in &items {
            assert_eq!(item.status, QueueStatus::Locked);
            assert_eq!(item.locked_by.as_deref(), Some("w1"));
            assert_eq!(item.attempt_count, 1);
        }
        // Only the unclaimed one is left for a second worker.
        let rest = db.claim_batch(&req("w2", 10, t0())).unwrap();
        assert_eq!(rest.len(), 1);
        assert!(db.claim_batch(&req("w3", 10, t0())).unwrap().is_empty());
    }

    #[test]
    fn test_claim_skips_future_and_inactive() {
        let db = temp_db();
        let eid = seed(&db, &["a@x.com"]);
        db.enqueue_item("t1", &eid, "b@x.com", 0, Some(t0() + Duration::hours(1)), t0())
            .unwrap();

        let items = db.claim_batch(&req("w1", 10, t0())).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].recipient_email, "a@x.com");

        // Future item becomes due later, but not while the enrollment is paused.
        db.set_enrollment_status(&eid, EnrollmentStatus::Paused, t0()).unwrap();
        assert!(db.claim_batch(&req("w1", 10, t0() + Duration::hours(2))).unwrap().is_empty());
    }

    #[test]
    fn test_expired_lease_is_reclaimed_and_old_holder_loses() {
        let db = temp_db();
        seed(&db, &["a@x.com"]);
        let first = db.claim_batch(&req("w1", 1, t0())).unwrap();
        let id = first[0].id.clone();

        // Still leased one second before expiry.
        assert!(db.claim_batch(&req("w2", 1, t0() + Duration::seconds(299))).unwrap().is_empty());

        let later = t0() + Duration::seconds(301);
        let second = db.claim_batch(&req("w2", 1, later)).unwrap();
        assert_eq!(second[0].id, id);
        assert_eq!(second[0].attempt_count, 2);

        assert!(!db.mark_sent("w1", &id, later).unwrap(), "stale holder must not resolve");
        assert!(db.mark_sent("w2", &id, later).unwrap());
        assert_eq!(db.get_queue_item(&id).unwrap().unwrap().status, QueueStatus::Sent);
    }

    #[test]
    fn test_requeue_defers_and_counts_failures() {
        let db = temp_db();
        seed(&db, &["a@x.com"]);
        let item = db.claim_batch(&req("w1", 1, t0())).unwrap().remove(0);
        let retry_at = t0() + Duration::minutes(5);
        let resolution = Resolution::Requeue {
            reason: "smtp timeout".into(),
            retry_at: Some(retry_at),
            count_failure: true,
        };
        assert!(db.resolve_item("w1", &item.id, &resolution, None, t0()).unwrap());

        let stored = db.get_queue_item(&item.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Queued);
        assert_eq!(stored.failure_count, 1);
        assert_eq!(stored.scheduled_for, Some(retry_at));
        assert!(stored.locked_by.is_none());

        assert!(db.claim_batch(&req("w1", 1, t0())).unwrap().is_empty());
        assert_eq!(db.claim_batch(&req("w1", 1, retry_at)).unwrap().len(), 1);
    }

    #[test]
    fn test_resolution_writes_audit_atomically() {
        let db = temp_db();
        let eid = seed(&db, &["a@x.com"]);
        let item = db.claim_batch(&req("w1", 1, t0())).unwrap().remove(0);
        let event = AuditEvent::for_item(&item, AuditEventType::SendSkipped, "suppressed", t0());
        assert!(db.mark_skipped("w1", &item.id, "suppression", Some(&event), t0()).unwrap());
        // A lost lease writes no audit.
        assert!(!db.mark_failed("w1", &item.id, "late", Some(&event), t0()).unwrap());
        assert_eq!(db.list_audit_for_enrollment(&eid).unwrap().len(), 1);
    }

    #[test]
    fn test_complete_send_records_everything() {
        let db = temp_db();
        let eid = seed(&db, &["a@x.com"]);
        let item = db.claim_batch(&req("w1", 1, t0())).unwrap().remove(0);
        let send = OutboundSend {
            id: new_id(),
            tenant_id: "t1".into(),
            queue_item_id: item.id.clone(),
            sender_identity_id: "sid-1".into(),
            enrollment_id: eid.clone(),
            recipient_email: "a@x.com".into(),
            step_index: 0,
            subject: "Hi".into(),
            provider_message_id: Some("<m1@acme.test>".into()),
            thread_id: None,
            sent_at: t0(),
        };
        let event = AuditEvent::for_item(&item, AuditEventType::SendSucceeded, "sent", t0());
        assert!(db.complete_send("w1", &send, &event).unwrap());

        let stored = db.get_queue_item(&item.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Sent);
        assert_eq!(stored.sent_at, Some(t0()));
        assert!(db.find_send_by_queue_item(&item.id).unwrap().is_some());
        let status = db.queue_status(&eid).unwrap();
        assert_eq!(status.counts.sent, 1);
        assert_eq!(status.items.len(), 1);
    }

    #[test]
    fn test_daily_slot_held_until_resolved() {
        let db = temp_db();
        let eid = seed(&db, &["a@x.com", "b@x.com", "c@x.com"]);
        let items = db.claim_batch(&req("w1", 3, t0())).unwrap();
        let (a, b, c) = (&items[0], &items[1], &items[2]);
        let reserve = |id: &str| db.reserve_daily_slot("sid-1", id, t0(), 2, t0()).unwrap();

        assert!(reserve(&a.id).granted);
        assert!(reserve(&b.id).granted);
        // Nothing has been sent yet, but both slots are spoken for.
        let denied = reserve(&c.id);
        assert!(!denied.granted);
        assert_eq!(denied.used, 2);
        // Re-reserving after a reclaim does not count the item twice.
        assert_eq!(reserve(&a.id).used, 1);

        db.requeue("w1", &b.id, "retry", None, None, t0()).unwrap();
        assert!(reserve(&c.id).granted);

        let send = OutboundSend {
            id: new_id(),
            tenant_id: "t1".into(),
            queue_item_id: a.id.clone(),
            sender_identity_id: "sid-1".into(),
            enrollment_id: eid,
            recipient_email: a.recipient_email.clone(),
            step_index: 0,
            subject: "Hi".into(),
            provider_message_id: None,
            thread_id: None,
            sent_at: t0(),
        };
        let event = AuditEvent::for_item(a, AuditEventType::SendSucceeded, "sent", t0());
        assert!(db.complete_send("w1", &send, &event).unwrap());
        // The send replaces a's reservation; the day is still full.
        assert!(!reserve(&b.id).granted);
        let open: u32 = db
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM send_slot_reservations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(open, 1);

        let tomorrow = t0() + Duration::days(1);
        let next_day = db.reserve_daily_slot("sid-1", &b.id, tomorrow, 2, tomorrow).unwrap();
        assert_eq!(next_day, DailySlot { granted: true, used: 0 });
    }

    #[test]
    fn test_skip_queued_item_only_when_unclaimed() {
        let db = temp_db();
        let eid = seed(&db, &["a@x.com", "b@x.com"]);
        db.mark_recipient_replied(&eid, "a@x.com", t0()).unwrap();
        db.mark_recipient_bounced(&eid, "b@x.com", t0()).unwrap();

        let stopped = db.stopped_recipient_items(10).unwrap();
        assert_eq!(stopped.len(), 2);
        let reasons: HashSet<_> = stopped.iter().map(|(_, r)| *r).collect();
        assert!(reasons.contains("replied") && reasons.contains("bounced"));

        let (item, reason) = &stopped[0];
        assert!(db.skip_queued_item(&item.id, reason, None, t0()).unwrap());
        assert!(!db.skip_queued_item(&item.id, reason, None, t0()).unwrap());
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let db = temp_db();
        let eid = seed(&db, &["a@x.com"]);
        assert!(db.enqueue_item("t1", &eid, "a@x.com", 1, None, t0()).unwrap());
        assert!(!db.enqueue_item("t1", &eid, "A@x.com", 1, None, t0()).unwrap());
        assert_eq!(db.list_queue_for_enrollment(&eid).unwrap().len(), 2);
    }

    #[test]
    fn test_follow_up_candidates_and_completion() {
        let db = temp_db();
        let eid = seed(&db, &["a@x.com"]);
        let seq_id = db.get_enrollment(&eid).unwrap().unwrap().sequence_id;
        db.add_sequence_step(&seq_id, 2, "Bump", "<p>bump</p>", None).unwrap();

        let item = db.claim_batch(&req("w1", 1, t0())).unwrap().remove(0);
        db.mark_sent("w1", &item.id, t0()).unwrap();

        let candidates = db.follow_up_candidates(10).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].step_index, 0);
        assert_eq!(candidates[0].sent_at, t0());
        // Pending follow-up keeps the enrollment open.
        assert_eq!(db.complete_finished_enrollments(t0()).unwrap(), 0);

        db.enqueue_item("t1", &eid, "a@x.com", 1, Some(t0()), t0()).unwrap();
        assert!(db.follow_up_candidates(10).unwrap().is_empty());

        let next = db.claim_batch(&req("w1", 1, t0())).unwrap().remove(0);
        assert_eq!(next.step_index, 1);
        db.mark_sent("w1", &next.id, t0()).unwrap();
        assert_eq!(db.complete_finished_enrollments(t0()).unwrap(), 1);
        assert_eq!(
            db.get_enrollment(&eid).unwrap().unwrap().status,
            EnrollmentStatus::Completed
        );
    }

    #[test]
    fn test_concurrent_workers_never_share_an_item() {
        let dir = std::env::temp_dir().join(format!("cadence-claim-race-{}", new_id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cadence.db");

        let db_a = CadenceDb::open(&path).unwrap();
        let emails: Vec<String> = (0..40).map(|i| format!("r{i}@x.com")).collect();
        let refs: Vec<&str> = emails.iter().map(String::as_str).collect();
        seed(&db_a, &refs);
        let db_b = CadenceDb::open(&path).unwrap();

        let (mut a, b) = std::thread::scope(|s| {
            let ha = s.spawn(|| {
                let mut got = Vec::new();
                for _ in 0..5 {
                    got.extend(db_a.claim_batch(&req("wa", 5, t0())).unwrap());
                }
                got
            });
            let hb = s.spawn(|| {
                let mut got = Vec::new();
                for _ in 0..5 {
                    got.extend(db_b.claim_batch(&req("wb", 5, t0())).unwrap());
                }
                got
            });
            (ha.join().unwrap(), hb.join().unwrap())
        });
        // Whatever a lost race left behind is still claimable exactly once.
        a.extend(db_a.claim_batch(&req("wa", 50, t0())).unwrap());

        let ids_a: HashSet<_> = a.iter().map(|i| i.id.clone()).collect();
        let ids_b: HashSet<_> = b.iter().map(|i| i.id.clone()).collect();
        assert!(ids_a.is_disjoint(&ids_b));
        assert_eq!(ids_a.len() + ids_b.len(), 40);

        drop(db_a);
        drop(db_b);
        std::fs::remove_dir_all(&dir).ok();
    }
}
