//! Enrollments and their recipients.

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{
    Enrollment, EnrollmentRecipient, EnrollmentStatus, NewRecipient, normalize_email,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;

use crate::{CadenceDb, from_ms, new_id, opt_from_ms, parse_col, to_ms};

const ENROLLMENT_SELECT: &str =
    "SELECT id, sequence_id, tenant_id, name, status, created_at, updated_at FROM enrollments";

const RECIPIENT_SELECT: &str = "SELECT id, enrollment_id, email, first_name, last_name, company, \
     job_title, phone, external_id, replied_at, reply_count, bounced_at FROM enrollment_recipients";

fn row_to_enrollment(row: &rusqlite::Row) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: row.get(0)?,
        sequence_id: row.get(1)?,
        tenant_id: row.get(2)?,
        name: row.get(3)?,
        status: parse_col(row, 4)?,
        created_at: from_ms(row.get(5)?),
        updated_at: from_ms(row.get(6)?),
    })
}

fn row_to_recipient(row: &rusqlite::Row) -> rusqlite::Result<EnrollmentRecipient> {
    Ok(EnrollmentRecipient {
        id: row.get(0)?,
        enrollment_id: row.get(1)?,
        email: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        company: row.get(5)?,
        job_title: row.get(6)?,
        phone: row.get(7)?,
        external_id: row.get(8)?,
        replied_at: opt_from_ms(row.get(9)?),
        reply_count: row.get(10)?,
        bounced_at: opt_from_ms(row.get(11)?),
    })
}

/// Reply bookkeeping on an open connection or transaction.
pub(crate) fn apply_reply(
    conn: &Connection,
    enrollment_id: &str,
    email: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let email = normalize_email(email);
    let first = conn
        .execute(
            "UPDATE enrollment_recipients SET replied_at = ?1, reply_count = reply_count + 1
             WHERE enrollment_id = ?2 AND email = ?3 AND replied_at IS NULL",
            params![to_ms(at), enrollment_id, email],
        )
        .map_err(|e| CadenceError::db("Mark replied", e))?;
    if first == 1 {
        return Ok(true);
    }
    conn.execute(
        "UPDATE enrollment_recipients SET reply_count = reply_count + 1
         WHERE enrollment_id = ?1 AND email = ?2",
        params![enrollment_id, email],
    )
    .map_err(|e| CadenceError::db("Count reply", e))?;
    Ok(false)
}

impl CadenceDb {
    /// Create an ACTIVE enrollment and queue step 0 for every recipient.
    ///
    /// Emails are normalised and de-duplicated; blank or `@`-less addresses
    /// are rejected. Step-0 items have no `scheduled_for` so they are due
    /// immediately. Everything happens in one transaction.
    pub fn create_enrollment(
        &self,
        tenant_id: &str,
        sequence_id: &str,
        name: &str,
        recipients: &[NewRecipient],
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(recipients.len());
        for r in recipients {
            let email = normalize_email(&r.email);
            if email.is_empty() || !email.contains('@') {
                return Err(CadenceError::Validation(format!(
                    "invalid recipient email '{}'",
                    r.email
                )));
            }
            if seen.insert(email.clone()) {
                unique.push((email, r));
            }
        }

        let enrollment = Enrollment {
            id: new_id(),
            sequence_id: sequence_id.to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            status: EnrollmentStatus::Active,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| CadenceError::db("Begin enrollment", e))?;
        tx.execute(
            "INSERT INTO enrollments (id, sequence_id, tenant_id, name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                enrollment.id,
                sequence_id,
                tenant_id,
                name,
                enrollment.status.as_str(),
                to_ms(now)
            ],
        )
        .map_err(|e| CadenceError::db("Insert enrollment", e))?;

        for (email, r) in &unique {
            tx.execute(
                "INSERT INTO enrollment_recipients
                 (id, enrollment_id, email, first_name, last_name, company, job_title, phone, external_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new_id(),
                    enrollment.id,
                    email,
                    r.first_name,
                    r.last_name,
                    r.company,
                    r.job_title,
                    r.phone,
                    r.external_id
                ],
            )
            .map_err(|e| CadenceError::db("Insert recipient", e))?;
            tx.execute(
                "INSERT INTO outbound_send_queue
                 (id, tenant_id, enrollment_id, recipient_email, step_index, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, 'QUEUED', ?5, ?5)",
                params![new_id(), tenant_id, enrollment.id, email, to_ms(now)],
            )
            .map_err(|e| CadenceError::db("Queue step 0", e))?;
        }

        tx.commit().map_err(|e| CadenceError::db("Commit enrollment", e))?;
        tracing::info!(
            "📋 Enrollment '{}' created with {} recipient(s)",
            name,
            unique.len()
        );
        Ok(enrollment)
    }

    pub fn get_enrollment(&self, id: &str) -> Result<Option<Enrollment>> {
        let conn = self.conn()?;
        conn.query_row(&format!("{ENROLLMENT_SELECT} WHERE id = ?1"), params![id], row_to_enrollment)
            .optional()
            .map_err(|e| CadenceError::db("Get enrollment", e))
    }

    /// Enrollment scoped to a tenant that is still active.
    pub fn get_enrollment_for_tenant(&self, tenant_id: &str, id: &str) -> Result<Option<Enrollment>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT e.id, e.sequence_id, e.tenant_id, e.name, e.status, e.created_at, e.updated_at
             FROM enrollments e JOIN tenants t ON t.id = e.tenant_id
             WHERE e.id = ?1 AND e.tenant_id = ?2 AND t.is_active = 1",
            params![id, tenant_id],
            row_to_enrollment,
        )
        .optional()
        .map_err(|e| CadenceError::db("Get enrollment", e))
    }

    /// Change an enrollment's lifecycle status. Returns false if it does not exist.
    pub fn set_enrollment_status(
        &self,
        id: &str,
        status: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE enrollments SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), to_ms(now), id],
            )
            .map_err(|e| CadenceError::db("Set enrollment status", e))?;
        if n > 0 {
            tracing::info!("📋 Enrollment {id} → {status}");
        }
        Ok(n > 0)
    }

    pub fn get_recipient(&self, enrollment_id: &str, email: &str) -> Result<Option<EnrollmentRecipient>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{RECIPIENT_SELECT} WHERE enrollment_id = ?1 AND email = ?2"),
            params![enrollment_id, normalize_email(email)],
            row_to_recipient,
        )
        .optional()
        .map_err(|e| CadenceError::db("Get recipient", e))
    }

    pub fn list_recipients(&self, enrollment_id: &str) -> Result<Vec<EnrollmentRecipient>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{RECIPIENT_SELECT} WHERE enrollment_id = ?1 ORDER BY email"))
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map(params![enrollment_id], row_to_recipient)
            .map_err(|e| CadenceError::db("Query recipients", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CadenceError::db("Scan recipients", e))?;
        Ok(rows)
    }

    /// Record a reply. `replied_at` keeps its first value; `reply_count` always
    /// increments. Returns true when this was the first reply.
    pub fn mark_recipient_replied(
        &self,
        enrollment_id: &str,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| CadenceError::db("Begin reply", e))?;
        let first = apply_reply(&tx, enrollment_id, email, at)?;
        tx.commit().map_err(|e| CadenceError::db("Commit reply", e))?;
        Ok(first)
    }

    /// Record a hard bounce; the first bounce time is kept.
    pub fn mark_recipient_bounced(
        &self,
        enrollment_id: &str,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE enrollment_recipients SET bounced_at = COALESCE(bounced_at, ?1)
             WHERE enrollment_id = ?2 AND email = ?3",
            params![to_ms(at), enrollment_id, normalize_email(email)],
        )
        .map_err(|e| CadenceError::db("Mark bounced", e))?;
        Ok(())
    }
}
