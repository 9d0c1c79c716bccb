//! Tenants, sender identities and sequences: read-only to the workers,
//! written by administrative flows.

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{MailboxCredentials, Sequence, SequenceStep, SenderIdentity, Tenant};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::{CadenceDb, new_id, to_ms};

/// Shared SELECT column list for sender identity queries.
const IDENTITY_SELECT: &str = "SELECT id, tenant_id, email, display_name, send_window_time_zone, \
     send_window_hours_start, send_window_hours_end, daily_send_limit, is_active, \
     smtp_host, smtp_port, imap_host, imap_port, username, password FROM sender_identities";

fn row_to_identity(row: &rusqlite::Row) -> rusqlite::Result<SenderIdentity> {
    Ok(SenderIdentity {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        send_window_time_zone: row.get(4)?,
        send_window_hours_start: row.get(5)?,
        send_window_hours_end: row.get(6)?,
        daily_send_limit: row.get(7)?,
        is_active: row.get::<_, i32>(8)? != 0,
        mailbox: MailboxCredentials {
            smtp_host: row.get(9)?,
            smtp_port: row.get(10)?,
            imap_host: row.get(11)?,
            imap_port: row.get(12)?,
            username: row.get(13)?,
            password: row.get(14)?,
        },
    })
}

impl CadenceDb {
    // ── Tenants ─────────────────────────────────────────────

    /// Create (or rename) a tenant.
    pub fn create_tenant(&self, id: &str, name: &str) -> Result<Tenant> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tenants (id, name, is_active, created_at) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![id, name, to_ms(Utc::now())],
        )
        .map_err(|e| CadenceError::db("Create tenant", e))?;
        Ok(Tenant {
            id: id.to_string(),
            name: name.to_string(),
            is_active: true,
        })
    }

    pub fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, is_active FROM tenants WHERE id = ?1",
            params![id],
            |row| {
                Ok(Tenant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    is_active: row.get::<_, i32>(2)? != 0,
                })
            },
        )
        .optional()
        .map_err(|e| CadenceError::db("Get tenant", e))
    }

    pub fn set_tenant_active(&self, id: &str, active: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tenants SET is_active = ?1 WHERE id = ?2",
            params![active as i32, id],
        )
        .map_err(|e| CadenceError::db("Update tenant", e))?;
        Ok(())
    }

    // ── Sender identities ───────────────────────────────────

    /// Insert or replace a sender identity (connect/reconnect flow).
    pub fn upsert_sender_identity(&self, identity: &SenderIdentity, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sender_identities
             (id, tenant_id, email, display_name, send_window_time_zone, send_window_hours_start,
              send_window_hours_end, daily_send_limit, is_active, smtp_host, smtp_port,
              imap_host, imap_port, username, password, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id, email = excluded.email,
                display_name = excluded.display_name,
                send_window_time_zone = excluded.send_window_time_zone,
                send_window_hours_start = excluded.send_window_hours_start,
                send_window_hours_end = excluded.send_window_hours_end,
                daily_send_limit = excluded.daily_send_limit, is_active = excluded.is_active,
                smtp_host = excluded.smtp_host, smtp_port = excluded.smtp_port,
                imap_host = excluded.imap_host, imap_port = excluded.imap_port,
                username = excluded.username, password = excluded.password,
                updated_at = excluded.updated_at",
            params![
                identity.id,
                identity.tenant_id,
                identity.email,
                identity.display_name,
                identity.send_window_time_zone,
                identity.send_window_hours_start,
                identity.send_window_hours_end,
                identity.daily_send_limit,
                identity.is_active as i32,
                identity.mailbox.smtp_host,
                identity.mailbox.smtp_port,
                identity.mailbox.imap_host,
                identity.mailbox.imap_port,
                identity.mailbox.username,
                identity.mailbox.password,
                to_ms(now),
            ],
        )
        .map_err(|e| CadenceError::db("Upsert sender identity", e))?;
        Ok(())
    }

    pub fn get_sender_identity(&self, id: &str) -> Result<Option<SenderIdentity>> {
        let conn = self.conn()?;
        conn.query_row(&format!("{IDENTITY_SELECT} WHERE id = ?1"), params![id], row_to_identity)
            .optional()
            .map_err(|e| CadenceError::db("Get sender identity", e))
    }

    /// Active identities across all tenants (reply polling).
    pub fn list_active_identities(&self) -> Result<Vec<SenderIdentity>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{IDENTITY_SELECT} WHERE is_active = 1 ORDER BY tenant_id, id"))
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map([], row_to_identity)
            .map_err(|e| CadenceError::db("Query identities", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CadenceError::db("Scan identities", e))?;
        Ok(rows)
    }

    /// Disconnect flow: the identity stays on record but stops sending.
    pub fn deactivate_sender_identity(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sender_identities SET is_active = 0, updated_at = ?1 WHERE id = ?2",
            params![to_ms(now), id],
        )
        .map_err(|e| CadenceError::db("Deactivate sender identity", e))?;
        Ok(())
    }

    // ── Sequences ───────────────────────────────────────────

    pub fn create_sequence(
        &self,
        tenant_id: &str,
        name: &str,
        sender_identity_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Sequence> {
        let id = new_id();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sequences (id, tenant_id, name, sender_identity_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, tenant_id, name, sender_identity_id, to_ms(now)],
        )
        .map_err(|e| CadenceError::db("Create sequence", e))?;
        Ok(Sequence {
            id,
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            sender_identity_id: sender_identity_id.map(String::from),
        })
    }

    /// Add a step template. `step_order` is 1-based and unique per sequence.
    pub fn add_sequence_step(
        &self,
        sequence_id: &str,
        step_order: u32,
        subject: &str,
        html_body: &str,
        text_body: Option<&str>,
    ) -> Result<SequenceStep> {
        if step_order == 0 {
            return Err(CadenceError::Validation("step_order is 1-based".into()));
        }
        let id = new_id();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sequence_steps (id, sequence_id, step_order, subject, html_body, text_body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, sequence_id, step_order, subject, html_body, text_body],
        )
        .map_err(|e| CadenceError::db("Add sequence step", e))?;
        Ok(SequenceStep {
            id,
            sequence_id: sequence_id.to_string(),
            step_order,
            subject: subject.to_string(),
            html_body: html_body.to_string(),
            text_body: text_body.map(String::from),
        })
    }

    pub fn get_sequence(&self, id: &str) -> Result<Option<Sequence>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, tenant_id, name, sender_identity_id FROM sequences WHERE id = ?1",
            params![id],
            |row| {
                Ok(Sequence {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    name: row.get(2)?,
                    sender_identity_id: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| CadenceError::db("Get sequence", e))
    }

    /// Step template by 1-based order.
    pub fn get_sequence_step(&self, sequence_id: &str, step_order: u32) -> Result<Option<SequenceStep>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, sequence_id, step_order, subject, html_body, text_body
             FROM sequence_steps WHERE sequence_id = ?1 AND step_order = ?2",
            params![sequence_id, step_order],
            |row| {
                Ok(SequenceStep {
                    id: row.get(0)?,
                    sequence_id: row.get(1)?,
                    step_order: row.get(2)?,
                    subject: row.get(3)?,
                    html_body: row.get(4)?,
                    text_body: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| CadenceError::db("Get sequence step", e))
    }
}
