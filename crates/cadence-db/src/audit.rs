//! Append-only enrollment audit trail.

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::AuditEvent;
use rusqlite::{Connection, params};

use crate::{CadenceDb, from_ms, parse_col, to_ms};

const AUDIT_SELECT: &str = "SELECT id, tenant_id, enrollment_id, recipient_email, event_type, \
     message, meta, occurred_at FROM enrollment_audit_events";

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<AuditEvent> {
    let meta: String = row.get(6)?;
    Ok(AuditEvent {
        id: Some(row.get(0)?),
        tenant_id: row.get(1)?,
        enrollment_id: row.get(2)?,
        recipient_email: row.get(3)?,
        event_type: parse_col(row, 4)?,
        message: row.get(5)?,
        meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
        occurred_at: from_ms(row.get(7)?),
    })
}

/// Insert on an existing connection or transaction.
pub(crate) fn insert_audit(conn: &Connection, event: &AuditEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO enrollment_audit_events
         (tenant_id, enrollment_id, recipient_email, event_type, message, meta, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.tenant_id,
            event.enrollment_id,
            event.recipient_email,
            event.event_type.as_str(),
            event.message,
            event.meta.to_string(),
            to_ms(event.occurred_at),
        ],
    )
    .map_err(|e| CadenceError::db("Append audit", e))?;
    Ok(conn.last_insert_rowid())
}

impl CadenceDb {
    /// Append one audit row; returns its id.
    pub fn append_audit(&self, event: &AuditEvent) -> Result<i64> {
        let conn = self.conn()?;
        insert_audit(&conn, event)
    }

    /// Full trail for an enrollment in insertion order.
    pub fn list_audit_for_enrollment(&self, enrollment_id: &str) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{AUDIT_SELECT} WHERE enrollment_id = ?1 ORDER BY id"))
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map(params![enrollment_id], row_to_event)
            .map_err(|e| CadenceError::db("Query audit", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CadenceError::db("Scan audit", e))?;
        Ok(rows)
    }

    /// Most recent events across all enrollments, newest first.
    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{AUDIT_SELECT} ORDER BY id DESC LIMIT ?1"))
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map(params![limit], row_to_event)
            .map_err(|e| CadenceError::db("Query audit", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CadenceError::db("Scan audit", e))?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{t0, temp_db};
    use cadence_core::types::AuditEventType;

    fn event(kind: AuditEventType) -> AuditEvent {
        AuditEvent {
            id: None,
            tenant_id: "t1".into(),
            enrollment_id: "e1".into(),
            recipient_email: "bob@x.com".into(),
            event_type: kind,
            message: "test".into(),
            meta: serde_json::json!({"reason": "suppression"}),
            occurred_at: t0(),
        }
    }

    #[test]
    fn test_append_and_list_in_order() {
        let db = temp_db();
        db.append_audit(&event(AuditEventType::SendAttempted)).unwrap();
        db.append_audit(&event(AuditEventType::SendSkipped)).unwrap();

        let trail = db.list_audit_for_enrollment("e1").unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].event_type, AuditEventType::SendAttempted);
        assert_eq!(trail[1].reason(), Some("suppression"));
        assert_eq!(trail[1].occurred_at, t0());

        let recent = db.recent_audit(1).unwrap();
        assert_eq!(recent[0].event_type, AuditEventType::SendSkipped);
    }

    #[test]
    fn test_audit_rows_are_immutable() {
        let db = temp_db();
        let id = db.append_audit(&event(AuditEventType::SendFailed)).unwrap();
        let conn = db.conn().unwrap();
        assert!(
            conn.execute("UPDATE enrollment_audit_events SET message = 'x' WHERE id = ?1", params![id])
                .is_err()
        );
        assert!(
            conn.execute("DELETE FROM enrollment_audit_events WHERE id = ?1", params![id])
                .is_err()
        );
    }
}
