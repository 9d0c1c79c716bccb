//! Suppression list. Queried on every attempt, never cached.

use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{SuppressionEntry, email_domain, normalize_email};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::{CadenceDb, parse_col, to_ms};

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<SuppressionEntry> {
    Ok(SuppressionEntry {
        tenant_id: row.get(0)?,
        kind: parse_col(row, 1)?,
        value: row.get(2)?,
        reason: row.get(3)?,
    })
}

impl CadenceDb {
    /// Add (or re-reason) a suppression entry.
    pub fn add_suppression(&self, entry: &SuppressionEntry, now: DateTime<Utc>) -> Result<()> {
        let value = entry.normalized_value();
        if value.is_empty() {
            return Err(CadenceError::Validation("suppression value is empty".into()));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO suppression_entries (tenant_id, type, value, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id, type, value) DO UPDATE SET reason = excluded.reason",
            params![entry.tenant_id, entry.kind.as_str(), value, entry.reason, to_ms(now)],
        )
        .map_err(|e| CadenceError::db("Add suppression", e))?;
        tracing::info!("🚫 Suppressed {} '{}' for tenant {}", entry.kind, value, entry.tenant_id);
        Ok(())
    }

    /// Matching entry for an address: exact email first, then its domain.
    pub fn find_suppression(&self, tenant_id: &str, email: &str) -> Result<Option<SuppressionEntry>> {
        let email = normalize_email(email);
        let domain = email_domain(&email).unwrap_or("").to_string();
        let conn = self.conn()?;
        conn.query_row(
            "SELECT tenant_id, type, value, reason FROM suppression_entries
             WHERE tenant_id = ?1
               AND ((type = 'email' AND value = ?2) OR (type = 'domain' AND value = ?3))
             ORDER BY CASE type WHEN 'email' THEN 0 ELSE 1 END
             LIMIT 1",
            params![tenant_id, email, domain],
            row_to_entry,
        )
        .optional()
        .map_err(|e| CadenceError::db("Find suppression", e))
    }

    pub fn list_suppressions(&self, tenant_id: &str) -> Result<Vec<SuppressionEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT tenant_id, type, value, reason FROM suppression_entries
                 WHERE tenant_id = ?1 ORDER BY type, value",
            )
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_entry)
            .map_err(|e| CadenceError::db("Query suppressions", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CadenceError::db("Scan suppressions", e))?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{t0, temp_db};
    use cadence_core::types::{SuppressionEntry, SuppressionType};

    fn entry(kind: SuppressionType, value: &str) -> SuppressionEntry {
        SuppressionEntry {
            tenant_id: "t1".into(),
            kind,
            value: value.into(),
            reason: "unsubscribed".into(),
        }
    }

    #[test]
    fn test_email_and_domain_matching() {
        let db = temp_db();
        db.add_suppression(&entry(SuppressionType::Email, "Bob@X.com"), t0()).unwrap();
        db.add_suppression(&entry(SuppressionType::Domain, "@blocked.io"), t0()).unwrap();

        let hit = db.find_suppression("t1", "bob@x.com").unwrap().unwrap();
        assert_eq!(hit.kind, SuppressionType::Email);
        assert!(db.find_suppression("t1", "anyone@BLOCKED.io").unwrap().is_some());
        assert!(db.find_suppression("t1", "carol@x.com").unwrap().is_none());
        // Tenant scoped.
        assert!(db.find_suppression("t2", "bob@x.com").unwrap().is_none());
    }

    #[test]
    fn test_suppression_upsert() {
        let db = temp_db();
        db.add_suppression(&entry(SuppressionType::Email, "bob@x.com"), t0()).unwrap();
        let mut again = entry(SuppressionType::Email, "BOB@x.com");
        again.reason = "complaint".into();
        db.add_suppression(&again, t0()).unwrap();

        let all = db.list_suppressions("t1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reason, "complaint");
        assert!(db.add_suppression(&entry(SuppressionType::Domain, " @ "), t0()).is_err());
    }
}
