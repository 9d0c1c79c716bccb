//! Sending controls stored in `platform_configs`.
//!
//! Operators flip these at runtime through the admin API; every worker tick
//! reloads them, falling back to the config file for keys never written.

use cadence_core::config::SendingControls;
use cadence_core::error::{CadenceError, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::HashMap;

use crate::{CadenceDb, to_ms};

const SENDING_ENABLED: &str = "sending_enabled";
const LIVE_SENDING_ENABLED: &str = "live_sending_enabled";
const CANARY_TENANT_ID: &str = "canary_tenant_id";
const CANARY_SENDER_IDENTITY_ID: &str = "canary_sender_identity_id";

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn non_blank(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty()).then(|| v.to_string())
}

impl CadenceDb {
    /// Current controls: stored keys override `defaults`.
    pub fn load_sending_controls(&self, defaults: &SendingControls) -> Result<SendingControls> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM platform_configs")
            .map_err(|e| CadenceError::db("Prepare", e))?;
        let stored: HashMap<String, String> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| CadenceError::db("Query controls", e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| CadenceError::db("Scan controls", e))?;

        let mut controls = defaults.clone();
        if let Some(v) = stored.get(SENDING_ENABLED) {
            controls.sending_enabled = parse_flag(v);
        }
        if let Some(v) = stored.get(LIVE_SENDING_ENABLED) {
            controls.live_sending_enabled = parse_flag(v);
        }
        if let Some(v) = stored.get(CANARY_TENANT_ID) {
            controls.canary_tenant_id = non_blank(v);
        }
        if let Some(v) = stored.get(CANARY_SENDER_IDENTITY_ID) {
            controls.canary_sender_identity_id = non_blank(v);
        }
        Ok(controls)
    }

    /// Persist every control key.
    pub fn save_sending_controls(&self, controls: &SendingControls, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| CadenceError::db("Begin controls", e))?;
        let entries = [
            (SENDING_ENABLED, controls.sending_enabled.to_string()),
            (LIVE_SENDING_ENABLED, controls.live_sending_enabled.to_string()),
            (CANARY_TENANT_ID, controls.canary_tenant_id.clone().unwrap_or_default()),
            (
                CANARY_SENDER_IDENTITY_ID,
                controls.canary_sender_identity_id.clone().unwrap_or_default(),
            ),
        ];
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO platform_configs (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, to_ms(now)],
            )
            .map_err(|e| CadenceError::db("Save control", e))?;
        }
        tx.commit().map_err(|e| CadenceError::db("Commit controls", e))?;
        tracing::info!(
            "🎛️ Sending controls saved: sending={} live={} canary={:?}",
            controls.sending_enabled,
            controls.live_sending_enabled,
            controls.canary_tenant()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{t0, temp_db};

    #[test]
    fn test_defaults_used_until_saved() {
        let db = temp_db();
        let defaults = SendingControls {
            sending_enabled: true,
            ..Default::default()
        };
        assert_eq!(db.load_sending_controls(&defaults).unwrap(), defaults);
    }

    #[test]
    fn test_saved_controls_override_defaults() {
        let db = temp_db();
        let saved = SendingControls {
            sending_enabled: true,
            live_sending_enabled: true,
            canary_tenant_id: Some("t1".into()),
            canary_sender_identity_id: None,
        };
        db.save_sending_controls(&saved, t0()).unwrap();
        let loaded = db
            .load_sending_controls(&SendingControls {
                canary_sender_identity_id: Some("from-file".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_flag_parsing() {
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }
}
