//! Cadence configuration system.
//!
//! Loaded from `~/.cadence/config.toml`. Every field has a serde default, so an
//! empty file (or no file at all) yields a working, fail-closed configuration:
//! live sending is off until an operator turns it on.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub sending: SendingControls,
    #[serde(default)]
    pub replies: ReplyConfig,
    #[serde(default)]
    pub followups: FollowUpConfig,
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.cadence/cadence.db".into() }

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Admin gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Shared secret for `/api/v1/admin/*`. Empty disables the admin API.
    #[serde(default)]
    pub admin_token: String,
}

fn default_port() -> u16 { 3100 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            admin_token: String::new(),
        }
    }
}

/// Send queue worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Items actually dispatched per tick; the rest of the batch is a dry run.
    #[serde(default = "default_live_send_cap")]
    pub live_send_cap: u32,
    /// Staged rollout gate: when false only step 0 is ever sent.
    #[serde(default)]
    pub multi_step_enabled: bool,
    /// Transport failures tolerated before an item is marked FAILED.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

fn default_tick_secs() -> u64 { 60 }
fn default_batch_size() -> u32 { 25 }
fn default_lease_secs() -> u64 { 300 }
fn default_live_send_cap() -> u32 { 1 }
fn default_max_failures() -> u32 { 5 }
fn default_retry_base_secs() -> u64 { 60 }
fn default_retry_max_secs() -> u64 { 3600 }

/// Hard bounds on the claim batch size.
pub const MIN_BATCH_SIZE: u32 = 1;
pub const MAX_BATCH_SIZE: u32 = 50;

impl WorkerConfig {
    /// Batch size clamped into `[1, 50]`.
    pub fn effective_batch_size(&self) -> u32 {
        self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
    }

    /// Live-send cap, never larger than the batch and never zero.
    pub fn effective_live_send_cap(&self) -> u32 {
        self.live_send_cap.clamp(1, self.effective_batch_size())
    }

    /// Exponential retry delay after the `failures`-th failure.
    pub fn retry_delay(&self, failures: u32) -> chrono::Duration {
        let exp = failures.saturating_sub(1).min(16);
        let secs = self
            .retry_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_secs);
        chrono::Duration::seconds(secs as i64)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            live_send_cap: default_live_send_cap(),
            multi_step_enabled: false,
            max_failures: default_max_failures(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
        }
    }
}

/// Administrative sending switches, injected into every worker tick.
///
/// Defaults are fail-closed: nothing is dispatched until an operator enables
/// both switches and names a canary tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendingControls {
    /// Global sending gate. Off means every claimed item is quietly requeued.
    #[serde(default)]
    pub sending_enabled: bool,
    /// Kill switch for live dispatch.
    #[serde(default)]
    pub live_sending_enabled: bool,
    #[serde(default)]
    pub canary_tenant_id: Option<String>,
    #[serde(default)]
    pub canary_sender_identity_id: Option<String>,
}

impl SendingControls {
    /// Canary tenant, treating an empty string as unset.
    pub fn canary_tenant(&self) -> Option<&str> {
        self.canary_tenant_id.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Canary sender identity, treating an empty string as unset.
    pub fn canary_identity(&self) -> Option<&str> {
        self.canary_sender_identity_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

/// Reply detection worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default = "default_reply_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_hours_back")]
    pub hours_back: u32,
}

fn default_reply_tick_secs() -> u64 { 300 }
fn default_hours_back() -> u32 { 72 }

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_reply_tick_secs(),
            hours_back: default_hours_back(),
        }
    }
}

/// Follow-up planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpConfig {
    #[serde(default = "default_followup_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_min_delay_days")]
    pub min_delay_days: u32,
    #[serde(default = "default_max_delay_days")]
    pub max_delay_days: u32,
}

fn default_followup_tick_secs() -> u64 { 300 }
fn default_min_delay_days() -> u32 { 2 }
fn default_max_delay_days() -> u32 { 4 }

impl FollowUpConfig {
    /// Delay bounds in minutes, with `min <= max` guaranteed.
    pub fn delay_bounds_minutes(&self) -> (i64, i64) {
        let a = i64::from(self.min_delay_days) * 24 * 60;
        let b = i64::from(self.max_delay_days) * 24 * 60;
        (a.min(b), a.max(b))
    }
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_followup_tick_secs(),
            min_delay_days: default_min_delay_days(),
            max_delay_days: default_max_delay_days(),
        }
    }
}
