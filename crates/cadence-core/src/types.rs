//! Domain types: enrollments, the outbound send queue, sender identities,
//! suppression entries and the audit trail.

use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CadenceError, Result};

/// Lowercase + trim an email address for storage and comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Domain part of an email address (after the last `@`).
pub fn email_domain(email: &str) -> Option<&str> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|d| !d.is_empty())
}

/// Message id without angle brackets or surrounding whitespace.
pub fn normalize_message_id(id: &str) -> String {
    id.trim().trim_start_matches('<').trim_end_matches('>').trim().to_string()
}

/// All message ids in an `In-Reply-To` / `References` header value.
pub fn parse_message_ids(header: &str) -> Vec<String> {
    header
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(normalize_message_id)
        .filter(|id| !id.is_empty())
        .collect()
}

/// Implements `as_str` / `Display` / `FromStr` for a fieldless status enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CadenceError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CadenceError::Validation(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// ─── Tenants ──────────────────────────────────────────────

/// Tenant record, resolved read-only by the workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub is_active: bool,
}

// ─── Enrollments ──────────────────────────────────────────

/// Enrollment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

string_enum!(EnrollmentStatus {
    Active => "ACTIVE",
    Paused => "PAUSED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

/// A named batch of recipients attached to one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub sequence_id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: EnrollmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a recipient when creating an enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRecipient {
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
}

impl NewRecipient {
    pub fn email(email: &str) -> Self {
        Self {
            email: email.to_string(),
            ..Default::default()
        }
    }
}

/// A send target within an enrollment.
///
/// Identity fields never change after creation. `replied_at`, `reply_count`
/// and `bounced_at` are reply/bounce state written by the reply detection
/// worker and the bounce path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRecipient {
    pub id: String,
    pub enrollment_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub phone: Option<String>,
    pub external_id: Option<String>,
    pub replied_at: Option<DateTime<Utc>>,
    pub reply_count: u32,
    pub bounced_at: Option<DateTime<Utc>>,
}

impl EnrollmentRecipient {
    /// Whether further sequence steps must be withheld.
    pub fn is_stopped(&self) -> bool {
        self.replied_at.is_some() || self.bounced_at.is_some()
    }
}

// ─── Sequences ────────────────────────────────────────────

/// An ordered list of message templates bound to one sender identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub sender_identity_id: Option<String>,
}

/// One templated message. `step_order` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: String,
    pub sequence_id: String,
    pub step_order: u32,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

// ─── Outbound send queue ──────────────────────────────────

/// Queue item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Queued,
    Locked,
    Sent,
    Failed,
    Skipped,
}

string_enum!(QueueStatus {
    Queued => "QUEUED",
    Locked => "LOCKED",
    Sent => "SENT",
    Failed => "FAILED",
    Skipped => "SKIPPED",
});

impl QueueStatus {
    /// SENT, FAILED and SKIPPED are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed | QueueStatus::Skipped)
    }
}

/// One (enrollment, recipient, step) work item. `step_index` is 0-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub tenant_id: String,
    pub enrollment_id: String,
    pub recipient_email: String,
    pub step_index: u32,
    pub status: QueueStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempt_count: u32,
    /// Transport failures only; drives the retry ceiling.
    pub failure_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Sender identities ────────────────────────────────────

/// Mailbox credentials for SMTP send and IMAP inbox polling.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MailboxCredentials {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for MailboxCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxCredentials")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("imap_host", &self.imap_host)
            .field("imap_port", &self.imap_port)
            .field("username", &self.username)
            .field("password", &"••••")
            .finish()
    }
}

/// A tenant's sending mailbox with its send window and daily cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub send_window_time_zone: String,
    pub send_window_hours_start: u32,
    pub send_window_hours_end: u32,
    pub daily_send_limit: u32,
    pub is_active: bool,
    pub mailbox: MailboxCredentials,
}

impl SenderIdentity {
    /// Parsed IANA timezone of the send window.
    pub fn time_zone(&self) -> Result<Tz> {
        self.send_window_time_zone.parse::<Tz>().map_err(|_| {
            CadenceError::Config(format!(
                "sender identity {} has invalid timezone '{}'",
                self.id, self.send_window_time_zone
            ))
        })
    }

    /// Hour of day (0-23) in the identity's timezone.
    pub fn local_hour(&self, now: DateTime<Utc>) -> Result<u32> {
        Ok(now.with_timezone(&self.time_zone()?).hour())
    }

    /// `[start, end)` membership. A window with `start > end` wraps midnight;
    /// `start == end` is empty except for the `[0, 24)` always-open case.
    pub fn window_contains(&self, hour: u32) -> bool {
        let (start, end) = (self.send_window_hours_start, self.send_window_hours_end);
        if start < end {
            hour >= start && hour < end
        } else if start > end {
            hour >= start || hour < end
        } else {
            false
        }
    }

    /// First whole UTC hour after `now` whose local hour is inside the window.
    /// `None` for an empty window.
    pub fn next_window_open(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let tz = self.time_zone()?;
        let hour_start = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        for k in 1..=48 {
            let candidate = hour_start + chrono::Duration::hours(k);
            if self.window_contains(candidate.with_timezone(&tz).hour()) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Local midnight of `now`'s local day, expressed in UTC.
    pub fn local_day_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let tz = self.time_zone()?;
        let local_date = now.with_timezone(&tz).date_naive();
        let midnight = local_date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| CadenceError::Validation(format!("no midnight for {local_date}")))?;
        // DST gaps at midnight fall back to the earliest valid instant.
        let start = tz
            .from_local_datetime(&midnight)
            .earliest()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|| now - chrono::Duration::hours(24));
        Ok(start)
    }
}

// ─── Suppression ──────────────────────────────────────────

/// Suppression entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionType {
    Email,
    Domain,
}

string_enum!(SuppressionType {
    Email => "email",
    Domain => "domain",
});

/// A permanent do-not-send record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub kind: SuppressionType,
    pub value: String,
    pub reason: String,
}

impl SuppressionEntry {
    /// Normalised value: lowercase, and domains without a leading `@`.
    pub fn normalized_value(&self) -> String {
        let v = normalize_email(&self.value);
        match self.kind {
            SuppressionType::Domain => v.trim_start_matches('@').to_string(),
            SuppressionType::Email => v,
        }
    }
}

// ─── Audit trail ──────────────────────────────────────────

/// Audit event types, one per scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SendAttempted,
    SendSucceeded,
    SendFailed,
    SendSkipped,
    SendBounced,
    ValidationFailed,
    CanaryBlocked,
    #[serde(rename = "SEND_BLOCKED_CANARY_MISCONFIG")]
    CanaryMisconfig,
    OutsideWindow,
    SendWindowBypass,
    DailyCapReached,
    ProcessingError,
    ReplyDetected,
    ReplyAdditional,
}

string_enum!(AuditEventType {
    SendAttempted => "send_attempted",
    SendSucceeded => "send_succeeded",
    SendFailed => "send_failed",
    SendSkipped => "send_skipped",
    SendBounced => "send_bounced",
    ValidationFailed => "validation_failed",
    CanaryBlocked => "canary_blocked",
    CanaryMisconfig => "SEND_BLOCKED_CANARY_MISCONFIG",
    OutsideWindow => "outside_window",
    SendWindowBypass => "send_window_bypass",
    DailyCapReached => "daily_cap_reached",
    ProcessingError => "processing_error",
    ReplyDetected => "reply_detected",
    ReplyAdditional => "reply_additional",
});

/// Reason codes carried in `meta.reason` for `send_skipped` events.
pub mod skip_reason {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const KILL_SWITCH: &str = "SKIPPED_KILL_SWITCH";
    pub const SUPPRESSION: &str = "suppression";
    pub const REPLIED: &str = "replied";
    pub const BOUNCED: &str = "bounced";
    pub const ENROLLMENT_PAUSED: &str = "enrollment_paused";
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Row id, assigned on insert.
    pub id: Option<i64>,
    pub tenant_id: String,
    pub enrollment_id: String,
    pub recipient_email: String,
    pub event_type: AuditEventType,
    pub message: String,
    pub meta: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Build an event for a queue item decision.
    pub fn for_item(
        item: &QueueItem,
        event_type: AuditEventType,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            tenant_id: item.tenant_id.clone(),
            enrollment_id: item.enrollment_id.clone(),
            recipient_email: item.recipient_email.clone(),
            event_type,
            message: message.into(),
            meta: serde_json::json!({
                "queue_item_id": item.id,
                "step_index": item.step_index,
                "attempt_count": item.attempt_count,
            }),
            occurred_at,
        }
    }

    /// Merge extra keys into `meta`.
    pub fn with_meta(mut self, extra: serde_json::Value) -> Self {
        if let (Some(meta), serde_json::Value::Object(extra)) = (self.meta.as_object_mut(), extra) {
            meta.extend(extra);
        }
        self
    }

    /// `meta.reason`, if present.
    pub fn reason(&self) -> Option<&str> {
        self.meta.get("reason").and_then(|v| v.as_str())
    }
}

// ─── Transport DTOs ───────────────────────────────────────

/// A rendered message ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    /// Extra headers, e.g. the send correlation header.
    pub headers: Vec<(String, String)>,
}

/// Result of a transport send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn sent(message_id: impl Into<String>, thread_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            thread_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// An inbound message fetched from a sender identity's inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEmail {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub body_preview: String,
    pub received_at: DateTime<Utc>,
    pub headers: Vec<(String, String)>,
}

impl InboundEmail {
    /// Case-insensitive header lookup (first occurrence).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A recorded successful dispatch; the correlation target for replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundSend {
    pub id: String,
    pub tenant_id: String,
    pub queue_item_id: String,
    pub sender_identity_id: String,
    pub enrollment_id: String,
    pub recipient_email: String,
    pub step_index: u32,
    pub subject: String,
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}
