//! Send Queue Worker: claims due queue items and walks each one through the
//! safety gates before dispatch.
//!
//! Per tick:
//! 1. Cancel QUEUED items of recipients who replied or bounced.
//! 2. Claim a batch (lease-based, see `cadence_db::queue`).
//! 3. Per item: live recipient check, step filter, live-send cap, then the
//!    gates in fixed order: existence, global gate, kill switch, canary,
//!    suppression, sender identity, send window, daily cap. Then render and
//!    dispatch.
//!
//! Every gate resolves the item and writes at most one audit event. Errors
//! and panics inside one item are contained and turned into a requeue.

use cadence_core::config::{SendingControls, WorkerConfig};
use cadence_core::error::Result;
use cadence_core::traits::MailTransport;
use cadence_core::types::{
    AuditEvent, AuditEventType, EnrollmentRecipient, EnrollmentStatus, OutboundSend, QueueItem,
    SenderIdentity, normalize_message_id, skip_reason,
};
use cadence_db::{CadenceDb, ClaimRequest, Resolution};
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::render;

/// Provider errors are kept to this many characters in `last_error`.
pub const MAX_ERROR_CHARS: usize = 500;
/// Replied/bounced items cancelled per tick.
const SWEEP_LIMIT: u32 = 500;

const STEP_GATE_REASON: &str = "steps >0 not yet enabled";
const DRY_RUN_REASON: &str = "dry run: live-send cap reached";
const SENDING_DISABLED_REASON: &str = "sending disabled";

const BOUNCE_CODES: [&str; 5] = ["550", "551", "552", "553", "554"];
const BOUNCE_PHRASES: [&str; 5] = [
    "user unknown",
    "mailbox unavailable",
    "does not exist",
    "no such user",
    "recipient rejected",
];

/// Per-call options. Only the manual admin trigger sets these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickOptions {
    #[serde(default)]
    pub ignore_send_window: bool,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: u32,
    pub sent: u32,
    pub skipped: u32,
    pub failed: u32,
    pub requeued: u32,
    pub dry_run: u32,
    pub lease_lost: u32,
    pub errors: u32,
    /// QUEUED items cancelled because the recipient replied or bounced.
    pub swept: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Sent,
    Skipped,
    Failed,
    Requeued,
    DryRun,
    LeaseLost,
    Error,
}

impl TickReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Sent => self.sent += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Requeued => self.requeued += 1,
            ItemOutcome::DryRun => self.dry_run += 1,
            ItemOutcome::LeaseLost => self.lease_lost += 1,
            ItemOutcome::Error => self.errors += 1,
        }
    }
}

/// Whether a transport error is a permanent recipient rejection.
pub fn is_bounce(error: &str) -> bool {
    let lower = error.to_lowercase();
    if BOUNCE_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_ascii_digit())
        .any(|token| BOUNCE_CODES.contains(&token))
}

fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_CHARS).collect()
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic while processing item".into()
    }
}

/// The send queue worker.
pub struct SendQueueWorker {
    db: Arc<CadenceDb>,
    transport: Arc<dyn MailTransport>,
    config: WorkerConfig,
    worker_id: String,
}

impl SendQueueWorker {
    pub fn new(db: Arc<CadenceDb>, transport: Arc<dyn MailTransport>, config: WorkerConfig) -> Self {
        Self {
            db,
            transport,
            config,
            worker_id: crate::worker_id(),
        }
    }

    /// Override the lease owner id.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run one tick with explicitly injected sending controls.
    pub async fn tick(
        &self,
        controls: &SendingControls,
        opts: TickOptions,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let mut report = TickReport {
            swept: self.sweep_stopped_recipients(now)?,
            ..Default::default()
        };

        let items = self.db.claim_batch(&ClaimRequest {
            worker_id: self.worker_id.clone(),
            batch_size: self.config.effective_batch_size(),
            lease: Duration::seconds(self.config.lease_secs as i64),
            now,
        })?;
        report.claimed = items.len() as u32;

        let live_cap = self.config.effective_live_send_cap();
        let mut live_used = 0u32;
        for item in &items {
            let result = AssertUnwindSafe(self.process_item(item, controls, opts, &mut live_used, live_cap, now))
                .catch_unwind()
                .await;
            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => self.recover(item, &e.to_string(), now),
                Err(panic) => self.recover(item, &panic_message(panic), now),
            };
            report.record(outcome);
        }

        if report.claimed > 0 || report.swept > 0 {
            tracing::info!(
                "📬 Send tick [{}]: claimed={} sent={} skipped={} failed={} requeued={} dry_run={} swept={}",
                self.worker_id,
                report.claimed,
                report.sent,
                report.skipped,
                report.failed,
                report.requeued,
                report.dry_run,
                report.swept
            );
        }
        Ok(report)
    }

    // ─── Reply/bounce sweep ───────────────────────────────────

    fn sweep_stopped_recipients(&self, now: DateTime<Utc>) -> Result<u32> {
        let mut swept = 0;
        for (item, reason) in self.db.stopped_recipient_items(SWEEP_LIMIT)? {
            let event = self
                .event(
                    &item,
                    AuditEventType::SendSkipped,
                    format!("Recipient {reason}; step {} cancelled", item.step_index),
                    now,
                )
                .with_meta(json!({ "reason": reason }));
            if self.db.skip_queued_item(&item.id, reason, Some(&event), now)? {
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!("🛑 Cancelled {swept} queued step(s) for replied/bounced recipients");
        }
        Ok(swept)
    }

    // ─── Per-item pipeline ────────────────────────────────────

    async fn process_item(
        &self,
        item: &QueueItem,
        controls: &SendingControls,
        opts: TickOptions,
        live_used: &mut u32,
        live_cap: u32,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        // Recipient state is read live; a reply may have landed since the sweep.
        let recipient = self.db.get_recipient(&item.enrollment_id, &item.recipient_email)?;
        if let Some(r) = &recipient
            && r.is_stopped()
        {
            let reason = if r.replied_at.is_some() {
                skip_reason::REPLIED
            } else {
                skip_reason::BOUNCED
            };
            return self.skip(item, reason, format!("Recipient {reason}"), json!({}), now);
        }

        if item.step_index > 0 && !self.config.multi_step_enabled {
            tracing::debug!("⏭️ {} step {} held: {STEP_GATE_REASON}", item.id, item.step_index);
            return self.requeue_quiet(item, STEP_GATE_REASON, ItemOutcome::Requeued, now);
        }

        if *live_used >= live_cap {
            return self.requeue_quiet(item, DRY_RUN_REASON, ItemOutcome::DryRun, now);
        }
        *live_used += 1;

        self.run_gates(item, recipient, controls, opts, now).await
    }

    async fn run_gates(
        &self,
        item: &QueueItem,
        recipient: Option<EnrollmentRecipient>,
        controls: &SendingControls,
        opts: TickOptions,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        // a. Existence
        let Some(enrollment) = self
            .db
            .get_enrollment_for_tenant(&item.tenant_id, &item.enrollment_id)?
        else {
            return self.fail_validation(item, "Enrollment not found for tenant", now);
        };
        match enrollment.status {
            EnrollmentStatus::Active => {}
            EnrollmentStatus::Paused => {
                return self.requeue_audited(
                    item,
                    AuditEventType::SendSkipped,
                    skip_reason::ENROLLMENT_PAUSED,
                    "Enrollment is paused".into(),
                    None,
                    now,
                );
            }
            other => {
                return self.fail_validation(item, &format!("Enrollment is {other}"), now);
            }
        }
        let Some(recipient) = recipient else {
            return self.fail_validation(item, "Recipient is not a member of the enrollment", now);
        };

        // b. Global sending gate
        if !controls.sending_enabled {
            tracing::debug!("⏸️ {} requeued: {SENDING_DISABLED_REASON}", item.id);
            return self.requeue_quiet(item, SENDING_DISABLED_REASON, ItemOutcome::Requeued, now);
        }

        // c. Kill switch
        if !controls.live_sending_enabled {
            return self.requeue_audited(
                item,
                AuditEventType::SendSkipped,
                skip_reason::KILL_SWITCH,
                "Live sending is disabled".into(),
                None,
                now,
            );
        }

        // d. Canary allow-list
        let sequence = self.db.get_sequence(&enrollment.sequence_id)?;
        let identity_id = sequence.as_ref().and_then(|s| s.sender_identity_id.clone());
        match controls.canary_tenant() {
            None => {
                tracing::warn!("🚨 Live sending enabled without a canary tenant, blocking {}", item.id);
                return self.requeue_audited(
                    item,
                    AuditEventType::CanaryMisconfig,
                    AuditEventType::CanaryMisconfig.as_str(),
                    "Live sending is enabled but no canary tenant is configured".into(),
                    None,
                    now,
                );
            }
            Some(canary) if canary != item.tenant_id => {
                return self.requeue_audited(
                    item,
                    AuditEventType::CanaryBlocked,
                    "canary_tenant_mismatch",
                    format!("Tenant {} is not the canary tenant", item.tenant_id),
                    None,
                    now,
                );
            }
            Some(_) => {}
        }
        if let Some(canary_identity) = controls.canary_identity()
            && identity_id.as_deref() != Some(canary_identity)
        {
            return self.requeue_audited(
                item,
                AuditEventType::CanaryBlocked,
                "canary_identity_mismatch",
                format!(
                    "Sender identity {} is not the canary identity",
                    identity_id.as_deref().unwrap_or("(none)")
                ),
                None,
                now,
            );
        }

        // e. Suppression
        if let Some(entry) = self.db.find_suppression(&item.tenant_id, &item.recipient_email)? {
            return self.skip(
                item,
                skip_reason::SUPPRESSION,
                format!("Suppressed by {} entry '{}'", entry.kind, entry.value),
                json!({ "suppression_type": entry.kind.as_str(), "suppression_value": entry.value }),
                now,
            );
        }

        // f. Sender identity
        let identity = match &identity_id {
            Some(id) => self.db.get_sender_identity(id)?,
            None => None,
        };
        let identity = match identity {
            Some(identity) if identity.is_active && identity.tenant_id == item.tenant_id => identity,
            Some(identity) => {
                return self.requeue_config_error(
                    item,
                    format!("Sender identity {} is inactive", identity.id),
                    now,
                );
            }
            None => {
                return self.requeue_config_error(
                    item,
                    "Sequence has no active sender identity".into(),
                    now,
                );
            }
        };

        // g. Send window
        let hour = match identity.local_hour(now) {
            Ok(hour) => hour,
            Err(e) => return self.requeue_config_error(item, e.to_string(), now),
        };
        if !identity.window_contains(hour) {
            let window = format!(
                "[{}, {}) {}",
                identity.send_window_hours_start,
                identity.send_window_hours_end,
                identity.send_window_time_zone
            );
            if opts.ignore_send_window {
                let event = self
                    .event(
                        item,
                        AuditEventType::SendWindowBypass,
                        format!("Send window {window} bypassed at local hour {hour}"),
                        now,
                    )
                    .with_meta(json!({ "local_hour": hour }));
                self.db.append_audit(&event)?;
            } else {
                let retry_at = identity.next_window_open(now)?;
                return self.requeue_audited(
                    item,
                    AuditEventType::OutsideWindow,
                    "outside_window",
                    format!("Local hour {hour} is outside send window {window}"),
                    retry_at,
                    now,
                );
            }
        }

        // Daily cap
        if let Some(outcome) = self.check_daily_cap(item, &identity, now)? {
            return Ok(outcome);
        }

        // h. Render
        let step = match &sequence {
            Some(seq) => self.db.get_sequence_step(&seq.id, item.step_index + 1)?,
            None => None,
        };
        let email = render::build_email(item, &recipient, step.as_ref());

        // i. Dispatch
        let attempted = self
            .event(
                item,
                AuditEventType::SendAttempted,
                format!("Dispatching step {} via {}", item.step_index, self.transport.name()),
                now,
            )
            .with_meta(json!({ "sender_identity_id": identity.id, "canary_fallback": step.is_none() }));
        self.db.append_audit(&attempted)?;

        let outcome = self.transport.send(&identity, &email).await;
        if outcome.success {
            let send = OutboundSend {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: item.tenant_id.clone(),
                queue_item_id: item.id.clone(),
                sender_identity_id: identity.id.clone(),
                enrollment_id: item.enrollment_id.clone(),
                recipient_email: item.recipient_email.clone(),
                step_index: item.step_index,
                subject: email.subject.clone(),
                provider_message_id: outcome.message_id.as_deref().map(normalize_message_id),
                thread_id: outcome.thread_id.as_deref().map(normalize_message_id),
                sent_at: now,
            };
            let event = self
                .event(
                    item,
                    AuditEventType::SendSucceeded,
                    format!("Sent to {}", item.recipient_email),
                    now,
                )
                .with_meta(json!({
                    "provider_message_id": send.provider_message_id,
                    "thread_id": send.thread_id,
                    "outbound_send_id": send.id,
                }));
            // From here on the message is out: no path may requeue the item.
            return Ok(self.record_dispatch(item, &send, event, now));
        }

        let error = truncate_error(outcome.error.as_deref().unwrap_or("unknown transport error"));
        if is_bounce(&error) {
            let event = self
                .event(item, AuditEventType::SendBounced, format!("Bounced: {error}"), now)
                .with_meta(json!({ "error": error }));
            let ok = self.db.resolve_item(
                &self.worker_id,
                &item.id,
                &Resolution::Failed {
                    error: error.clone(),
                    count_failure: true,
                },
                Some(&event),
                now,
            )?;
            if !ok {
                return Ok(ItemOutcome::LeaseLost);
            }
            self.db
                .mark_recipient_bounced(&item.enrollment_id, &item.recipient_email, now)?;
            tracing::warn!("📭 {} bounced: {error}", item.recipient_email);
            return Ok(ItemOutcome::Failed);
        }

        tracing::warn!("⚠️ Send of {} failed: {error}", item.id);
        self.retry_or_fail(item, AuditEventType::SendFailed, &error, now)
    }

    /// Persist a completed dispatch. Falls back to a bare SENT mark when the
    /// send log cannot be written, and never returns an error.
    fn record_dispatch(
        &self,
        item: &QueueItem,
        send: &OutboundSend,
        event: AuditEvent,
        now: DateTime<Utc>,
    ) -> ItemOutcome {
        match self.db.complete_send(&self.worker_id, send, &event) {
            Ok(true) => {
                tracing::info!(
                    "📤 Sent {} step {} → {}",
                    item.enrollment_id,
                    item.step_index,
                    item.recipient_email
                );
                return ItemOutcome::Sent;
            }
            Ok(false) => {
                tracing::error!("❌ {} dispatched but the lease was lost before recording", item.id);
                return ItemOutcome::LeaseLost;
            }
            Err(e) => {
                tracing::error!("❌ {} dispatched but the send log write failed: {e}", item.id);
            }
        }

        let event = event.with_meta(json!({ "send_log_missing": true }));
        match self
            .db
            .resolve_item(&self.worker_id, &item.id, &Resolution::Sent, Some(&event), now)
        {
            Ok(true) => ItemOutcome::Sent,
            Ok(false) => ItemOutcome::LeaseLost,
            Err(e) => {
                // Left LOCKED; only lease expiry can hand it to another worker.
                tracing::error!("❌ {} dispatched but could not be marked SENT: {e}", item.id);
                ItemOutcome::Error
            }
        }
    }

    fn check_daily_cap(
        &self,
        item: &QueueItem,
        identity: &SenderIdentity,
        now: DateTime<Utc>,
    ) -> Result<Option<ItemOutcome>> {
        let day_start = identity.local_day_start(now)?;
        let slot = self.db.reserve_daily_slot(
            &identity.id,
            &item.id,
            day_start,
            identity.daily_send_limit,
            now,
        )?;
        if slot.granted {
            return Ok(None);
        }
        let sent_today = slot.used;
        // Any local day is 23-25h long, so +36h always lands in the next one.
        let next_day = identity.local_day_start(day_start + Duration::hours(36))?;
        let outcome = self.requeue_audited(
            item,
            AuditEventType::DailyCapReached,
            "daily_cap_reached",
            format!(
                "Sender identity {} reached its daily limit ({sent_today}/{})",
                identity.id, identity.daily_send_limit
            ),
            Some(next_day),
            now,
        )?;
        Ok(Some(outcome))
    }

    // ─── Resolution helpers ───────────────────────────────────

    fn event(
        &self,
        item: &QueueItem,
        event_type: AuditEventType,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> AuditEvent {
        AuditEvent::for_item(item, event_type, message, now)
            .with_meta(json!({ "worker_id": self.worker_id }))
    }

    fn lease_checked(ok: bool, outcome: ItemOutcome) -> ItemOutcome {
        if ok { outcome } else { ItemOutcome::LeaseLost }
    }

    /// Held items step aside for one tick so the rest of the queue gets claimed.
    fn hold_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.config.tick_secs.max(1) as i64)
    }

    /// Requeue without an audit row (step filter, dry run, global gate).
    fn requeue_quiet(
        &self,
        item: &QueueItem,
        reason: &str,
        outcome: ItemOutcome,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        let hold = self.hold_until(now);
        let ok = self
            .db
            .requeue(&self.worker_id, &item.id, reason, Some(hold), None, now)?;
        Ok(Self::lease_checked(ok, outcome))
    }

    fn requeue_audited(
        &self,
        item: &QueueItem,
        event_type: AuditEventType,
        reason: &str,
        message: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        let retry_at = retry_at.unwrap_or_else(|| self.hold_until(now));
        let event = self
            .event(item, event_type, message, now)
            .with_meta(json!({ "reason": reason, "retry_at": retry_at }));
        let ok = self
            .db
            .requeue(&self.worker_id, &item.id, reason, Some(retry_at), Some(&event), now)?;
        Ok(Self::lease_checked(ok, ItemOutcome::Requeued))
    }

    /// Configuration problems are not terminal; back off and surface them.
    fn requeue_config_error(
        &self,
        item: &QueueItem,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        let retry_at = now + self.config.retry_delay(item.attempt_count);
        tracing::warn!("⚙️ {} requeued on configuration error: {message}", item.id);
        self.requeue_audited(
            item,
            AuditEventType::ValidationFailed,
            skip_reason::VALIDATION_FAILED,
            message,
            Some(retry_at),
            now,
        )
    }

    fn fail_validation(&self, item: &QueueItem, message: &str, now: DateTime<Utc>) -> Result<ItemOutcome> {
        let event = self
            .event(item, AuditEventType::SendSkipped, message, now)
            .with_meta(json!({ "reason": skip_reason::VALIDATION_FAILED }));
        let ok = self
            .db
            .mark_failed(&self.worker_id, &item.id, message, Some(&event), now)?;
        Ok(Self::lease_checked(ok, ItemOutcome::Failed))
    }

    fn skip(
        &self,
        item: &QueueItem,
        reason: &str,
        message: String,
        extra: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        let event = self
            .event(item, AuditEventType::SendSkipped, message, now)
            .with_meta(json!({ "reason": reason }))
            .with_meta(extra);
        let ok = self
            .db
            .mark_skipped(&self.worker_id, &item.id, reason, Some(&event), now)?;
        Ok(Self::lease_checked(ok, ItemOutcome::Skipped))
    }

    /// Requeue with backoff, or FAILED once the failure ceiling is reached.
    fn retry_or_fail(
        &self,
        item: &QueueItem,
        event_type: AuditEventType,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        let failures = item.failure_count + 1;
        if failures >= self.config.max_failures.max(1) {
            let event = self
                .event(item, event_type, format!("Giving up after {failures} failure(s): {error}"), now)
                .with_meta(json!({ "error": error, "failure_count": failures, "final": true }));
            let resolution = Resolution::Failed {
                error: error.to_string(),
                count_failure: true,
            };
            let ok = self
                .db
                .resolve_item(&self.worker_id, &item.id, &resolution, Some(&event), now)?;
            return Ok(Self::lease_checked(ok, ItemOutcome::Failed));
        }

        let retry_at = now + self.config.retry_delay(failures);
        let event = self
            .event(item, event_type, error.to_string(), now)
            .with_meta(json!({ "error": error, "failure_count": failures, "retry_at": retry_at }));
        let resolution = Resolution::Requeue {
            reason: error.to_string(),
            retry_at: Some(retry_at),
            count_failure: true,
        };
        let ok = self
            .db
            .resolve_item(&self.worker_id, &item.id, &resolution, Some(&event), now)?;
        Ok(Self::lease_checked(ok, ItemOutcome::Requeued))
    }

    /// Contain a per-item error or panic.
    fn recover(&self, item: &QueueItem, error: &str, now: DateTime<Utc>) -> ItemOutcome {
        tracing::error!("❌ Processing {} failed: {error}", item.id);
        let error = truncate_error(error);
        match self.retry_or_fail(item, AuditEventType::ProcessingError, &error, now) {
            Ok(ItemOutcome::LeaseLost) => ItemOutcome::LeaseLost,
            Ok(_) => ItemOutcome::Error,
            Err(e) => {
                tracing::error!("❌ Could not requeue {} after error: {e}", item.id);
                ItemOutcome::Error
            }
        }
    }
}
