//! Reply detection: polls each active sender identity's inbox and ties
//! inbound mail back to the outbound send it answers.
//!
//! Correlation, strongest first:
//! 1. `X-Cadence-Send-Id` echoed back by the recipient's client
//! 2. `In-Reply-To` / `References` against recorded provider message ids
//! 3. Provider thread id
//! 4. Reply-style subject from an address we recently sent to
//!
//! A first reply stamps `replied_at` on the recipient, which stops every
//! later step of the sequence for them. Later replies only bump the count.

use cadence_core::SEND_ID_HEADER;
use cadence_core::config::ReplyConfig;
use cadence_core::error::Result;
use cadence_core::traits::MailTransport;
use cadence_core::types::{
    AuditEvent, AuditEventType, InboundEmail, OutboundSend, SenderIdentity, normalize_email,
    normalize_message_id, parse_message_ids,
};
use cadence_db::{CadenceDb, InboundRecorded, NewInbound, ReplyTarget};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

const REPLY_PREFIXES: [&str; 5] = ["re:", "aw:", "sv:", "antw:", "réf:"];

/// What one reply-detection pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplyReport {
    pub fetched: u32,
    pub recorded: u32,
    pub correlated: u32,
    pub first_replies: u32,
    pub additional: u32,
    /// Inbox fetches and messages that failed; failed messages are retried
    /// on the next pass.
    pub errors: u32,
}

/// How an inbound message was matched to a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Correlation {
    Header,
    Thread,
    Heuristic,
}

impl Correlation {
    fn as_str(&self) -> &'static str {
        match self {
            Correlation::Header => "header",
            Correlation::Thread => "thread",
            Correlation::Heuristic => "heuristic",
        }
    }
}

fn looks_like_reply(subject: &str) -> bool {
    let s = subject.trim_start().to_lowercase();
    REPLY_PREFIXES.iter().any(|p| s.starts_with(p))
}

fn reply_target(
    send: &OutboundSend,
    correlation: Correlation,
    inbound_message_id: &str,
    received_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ReplyTarget {
    let event = |event_type, message: String| AuditEvent {
        id: None,
        tenant_id: send.tenant_id.clone(),
        enrollment_id: send.enrollment_id.clone(),
        recipient_email: send.recipient_email.clone(),
        event_type,
        message,
        meta: json!({
            "outbound_send_id": send.id,
            "queue_item_id": send.queue_item_id,
            "inbound_message_id": inbound_message_id,
            "correlation": correlation.as_str(),
            "step_index": send.step_index,
        }),
        occurred_at: now,
    };
    ReplyTarget {
        enrollment_id: send.enrollment_id.clone(),
        recipient_email: send.recipient_email.clone(),
        replied_at: received_at,
        first_reply: event(
            AuditEventType::ReplyDetected,
            format!("Reply from {}; remaining steps stopped", send.recipient_email),
        ),
        additional_reply: event(
            AuditEventType::ReplyAdditional,
            format!("Additional reply from {}", send.recipient_email),
        ),
    }
}

pub struct ReplyWorker {
    db: Arc<CadenceDb>,
    transport: Arc<dyn MailTransport>,
    config: ReplyConfig,
}

impl ReplyWorker {
    pub fn new(db: Arc<CadenceDb>, transport: Arc<dyn MailTransport>, config: ReplyConfig) -> Self {
        Self {
            db,
            transport,
            config,
        }
    }

    /// Poll every active identity once.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ReplyReport> {
        let mut report = ReplyReport::default();
        for identity in self.db.list_active_identities()? {
            let inbox = match self
                .transport
                .fetch_recent_inbox(&identity, self.config.hours_back)
                .await
            {
                Ok(inbox) => inbox,
                Err(e) => {
                    tracing::warn!("📭 Inbox fetch failed for {} ({}): {e}", identity.id, identity.email);
                    report.errors += 1;
                    continue;
                }
            };
            report.fetched += inbox.len() as u32;
            for msg in &inbox {
                if let Err(e) = self.process_message(&identity, msg, now, &mut report) {
                    tracing::warn!("📭 Inbound {} for {} not recorded: {e}", msg.message_id, identity.id);
                    report.errors += 1;
                }
            }
        }

        if report.recorded > 0 {
            tracing::info!(
                "📨 Reply pass: fetched={} recorded={} correlated={} first={} additional={}",
                report.fetched,
                report.recorded,
                report.correlated,
                report.first_replies,
                report.additional
            );
        }
        Ok(report)
    }

    fn process_message(
        &self,
        identity: &SenderIdentity,
        msg: &InboundEmail,
        now: DateTime<Utc>,
        report: &mut ReplyReport,
    ) -> Result<()> {
        let message_id = normalize_message_id(&msg.message_id);
        if message_id.is_empty() || self.db.inbound_exists(&identity.id, &message_id)? {
            return Ok(());
        }

        // Our own outgoing copies are kept on record but never correlated.
        let own = normalize_email(&msg.from) == normalize_email(&identity.email);
        let matched = if own { None } else { self.correlate(identity, msg)? };
        let inbound = NewInbound {
            sender_identity_id: identity.id.clone(),
            provider_message_id: message_id.clone(),
            tenant_id: identity.tenant_id.clone(),
            thread_id: msg.thread_id.as_deref().map(normalize_message_id),
            from_email: msg.from.clone(),
            to_email: msg.to.clone(),
            subject: msg.subject.clone(),
            body_preview: msg.body_preview.clone(),
            received_at: msg.received_at,
            correlated_send_id: matched.as_ref().map(|(send, _)| send.id.clone()),
            correlation: matched.as_ref().map(|(_, c)| c.as_str().to_string()),
        };
        let target = matched
            .as_ref()
            .map(|(send, correlation)| reply_target(send, *correlation, &message_id, msg.received_at, now));

        match self.db.record_inbound(&inbound, target.as_ref(), now)? {
            InboundRecorded::Duplicate => return Ok(()),
            InboundRecorded::Stored => {
                report.recorded += 1;
                tracing::debug!("📨 Uncorrelated inbound {message_id} from {}", msg.from);
            }
            InboundRecorded::FirstReply => {
                report.recorded += 1;
                report.correlated += 1;
                report.first_replies += 1;
                if let Some((send, _)) = &matched {
                    tracing::info!(
                        "💬 Reply detected: {} (enrollment {})",
                        send.recipient_email,
                        send.enrollment_id
                    );
                }
            }
            InboundRecorded::AdditionalReply => {
                report.recorded += 1;
                report.correlated += 1;
                report.additional += 1;
            }
        }
        Ok(())
    }

    fn correlate(
        &self,
        identity: &SenderIdentity,
        msg: &InboundEmail,
    ) -> Result<Option<(OutboundSend, Correlation)>> {
        // 1. Our own correlation header.
        if let Some(queue_item_id) = msg.header(SEND_ID_HEADER).map(str::trim)
            && !queue_item_id.is_empty()
            && let Some(send) = self.db.find_send_by_queue_item(queue_item_id)?
            && send.sender_identity_id == identity.id
        {
            return Ok(Some((send, Correlation::Header)));
        }

        // 2. In-Reply-To, then References newest first.
        let mut referenced = Vec::new();
        if let Some(v) = msg.header("In-Reply-To") {
            referenced.extend(parse_message_ids(v));
        }
        if let Some(v) = msg.header("References") {
            referenced.extend(parse_message_ids(v).into_iter().rev());
        }
        for id in &referenced {
            if let Some(send) = self.db.find_send_by_message_id(&identity.id, id)? {
                return Ok(Some((send, Correlation::Header)));
            }
        }

        // 3. Provider thread.
        if let Some(thread) = msg.thread_id.as_deref().map(normalize_message_id)
            && !thread.is_empty()
            && let Some(send) = self.db.find_send_by_thread(&identity.id, &thread)?
        {
            return Ok(Some((send, Correlation::Thread)));
        }

        // 4. Reply-looking subject from someone we sent to.
        if looks_like_reply(&msg.subject)
            && let Some(send) = self.db.latest_send_to(&identity.id, &msg.from)?
        {
            return Ok(Some((send, Correlation::Heuristic)));
        }
        Ok(None)
    }
}
