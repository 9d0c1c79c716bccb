//! In-process transport: records every dispatch and serves a scripted inbox.
//!
//! Used for dry runs and as the transport double in scheduler and gateway
//! tests.

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::MailTransport;
use cadence_core::types::{InboundEmail, OutgoingEmail, SendOutcome, SenderIdentity, email_domain};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// A message accepted by [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub sender_identity_id: String,
    pub message_id: String,
    pub email: OutgoingEmail,
}

#[derive(Default)]
struct State {
    sent: Vec<SentMessage>,
    failures: VecDeque<String>,
    inbox: HashMap<String, Vec<InboundEmail>>,
    inbox_error: Option<String>,
    counter: u64,
}

/// Recording transport.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-send; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every accepted message, in dispatch order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    /// Make the next send fail with `error` (queued, one per call).
    pub fn fail_next(&self, error: impl Into<String>) {
        self.lock().failures.push_back(error.into());
    }

    /// Deliver a message to `sender_identity_id`'s inbox.
    pub fn deliver(&self, sender_identity_id: &str, email: InboundEmail) {
        self.lock()
            .inbox
            .entry(sender_identity_id.to_string())
            .or_default()
            .push(email);
    }

    /// Make every inbox fetch fail until cleared with `None`.
    pub fn set_inbox_error(&self, error: Option<String>) {
        self.lock().inbox_error = error;
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, identity: &SenderIdentity, email: &OutgoingEmail) -> SendOutcome {
        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return SendOutcome::failed(error);
        }
        state.counter += 1;
        let domain = email_domain(&identity.email).unwrap_or("memory.local");
        let message_id = format!("mem-{}@{domain}", state.counter);
        state.sent.push(SentMessage {
            sender_identity_id: identity.id.clone(),
            message_id: message_id.clone(),
            email: email.clone(),
        });
        tracing::debug!("📤 [memory] {} → {}", identity.email, email.to);
        SendOutcome::sent(message_id.clone(), Some(message_id))
    }

    async fn fetch_recent_inbox(
        &self,
        identity: &SenderIdentity,
        hours_back: u32,
    ) -> Result<Vec<InboundEmail>> {
        let state = self.lock();
        if let Some(error) = &state.inbox_error {
            return Err(CadenceError::transport(error.clone()));
        }
        let since = chrono::Utc::now() - chrono::Duration::hours(i64::from(hours_back));
        Ok(state
            .inbox
            .get(&identity.id)
            .map(|msgs| msgs.iter().filter(|m| m.received_at >= since).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::MailboxCredentials;
    use chrono::{Duration, Utc};

    fn identity() -> SenderIdentity {
        SenderIdentity {
            id: "sid-1".into(),
            tenant_id: "t1".into(),
            email: "sales@acme.test".into(),
            display_name: None,
            send_window_time_zone: "UTC".into(),
            send_window_hours_start: 0,
            send_window_hours_end: 24,
            daily_send_limit: 50,
            is_active: true,
            mailbox: MailboxCredentials::default(),
        }
    }

    fn email(to: &str) -> OutgoingEmail {
        OutgoingEmail {
            to: to.into(),
            subject: "Hi".into(),
            html: "<p>Hi</p>".into(),
            text: None,
            headers: vec![],
        }
    }

    fn inbound(id: &str, age: Duration) -> InboundEmail {
        InboundEmail {
            message_id: id.into(),
            thread_id: None,
            from: "bob@x.com".into(),
            to: "sales@acme.test".into(),
            subject: "Re: Hi".into(),
            body: String::new(),
            body_preview: String::new(),
            received_at: Utc::now() - age,
            headers: vec![],
        }
    }

    #[tokio::test]
    async fn test_records_sends_and_scripted_failures() {
        let transport = MemoryTransport::new();
        transport.fail_next("550 user unknown");

        let first = transport.send(&identity(), &email("a@x.com")).await;
        assert!(!first.success);
        assert_eq!(first.error.as_deref(), Some("550 user unknown"));

        let second = transport.send(&identity(), &email("a@x.com")).await;
        assert!(second.success);
        assert_eq!(second.message_id.as_deref(), Some("mem-1@acme.test"));
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_inbox_respects_window_and_errors() {
        let transport = MemoryTransport::new();
        transport.deliver("sid-1", inbound("new", Duration::hours(1)));
        transport.deliver("sid-1", inbound("old", Duration::hours(100)));

        let recent = transport.fetch_recent_inbox(&identity(), 72).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message_id, "new");

        transport.set_inbox_error(Some("IMAP login: denied".into()));
        assert!(transport.fetch_recent_inbox(&identity(), 72).await.is_err());
    }
}
