//! Collaborator traits consumed by the scheduler core.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{InboundEmail, OutgoingEmail, SendOutcome, SenderIdentity};

/// Header stamped on every outbound message with the queue item id, used to
/// correlate replies back to the send that caused them.
pub const SEND_ID_HEADER: &str = "X-Cadence-Send-Id";

/// Mail transport: SMTP/IMAP, a provider API, or a test double.
///
/// `send` reports provider rejections through [`SendOutcome`] rather than an
/// error so the worker can keep the provider's message for the operator.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Dispatch one message from `identity`.
    async fn send(&self, identity: &SenderIdentity, email: &OutgoingEmail) -> SendOutcome;

    /// Messages received by `identity` within the last `hours_back` hours.
    async fn fetch_recent_inbox(
        &self,
        identity: &SenderIdentity,
        hours_back: u32,
    ) -> Result<Vec<InboundEmail>>;
}
