//! SMTP/IMAP mail transport.
//!
//! Sends through the sender identity's SMTP relay (async lettre) and polls
//! its inbox over IMAP (async-imap on tokio-native-tls). Every outbound
//! message gets an explicit `Message-ID`; that id doubles as the thread id,
//! so a reply whose `References` chain starts with it lands in the same
//! thread.

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{MailTransport, SEND_ID_HEADER};
use cadence_core::types::{
    InboundEmail, OutgoingEmail, SendOutcome, SenderIdentity, email_domain, normalize_message_id,
    parse_message_ids,
};
use chrono::{DateTime, Duration, Utc};
use lettre::message::header::{Header, HeaderName, HeaderValue};

/// Characters kept in `body_preview`.
const PREVIEW_CHARS: usize = 280;
/// Characters kept in `body`.
const BODY_CHARS: usize = 4000;

/// Type alias for the TLS IMAP stream used throughout this module.
type ImapTlsStream = async_imap::Client<tokio_native_tls::TlsStream<tokio::net::TcpStream>>;

/// Create TLS-wrapped IMAP connection (async, tokio-native).
async fn connect_imap_tls(host: &str, port: u16) -> Result<ImapTlsStream> {
    let tcp = tokio::net::TcpStream::connect((host, port))
        .await
        .map_err(|e| CadenceError::transport(format!("TCP connect: {e}")))?;

    let connector = native_tls::TlsConnector::new()
        .map_err(|e| CadenceError::transport(format!("TLS connector: {e}")))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let tls_stream = connector
        .connect(host, tcp)
        .await
        .map_err(|e| CadenceError::transport(format!("TLS handshake: {e}")))?;

    Ok(async_imap::Client::new(tls_stream))
}

/// `X-Cadence-Send-Id` as a typed lettre header.
#[derive(Debug, Clone)]
struct SendIdHeader(String);

impl Header for SendIdHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str(SEND_ID_HEADER)
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.trim().to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// SMTP send + IMAP inbox transport.
#[derive(Debug, Clone)]
pub struct SmtpImapTransport {
    mailbox: String,
}

impl Default for SmtpImapTransport {
    fn default() -> Self {
        Self {
            mailbox: "INBOX".into(),
        }
    }
}

impl SmtpImapTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll a folder other than `INBOX`.
    pub fn with_mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = mailbox.into();
        self
    }

    async fn dispatch(&self, identity: &SenderIdentity, email: &OutgoingEmail) -> Result<String> {
        use lettre::{
            AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, message::Mailbox,
            message::MultiPart, transport::smtp::authentication::Credentials,
        };

        let creds = &identity.mailbox;
        if creds.smtp_host.is_empty() {
            return Err(CadenceError::transport(format!(
                "sender identity {} has no SMTP host",
                identity.id
            )));
        }

        let from = match identity.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => format!("{name} <{}>", identity.email),
            _ => identity.email.clone(),
        };
        let from_mailbox: Mailbox = from
            .parse()
            .map_err(|e| CadenceError::transport(format!("Invalid from: {e}")))?;
        let to_mailbox: Mailbox = email
            .to
            .parse()
            .map_err(|e| CadenceError::transport(format!("Invalid to: {e}")))?;

        let message_id = new_message_id(&identity.email);
        let mut builder = LettreMessage::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(email.subject.clone())
            .message_id(Some(format!("<{message_id}>")));

        for (name, value) in &email.headers {
            if name.eq_ignore_ascii_case(SEND_ID_HEADER) {
                builder = builder.header(SendIdHeader(value.clone()));
            } else {
                tracing::debug!("Unsupported outbound header dropped: {name}");
            }
        }

        let plain = email
            .text
            .clone()
            .unwrap_or_else(|| strip_html(&email.html));
        let message = builder
            .multipart(MultiPart::alternative_plain_html(plain, email.html.clone()))
            .map_err(|e| CadenceError::transport(format!("Build email: {e}")))?;

        let smtp_creds = Credentials::new(creds.username.clone(), creds.password.clone());
        // 465 is implicit TLS; everything else negotiates STARTTLS.
        let relay = if creds.smtp_port == 465 {
            AsyncSmtpTransport::<lettre::Tokio1Executor>::relay(&creds.smtp_host)
        } else {
            AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(&creds.smtp_host)
        };
        let mailer = relay
            .map_err(|e| CadenceError::transport(format!("SMTP relay: {e}")))?
            .port(creds.smtp_port)
            .credentials(smtp_creds)
            .build();

        mailer
            .send(message)
            .await
            .map_err(|e| CadenceError::transport(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Email sent: {} → {}", identity.email, email.to);
        Ok(message_id)
    }
}

#[async_trait]
impl MailTransport for SmtpImapTransport {
    fn name(&self) -> &str {
        "smtp-imap"
    }

    async fn send(&self, identity: &SenderIdentity, email: &OutgoingEmail) -> SendOutcome {
        match self.dispatch(identity, email).await {
            Ok(message_id) => SendOutcome::sent(message_id.clone(), Some(message_id)),
            Err(e) => {
                tracing::warn!("📤 Send via {} failed: {e}", identity.email);
                SendOutcome::failed(e.to_string())
            }
        }
    }

    async fn fetch_recent_inbox(
        &self,
        identity: &SenderIdentity,
        hours_back: u32,
    ) -> Result<Vec<InboundEmail>> {
        use futures::StreamExt;

        let creds = &identity.mailbox;
        if creds.imap_host.is_empty() {
            return Err(CadenceError::transport(format!(
                "sender identity {} has no IMAP host",
                identity.id
            )));
        }
        let since = Utc::now() - Duration::hours(i64::from(hours_back));

        let client = connect_imap_tls(&creds.imap_host, creds.imap_port).await?;
        let mut session = client
            .login(&creds.username, &creds.password)
            .await
            .map_err(|e| CadenceError::transport(format!("IMAP login: {}", e.0)))?;

        session
            .select(&self.mailbox)
            .await
            .map_err(|e| CadenceError::transport(format!("Select: {e}")))?;

        // SINCE is day-granular; the exact cutoff is applied after parsing.
        let query = format!("SINCE {}", since.format("%-d-%b-%Y"));
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| CadenceError::transport(format!("Search: {e}")))?;

        if uids.is_empty() {
            session.logout().await.ok();
            return Ok(vec![]);
        }

        let mut sorted: Vec<u32> = uids.into_iter().collect();
        sorted.sort_unstable();
        let uid_set = sorted
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        // PEEK leaves the \Seen flag alone.
        let mut messages = session
            .uid_fetch(&uid_set, "(UID BODY.PEEK[])")
            .await
            .map_err(|e| CadenceError::transport(format!("Fetch: {e}")))?;

        let mut emails = Vec::new();
        while let Some(msg_result) = messages.next().await {
            let msg = msg_result.map_err(|e| CadenceError::transport(format!("Fetch msg: {e}")))?;
            if let Some(body) = msg.body()
                && let Some(parsed) = parse_email_bytes(body)
                && parsed.received_at >= since
            {
                emails.push(parsed);
            }
        }

        // Drop the messages stream before using session again
        drop(messages);
        session.logout().await.ok();

        tracing::info!("📧 Fetched {} recent email(s) for {}", emails.len(), identity.email);
        Ok(emails)
    }
}

fn new_message_id(sender_email: &str) -> String {
    let domain = email_domain(sender_email).unwrap_or("cadence.local");
    format!("{}@{domain}", uuid::Uuid::new_v4().simple())
}

/// Raw header block as `(name, value)` pairs with folded lines joined.
fn raw_headers(raw: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}

/// Parse raw RFC 822 bytes into an [`InboundEmail`].
fn parse_email_bytes(raw: &[u8]) -> Option<InboundEmail> {
    use mail_parser::MessageParser;
    let parsed = MessageParser::default().parse(raw)?;
    let headers = raw_headers(raw);
    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let message_id = parsed
        .message_id()
        .map(normalize_message_id)
        .or_else(|| header("Message-ID").map(normalize_message_id))?;

    let from = parsed
        .from()
        .and_then(|a| a.first())
        .map(|a| a.address().unwrap_or_default().to_string())
        .unwrap_or_default();
    let to = parsed
        .to()
        .and_then(|a| a.first())
        .map(|a| a.address().unwrap_or_default().to_string())
        .unwrap_or_default();

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();

    let body_text = parsed
        .body_text(0)
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            parsed
                .body_html(0)
                .map(|h| strip_html(&h))
                .unwrap_or_default()
        });

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    // Thread root: first References entry, else the message replied to.
    let thread_id = header("References")
        .and_then(|r| parse_message_ids(r).into_iter().next())
        .or_else(|| header("In-Reply-To").and_then(|r| parse_message_ids(r).into_iter().next()));

    let body_preview = body_text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(PREVIEW_CHARS)
        .collect();

    Some(InboundEmail {
        message_id,
        thread_id,
        from,
        to,
        subject,
        body_preview,
        body: body_text.chars().take(BODY_CHARS).collect(),
        received_at,
        headers,
    })
}

fn strip_html(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}
