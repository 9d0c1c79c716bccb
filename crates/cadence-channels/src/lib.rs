//! # Cadence Channels
//! Mail transports behind [`cadence_core::MailTransport`].
//!
//! `email` talks to real mailboxes over SMTP and IMAP. `memory` records
//! dispatches in-process and serves a scripted inbox.

pub mod email;
pub mod memory;

pub use email::SmtpImapTransport;
pub use memory::MemoryTransport;
