//! # Cadence Core
//!
//! Shared building blocks for the outbound send scheduler: configuration,
//! the error type, domain types, the mail transport trait and the template
//! renderer.

pub mod config;
pub mod error;
pub mod template;
pub mod traits;
pub mod types;

pub use config::{CadenceConfig, SendingControls, WorkerConfig};
pub use error::{CadenceError, Result};
pub use traits::{MailTransport, SEND_ID_HEADER};
