//! Account activation codes
//!
//! One-time numeric codes mailed to new users, verified once, and swept
//! from the backing store after they expire.

pub mod code;
pub mod mailer;
pub mod service;
pub mod store;

pub use code::{email_key, generate_code, ActivationCode, CODE_VALIDITY};
pub use mailer::{EmailMessage, HttpMailer, MailConfig, MailCredentials, MailError, Mailer};
pub use service::{spawn_sweep_loop, ActivationError, ActivationService, IssuedCode, SweepReport};
pub use store::{CodeStore, CodeStoreError, MemoryCodeStore};
