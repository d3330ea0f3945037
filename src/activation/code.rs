//! Activation code records

use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How long an issued code stays valid
pub const CODE_VALIDITY: Duration = Duration::minutes(15);

/// Smallest and largest generated code
const CODE_MIN: u32 = 10_000;
const CODE_MAX: u32 = 99_999;

/// A stored activation code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationCode {
    /// Five-digit numeric code
    pub code: String,
    pub email: String,
    pub name: String,
    /// Epoch milliseconds
    pub created_at: i64,
    /// Epoch milliseconds
    pub expires_at: i64,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<i64>,
}

impl ActivationCode {
    /// A fresh, unused code valid for [`CODE_VALIDITY`] from `now_ms`
    pub fn issue(code: String, email: &str, name: &str, now_ms: i64) -> Self {
        Self {
            code,
            email: email.to_string(),
            name: name.to_string(),
            created_at: now_ms,
            expires_at: now_ms + CODE_VALIDITY.num_milliseconds(),
            used: false,
            used_at: None,
        }
    }

    /// Whether the code can no longer be verified by time alone
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at
    }
}

/// Generate a code uniformly in [10000, 99999]
pub fn generate_code() -> String {
    rand::thread_rng().gen_range(CODE_MIN..=CODE_MAX).to_string()
}

/// Store key for an email address.
///
/// The backing store forbids `.` in keys, so dots become commas.
pub fn email_key(email: &str) -> String {
    email.trim().to_lowercase().replace('.', ",")
}
