//! Activation code issuing, verification and expiry sweep

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::code::{email_key, generate_code, ActivationCode};
use super::mailer::{activation_email, MailError, Mailer};
use super::store::{CodeStore, CodeStoreError};
use crate::clock::Clock;

/// Upper bound on any single store or mail call
const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Period of the expiry sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of a failed activation call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivationError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("Activation code not found")]
    NotFound,

    #[error("Activation code already used")]
    AlreadyUsed,

    #[error("Activation code expired")]
    Expired,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ActivationError {
    /// Stable error code for callers
    pub fn code(&self) -> &'static str {
        match self {
            ActivationError::InvalidArgument(_) => "invalid-argument",
            ActivationError::FailedPrecondition(_) => "failed-precondition",
            ActivationError::NotFound => "not-found",
            ActivationError::AlreadyUsed => "already-exists",
            ActivationError::Expired => "deadline-exceeded",
            ActivationError::Internal(_) => "internal",
        }
    }

    /// Message safe to show the caller; internal detail stays in the logs
    pub fn public_message(&self) -> String {
        match self {
            ActivationError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<CodeStoreError> for ActivationError {
    fn from(err: CodeStoreError) -> Self {
        ActivationError::Internal(err.to_string())
    }
}

/// Successful issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCode {
    pub success: bool,
    pub message: String,
    pub expires_at: i64,
}

/// Result of one sweep pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
}

/// Issues, verifies and sweeps activation codes
pub struct ActivationService {
    store: Arc<dyn CodeStore>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    from_address: String,
}

/// Run a collaborator call under [`COLLABORATOR_TIMEOUT`]
async fn bounded<T, E>(
    operation: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, ActivationError>
where
    E: std::fmt::Display,
{
    match tokio::time::timeout(COLLABORATOR_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ActivationError::Internal(format!("{}: {}", operation, e))),
        Err(_) => Err(ActivationError::Internal(format!("{}: timed out", operation))),
    }
}

fn require(value: &str, what: &str) -> Result<String, ActivationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ActivationError::InvalidArgument(format!("{} is required", what)));
    }
    Ok(trimmed.to_string())
}

fn require_email(email: &str) -> Result<String, ActivationError> {
    let email = require(email, "Email")?;
    if !email.contains('@') {
        return Err(ActivationError::InvalidArgument(
            "Email address is invalid".to_string(),
        ));
    }
    Ok(email)
}

impl ActivationService {
    pub fn new(
        store: Arc<dyn CodeStore>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            clock,
            from_address: from_address.into(),
        }
    }

    /// Issue a fresh code for `email`, replacing any earlier one, and mail it.
    ///
    /// A delivery failure is reported as internal, but the stored code stays
    /// valid.
    pub async fn issue(&self, email: &str, name: &str) -> Result<IssuedCode, ActivationError> {
        let email = require_email(email)?;
        let name = require(name, "Name")?;

        self.mailer.ensure_configured().map_err(|e| {
            error!(error = %e, "Activation email is not configured");
            ActivationError::FailedPrecondition("Email service is not configured".to_string())
        })?;

        let now = self.clock.now_millis();
        let record = ActivationCode::issue(generate_code(), &email, &name, now);
        let key = email_key(&email);

        bounded("store activation code", self.store.set(&key, &record)).await?;
        debug!(key = %key, expires_at = record.expires_at, "Activation code stored");

        let message = activation_email(&self.from_address, &email, &name, &record.code);
        match tokio::time::timeout(COLLABORATOR_TIMEOUT, self.mailer.send(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(MailError::MissingCredentials | MailError::MissingApiUrl)) => {
                return Err(ActivationError::FailedPrecondition(
                    "Email service is not configured".to_string(),
                ));
            }
            Ok(Err(e)) => {
                return Err(ActivationError::Internal(format!("send activation email: {}", e)));
            }
            Err(_) => {
                return Err(ActivationError::Internal(
                    "send activation email: timed out".to_string(),
                ));
            }
        }

        info!(key = %key, "Activation code issued");
        Ok(IssuedCode {
            success: true,
            message: "Activation code sent".to_string(),
            expires_at: record.expires_at,
        })
    }

    /// Check `code` for `email` and mark it used on success
    pub async fn verify(&self, email: &str, code: &str) -> Result<(), ActivationError> {
        let email = require_email(email)?;
        let code = require(code, "Code")?;
        let key = email_key(&email);

        let record = bounded("read activation code", self.store.get(&key))
            .await?
            .ok_or(ActivationError::NotFound)?;

        if record.used {
            return Err(ActivationError::AlreadyUsed);
        }

        let now = self.clock.now_millis();
        if record.is_expired(now) {
            return Err(ActivationError::Expired);
        }

        if record.code != code {
            debug!(key = %key, "Activation code mismatch");
            return Err(ActivationError::InvalidArgument(
                "Invalid activation code".to_string(),
            ));
        }

        let marked = bounded(
            "mark activation code used",
            self.store.mark_used(&key, &code, now),
        )
        .await?;
        if !marked {
            debug!(key = %key, "Activation code consumed concurrently");
            return Err(ActivationError::AlreadyUsed);
        }
        info!(key = %key, "Activation code verified");
        Ok(())
    }

    /// Delete every record whose expiry lies in the past, in one batch
    pub async fn sweep(&self) -> Result<SweepReport, ActivationError> {
        let now = self.clock.now_millis();
        let records = bounded("list activation codes", self.store.list()).await?;

        let expired: HashMap<String, Option<ActivationCode>> = records
            .iter()
            .filter(|(_, record)| record.expires_at < now)
            .map(|(key, _)| (key.clone(), None))
            .collect();

        let report = SweepReport {
            scanned: records.len(),
            removed: expired.len(),
        };

        if !expired.is_empty() {
            bounded("delete expired activation codes", self.store.update_many(expired)).await?;
        }

        info!(
            scanned = report.scanned,
            removed = report.removed,
            "Activation code sweep finished"
        );
        Ok(report)
    }

    /// Boundary wrapper for issuing: internal detail is logged, not returned
    pub async fn issue_call(&self, email: &str, name: &str) -> Result<IssuedCode, ActivationError> {
        self.issue(email, name).await.map_err(Self::log_boundary)
    }

    /// Boundary wrapper for verification
    pub async fn verify_call(&self, email: &str, code: &str) -> Result<(), ActivationError> {
        self.verify(email, code).await.map_err(Self::log_boundary)
    }

    fn log_boundary(err: ActivationError) -> ActivationError {
        if let ActivationError::Internal(detail) = &err {
            error!(detail = %detail, "Activation call failed");
        }
        err
    }
}

/// Sweep immediately, then every `interval`, until the runtime shuts down
pub fn spawn_sweep_loop(
    service: Arc<ActivationService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = service.sweep().await {
                warn!(error = %e, "Activation code sweep failed");
            }
            tokio::time::sleep(interval).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::store::MemoryCodeStore;
    use crate::activation::EmailMessage;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const T0: i64 = 1_700_000_000_000;

    /// Mailer that records messages and can be told to fail
    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<EmailMessage>>,
        unconfigured: bool,
        failing: bool,
    }

    impl RecordingMailer {
        fn last_code(&self) -> String {
            let sent = self.sent.lock().unwrap();
            let text = &sent.last().unwrap().text;
            text.split_whitespace()
                .find(|word| word.len() == 5 && word.chars().all(|c| c.is_ascii_digit()))
                .unwrap()
                .to_string()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        fn ensure_configured(&self) -> Result<(), MailError> {
            if self.unconfigured {
                Err(MailError::MissingCredentials)
            } else {
                Ok(())
            }
        }

        async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
            if self.failing {
                return Err(MailError::Delivery("smtp down".to_string()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Harness {
        service: ActivationService,
        store: Arc<MemoryCodeStore>,
        mailer: Arc<RecordingMailer>,
        clock: Arc<ManualClock>,
    }

    fn harness(mailer: RecordingMailer) -> Harness {
        let store = Arc::new(MemoryCodeStore::new());
        let mailer = Arc::new(mailer);
        let clock = Arc::new(ManualClock::at_millis(T0));
        let service = ActivationService::new(
            store.clone(),
            mailer.clone(),
            clock.clone(),
            "noreply@krysztalkowo.pl",
        );
        Harness {
            service,
            store,
            mailer,
            clock,
        }
    }

    fn record(expires_at: i64) -> ActivationCode {
        ActivationCode {
            code: "12345".to_string(),
            email: "x@test.com".to_string(),
            name: "X".to_string(),
            created_at: expires_at - 900_000,
            expires_at,
            used: false,
            used_at: None,
        }
    }

    #[tokio::test]
    async fn test_issue_then_verify_once() {
        let h = harness(RecordingMailer::default());

        let issued = h.service.issue("a@test.com", "Ann").await.unwrap();
        assert!(issued.success);
        assert_eq!(issued.expires_at, T0 + 900_000);

        let stored = h.store.get("a@test,com").await.unwrap().unwrap();
        assert_eq!(stored.created_at, T0);
        assert_eq!(stored.expires_at, stored.created_at + 900_000);
        assert_eq!(stored.code.len(), 5);
        assert_eq!(h.mailer.last_code(), stored.code);

        h.clock.advance(chrono::Duration::minutes(5));
        h.service.verify("a@test.com", &stored.code).await.unwrap();

        let used = h.store.get("a@test,com").await.unwrap().unwrap();
        assert!(used.used);
        assert_eq!(used.used_at, Some(T0 + 5 * 60 * 1000));

        let again = h.service.verify("a@test.com", &stored.code).await.unwrap_err();
        assert_eq!(again, ActivationError::AlreadyUsed);
        assert_eq!(again.code(), "already-exists");
    }

    #[tokio::test]
    async fn test_wrong_code_is_invalid_argument() {
        let h = harness(RecordingMailer::default());
        h.service.issue("a@test.com", "Ann").await.unwrap();
        let code = h.mailer.last_code();

        let wrong = if code == "00000" { "11111" } else { "00000" };
        let err = h.service.verify("a@test.com", wrong).await.unwrap_err();
        assert_eq!(err.code(), "invalid-argument");

        // A mismatch leaves the code usable
        h.service.verify("a@test.com", &code).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_code_rejected_even_if_correct() {
        let h = harness(RecordingMailer::default());
        h.service.issue("a@test.com", "Ann").await.unwrap();
        let code = h.mailer.last_code();

        h.clock.advance(chrono::Duration::minutes(15));
        h.clock.advance(chrono::Duration::milliseconds(1));

        let err = h.service.verify("a@test.com", &code).await.unwrap_err();
        assert_eq!(err, ActivationError::Expired);
        assert_eq!(err.code(), "deadline-exceeded");
        assert!(!h.store.get("a@test,com").await.unwrap().unwrap().used);
    }

    #[tokio::test]
    async fn test_verify_at_exact_expiry_succeeds() {
        let h = harness(RecordingMailer::default());
        h.service.issue("a@test.com", "Ann").await.unwrap();
        let code = h.mailer.last_code();

        h.clock.advance(chrono::Duration::minutes(15));
        h.service.verify("a@test.com", &code).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_unknown_email() {
        let h = harness(RecordingMailer::default());
        let err = h.service.verify("nobody@test.com", "12345").await.unwrap_err();
        assert_eq!(err, ActivationError::NotFound);
        assert_eq!(err.code(), "not-found");
    }

    #[tokio::test]
    async fn test_email_key_is_case_insensitive() {
        let h = harness(RecordingMailer::default());
        h.service.issue("Ann.Smith@Test.com", "Ann").await.unwrap();
        let code = h.mailer.last_code();

        h.service.verify(" ann.smith@test.com ", &code).await.unwrap();
    }

    #[tokio::test]
    async fn test_reissue_overwrites_previous_code() {
        let h = harness(RecordingMailer::default());
        h.service.issue("a@test.com", "Ann").await.unwrap();
        let first = h.store.get("a@test,com").await.unwrap().unwrap();
        h.service.verify("a@test.com", &first.code).await.unwrap();

        h.clock.advance(chrono::Duration::minutes(1));
        h.service.issue("a@test.com", "Ann").await.unwrap();
        let second = h.store.get("a@test,com").await.unwrap().unwrap();
        assert!(!second.used);
        assert_eq!(second.created_at, T0 + 60_000);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_has_no_side_effects() {
        let h = harness(RecordingMailer::default());

        for (email, name) in [("", "Ann"), ("   ", "Ann"), ("not-an-email", "Ann"), ("a@test.com", " ")] {
            let err = h.service.issue(email, name).await.unwrap_err();
            assert_eq!(err.code(), "invalid-argument", "{:?}/{:?}", email, name);
        }
        let err = h.service.verify("a@test.com", "").await.unwrap_err();
        assert_eq!(err.code(), "invalid-argument");

        assert!(h.store.is_empty());
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_mailer_fails_fast() {
        let h = harness(RecordingMailer {
            unconfigured: true,
            ..RecordingMailer::default()
        });

        let err = h.service.issue("a@test.com", "Ann").await.unwrap_err();
        assert_eq!(err.code(), "failed-precondition");
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_code() {
        let h = harness(RecordingMailer {
            failing: true,
            ..RecordingMailer::default()
        });

        let err = h.service.issue_call("a@test.com", "Ann").await.unwrap_err();
        assert_eq!(err.code(), "internal");
        assert_eq!(err.public_message(), "Internal error");

        let stored = h.store.get("a@test,com").await.unwrap().unwrap();
        h.service.verify_call("a@test.com", &stored.code).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let h = harness(RecordingMailer::default());

        let mut expected_kept = Vec::new();
        for i in 0..20i64 {
            // Offsets from -10 min to +9 min around now; offset 0 expires exactly now
            let expires_at = T0 + (i - 10) * 60_000;
            let key = format!("user{}@test,com", i);
            h.store.set(&key, &record(expires_at)).await.unwrap();
            if expires_at >= T0 {
                expected_kept.push(key);
            }
        }

        let report = h.service.sweep().await.unwrap();
        assert_eq!(report.scanned, 20);
        assert_eq!(report.removed, 10);

        let mut kept: Vec<String> = h.store.list().await.unwrap().into_iter().map(|(k, _)| k).collect();
        kept.sort();
        expected_kept.sort();
        assert_eq!(kept, expected_kept);
    }

    #[tokio::test]
    async fn test_sweep_empty_and_all_valid() {
        let h = harness(RecordingMailer::default());
        assert_eq!(h.service.sweep().await.unwrap(), SweepReport::default());

        h.store.set("k", &record(T0 + 1)).await.unwrap();
        let report = h.service.sweep().await.unwrap();
        assert_eq!(report, SweepReport { scanned: 1, removed: 0 });
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_used_expired_codes() {
        let h = harness(RecordingMailer::default());
        let mut used = record(T0 - 1);
        used.used = true;
        h.store.set("k", &used).await.unwrap();

        assert_eq!(h.service.sweep().await.unwrap().removed, 1);
        assert!(h.store.is_empty());
    }

    /// Store whose reads yield before returning, so concurrent verifications
    /// both observe the unused record
    struct YieldingStore {
        inner: MemoryCodeStore,
    }

    #[async_trait]
    impl CodeStore for YieldingStore {
        async fn set(&self, key: &str, record: &ActivationCode) -> Result<(), CodeStoreError> {
            self.inner.set(key, record).await
        }

        async fn get(&self, key: &str) -> Result<Option<ActivationCode>, CodeStoreError> {
            let record = self.inner.get(key).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            record
        }

        async fn mark_used(
            &self,
            key: &str,
            expected_code: &str,
            used_at: i64,
        ) -> Result<bool, CodeStoreError> {
            self.inner.mark_used(key, expected_code, used_at).await
        }

        async fn list(&self) -> Result<Vec<(String, ActivationCode)>, CodeStoreError> {
            self.inner.list().await
        }

        async fn update_many(
            &self,
            updates: HashMap<String, Option<ActivationCode>>,
        ) -> Result<(), CodeStoreError> {
            self.inner.update_many(updates).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_verify_succeeds_once() {
        let store = Arc::new(YieldingStore {
            inner: MemoryCodeStore::new(),
        });
        let mailer = Arc::new(RecordingMailer::default());
        let service = ActivationService::new(
            store.clone(),
            mailer.clone(),
            Arc::new(ManualClock::at_millis(T0)),
            "noreply@krysztalkowo.pl",
        );
        service.issue("a@test.com", "Ann").await.unwrap();
        let code = mailer.last_code();

        let (first, second) = tokio::join!(
            service.verify("a@test.com", &code),
            service.verify("a@test.com", &code)
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.contains(&Err(ActivationError::AlreadyUsed)));
    }

    #[tokio::test]
    async fn test_verify_does_not_consume_reissued_code() {
        let h = harness(RecordingMailer::default());
        h.service.issue("a@test.com", "Ann").await.unwrap();
        let stale = h.store.get("a@test,com").await.unwrap().unwrap();

        h.service.issue("a@test.com", "Ann").await.unwrap();
        let fresh = h.store.get("a@test,com").await.unwrap().unwrap();
        if fresh.code == stale.code {
            return;
        }

        // A verification that read the old record loses to the re-issue
        assert!(!h.store.mark_used("a@test,com", &stale.code, T0).await.unwrap());
        assert!(!h.store.get("a@test,com").await.unwrap().unwrap().used);
        h.service.verify("a@test.com", &fresh.code).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_loop_runs_immediately() {
        let h = harness(RecordingMailer::default());
        h.store.set("old", &record(T0 - 1)).await.unwrap();

        let Harness { service, store, .. } = h;
        let handle = spawn_sweep_loop(Arc::new(service), SWEEP_INTERVAL);

        for _ in 0..100 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(store.is_empty());
    }
}
