//! Activation email delivery
//!
//! Delivery goes through an external mail API. Missing credentials are a
//! configuration problem and are reported separately from delivery
//! failures, before anything is persisted.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

/// Mail API timeout
const MAIL_TIMEOUT: Duration = Duration::from_secs(15);

/// Mail delivery failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum MailError {
    #[error("Email credentials are not configured")]
    MissingCredentials,

    #[error("Mail API URL is not configured")]
    MissingApiUrl,

    #[error("Email delivery failed: {0}")]
    Delivery(String),
}

/// A message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Sends email
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Fail fast when the mailer cannot possibly deliver
    fn ensure_configured(&self) -> Result<(), MailError> {
        Ok(())
    }

    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

/// Mail API account
#[derive(Debug, Clone)]
pub struct MailCredentials {
    pub user: String,
    pub password: String,
}

/// Mail API settings
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Endpoint accepting `{from,to,subject,text,html}` as JSON
    pub api_url: String,
    /// Sender address
    pub from: String,
    pub credentials: Option<MailCredentials>,
}

/// Build the activation email for `name` <`to`>
pub fn activation_email(from: &str, to: &str, name: &str, code: &str) -> EmailMessage {
    let minutes = super::code::CODE_VALIDITY.num_minutes();

    let text = format!(
        "Cześć {name}!\n\n\
         Twój kod aktywacyjny do Kryształkowa: {code}\n\n\
         Kod jest ważny przez {minutes} minut.\n\
         Jeśli to nie Ty zakładałeś konto, zignoruj tę wiadomość.\n"
    );

    let html = format!(
        "<!DOCTYPE html>\
         <html lang=\"pl\"><body style=\"font-family:sans-serif;background:#f6f3ff;padding:24px\">\
         <div style=\"max-width:480px;margin:0 auto;background:#fff;border-radius:12px;padding:24px\">\
         <h1 style=\"color:#7b5cd6;margin-top:0\">Kryształkowo</h1>\
         <p>Cześć {name}!</p>\
         <p>Twój kod aktywacyjny:</p>\
         <p style=\"font-size:32px;letter-spacing:8px;font-weight:bold;text-align:center\">{code}</p>\
         <p>Kod jest ważny przez {minutes} minut.</p>\
         <p style=\"color:#888;font-size:12px\">Jeśli to nie Ty zakładałeś konto, zignoruj tę wiadomość.</p>\
         </div></body></html>",
        name = escape_html(name),
    );

    EmailMessage {
        from: from.to_string(),
        to: to.to_string(),
        subject: "Kod aktywacyjny - Kryształkowo".to_string(),
        text,
        html,
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Mailer posting messages to an HTTP mail API with Basic auth
pub struct HttpMailer {
    http_client: Client,
    config: MailConfig,
}

impl HttpMailer {
    pub fn new(config: MailConfig) -> Result<Self, MailError> {
        let http_client = Client::builder()
            .timeout(MAIL_TIMEOUT)
            .build()
            .map_err(|e| MailError::Delivery(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            api_url = %config.api_url,
            configured = config.credentials.is_some(),
            "Mailer ready"
        );
        Ok(Self {
            http_client,
            config,
        })
    }

    /// Sender address used for outgoing mail
    pub fn from_address(&self) -> &str {
        &self.config.from
    }

    fn auth_header(credentials: &MailCredentials) -> String {
        let raw = format!("{}:{}", credentials.user, credentials.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
        format!("Basic {}", encoded)
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    fn ensure_configured(&self) -> Result<(), MailError> {
        if self.config.credentials.is_none() {
            return Err(MailError::MissingCredentials);
        }
        if self.config.api_url.trim().is_empty() {
            return Err(MailError::MissingApiUrl);
        }
        Ok(())
    }

    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        self.ensure_configured()?;
        let credentials = self
            .config
            .credentials
            .as_ref()
            .ok_or(MailError::MissingCredentials)?;

        debug!(to = %message.to, subject = %message.subject, "Sending email");

        let response = self
            .http_client
            .post(&self.config.api_url)
            .header("Authorization", Self::auth_header(credentials))
            .json(message)
            .send()
            .await
            .map_err(|e| MailError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Delivery(format!("HTTP {}: {}", status, body)));
        }

        info!(to = %message.to, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_email_contents() {
        let message = activation_email("noreply@krysztalkowo.pl", "a@test.com", "Ann", "54321");
        assert_eq!(message.to, "a@test.com");
        assert!(message.text.contains("54321"));
        assert!(message.text.contains("15 minut"));
        assert!(message.html.contains("54321"));
        assert!(message.html.contains("Cześć Ann!"));
    }

    #[test]
    fn test_activation_email_escapes_name() {
        let message = activation_email("f@x.pl", "a@test.com", "<b>Ann</b>", "54321");
        assert!(message.html.contains("&lt;b&gt;Ann&lt;/b&gt;"));
        assert!(!message.html.contains("<b>Ann"));
    }

    #[test]
    fn test_missing_credentials_reported() {
        let mailer = HttpMailer::new(MailConfig {
            api_url: "https://mail.invalid/send".to_string(),
            from: "noreply@krysztalkowo.pl".to_string(),
            credentials: None,
        })
        .unwrap();
        assert!(matches!(
            mailer.ensure_configured(),
            Err(MailError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn test_missing_api_url_reported() {
        let mailer = HttpMailer::new(MailConfig {
            api_url: String::new(),
            from: "noreply@krysztalkowo.pl".to_string(),
            credentials: Some(MailCredentials {
                user: "bot".to_string(),
                password: "secret".to_string(),
            }),
        })
        .unwrap();
        assert!(matches!(
            mailer.ensure_configured(),
            Err(MailError::MissingApiUrl)
        ));

        let message = activation_email("noreply@krysztalkowo.pl", "a@test.com", "Ann", "54321");
        assert!(matches!(
            mailer.send(&message).await,
            Err(MailError::MissingApiUrl)
        ));
    }

    #[test]
    fn test_basic_auth_header() {
        let header = HttpMailer::auth_header(&MailCredentials {
            user: "user".to_string(),
            password: "pass".to_string(),
        });
        assert_eq!(header, "Basic dXNlcjpwYXNz");
    }
}
