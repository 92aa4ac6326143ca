//! Transactional email client
//!
//! Sign-in codes go out through the Resend HTTP API; tests capture them
//! with the mock implementation instead.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}

pub struct ResendMailer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

const RESEND_BASE_URL: &str = "https://api.resend.com";

impl ResendMailer {
    pub fn new(api_key: String, from: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build mail HTTP client")?;

        Ok(Self {
            client,
            base_url: RESEND_BASE_URL.to_string(),
            api_key,
            from,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    fn name(&self) -> &str {
        "resend"
    }

    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let body = serde_json::json!({
            "from": self.from,
            "to": [to],
            "subject": subject,
            "html": html,
        });

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Mail request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Mail API returned HTTP {}", response.status());
        }

        tracing::debug!("Sent mail to {}: {}", to, subject);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Records outgoing mail instead of sending it.
#[derive(Default)]
pub struct MockMailer {
    sent: tokio::sync::Mutex<Vec<SentMail>>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        self.sent.lock().await.push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

/// Subject and HTML body for the sign-in code email.
pub fn otp_email(code: &str) -> (String, String) {
    let subject = "Your Melodia sign-in code".to_string();
    let html = format!(
        "<p>Your sign-in code is:</p>\
         <p style=\"font-size:24px;font-weight:bold;letter-spacing:4px\">{}</p>\
         <p>The code expires in 10 minutes. If you didn't request it, you can ignore this email.</p>",
        code
    );
    (subject, html)
}
