//! Outbound email delivery.
//!
//! The auth core only needs "send this HTML to that address". Delivery is
//! best-effort from its point of view: callers log failures and move on.
//!
//! - `LogMailer` logs the message and returns `Ok(())` (local dev).
//! - `OutboxMailer` enqueues a row in `email_outbox` for an external worker.
//! - `RecordingMailer` keeps messages in memory so tests can read links back.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{Instrument, info, info_span};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        info!(to_email = %to, subject = %subject, body_len = html.len(), "email send stub");
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct OutboxMailer {
    pool: PgPool,
}

impl OutboxMailer {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let query = r"
            INSERT INTO email_outbox (to_email, subject, html, status)
            VALUES ($1, $2, $3, 'pending')
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(to)
            .bind(subject)
            .bind(html)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to enqueue email")?;
        Ok(())
    }
}

/// Keeps every message in memory. Optionally fails every send.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    fail: bool,
}

impl RecordingMailer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A mailer whose `send` always errors.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().await.clone()
    }

    pub async fn last_to(&self, to: &str) -> Option<OutgoingEmail> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|email| email.to == to)
            .cloned()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        if self.fail {
            anyhow::bail!("mail transport unavailable");
        }
        self.sent.lock().await.push(OutgoingEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

/// Pulls the first `token=` query value out of an email body.
#[must_use]
pub fn extract_token(html: &str) -> Option<String> {
    let start = html.find("token=")? + "token=".len();
    let token: String = html[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!token.is_empty()).then_some(token)
}
