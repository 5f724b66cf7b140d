//! Alert delivery by mail

use std::fmt;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use super::rules::Alert;
use crate::model::AlertKind;
use crate::util;

#[derive(Debug)]
pub enum MailError {
    /// A required setting is missing from the environment
    NotConfigured(&'static str),

    /// Sender or recipient is not a valid address
    Address(String),

    Build(String),

    Transport(String),
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailError::NotConfigured(var) => write!(f, "mail not configured: {} is not set", var),
            MailError::Address(msg) => write!(f, "invalid mail address: {}", msg),
            MailError::Build(msg) => write!(f, "failed to build mail: {}", msg),
            MailError::Transport(msg) => write!(f, "SMTP error: {}", msg),
        }
    }
}

impl std::error::Error for MailError {}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver `alert` to its destination; `Ok` means the relay accepted it
    async fn send(&self, alert: &Alert) -> Result<(), MailError>;
}

pub fn subject(alert: &Alert) -> String {
    format!(
        "[ALERT] {} triggered for {}",
        alert.kind.as_str().to_uppercase(),
        alert.url
    )
}

pub fn body(alert: &Alert) -> String {
    let mut body = format!(
        "Hello,\n\n\
         This is an automated notification from the URL monitoring system.\n\n\
         Alert Type: {}\n\
         URL: {}\n",
        alert.kind, alert.url
    );

    if let (true, Some(metric)) = (alert.kind.needs_metric(), alert.metric) {
        let shown = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| v.to_string());
        body.push_str(&format!(
            "\nMetric: {}\nValue: {}\nThreshold: {}\n",
            metric,
            shown(alert.value),
            shown(alert.threshold)
        ));
    }

    match alert.kind {
        AlertKind::OnDown => body.push_str("\nThe site appears to be DOWN.\n"),
        AlertKind::OnBrokenLink => {
            body.push_str("\nThe page contains broken link(s):\n");
            for link in &alert.broken_links {
                body.push_str(&format!("  {link}\n"));
            }
        }
        AlertKind::HardCap | AlertKind::PercentCap => {}
    }

    body.push_str("\nThis message was generated automatically by the system.");
    body
}

/// SMTP relay settings
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub sender: String,
    pub password: String,
}

impl SmtpSettings {
    /// `SENDER_EMAIL` and `SENDER_PASSWORD` are required, `SMTP_SERVER` and
    /// `SMTP_PORT` default to Gmail's STARTTLS relay
    pub fn from_env() -> Result<Self, MailError> {
        Ok(Self {
            server: util::get_smtp_server(),
            port: util::get_smtp_port(),
            sender: util::get_sender_email().ok_or(MailError::NotConfigured("SENDER_EMAIL"))?,
            password: util::get_sender_password()
                .ok_or(MailError::NotConfigured("SENDER_PASSWORD"))?,
        })
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Result<Self, MailError> {
        let sender: Mailbox = settings
            .sender
            .parse()
            .map_err(|e: lettre::address::AddressError| MailError::Address(e.to_string()))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)
            .map_err(|e| MailError::Transport(e.to_string()))?
            .port(settings.port)
            .credentials(Credentials::new(settings.sender, settings.password))
            .build();

        Ok(Self { transport, sender })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, alert: &Alert) -> Result<(), MailError> {
        let recipient: Mailbox = alert
            .destination
            .parse()
            .map_err(|e: lettre::address::AddressError| MailError::Address(e.to_string()))?;

        let email = Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(subject(alert))
            .header(ContentType::TEXT_PLAIN)
            .body(body(alert))
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        info!(to = %alert.destination, kind = %alert.kind, "alert mail sent for {}", alert.url);
        Ok(())
    }
}
