//! Outbound message relay for the contact and newsletter forms.
//!
//! Sends are fire-and-forget: the outcome only drives the toast shown to the
//! user and nothing is retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

/// Contact form as submitted by the page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactForm {
    pub from_name: String,
    pub from_email: String,
    pub subject: String,
    pub message: String,
}

impl ContactForm {
    /// Check required fields and address the message to `to_email`.
    pub fn into_message(self, to_email: &str) -> Result<OutboundMessage, RelayError> {
        let required = [
            ("from_name", &self.from_name),
            ("from_email", &self.from_email),
            ("message", &self.message),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(RelayError::MissingField(name));
            }
        }
        check_email(&self.from_email)?;

        Ok(OutboundMessage::Contact {
            from_name: self.from_name.trim().to_string(),
            from_email: self.from_email.trim().to_string(),
            subject: self.subject.trim().to_string(),
            message: self.message,
            to_email: to_email.to_string(),
        })
    }
}

fn check_email(email: &str) -> Result<(), RelayError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(RelayError::InvalidEmail(email.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Contact {
        from_name: String,
        from_email: String,
        subject: String,
        message: String,
        to_email: String,
    },
    Newsletter {
        email: String,
    },
}

impl OutboundMessage {
    pub fn newsletter(email: &str) -> Result<Self, RelayError> {
        if email.trim().is_empty() {
            return Err(RelayError::MissingField("email"));
        }
        check_email(email)?;
        Ok(OutboundMessage::Newsletter {
            email: email.trim().to_string(),
        })
    }
}

#[async_trait]
pub trait Relay: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), RelayError>;
}

/// Relay that records messages in the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogRelay {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl LogRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Relay for LogRelay {
    async fn send(&self, message: OutboundMessage) -> Result<(), RelayError> {
        match &message {
            OutboundMessage::Contact {
                from_email,
                subject,
                to_email,
                ..
            } => info!(from = %from_email, to = %to_email, subject = %subject, "contact message"),
            OutboundMessage::Newsletter { email } => info!(email = %email, "newsletter signup"),
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
        Ok(())
    }
}
