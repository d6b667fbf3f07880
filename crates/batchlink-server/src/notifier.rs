// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion and error notifications.
//!
//! A [`Notifier`] delivers a rendered [`Notice`] somewhere: email over SMTP,
//! a webhook, or just the log. The [`NotificationDispatcher`] turns completion events into
//! notices and records the delivery outcome on the batch; it is also the
//! sweeper's [`CompletionSink`].

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use batchlink_core::sweeper::deliver_completion;
use batchlink_core::{
    CompletionEvent, CompletionSink, CorrelationService, DeliveryError, DeliveryOutcome,
};

use crate::config::{SmtpConfig, SmtpTls};
use crate::rows::render_csv;

/// What a notice reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// The batch completed; the results CSV is attached.
    Results,
    /// Processing of the batch hit an error.
    Error,
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub batch_id: String,
    pub owner_contact: String,
    pub kind: NoticeKind,
    pub subject: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv: Option<String>,
}

impl Notice {
    /// Results notice for a completed batch.
    pub fn results(event: &CompletionEvent, csv: String) -> Self {
        Self {
            batch_id: event.batch_id.clone(),
            owner_contact: event.owner_contact.clone(),
            kind: NoticeKind::Results,
            subject: format!("Results ready for batch {}", event.batch_id),
            message: format!(
                "Your batch {} has completed: {} of {} items resolved, {} errors. The CSV is attached.",
                event.batch_id,
                event.results.len(),
                event.total_items,
                event.errors.len()
            ),
            csv: Some(csv),
        }
    }

    /// Error notice for a batch whose processing failed.
    pub fn error(batch_id: &str, owner_contact: &str, error: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            owner_contact: owner_contact.to_string(),
            kind: NoticeKind::Error,
            subject: format!("Processing error for batch {}", batch_id),
            message: format!("Batch {} encountered an error: {}", batch_id, error),
            csv: None,
        }
    }
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The request could not be sent.
    #[error("Failed to send notification: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success status.
    #[error("Notification endpoint returned status {0}")]
    Status(u16),

    /// The results could not be rendered.
    #[error("Failed to render results: {0}")]
    Render(String),

    /// A sender or recipient is not a valid mailbox.
    #[error("Invalid email address '{0}': {1}")]
    Address(String, String),

    /// The email could not be assembled.
    #[error("Failed to build email: {0}")]
    Message(String),
}

/// Notification channel.
#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Deliver one notice.
    async fn send(&self, notice: &Notice) -> Result<(), NotifyError>;

    /// Channel name, for logs.
    fn name(&self) -> &str;
}

/// Writes notices to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notice: &Notice) -> Result<(), NotifyError> {
        info!(
            batch_id = %notice.batch_id,
            owner_contact = %notice.owner_contact,
            kind = ?notice.kind,
            subject = %notice.subject,
            csv_bytes = notice.csv.as_ref().map(String::len),
            "Notification"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// POSTs notices as JSON to a webhook.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a webhook notifier.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notice: &Notice) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Emails notices through an SMTP relay. Results notices carry the CSV as
/// an attachment.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl std::fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailNotifier")
            .field("from", &self.from.to_string())
            .finish()
    }
}

impl EmailNotifier {
    /// Create an email notifier. Does not connect.
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let from = parse_mailbox(&config.from)?;
        let builder = match config.tls {
            SmtpTls::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host),
            SmtpTls::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            }
            SmtpTls::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                &config.host,
            )),
        }
        .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let builder = builder.port(config.port);
        let builder = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                builder.credentials(Credentials::new(user.clone(), password.clone()))
            }
            _ => builder,
        };

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    /// Assemble the email for a notice.
    pub fn build_message(&self, notice: &Notice) -> Result<Message, NotifyError> {
        let builder = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(&notice.owner_contact)?)
            .subject(notice.subject.clone());
        let body = SinglePart::plain(notice.message.clone());

        let message = match &notice.csv {
            Some(csv) => {
                let content_type = ContentType::parse("text/csv; charset=utf-8")
                    .map_err(|e| NotifyError::Message(e.to_string()))?;
                let attachment = Attachment::new(format!("results_{}.csv", notice.batch_id))
                    .body(csv.clone().into_bytes(), content_type);
                builder.multipart(MultiPart::mixed().singlepart(body).singlepart(attachment))
            }
            None => builder.singlepart(body),
        };
        message.map_err(|e| NotifyError::Message(e.to_string()))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| {
            NotifyError::Address(address.to_string(), e.to_string())
        })
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, notice: &Notice) -> Result<(), NotifyError> {
        let message = self.build_message(notice)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        info!(batch_id = %notice.batch_id, kind = ?notice.kind, "Email sent");
        Ok(())
    }

    fn name(&self) -> &str {
        "email"
    }
}

/// Turns completion events into notices and records the outcome.
pub struct NotificationDispatcher {
    service: Arc<CorrelationService>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("service", &"...")
            .field("notifier", &self.notifier.name())
            .finish()
    }
}

impl NotificationDispatcher {
    /// Create a dispatcher.
    pub fn new(service: Arc<CorrelationService>, notifier: Arc<dyn Notifier>) -> Self {
        Self { service, notifier }
    }

    /// Name of the notification channel in use.
    pub fn channel(&self) -> &str {
        self.notifier.name()
    }

    /// Deliver a completion notice and record the outcome on the batch.
    ///
    /// Returns whether this call delivered it. Failures never propagate: the
    /// batch stays complete and the sweeper retries later.
    pub async fn notify_completion(&self, event: &CompletionEvent) -> bool {
        match deliver_completion(&self.service, self, event).await {
            Ok(outcome) => outcome == DeliveryOutcome::Delivered,
            Err(e) => {
                error!(batch_id = %event.batch_id, error = %e, "Failed to record notification outcome");
                false
            }
        }
    }

    /// Notify in the background.
    pub fn spawn_completion(self: &Arc<Self>, event: CompletionEvent) -> JoinHandle<bool> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.notify_completion(&event).await })
    }

    /// Send an error notice for a batch. Failures are logged.
    pub async fn notify_error(&self, batch_id: &str, owner_contact: &str, error: &str) {
        let notice = Notice::error(batch_id, owner_contact, error);
        if let Err(e) = self.notifier.send(&notice).await {
            warn!(batch_id, channel = self.notifier.name(), error = %e, "Error notice failed");
        }
    }
}

#[async_trait]
impl CompletionSink for NotificationDispatcher {
    async fn deliver(&self, event: &CompletionEvent) -> Result<(), DeliveryError> {
        let results = match self.service.results(&event.batch_id).await {
            Ok(results) => results,
            Err(e) => {
                warn!(batch_id = %event.batch_id, error = %e, "Results log unavailable, using batch record");
                event.results.clone()
            }
        };
        let csv = render_csv(&results)
            .map_err(|e| DeliveryError(NotifyError::Render(e.to_string()).to_string()))?;

        let notice = Notice::results(event, String::from_utf8_lossy(&csv).into_owned());
        self.notifier
            .send(&notice)
            .await
            .map_err(|e| DeliveryError(format!("{} notifier: {}", self.notifier.name(), e)))
    }
}
