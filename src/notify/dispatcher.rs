//! Best-effort notification fan-out.
//!
//! ```text
//! Notification --> TemplateStore --> render --+--> MailSender (per recipient)
//!                                             |
//!                                             +--> WebhookPoster (once)
//! ```
//!
//! A failed recipient is logged and counted; delivery continues with the
//! next one. Nothing here returns an error to the caller.

use super::delivery::{MailSender, OutboundEmail, WebhookPoster};
use super::templates::{NotificationKind, RenderedMessage, TemplateStore};
use serde::Serialize;
use std::sync::Arc;

/// A notification to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Which template to use.
    pub kind: NotificationKind,
    /// Email recipients.
    pub recipients: Vec<String>,
    /// Placeholder values, in substitution order.
    pub vars: Vec<(String, String)>,
    /// Whether to also post to the webhook.
    pub webhook: bool,
}

impl Notification {
    /// Creates a notification with no recipients.
    #[must_use]
    pub const fn new(kind: NotificationKind) -> Self {
        Self {
            kind,
            recipients: Vec::new(),
            vars: Vec::new(),
            webhook: false,
        }
    }

    /// Adds an email recipient.
    #[must_use]
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    /// Adds a placeholder value.
    #[must_use]
    pub fn var(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.vars.push((name.into(), value.to_string()));
        self
    }

    /// Also posts to the webhook.
    #[must_use]
    pub const fn with_webhook(mut self) -> Self {
        self.webhook = true;
        self
    }
}

/// What happened to one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Emails accepted by the transport.
    pub emails_sent: usize,
    /// Emails that failed.
    pub emails_failed: usize,
    /// Webhook outcome, None when not attempted.
    pub webhook_delivered: Option<bool>,
}

/// Renders and delivers notifications.
#[derive(Clone)]
pub struct Notifier {
    templates: TemplateStore,
    mailer: Option<Arc<dyn MailSender>>,
    webhook: Option<Arc<dyn WebhookPoster>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("mailer", &self.mailer.is_some())
            .field("webhook", &self.webhook.is_some())
            .finish_non_exhaustive()
    }
}

impl Notifier {
    /// Creates a notifier with no transports configured.
    #[must_use]
    pub const fn new(templates: TemplateStore) -> Self {
        Self {
            templates,
            mailer: None,
            webhook: None,
        }
    }

    /// Sets the mail transport.
    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn MailSender>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Sets the webhook transport.
    #[must_use]
    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookPoster>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Renders and delivers `notification`.
    pub async fn dispatch(&self, notification: &Notification) -> DispatchReport {
        let template = self.templates.template(notification.kind).await;
        let message = template.render(&notification.vars);
        let kind = notification.kind;

        let mut report = DispatchReport::default();

        if !notification.recipients.is_empty() {
            match &self.mailer {
                Some(mailer) => {
                    let mailer = Arc::clone(mailer);
                    let recipients = notification.recipients.clone();
                    let message = message.clone();
                    let outcome = tokio::task::spawn_blocking(move || {
                        send_all(mailer.as_ref(), kind, &recipients, &message)
                    })
                    .await;
                    match outcome {
                        Ok((sent, failed)) => {
                            report.emails_sent = sent;
                            report.emails_failed = failed;
                        },
                        Err(e) => {
                            report.emails_failed = notification.recipients.len();
                            tracing::warn!(kind = %kind, error = %e, "Mail delivery task failed");
                        },
                    }
                },
                None => {
                    tracing::debug!(kind = %kind, "No mail transport configured, skipping email");
                },
            }
        }

        if notification.webhook
            && let Some(webhook) = &self.webhook
        {
            let webhook = Arc::clone(webhook);
            let RenderedMessage { subject, body } = message;
            let outcome =
                tokio::task::spawn_blocking(move || webhook.post(&subject, &body)).await;
            let delivered = match outcome {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!(kind = %kind, error = %e, "Webhook notification failed");
                    false
                },
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "Webhook delivery task failed");
                    false
                },
            };
            if !delivered {
                metrics::counter!("notification_delivery_failed_total", "channel" => "webhook")
                    .increment(1);
            }
            report.webhook_delivered = Some(delivered);
        }

        tracing::debug!(
            kind = %kind,
            emails_sent = report.emails_sent,
            emails_failed = report.emails_failed,
            webhook = ?report.webhook_delivered,
            "Notification dispatched"
        );
        report
    }
}

fn send_all(
    mailer: &dyn MailSender,
    kind: NotificationKind,
    recipients: &[String],
    message: &RenderedMessage,
) -> (usize, usize) {
    let mut sent = 0;
    let mut failed = 0;
    for recipient in recipients {
        let email = OutboundEmail {
            to: recipient.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
        };
        match mailer.send(&email) {
            Ok(()) => sent += 1,
            Err(e) => {
                failed += 1;
                metrics::counter!("notification_delivery_failed_total", "channel" => "email")
                    .increment(1);
                tracing::warn!(kind = %kind, recipient = %recipient, error = %e, "Email notification failed");
            },
        }
    }
    (sent, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigDescriptor, ConfigPaths, EnvSource};
    use crate::settings::SettingsStore;
    use crate::storage::ConnectionManager;
    use crate::{Error, Result};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutboundEmail>>,
        reject: Option<String>,
    }

    impl MailSender for RecordingMailer {
        fn send(&self, email: &OutboundEmail) -> Result<()> {
            if self.reject.as_deref() == Some(email.to.as_str()) {
                return Err(Error::operation("smtp_send", "mailbox unavailable"));
            }
            self.sent.lock().expect("lock").push(email.clone());
            Ok(())
        }
    }

    struct FailingWebhook;

    impl WebhookPoster for FailingWebhook {
        fn post(&self, _title: &str, _text: &str) -> Result<()> {
            Err(Error::operation("dingtalk_post", "errcode 310000: sign not match"))
        }
    }

    async fn settings(dir: &TempDir) -> SettingsStore {
        let manager = Arc::new(ConnectionManager::with_env(
            ConfigPaths::new(dir.path()),
            EnvSource::empty(),
        ));
        manager
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect("initialize");
        SettingsStore::new(manager)
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_stop_others() {
        let dir = TempDir::new().expect("temp dir");
        let mailer = Arc::new(RecordingMailer {
            reject: Some("bad@lib.example.edu".into()),
            ..RecordingMailer::default()
        });
        let notifier = Notifier::new(TemplateStore::new(settings(&dir).await))
            .with_mailer(Arc::clone(&mailer) as Arc<dyn MailSender>);

        let notification = Notification::new(NotificationKind::VerificationCode)
            .to("bad@lib.example.edu")
            .to("good@lib.example.edu")
            .var("code", 123_456)
            .var("expires_minutes", 10);
        let report = notifier.dispatch(&notification).await;

        assert_eq!(report.emails_sent, 1);
        assert_eq!(report.emails_failed, 1);
        let sent = mailer.sent.lock().expect("lock");
        assert_eq!(sent[0].to, "good@lib.example.edu");
        assert!(sent[0].body.contains("123456"));
    }

    #[tokio::test]
    async fn test_persisted_template_overrides_fallback() {
        let dir = TempDir::new().expect("temp dir");
        let settings = settings(&dir).await;
        settings
            .set_setting(
                &NotificationKind::NewTicket.setting_key(),
                &json!({"subject": "New: {title}", "body": "From {user_name}"}),
            )
            .await
            .expect("set");

        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(TemplateStore::new(settings))
            .with_mailer(Arc::clone(&mailer) as Arc<dyn MailSender>);

        notifier
            .dispatch(
                &Notification::new(NotificationKind::NewTicket)
                    .to("desk@lib.example.edu")
                    .var("title", "Broken scanner")
                    .var("user_name", "Lin"),
            )
            .await;

        let sent = mailer.sent.lock().expect("lock");
        assert_eq!(sent[0].subject, "New: Broken scanner");
        assert_eq!(sent[0].body, "From Lin");
    }

    #[tokio::test]
    async fn test_webhook_failure_is_reported_not_raised() {
        let dir = TempDir::new().expect("temp dir");
        let notifier = Notifier::new(TemplateStore::new(settings(&dir).await))
            .with_webhook(Arc::new(FailingWebhook));

        let report = notifier
            .dispatch(&Notification::new(NotificationKind::StatusChange).with_webhook())
            .await;
        assert_eq!(report.webhook_delivered, Some(false));
        assert_eq!(report.emails_sent, 0);
    }

    #[tokio::test]
    async fn test_unreadable_settings_use_fallback() {
        let dir = TempDir::new().expect("temp dir");
        let manager = Arc::new(ConnectionManager::with_env(
            ConfigPaths::new(dir.path()),
            EnvSource::empty(),
        ));
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(TemplateStore::new(SettingsStore::new(manager)))
            .with_mailer(Arc::clone(&mailer) as Arc<dyn MailSender>);

        notifier
            .dispatch(
                &Notification::new(NotificationKind::TicketReply)
                    .to("reader@lib.example.edu")
                    .var("ticket_id", 9),
            )
            .await;

        let sent = mailer.sent.lock().expect("lock");
        assert_eq!(sent[0].subject, "[Library Feedback] Reply to ticket #9");
    }
}
