//! Notification templates with `{placeholder}` substitution.

use crate::settings::SettingsStore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Placeholder tokens: `{name}`.
static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|_| unreachable!()));

/// Setting key prefix for persisted templates.
pub const TEMPLATE_SETTING_PREFIX: &str = "notification_template.";

/// Kinds of notification the desk sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A reader submitted a ticket.
    NewTicket,
    /// Staff replied to a ticket.
    TicketReply,
    /// A ticket changed status.
    StatusChange,
    /// One-time email verification code.
    VerificationCode,
}

impl NotificationKind {
    /// All kinds.
    pub const ALL: [Self; 4] = [
        Self::NewTicket,
        Self::TicketReply,
        Self::StatusChange,
        Self::VerificationCode,
    ];

    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NewTicket => "new_ticket",
            Self::TicketReply => "ticket_reply",
            Self::StatusChange => "status_change",
            Self::VerificationCode => "verification_code",
        }
    }

    /// Setting key holding the persisted template for this kind.
    #[must_use]
    pub fn setting_key(&self) -> String {
        format!("{TEMPLATE_SETTING_PREFIX}{}", self.as_str())
    }

    /// Built-in template used when none is persisted.
    #[must_use]
    pub const fn fallback(&self) -> MessageTemplate {
        match self {
            Self::NewTicket => MessageTemplate::fixed(
                "[Library Feedback] New ticket #{ticket_id}: {title}",
                "A new ticket was submitted by {user_name}.\n\nCategory: {category}\n\n{content}\n\nView it at {link}",
            ),
            Self::TicketReply => MessageTemplate::fixed(
                "[Library Feedback] Reply to ticket #{ticket_id}",
                "Hello {user_name},\n\n{replier} replied to your ticket \"{title}\":\n\n{content}\n\nView it at {link}",
            ),
            Self::StatusChange => MessageTemplate::fixed(
                "[Library Feedback] Ticket #{ticket_id} is now {status}",
                "Hello {user_name},\n\nThe status of your ticket \"{title}\" changed from {old_status} to {status}.\n\nView it at {link}",
            ),
            Self::VerificationCode => MessageTemplate::fixed(
                "[Library Feedback] Your verification code",
                "Your verification code is {code}. It expires in {expires_minutes} minutes.",
            ),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown notification kind: {s}")))
    }
}

/// Subject and body with `{placeholder}` tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    /// Subject line (also the webhook title).
    pub subject: Cow<'static, str>,
    /// Message body.
    pub body: Cow<'static, str>,
}

impl MessageTemplate {
    const fn fixed(subject: &'static str, body: &'static str) -> Self {
        Self {
            subject: Cow::Borrowed(subject),
            body: Cow::Borrowed(body),
        }
    }

    /// Renders subject and body with `vars`.
    #[must_use]
    pub fn render(&self, vars: &[(String, String)]) -> RenderedMessage {
        RenderedMessage {
            subject: render(&self.subject, vars),
            body: render(&self.body, vars),
        }
    }
}

/// A template after substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    /// Rendered subject.
    pub subject: String,
    /// Rendered body.
    pub body: String,
}

/// Replaces each `{name}` with the first matching value in `vars`.
///
/// Tokens without a value are left as-is. Substituted values are not
/// scanned again.
#[must_use]
pub fn render(template: &str, vars: &[(String, String)]) -> String {
    PLACEHOLDER_PATTERN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            vars.iter()
                .find(|(key, _)| key == name)
                .map_or_else(|| caps[0].to_string(), |(_, value)| value.clone())
        })
        .into_owned()
}

/// Resolves templates from settings, falling back to the built-in ones.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    settings: SettingsStore,
}

impl TemplateStore {
    /// Creates a store reading `notification_template.<kind>` settings.
    #[must_use]
    pub const fn new(settings: SettingsStore) -> Self {
        Self { settings }
    }

    /// Template for `kind`.
    ///
    /// A missing, malformed or unreadable setting yields the fallback.
    pub async fn template(&self, kind: NotificationKind) -> MessageTemplate {
        let key = kind.setting_key();
        match self.settings.get_setting(&key).await {
            Ok(Some(value)) => match serde_json::from_value::<MessageTemplate>(value) {
                Ok(template) => template,
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "Malformed notification template, using fallback");
                    kind.fallback()
                },
            },
            Ok(None) => kind.fallback(),
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Could not read notification template, using fallback");
                kind.fallback()
            },
        }
    }
}
