//! Email and DingTalk notifications.
//!
//! Templates come from settings with built-in fallbacks; delivery goes
//! through the [`MailSender`] and [`WebhookPoster`] collaborators.

mod delivery;
mod dispatcher;
mod templates;

pub use delivery::{
    DingTalkWebhook, ENV_DINGTALK_SECRET, ENV_DINGTALK_WEBHOOK, MailSender, OutboundEmail,
    WebhookPoster, sign,
};
pub use dispatcher::{DispatchReport, Notification, Notifier};
pub use templates::{
    MessageTemplate, NotificationKind, RenderedMessage, TEMPLATE_SETTING_PREFIX, TemplateStore,
    render,
};
