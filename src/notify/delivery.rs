//! Outbound collaborators: mail and webhook.
//!
//! Both are synchronous, matching the blocking HTTP client; the dispatcher
//! runs them on the blocking thread pool.
//!
//! # DingTalk signing
//!
//! When a secret is configured the robot URL carries `timestamp` (epoch
//! milliseconds) and `sign`, where `sign` is
//! `base64(HMAC-SHA256(key = secret, message = "{timestamp}\n{secret}"))`.
//! Delivery is a single attempt; DingTalk reports failures in the body as a
//! non-zero `errcode`.

use crate::config::EnvSource;
use crate::{Error, Result};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Robot webhook URL.
pub const ENV_DINGTALK_WEBHOOK: &str = "DINGTALK_WEBHOOK";
/// Robot signing secret.
pub const ENV_DINGTALK_SECRET: &str = "DINGTALK_SECRET";

/// One outbound email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Sends email. Implemented by the host application's mail transport.
pub trait MailSender: Send + Sync {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the message.
    fn send(&self, email: &OutboundEmail) -> Result<()>;
}

/// Posts a titled message to a chat webhook.
pub trait WebhookPoster: Send + Sync {
    /// Posts one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the receiver rejects it.
    fn post(&self, title: &str, text: &str) -> Result<()>;
}

/// DingTalk custom robot.
///
/// The blocking HTTP client owns a private runtime, which must neither be
/// created nor dropped on an async worker thread. It is built on the first
/// [`WebhookPoster::post`] (which the dispatcher runs on the blocking pool)
/// and handed to a plain thread for dropping when the robot is dropped
/// inside a runtime.
pub struct DingTalkWebhook {
    url: String,
    secret: Option<SecretString>,
    client: OnceLock<reqwest::blocking::Client>,
}

impl std::fmt::Debug for DingTalkWebhook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkWebhook")
            .field("signed", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct DingTalkResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

impl DingTalkWebhook {
    /// Creates a robot client for `url`, signing when `secret` is set.
    #[must_use]
    pub fn new(url: impl Into<String>, secret: Option<SecretString>) -> Self {
        Self {
            url: url.into(),
            secret,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("deskbase/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::operation("dingtalk_client", e))?;
        Ok(self.client.get_or_init(|| client))
    }

    /// Reads `DINGTALK_WEBHOOK` and `DINGTALK_SECRET`; None without a URL.
    #[must_use]
    pub fn from_env(env: &EnvSource) -> Option<Self> {
        let url = env.get(ENV_DINGTALK_WEBHOOK)?;
        let secret = env.get(ENV_DINGTALK_SECRET).map(SecretString::from);
        Some(Self::new(url, secret))
    }

    /// The robot URL for a request made at `timestamp_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the configured URL does not parse.
    pub fn request_url(&self, timestamp_ms: i64) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.url)
            .map_err(|e| Error::InvalidInput(format!("invalid DingTalk webhook URL: {e}")))?;
        if let Some(secret) = &self.secret {
            let sign = sign(secret.expose_secret(), timestamp_ms);
            url.query_pairs_mut()
                .append_pair("timestamp", &timestamp_ms.to_string())
                .append_pair("sign", &sign);
        }
        Ok(url)
    }
}

impl WebhookPoster for DingTalkWebhook {
    fn post(&self, title: &str, text: &str) -> Result<()> {
        let url = self.request_url(chrono::Utc::now().timestamp_millis())?;
        let body = serde_json::json!({
            "msgtype": "markdown",
            "markdown": { "title": title, "text": format!("### {title}\n\n{text}") },
        });

        let response = self
            .client()?
            .post(url)
            .json(&body)
            .send()
            .map_err(|e| Error::operation("dingtalk_post", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::operation("dingtalk_post", format!("HTTP {status}")));
        }

        let reply: DingTalkResponse = response
            .json()
            .map_err(|e| Error::operation("dingtalk_response", e))?;
        if reply.errcode != 0 {
            return Err(Error::operation(
                "dingtalk_post",
                format!("errcode {}: {}", reply.errcode, reply.errmsg),
            ));
        }
        Ok(())
    }
}

impl Drop for DingTalkWebhook {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            let _ = thread::spawn(move || drop(client)).join();
        }
    }
}

/// Computes the DingTalk request signature.
#[must_use]
pub fn sign(secret: &str, timestamp_ms: i64) -> String {
    type HmacSha256 = Hmac<Sha256>;

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts keys of any length")
    };
    mac.update(format!("{timestamp_ms}\n{secret}").as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_matches_reference() {
        // HMAC-SHA256(key = "SEC123", msg = "1700000000000\nSEC123"), base64.
        let expected = {
            let mut mac = Hmac::<Sha256>::new_from_slice(b"SEC123").expect("key");
            mac.update(b"1700000000000\nSEC123");
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
        };
        assert_eq!(sign("SEC123", 1_700_000_000_000), expected);
        assert_eq!(expected.len(), 44);
    }

    #[test]
    fn test_signed_url_carries_timestamp_and_sign() {
        let hook = DingTalkWebhook::new(
            "https://oapi.dingtalk.com/robot/send?access_token=abc",
            Some(SecretString::from("SEC123".to_string())),
        );
        let url = hook.request_url(1_700_000_000_000).expect("url");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert_eq!(pairs[0], ("access_token".into(), "abc".into()));
        assert_eq!(pairs[1], ("timestamp".into(), "1700000000000".into()));
        assert_eq!(pairs[2].0, "sign");
        assert_eq!(pairs[2].1, sign("SEC123", 1_700_000_000_000));
    }

    #[test]
    fn test_unsigned_url_is_unchanged() {
        let hook = DingTalkWebhook::new("https://oapi.dingtalk.com/robot/send?access_token=abc", None);
        let url = hook.request_url(1).expect("url");
        assert_eq!(url.query(), Some("access_token=abc"));
    }

    #[test]
    fn test_from_env_requires_url() {
        assert!(DingTalkWebhook::from_env(&EnvSource::empty()).is_none());
        let env = EnvSource::from_pairs([(ENV_DINGTALK_WEBHOOK, "https://example.invalid/hook")]);
        assert!(DingTalkWebhook::from_env(&env).is_some());
    }

    #[tokio::test]
    async fn test_construct_and_drop_inside_runtime() {
        let hook = DingTalkWebhook::new(
            "https://example.invalid/robot/send?access_token=x",
            Some(SecretString::from("SEC123".to_string())),
        );
        assert!(hook.request_url(1).is_ok());
        drop(hook);

        let env = EnvSource::from_pairs([(ENV_DINGTALK_WEBHOOK, "https://example.invalid/hook")]);
        drop(DingTalkWebhook::from_env(&env));
    }

    #[tokio::test]
    async fn test_used_client_drops_inside_runtime() {
        let hook = std::sync::Arc::new(DingTalkWebhook::new("http://127.0.0.1:1/robot", None));
        let poster = std::sync::Arc::clone(&hook);
        let result = tokio::task::spawn_blocking(move || poster.post("title", "text"))
            .await
            .expect("join");

        assert!(result.is_err());
        assert!(hook.client.get().is_some());
        drop(hook);
    }

    #[test]
    fn test_bad_url_is_invalid_input() {
        let hook = DingTalkWebhook::new("not a url", None);
        assert!(matches!(hook.request_url(1), Err(Error::InvalidInput(_))));
    }
}
