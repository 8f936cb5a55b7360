//! User notifications.
//!
//! All users share one sender; messages are routed by chat id. Send
//! failures are logged, never propagated: a lost notification must not
//! halt a strategy.

use async_trait::async_trait;
use teloxide::prelude::Requester;
use teloxide::types::ChatId;
use teloxide::Bot;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier platform '{0}' not supported")]
    UnsupportedPlatform(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str);
}

/// Telegram sender backed by the bot API.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token.into()),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.bot.send_message(ChatId(chat_id), text).await {
            error!(chat_id, error = %e, "failed to send telegram message");
        }
    }
}

/// Sender that only logs; used when no notifier platform is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, chat_id: i64, text: &str) {
        debug!(chat_id, "notification dropped: {text}");
    }
}

/// Build a sender by platform name.
pub fn new_notifier(
    platform: &str,
    token: &str,
) -> Result<std::sync::Arc<dyn Notifier>, NotifyError> {
    match platform {
        "telegram" => Ok(std::sync::Arc::new(TelegramNotifier::new(token))),
        "none" => Ok(std::sync::Arc::new(NullNotifier)),
        other => Err(NotifyError::UnsupportedPlatform(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_platform_rejected() {
        assert!(matches!(
            new_notifier("carrier-pigeon", ""),
            Err(NotifyError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_known_platforms() {
        assert!(new_notifier("telegram", "123:token").is_ok());
        assert!(new_notifier("none", "").is_ok());
    }
}
