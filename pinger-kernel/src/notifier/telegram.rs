//! Telegram Bot API `sendMessage`.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{Message, NotifyError, Target, Transport};
use crate::settings::NotifySettings;

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

pub struct TelegramTransport {
    http: reqwest::Client,
    api_url: String,
}

impl TelegramTransport {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, token: &str) -> String {
        format!("{}/bot{}/sendMessage", self.api_url, token)
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn targets(&self, settings: &NotifySettings) -> Vec<Target> {
        if !settings.tg_enabled {
            return vec![];
        }
        match (&settings.token, &settings.chat_id) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
                vec![Target { to: chat.clone(), credential: Some(token.clone()) }]
            }
            _ => {
                tracing::debug!("telegram enabled without token or chat_id");
                vec![]
            }
        }
    }

    async fn send(&self, target: &Target, message: &Message<'_>) -> Result<(), NotifyError> {
        let token = target
            .credential
            .as_deref()
            .ok_or_else(|| NotifyError::Misconfigured("telegram target without bot token".into()))?;
        let body = SendMessage { chat_id: &target.to, text: message.text, disable_web_page_preview: true };
        let resp = self.http.post(self.endpoint(token)).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}
