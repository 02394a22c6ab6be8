//! WhatsApp through an HTTP gateway accepting `{to, body}`.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{Message, NotifyError, Target, Transport};
use crate::settings::NotifySettings;

#[derive(Serialize)]
struct GatewayMessage<'a> {
    to: &'a str,
    body: &'a str,
}

pub struct WhatsAppTransport {
    http: reqwest::Client,
    gateway_url: String,
}

impl WhatsAppTransport {
    pub fn new(gateway_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            gateway_url: gateway_url.into(),
        })
    }
}

#[async_trait]
impl Transport for WhatsAppTransport {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    fn targets(&self, settings: &NotifySettings) -> Vec<Target> {
        if !settings.wa_enabled {
            return vec![];
        }
        [&settings.wa_target, &settings.wa_target_group]
            .into_iter()
            .flatten()
            .filter(|to| !to.is_empty())
            .map(Target::new)
            .collect()
    }

    async fn send(&self, target: &Target, message: &Message<'_>) -> Result<(), NotifyError> {
        let body = GatewayMessage { to: &target.to, body: message.text };
        let resp = self.http.post(&self.gateway_url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_and_group_are_separate_targets() {
        let wa = WhatsAppTransport::new("http://localhost:3000/send", Duration::from_secs(5)).unwrap();
        let mut settings = NotifySettings {
            wa_enabled: true,
            wa_target: Some("5511999990000".into()),
            wa_target_group: Some("noc-group".into()),
            ..Default::default()
        };
        let to: Vec<String> = wa.targets(&settings).into_iter().map(|t| t.to).collect();
        assert_eq!(to, vec!["5511999990000", "noc-group"]);

        settings.wa_target_group = Some(String::new());
        assert_eq!(wa.targets(&settings).len(), 1);

        settings.wa_enabled = false;
        assert!(wa.targets(&settings).is_empty());
    }
}
