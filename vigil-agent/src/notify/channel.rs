//! Channel transports
//!
//! Every channel kind implements `ChannelTransport::send(destination, text)`.
//! Transports classify their own failures: anything a retry could fix is
//! `Transient`, everything else `Permanent`.

use super::dispatcher::ChannelTarget;
use crate::config::{AgentConfig, ChannelKind};
use crate::error::ChannelDeliveryError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rumqttc::{AsyncClient, QoS};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send(&self, destination: &str, text: &str) -> Result<(), ChannelDeliveryError>;
}

fn classify_status(status: StatusCode) -> Result<(), ChannelDeliveryError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        Err(ChannelDeliveryError::Transient(format!("HTTP {}", status)))
    } else {
        Err(ChannelDeliveryError::Permanent(format!("HTTP {}", status)))
    }
}

fn classify_error(error: reqwest::Error) -> ChannelDeliveryError {
    if error.is_builder() {
        ChannelDeliveryError::Permanent(error.to_string())
    } else {
        ChannelDeliveryError::Transient(error.to_string())
    }
}

/// HTTP POST of `{"text": ...}`; also feeds the operator web interface
pub struct WebhookTransport {
    client: Client,
}

impl WebhookTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelTransport for WebhookTransport {
    async fn send(&self, destination: &str, text: &str) -> Result<(), ChannelDeliveryError> {
        let response = self
            .client
            .post(destination)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(classify_error)?;
        classify_status(response.status())
    }
}

/// SMS gateway REST API (Twilio-style form post with basic auth)
pub struct SmsTransport {
    client: Client,
    api_base: String,
    account_sid: String,
    from_number: String,
    auth_token: Option<String>,
}

impl SmsTransport {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        account_sid: impl Into<String>,
        from_number: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            account_sid: account_sid.into(),
            from_number: from_number.into(),
            auth_token,
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            self.account_sid
        )
    }
}

#[async_trait]
impl ChannelTransport for SmsTransport {
    async fn send(&self, destination: &str, text: &str) -> Result<(), ChannelDeliveryError> {
        let token = self
            .auth_token
            .as_deref()
            .ok_or_else(|| ChannelDeliveryError::Permanent("no SMS auth token configured".into()))?;

        let form = [("To", destination), ("From", self.from_number.as_str()), ("Body", text)];
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(token))
            .form(&form)
            .send()
            .await
            .map_err(classify_error)?;
        classify_status(response.status())
    }
}

/// HTTP mail relay: `POST relay_url` with `{to, subject, text}`
pub struct EmailTransport {
    client: Client,
    relay_url: String,
    from_address: Option<String>,
}

impl EmailTransport {
    pub fn new(client: Client, relay_url: impl Into<String>, from_address: Option<String>) -> Self {
        Self { client, relay_url: relay_url.into(), from_address }
    }
}

#[async_trait]
impl ChannelTransport for EmailTransport {
    async fn send(&self, destination: &str, text: &str) -> Result<(), ChannelDeliveryError> {
        let subject = text.lines().next().unwrap_or("Vigil alert");
        let mut body = json!({ "to": destination, "subject": subject, "text": text });
        if let Some(from) = &self.from_address {
            body["from"] = json!(from);
        }

        let response = self
            .client
            .post(&self.relay_url)
            .json(&body)
            .send()
            .await
            .map_err(classify_error)?;
        classify_status(response.status())
    }
}

/// Publish to an operator topic on the platform broker
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelTransport for MqttTransport {
    async fn send(&self, destination: &str, text: &str) -> Result<(), ChannelDeliveryError> {
        let payload = json!({ "text": text }).to_string();
        self.client
            .publish(destination, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ChannelDeliveryError::Transient(e.to_string()))?;
        debug!("Alert published on {}", destination);
        Ok(())
    }
}

/// Bind every usable configured channel to its transport. MQTT channels need
/// the platform broker client.
pub fn build_targets(config: &AgentConfig, http: Client, mqtt: Option<AsyncClient>) -> Vec<ChannelTarget> {
    let mut targets = Vec::new();

    for channel in config.usable_channels() {
        let transport: Arc<dyn ChannelTransport> = match channel.kind {
            ChannelKind::Webhook => Arc::new(WebhookTransport::new(http.clone())),
            ChannelKind::Sms => {
                let sms = &config.notify.sms;
                match (&sms.account_sid, &sms.from_number) {
                    (Some(sid), Some(from)) => Arc::new(SmsTransport::new(
                        http.clone(),
                        sms.api_base.clone(),
                        sid.clone(),
                        from.clone(),
                        sms.auth_token.clone(),
                    )),
                    _ => continue,
                }
            }
            ChannelKind::Email => match &config.notify.email.relay_url {
                Some(url) => Arc::new(EmailTransport::new(
                    http.clone(),
                    url.clone(),
                    config.notify.email.from_address.clone(),
                )),
                None => continue,
            },
            ChannelKind::Mqtt => match &mqtt {
                Some(client) => Arc::new(MqttTransport::new(client.clone())),
                None => {
                    warn!("Skipping channel {}: no broker connection", channel.channel_name());
                    continue;
                }
            },
        };
        targets.push(ChannelTarget::new(channel, transport));
    }
    targets
}
