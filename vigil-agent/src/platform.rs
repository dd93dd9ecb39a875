//! MQTT link to the flight platform
//!
//! Request/response over the platform broker:
//! - Command published on `vigil/platform/command@v1/<agent_id>`
//! - Ack expected on `vigil/platform/ack@v1/<agent_id>` with the same `command_id`
//!
//! Pending commands wait on a oneshot keyed by `command_id`; the event loop task
//! routes acks to them. The platform dedups on `command_id`, so re-publishing
//! the same id after a lost ack is safe.

use crate::command::PlatformLink;
use crate::config::AgentConfig;
use crate::error::LinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub fn command_topic(agent_id: &str) -> String {
    format!("vigil/platform/command@v1/{}", agent_id)
}

pub fn ack_topic(agent_id: &str) -> String {
    format!("vigil/platform/ack@v1/{}", agent_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformCommand {
    pub command_id: Uuid,
    pub agent_id: String,
    pub command_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformAck {
    pub command_id: Uuid,
    pub status: AckStatus,
    #[serde(default)]
    pub message: Option<String>,
}

pub struct MqttPlatformLink {
    client: AsyncClient,
    agent_id: String,
    attempt_timeout: Duration,
    connected: AtomicBool,
    pending: PendingAcks,
}

impl MqttPlatformLink {
    pub fn new(client: AsyncClient, agent_id: impl Into<String>, attempt_timeout: Duration) -> Self {
        Self {
            client,
            agent_id: agent_id.into(),
            attempt_timeout,
            connected: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Create the broker client and start its event loop
    pub fn connect(config: &AgentConfig) -> (Arc<Self>, JoinHandle<()>) {
        let client_id = format!("vigil-agent-{}", config.agent.agent_id);
        let mut options = MqttOptions::new(
            client_id,
            &config.platform.broker_host,
            config.platform.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(config.platform.keep_alive_secs));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 10);
        let link = Arc::new(Self::new(
            client,
            config.agent.agent_id.clone(),
            Duration::from_millis(config.command.attempt_timeout_ms),
        ));
        let handle = tokio::spawn(run_event_loop(eventloop, link.clone()));

        info!(
            "Platform link to {}:{} for agent {}",
            config.platform.broker_host, config.platform.broker_port, config.agent.agent_id
        );
        (link, handle)
    }

    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Route an ack payload to the command waiting for it
    pub fn handle_ack(&self, payload: &[u8]) {
        let ack: PlatformAck = match serde_json::from_slice(payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Ignoring malformed platform ack: {}", e);
                return;
            }
        };

        let command_id = ack.command_id;
        match self.pending.lock().remove(&command_id) {
            Some(sender) => {
                if sender.send(ack).is_err() {
                    debug!(%command_id, "Ack arrived after the command gave up");
                }
            }
            None => debug!(%command_id, "Ack for unknown or settled command"),
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

type PendingAcks = Mutex<HashMap<Uuid, oneshot::Sender<PlatformAck>>>;

/// Removes a pending entry however the wait ends, including when the caller
/// drops the future on its own timeout
struct PendingGuard<'a> {
    pending: &'a PendingAcks,
    command_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.command_id);
    }
}

#[async_trait]
impl PlatformLink for MqttPlatformLink {
    async fn send_return_to_base(&self, command_id: Uuid) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }

        let command = PlatformCommand {
            command_id,
            agent_id: self.agent_id.clone(),
            command_type: "return_to_base".to_string(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&command).map_err(|e| LinkError::Transient(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(command_id, tx);
        let _guard = PendingGuard { pending: &self.pending, command_id };

        if let Err(e) = self
            .client
            .publish(command_topic(&self.agent_id), QoS::AtLeastOnce, false, payload)
            .await
        {
            return Err(LinkError::Transient(e.to_string()));
        }
        debug!(%command_id, "Return-to-base published");

        match timeout(self.attempt_timeout, rx).await {
            Ok(Ok(ack)) => match ack.status {
                AckStatus::Accepted => Ok(()),
                AckStatus::Rejected => Err(LinkError::Rejected(
                    ack.message.unwrap_or_else(|| "no reason given".to_string()),
                )),
            },
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => Err(LinkError::Timeout(self.attempt_timeout.as_millis() as u64)),
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, link: Arc<MqttPlatformLink>) {
    let ack_topic = ack_topic(&link.agent_id);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                link.set_connected(true);
                // clean sessions drop subscriptions on reconnect
                if let Err(e) = link.client.try_subscribe(&ack_topic, QoS::AtLeastOnce) {
                    error!("Failed to subscribe to {}: {}", ack_topic, e);
                }
                info!("Connected to platform broker");
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if publish.topic == ack_topic {
                    link.handle_ack(&publish.payload);
                } else {
                    debug!("Received MQTT message on topic: {}", publish.topic);
                }
            }
            Ok(_) => {}
            Err(e) => {
                if link.is_connected() {
                    error!("MQTT connection error: {}", e);
                }
                link.set_connected(false);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(attempt_timeout: Duration) -> (Arc<MqttPlatformLink>, EventLoop) {
        let options = MqttOptions::new("vigil-test", "127.0.0.1", 1883);
        let (client, eventloop) = AsyncClient::new(options, 10);
        (Arc::new(MqttPlatformLink::new(client, "drone-7", attempt_timeout)), eventloop)
    }

    fn ack(command_id: Uuid, status: AckStatus) -> Vec<u8> {
        serde_json::to_vec(&PlatformAck { command_id, status, message: Some("geofence".into()) }).unwrap()
    }

    async fn wait_pending(link: &MqttPlatformLink) {
        for _ in 0..100 {
            if link.pending_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("command never became pending");
    }

    #[test]
    fn test_topics() {
        assert_eq!(command_topic("drone-7"), "vigil/platform/command@v1/drone-7");
        assert_eq!(ack_topic("drone-7"), "vigil/platform/ack@v1/drone-7");
    }

    #[tokio::test]
    async fn test_disconnected_link_fails_fast() {
        let (link, _eventloop) = link(Duration::from_secs(1));
        let err = link.send_return_to_base(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, LinkError::Disconnected);
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_command() {
        let (link, _eventloop) = link(Duration::from_secs(5));
        link.set_connected(true);
        let id = Uuid::new_v4();

        let sender = link.clone();
        let task = tokio::spawn(async move { sender.send_return_to_base(id).await });
        wait_pending(&link).await;

        link.handle_ack(&ack(Uuid::new_v4(), AckStatus::Accepted));
        assert_eq!(link.pending_count(), 1);
        link.handle_ack(&ack(id, AckStatus::Accepted));

        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_ack() {
        let (link, _eventloop) = link(Duration::from_secs(5));
        link.set_connected(true);
        let id = Uuid::new_v4();

        let sender = link.clone();
        let task = tokio::spawn(async move { sender.send_return_to_base(id).await });
        wait_pending(&link).await;
        link.handle_ack(&ack(id, AckStatus::Rejected));

        assert_eq!(task.await.unwrap(), Err(LinkError::Rejected("geofence".into())));
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let (link, _eventloop) = link(Duration::from_millis(20));
        link.set_connected(true);
        let err = link.send_return_to_base(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, LinkError::Timeout(20));
        assert!(err.is_transient());
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_wait_clears_pending() {
        let (link, _eventloop) = link(Duration::from_secs(5));
        link.set_connected(true);

        // outer deadline shorter than the per-attempt timeout
        let outer = timeout(Duration::from_millis(20), link.send_return_to_base(Uuid::new_v4())).await;
        assert!(outer.is_err());
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_ack_is_ignored() {
        let (link, _eventloop) = link(Duration::from_secs(1));
        link.handle_ack(b"not json");
        assert_eq!(link.pending_count(), 0);
    }
}
