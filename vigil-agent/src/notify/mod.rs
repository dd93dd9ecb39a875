//! Operator notifications
//!
//! An `AlertMessage` fans out to every configured channel through the
//! `Dispatcher`. Delivery is tracked per (alert id, channel): once a channel
//! reached a terminal outcome for an alert it is never sent that alert again.

mod channel;
mod dispatcher;

pub use channel::{
    build_targets, ChannelTransport, EmailTransport, MqttTransport, SmsTransport, WebhookTransport,
};
pub use dispatcher::{ChannelTarget, Dispatcher};

use crate::detector::DetectionEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Intrusion,
    Fault,
    LinkFailure,
}

/// Terminal outcome of one channel for one alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryResult {
    Success { attempts: u32 },
    Failure { reason: String, attempts: u32 },
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryResult::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryResult::Success { attempts } | DeliveryResult::Failure { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Every targeted channel succeeded
    Delivered,
    /// At least one succeeded, at least one did not
    Degraded,
    /// No channel succeeded
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub alert_id: Uuid,
    pub results: BTreeMap<String, DeliveryResult>,
    /// Channels not sent this time (already terminal or in flight)
    pub skipped: Vec<String>,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    id: Uuid,
    text: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub channels: Vec<String>,
    pub deliveries: BTreeMap<String, DeliveryResult>,
    pub created_at: DateTime<Utc>,
}

impl AlertMessage {
    pub fn new(id: Uuid, kind: AlertKind, severity: Severity, text: String, channels: Vec<String>) -> Self {
        Self {
            id,
            text,
            kind,
            severity,
            channels,
            deliveries: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Alert for a detection; shares the detection's id
    pub fn intrusion(event: &DetectionEvent, agent_id: &str, channels: Vec<String>) -> Self {
        let text = format!(
            "[vigil] Intrusion detected by {} at {:.1}s: area {} px, confidence {:.2}. Returning to base.",
            agent_id,
            event.timestamp.as_secs_f64(),
            event.area,
            event.confidence
        );
        Self::new(event.id, AlertKind::Intrusion, Severity::Warning, text, channels)
    }

    pub fn fault(reason: &str, agent_id: &str, channels: Vec<String>) -> Self {
        let text = format!("[vigil] Agent {} faulted and stopped monitoring: {}", agent_id, reason);
        Self::new(Uuid::new_v4(), AlertKind::Fault, Severity::Critical, text, channels)
    }

    /// Escalation sent when the platform never acknowledged return-to-base
    pub fn link_failure(source: Uuid, error: &str, agent_id: &str, channels: Vec<String>) -> Self {
        let text = format!(
            "[vigil] Agent {} could not command return-to-base after alert {}: {}. Manual intervention required.",
            agent_id, source, error
        );
        Self::new(Uuid::new_v4(), AlertKind::LinkFailure, Severity::Critical, text, channels)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Raise severity; never lowers it
    pub fn escalate(&mut self, severity: Severity) -> bool {
        if severity > self.severity {
            self.severity = severity;
            true
        } else {
            false
        }
    }
}
