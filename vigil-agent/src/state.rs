//! Shared state read by the control API
//!
//! The agent writes the status snapshot and its response tasks update recent
//! alerts; handlers only read.

use crate::notify::AlertMessage;
use crate::session::{MonitoringSession, MonitoringState};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Read-only view of the agent published after every cycle
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub agent_id: String,
    pub state: MonitoringState,
    pub detection_count: u64,
    pub consecutive_frame_failures: u32,
    pub last_alert_at_ms: Option<u64>,
    pub episode: Option<uuid::Uuid>,
    pub area_threshold: u32,
    pub frames_processed: u64,
    pub deadline_misses: u64,
    pub running: bool,
}

impl StatusSnapshot {
    pub fn new(agent_id: impl Into<String>, area_threshold: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: MonitoringState::Idle,
            detection_count: 0,
            consecutive_frame_failures: 0,
            last_alert_at_ms: None,
            episode: None,
            area_threshold,
            frames_processed: 0,
            deadline_misses: 0,
            running: true,
        }
    }

    pub fn update_session(&mut self, session: &MonitoringSession) {
        self.state = session.state;
        self.detection_count = session.detection_count;
        self.consecutive_frame_failures = session.consecutive_frame_failures;
        self.last_alert_at_ms = session.last_alert_at.map(|t| t.as_millis() as u64);
        self.episode = session.episode;
    }
}

/// Bounded history of alerts, newest last; the operator feed
#[derive(Debug, Clone)]
pub struct RecentAlerts {
    capacity: usize,
    alerts: VecDeque<AlertMessage>,
}

impl RecentAlerts {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), alerts: VecDeque::new() }
    }

    /// Insert or replace (by id) an alert
    pub fn upsert(&mut self, alert: AlertMessage) {
        if let Some(existing) = self.alerts.iter_mut().find(|a| a.id() == alert.id()) {
            *existing = alert;
            return;
        }
        if self.alerts.len() == self.capacity {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    pub fn to_vec(&self) -> Vec<AlertMessage> {
        self.alerts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
