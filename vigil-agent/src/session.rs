//! Monitoring state machine
//!
//! Pure transition logic: every input returns the transitions it caused and
//! the action the driver must take. Nothing here performs IO, which keeps the
//! machine deterministic under test. Time is the frame timestamp, never the
//! wall clock.
//!
//! ```text
//! Idle -> Monitoring -> Alerting -> ReturningToBase -> Cooldown -> Monitoring
//!   any non-faulted --stop--> Idle
//!   any --config/frame failures--> Faulted (terminal)
//! ```

use crate::detector::DetectionEvent;
use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringState {
    Idle,
    Monitoring,
    Alerting,
    ReturningToBase,
    Cooldown,
    Faulted,
}

impl MonitoringState {
    /// States in which frames are pulled and classified
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MonitoringState::Monitoring
                | MonitoringState::Alerting
                | MonitoringState::ReturningToBase
                | MonitoringState::Cooldown
        )
    }
}

impl fmt::Display for MonitoringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitoringState::Idle => "idle",
            MonitoringState::Monitoring => "monitoring",
            MonitoringState::Alerting => "alerting",
            MonitoringState::ReturningToBase => "returning_to_base",
            MonitoringState::Cooldown => "cooldown",
            MonitoringState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: MonitoringState,
    pub to: MonitoringState,
    pub reason: String,
}

/// What the driver owes the outside world after an input
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    None,
    /// Issue return-to-base and dispatch the alert for `event`
    BeginResponse { episode: Uuid, event: DetectionEvent },
    /// Counted and audited only
    Suppressed,
    /// Dispatch the one best-effort fault alert
    RaiseFault { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub transitions: Vec<Transition>,
    pub action: SessionAction,
}

impl Step {
    fn none() -> Self {
        Self { transitions: Vec::new(), action: SessionAction::None }
    }
}

/// Runtime state of one agent
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSession {
    pub state: MonitoringState,
    pub started_at: Option<DateTime<Utc>>,
    pub detection_count: u64,
    /// Frame timestamp of the last detection that raised an alert
    pub last_alert_at: Option<Duration>,
    pub consecutive_frame_failures: u32,
    /// Response cycle in progress or last completed
    pub episode: Option<Uuid>,
}

impl Default for MonitoringSession {
    fn default() -> Self {
        Self {
            state: MonitoringState::Idle,
            started_at: None,
            detection_count: 0,
            last_alert_at: None,
            consecutive_frame_failures: 0,
            episode: None,
        }
    }
}

pub struct SessionMachine {
    session: MonitoringSession,
    cooldown: Duration,
    max_frame_failures: u32,
}

impl SessionMachine {
    pub fn new(cooldown: Duration, max_frame_failures: u32) -> Self {
        Self {
            session: MonitoringSession::default(),
            cooldown,
            max_frame_failures,
        }
    }

    pub fn session(&self) -> &MonitoringSession {
        &self.session
    }

    pub fn state(&self) -> MonitoringState {
        self.session.state
    }

    fn go(&mut self, to: MonitoringState, reason: impl Into<String>) -> Transition {
        let from = self.session.state;
        self.session.state = to;
        Transition { from, to, reason: reason.into() }
    }

    /// Idle -> Monitoring; a no-op when already active
    pub fn start(&mut self) -> Result<Step, SessionError> {
        match self.session.state {
            MonitoringState::Faulted => Err(SessionError::Faulted("start refused".into())),
            MonitoringState::Idle => {
                self.session.started_at = Some(Utc::now());
                self.session.consecutive_frame_failures = 0;
                Ok(Step {
                    transitions: vec![self.go(MonitoringState::Monitoring, "start command")],
                    action: SessionAction::None,
                })
            }
            _ => Ok(Step::none()),
        }
    }

    /// Any non-faulted state -> Idle
    pub fn stop(&mut self) -> Result<Step, SessionError> {
        match self.session.state {
            MonitoringState::Faulted => Err(SessionError::IllegalTransition {
                action: "stop",
                state: MonitoringState::Faulted.to_string(),
            }),
            MonitoringState::Idle => Ok(Step::none()),
            _ => Ok(Step {
                transitions: vec![self.go(MonitoringState::Idle, "stop command")],
                action: SessionAction::None,
            }),
        }
    }

    /// Enter the terminal state; `RaiseFault` is produced once
    pub fn fault(&mut self, reason: impl Into<String>) -> Step {
        if self.session.state == MonitoringState::Faulted {
            return Step::none();
        }
        let reason = reason.into();
        Step {
            transitions: vec![self.go(MonitoringState::Faulted, reason.clone())],
            action: SessionAction::RaiseFault { reason },
        }
    }

    /// A frame was acquired and classified
    pub fn on_frame(&mut self, timestamp: Duration) -> Step {
        if !self.session.state.is_active() {
            return Step::none();
        }
        self.session.consecutive_frame_failures = 0;

        if self.session.state == MonitoringState::Cooldown && self.cooldown_elapsed(timestamp) {
            return Step {
                transitions: vec![self.go(MonitoringState::Monitoring, "cooldown elapsed")],
                action: SessionAction::None,
            };
        }
        Step::none()
    }

    /// A frame could not be acquired or classified
    pub fn on_frame_failure(&mut self, error: &str) -> Step {
        if !self.session.state.is_active() {
            return Step::none();
        }
        self.session.consecutive_frame_failures += 1;
        if self.session.consecutive_frame_failures >= self.max_frame_failures {
            return self.fault(format!(
                "{} consecutive frame failures, last: {}",
                self.session.consecutive_frame_failures, error
            ));
        }
        Step::none()
    }

    /// A detection above threshold
    pub fn on_detection(&mut self, event: &DetectionEvent) -> Step {
        if !self.session.state.is_active() {
            return Step::none();
        }
        self.session.detection_count += 1;

        if self.session.state != MonitoringState::Monitoring || !self.cooldown_elapsed(event.timestamp) {
            return Step { transitions: Vec::new(), action: SessionAction::Suppressed };
        }

        let episode = Uuid::new_v4();
        self.session.last_alert_at = Some(event.timestamp);
        self.session.episode = Some(episode);

        let first = self.go(MonitoringState::Alerting, format!("intrusion area {}", event.area));
        let second = self.go(MonitoringState::ReturningToBase, "response launched");
        Step {
            transitions: vec![first, second],
            action: SessionAction::BeginResponse { episode, event: event.clone() },
        }
    }

    /// The response task for `episode` reported back
    pub fn on_response_complete(&mut self, episode: Uuid, command_ok: bool) -> Step {
        if self.session.state != MonitoringState::ReturningToBase || self.session.episode != Some(episode) {
            return Step::none();
        }
        let reason = if command_ok {
            "return-to-base acknowledged"
        } else {
            "return-to-base failed"
        };
        Step {
            transitions: vec![self.go(MonitoringState::Cooldown, reason)],
            action: SessionAction::None,
        }
    }

    fn cooldown_elapsed(&self, now: Duration) -> bool {
        match self.session.last_alert_at {
            Some(at) => now >= at + self.cooldown,
            None => true,
        }
    }
}
