//! Acquisition cycle driver
//!
//! One sequential cycle per frame:
//! 1. Drain queued control commands
//! 2. Apply response reports from finished response tasks
//! 3. Pull a frame, classify it, feed the state machine
//! 4. Launch a response (return-to-base + alert dispatch) when asked to
//!
//! Responses run on a `JoinSet` so a slow platform or channel never stalls
//! the cycle. They report back over an mpsc channel that the next cycle reads.

use crate::audit::{AuditEvent, Auditor};
use crate::command::{CommandIssuer, PlatformLink};
use crate::config::AgentConfig;
use crate::detector::{DetectionEvent, MotionDetector};
use crate::error::{AuditError, ConfigError, FrameAcquisitionError, LinkError};
use crate::frame::FrameSource;
use crate::notify::{AlertMessage, ChannelTarget, Dispatcher, Severity};
use crate::retry::RetryPolicy;
use crate::session::{MonitoringSession, MonitoringState, SessionAction, SessionMachine, Step};
use crate::state::{new_state, RecentAlerts, Shared, StatusSnapshot};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Requests from the control API, applied between frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    SetAreaThreshold(u32),
    Shutdown,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Start => f.write_str("start"),
            ControlCommand::Stop => f.write_str("stop"),
            ControlCommand::SetAreaThreshold(area) => write!(f, "set_area_threshold({})", area),
            ControlCommand::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// What a single cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Not monitoring; no frame pulled
    Idle,
    Processed,
    FrameFailed,
    EndOfStream,
    Faulted,
    Shutdown,
}

impl CycleOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleOutcome::EndOfStream | CycleOutcome::Faulted | CycleOutcome::Shutdown)
    }
}

#[derive(Debug)]
struct ResponseReport {
    episode: Uuid,
    command_ok: bool,
}

pub struct Agent {
    config: AgentConfig,
    source: Box<dyn FrameSource>,
    detector: MotionDetector,
    machine: SessionMachine,
    auditor: Arc<Auditor>,
    issuer: Arc<CommandIssuer>,
    dispatcher: Arc<Dispatcher>,
    control_tx: mpsc::Sender<ControlCommand>,
    control_rx: mpsc::Receiver<ControlCommand>,
    reports_tx: mpsc::UnboundedSender<ResponseReport>,
    reports_rx: mpsc::UnboundedReceiver<ResponseReport>,
    tasks: JoinSet<()>,
    status: Shared<StatusSnapshot>,
    alerts: Shared<RecentAlerts>,
    fault_alert_raised: bool,
    shutdown_requested: bool,
    finished: Option<CycleOutcome>,
    frames_processed: u64,
    deadline_misses: u64,
}

impl Agent {
    /// Wire the agent to its collaborators. Opens the audit log and, when
    /// enabled, seeds the delivery ledger from it.
    pub fn new(
        config: AgentConfig,
        source: Box<dyn FrameSource>,
        link: Arc<dyn PlatformLink>,
        targets: Vec<ChannelTarget>,
    ) -> Result<Self, AuditError> {
        let auditor = Arc::new(Auditor::open(&config.audit.path)?);

        let mut dispatcher = Dispatcher::new(
            targets,
            auditor.clone(),
            RetryPolicy::new(config.notify.max_retries, Duration::from_millis(config.notify.base_backoff_ms)),
            Duration::from_millis(config.notify.send_timeout_ms),
        );
        if config.audit.replay_on_start {
            match Auditor::delivery_ledger(auditor.path()) {
                Ok(ledger) => {
                    debug!("Seeded delivery ledger with {} terminal outcomes", ledger.len());
                    dispatcher = dispatcher.with_ledger(ledger);
                }
                Err(e) => warn!("Could not replay audit log, starting with an empty ledger: {}", e),
            }
        }

        let issuer = CommandIssuer::new(
            link,
            auditor.clone(),
            RetryPolicy::new(config.command.max_retries, Duration::from_millis(config.command.base_backoff_ms)),
        );

        let (control_tx, control_rx) = mpsc::channel(32);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let status = new_state(StatusSnapshot::new(
            config.agent.agent_id.clone(),
            config.detection.area_threshold,
        ));
        let alerts = new_state(RecentAlerts::new(config.control.recent_alerts));

        auditor.note(AuditEvent::AgentStarted { agent_id: config.agent.agent_id.clone() });
        info!(
            agent_id = %config.agent.agent_id,
            channels = dispatcher.channel_names().len(),
            "Agent initialized"
        );

        Ok(Self {
            detector: MotionDetector::new(&config.detection),
            machine: SessionMachine::new(config.cooldown(), config.session.max_consecutive_frame_failures),
            config,
            source,
            auditor,
            issuer: Arc::new(issuer),
            dispatcher: Arc::new(dispatcher),
            control_tx,
            control_rx,
            reports_tx,
            reports_rx,
            tasks: JoinSet::new(),
            status,
            alerts,
            fault_alert_raised: false,
            shutdown_requested: false,
            finished: None,
            frames_processed: 0,
            deadline_misses: 0,
        })
    }

    pub fn control_sender(&self) -> mpsc::Sender<ControlCommand> {
        self.control_tx.clone()
    }

    pub fn status_handle(&self) -> Shared<StatusSnapshot> {
        self.status.clone()
    }

    pub fn alerts_handle(&self) -> Shared<RecentAlerts> {
        self.alerts.clone()
    }

    pub fn auditor(&self) -> Arc<Auditor> {
        self.auditor.clone()
    }

    pub fn issuer(&self) -> Arc<CommandIssuer> {
        self.issuer.clone()
    }

    pub fn session(&self) -> &MonitoringSession {
        self.machine.session()
    }

    pub fn state(&self) -> MonitoringState {
        self.machine.state()
    }

    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses
    }

    /// Validate the configuration and enter `Monitoring`. An invalid
    /// configuration faults the agent instead.
    pub fn start(&mut self) -> Result<(), ConfigError> {
        if let Err(e) = self.config.validate() {
            error!("Refusing to monitor: {}", e);
            self.auditor.note(AuditEvent::ConfigRejected { issues: e.issues().to_vec() });
            let step = self.machine.fault(format!("configuration rejected: {}", e));
            self.apply_step(step);
            self.publish_status();
            return Err(e);
        }

        match self.machine.start() {
            Ok(step) => self.apply_step(step),
            Err(e) => warn!("Start ignored: {}", e),
        }
        self.publish_status();
        Ok(())
    }

    /// Run one acquisition cycle
    pub async fn step(&mut self) -> CycleOutcome {
        if let Some(outcome) = self.finished {
            return outcome;
        }

        while let Ok(command) = self.control_rx.try_recv() {
            self.handle_control(command);
        }
        self.reap_tasks();
        self.apply_reports();

        if self.shutdown_requested {
            return CycleOutcome::Shutdown;
        }
        match self.machine.state() {
            MonitoringState::Faulted => return CycleOutcome::Faulted,
            state if !state.is_active() => {
                self.publish_status();
                return CycleOutcome::Idle;
            }
            _ => {}
        }

        let frame = match self.source.pull().await {
            Ok(frame) => frame,
            Err(FrameAcquisitionError::EndOfStream) => {
                info!("Frame source exhausted after {} frames", self.frames_processed);
                return CycleOutcome::EndOfStream;
            }
            Err(e) => return self.frame_failed(&e.to_string()),
        };

        let result = match self.detector.observe(&frame) {
            Ok(result) => result,
            Err(e) => return self.frame_failed(&e.to_string()),
        };
        self.frames_processed += 1;

        let step = self.machine.on_frame(frame.timestamp);
        self.apply_step(step);

        if let Some(event) = result.event() {
            let step = self.machine.on_detection(&event);
            self.record_detection(&event, step.action == SessionAction::Suppressed);
            self.apply_step(step);
        }

        self.publish_status();
        CycleOutcome::Processed
    }

    /// Cycle at the configured frame rate until the source ends, the agent
    /// faults, or shutdown is requested; then drain in-flight responses.
    pub async fn run(&mut self) -> CycleOutcome {
        let budget = match self.config.session.frame_rate {
            0 => None,
            fps => Some(Duration::from_secs(1) / fps),
        };
        info!("Starting acquisition loop (frame budget {:?})", budget);

        let outcome = loop {
            let cycle_start = Instant::now();
            let outcome = self.step().await;

            if outcome.is_terminal() {
                break outcome;
            }
            if outcome == CycleOutcome::Idle {
                // nothing to pace while idle; block until told otherwise
                match self.control_rx.recv().await {
                    Some(command) => self.handle_control(command),
                    None => break CycleOutcome::Shutdown,
                }
                continue;
            }

            match budget {
                Some(budget) => {
                    let elapsed = cycle_start.elapsed();
                    if elapsed > budget {
                        self.deadline_misses += 1;
                        debug!(?elapsed, ?budget, "Cycle missed its deadline");
                    } else {
                        tokio::time::sleep(budget - elapsed).await;
                    }
                }
                None => tokio::task::yield_now().await,
            }
        };

        let reason = match outcome {
            CycleOutcome::EndOfStream => "frame source exhausted",
            CycleOutcome::Faulted => "agent faulted",
            _ => "shutdown requested",
        };
        self.shutdown(reason).await;
        outcome
    }

    /// Stop cycling, give in-flight responses `shutdown_grace` to finish,
    /// abort the rest. Returns the number of aborted tasks.
    pub async fn shutdown(&mut self, reason: &str) -> usize {
        if self.finished.is_some() {
            return 0;
        }

        let grace = self.config.shutdown_grace();
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("Response task failed: {}", e);
                }
            }
        })
        .await;

        let forced = match drained {
            Ok(()) => 0,
            Err(_) => {
                let remaining = self.tasks.len();
                warn!("Aborting {} response tasks after {:?} grace", remaining, grace);
                self.tasks.abort_all();
                while self.tasks.join_next().await.is_some() {}
                remaining
            }
        };

        self.apply_reports();
        self.auditor.note(AuditEvent::Stopped { reason: reason.to_string(), forced_tasks: forced });
        info!(forced, "Agent stopped: {}", reason);

        self.finished = Some(match self.machine.state() {
            MonitoringState::Faulted => CycleOutcome::Faulted,
            _ => CycleOutcome::Shutdown,
        });
        self.status.lock().running = false;
        self.publish_status();
        forced
    }

    fn handle_control(&mut self, command: ControlCommand) {
        info!("Control command: {}", command);
        self.auditor.note(AuditEvent::ControlReceived { command: command.to_string() });

        match command {
            ControlCommand::Start if self.machine.state() == MonitoringState::Faulted => {
                warn!("Start ignored: agent is faulted");
            }
            ControlCommand::Start => {
                if self.start().is_err() {
                    warn!("Start command rejected: invalid configuration");
                }
            }
            ControlCommand::Stop => match self.machine.stop() {
                Ok(step) => self.apply_step(step),
                Err(e) => warn!("Stop ignored: {}", e),
            },
            ControlCommand::SetAreaThreshold(0) => warn!("Ignoring zero detection area threshold"),
            ControlCommand::SetAreaThreshold(area) => self.detector.set_area_threshold(area),
            ControlCommand::Shutdown => self.shutdown_requested = true,
        }
        self.publish_status();
    }

    fn frame_failed(&mut self, error: &str) -> CycleOutcome {
        let step = self.machine.on_frame_failure(error);
        let consecutive = self.machine.session().consecutive_frame_failures;
        warn!(consecutive, "Frame acquisition failed: {}", error);
        self.auditor.note(AuditEvent::FrameAcquisitionFailed {
            consecutive,
            error: error.to_string(),
        });
        self.apply_step(step);
        self.publish_status();

        if self.machine.state() == MonitoringState::Faulted {
            CycleOutcome::Faulted
        } else {
            CycleOutcome::FrameFailed
        }
    }

    fn record_detection(&self, event: &DetectionEvent, suppressed: bool) {
        if suppressed {
            debug!(event_id = %event.id, area = event.area, "Detection suppressed by cooldown");
        } else {
            info!(event_id = %event.id, area = event.area, confidence = event.confidence, "Intrusion detected");
        }
        self.auditor.note(AuditEvent::Detection {
            event_id: event.id,
            timestamp_ms: event.timestamp.as_millis() as u64,
            area: event.area,
            confidence: event.confidence,
            detection_count: self.machine.session().detection_count,
            suppressed,
        });
    }

    fn apply_step(&mut self, step: Step) {
        for t in step.transitions {
            info!("State {} -> {} ({})", t.from, t.to, t.reason);
            self.auditor.note(AuditEvent::StateTransition { from: t.from, to: t.to, reason: t.reason });
        }

        match step.action {
            SessionAction::None | SessionAction::Suppressed => {}
            SessionAction::BeginResponse { episode, event } => self.launch_response(episode, event),
            SessionAction::RaiseFault { reason } => self.raise_fault(&reason),
        }
    }

    fn apply_reports(&mut self) {
        while let Ok(report) = self.reports_rx.try_recv() {
            debug!(episode = %report.episode, command_ok = report.command_ok, "Response report");
            let step = self.machine.on_response_complete(report.episode, report.command_ok);
            self.apply_step(step);
        }
    }

    fn reap_tasks(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!("Response task failed: {}", e);
            }
        }
    }

    fn new_alert_recorded(&self, alert: &AlertMessage) {
        self.auditor.note(AuditEvent::AlertCreated {
            alert_id: alert.id(),
            alert_kind: alert.kind,
            severity: alert.severity,
            text: alert.text().to_string(),
            channels: alert.channels.clone(),
        });
        self.alerts.lock().upsert(alert.clone());
    }

    /// Return-to-base and alert dispatch, concurrently, off the cycle
    fn launch_response(&mut self, episode: Uuid, event: DetectionEvent) {
        let agent_id = self.config.agent.agent_id.clone();
        let mut alert = AlertMessage::intrusion(&event, &agent_id, self.dispatcher.channel_names());
        self.new_alert_recorded(&alert);

        let issuer = self.issuer.clone();
        let dispatcher = self.dispatcher.clone();
        let auditor = self.auditor.clone();
        let alerts = self.alerts.clone();
        let reports = self.reports_tx.clone();
        let command_timeout = self.config.command_timeout();

        self.tasks.spawn(async move {
            let command = async {
                match tokio::time::timeout(command_timeout, issuer.send_return_to_base(episode)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let e = LinkError::Timeout(command_timeout.as_millis() as u64);
                        issuer.abandon(episode, e.clone()).await;
                        Err(e)
                    }
                }
            };
            let (command, _report) = tokio::join!(command, dispatcher.dispatch(&mut alert));
            alerts.lock().upsert(alert.clone());

            if let Err(e) = &command {
                error!(%episode, alert_id = %alert.id(), "Return-to-base failed, escalating: {}", e);
                if alert.escalate(Severity::Critical) {
                    auditor.note(AuditEvent::AlertEscalated {
                        alert_id: alert.id(),
                        severity: alert.severity,
                        reason: e.to_string(),
                    });
                    alerts.lock().upsert(alert.clone());
                }

                let mut escalation =
                    AlertMessage::link_failure(alert.id(), &e.to_string(), &agent_id, dispatcher.channel_names());
                auditor.note(AuditEvent::AlertCreated {
                    alert_id: escalation.id(),
                    alert_kind: escalation.kind,
                    severity: escalation.severity,
                    text: escalation.text().to_string(),
                    channels: escalation.channels.clone(),
                });
                dispatcher.dispatch(&mut escalation).await;
                alerts.lock().upsert(escalation);
            }

            if reports.send(ResponseReport { episode, command_ok: command.is_ok() }).is_err() {
                debug!(%episode, "Agent gone before response report");
            }
        });
    }

    /// The single best-effort alert after entering `Faulted`
    fn raise_fault(&mut self, reason: &str) {
        if self.fault_alert_raised {
            return;
        }
        self.fault_alert_raised = true;

        let mut alert = AlertMessage::fault(reason, &self.config.agent.agent_id, self.dispatcher.channel_names());
        self.new_alert_recorded(&alert);

        let dispatcher = self.dispatcher.clone();
        let alerts = self.alerts.clone();
        self.tasks.spawn(async move {
            let report = dispatcher.dispatch(&mut alert).await;
            debug!(alert_id = %alert.id(), outcome = ?report.outcome, "Fault alert dispatched");
            alerts.lock().upsert(alert);
        });
    }

    fn publish_status(&self) {
        let mut status = self.status.lock();
        status.update_session(self.machine.session());
        status.area_threshold = self.detector.area_threshold();
        status.frames_processed = self.frames_processed;
        status.deadline_misses = self.deadline_misses;
    }
}
