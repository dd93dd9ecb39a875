/*!
Test Harness pour l'agent Vigil

Facilite l'écriture de tests de bout en bout avec:
- Configuration rapide (pas de cadence, backoff de 1 ms, warm-up court)
- Journal d'audit dans un répertoire temporaire
- Assertions sur les enregistrements d'audit
*/

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;
use vigil_agent::audit::{AuditEvent, AuditRecord, Auditor};
use vigil_agent::config::{ChannelConfig, ChannelKind};
use vigil_agent::notify::{AlertKind, ChannelTarget};
use vigil_agent::session::MonitoringState;
use vigil_agent::{Agent, AgentConfig};

use crate::channels::ScriptedTransport;
use crate::frames::ScriptedFrameSource;
use crate::link::MockPlatformLink;

/// Harness de test complet pour l'agent
pub struct TestHarness {
    dir: TempDir,
    pub config: AgentConfig,
    targets: Vec<ChannelTarget>,
}

impl TestHarness {
    /// Crée un harness sans canal; ajouter au moins un transport avant `build`
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let dir = tempfile::tempdir().context("Failed to create temp dir")?;
        let mut config = AgentConfig::default();
        config.agent.agent_id = "test-drone".into();
        config.agent.shutdown_grace_secs = 5;
        config.detection.warmup_frames = 5;
        config.session.frame_rate = 0;
        config.session.cooldown_secs = 30;
        config.command.base_backoff_ms = 1;
        config.command.attempt_timeout_ms = 200;
        config.command.timeout_secs = 2;
        config.notify.base_backoff_ms = 1;
        config.notify.channels.clear();
        config.audit.path = dir.path().join("audit.jsonl");
        config.control.enabled = false;

        Ok(Self { dir, config, targets: Vec::new() })
    }

    /// Ajoute un canal webhook servi par `transport`
    pub fn with_transport(mut self, destination: &str, transport: Arc<ScriptedTransport>) -> Self {
        let channel = ChannelConfig::new(ChannelKind::Webhook, destination);
        self.config.notify.channels.push(channel.clone());
        self.targets.push(ChannelTarget::new(channel, transport));
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut AgentConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn audit_path(&self) -> PathBuf {
        self.dir.path().join("audit.jsonl")
    }

    /// Construit un agent; peut être appelé plusieurs fois (redémarrage)
    pub fn build(&self, source: ScriptedFrameSource, link: Arc<MockPlatformLink>) -> Result<Agent> {
        let agent = Agent::new(self.config.clone(), Box::new(source), link, self.targets.clone())?;
        log::info!("🧪 Agent built, audit log at {}", self.audit_path().display());
        Ok(agent)
    }

    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        Ok(Auditor::read_records(&self.audit_path())?)
    }

    fn events(&self) -> Vec<AuditEvent> {
        self.records()
            .map(|records| records.into_iter().map(|r| r.event).collect())
            .unwrap_or_default()
    }

    /// Nombre d'enregistrements d'un type (`"delivery_attempt"`, ...)
    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn transitions(&self) -> Vec<(MonitoringState, MonitoringState)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::StateTransition { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn alerts_created(&self) -> Vec<(Uuid, AlertKind)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::AlertCreated { alert_id, alert_kind, .. } => Some((alert_id, alert_kind)),
                _ => None,
            })
            .collect()
    }

    /// Tentatives d'envoi auditées pour un canal
    pub fn delivery_attempts(&self, channel: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, AuditEvent::DeliveryAttempt { channel: c, .. } if c == channel))
            .count()
    }

    /// Position du premier enregistrement d'un type
    pub fn position(&self, kind: &str) -> Option<usize> {
        self.events().iter().position(|e| e.kind() == kind)
    }
}
