//! Append-only audit log
//!
//! One JSON object per line. Records are numbered in append order and each
//! line is flushed and synced to disk before `record` returns. The log is only
//! read after the fact (postmortem, restart seeding of the delivery ledger),
//! never by the live control path.
//!
//! `record` blocks the calling thread until the line is synced, including when
//! called from response tasks on the tokio runtime. Lines are a few hundred
//! bytes and one sync per record is the durability contract.
//!
//! A crash mid-write can leave a torn final line. `open` truncates it away so
//! the next record starts on a fresh line, and readers skip any line that does
//! not parse.

use crate::error::{AuditError, ConfigIssue};
use crate::notify::{AlertKind, DeliveryResult, DispatchOutcome, Severity};
use crate::session::MonitoringState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    AgentStarted {
        agent_id: String,
    },
    ConfigRejected {
        issues: Vec<ConfigIssue>,
    },
    StateTransition {
        from: MonitoringState,
        to: MonitoringState,
        reason: String,
    },
    FrameAcquisitionFailed {
        consecutive: u32,
        error: String,
    },
    Detection {
        event_id: Uuid,
        timestamp_ms: u64,
        area: u32,
        confidence: f32,
        detection_count: u64,
        /// Counted, but no new response cycle
        suppressed: bool,
    },
    AlertCreated {
        alert_id: Uuid,
        alert_kind: AlertKind,
        severity: Severity,
        text: String,
        channels: Vec<String>,
    },
    AlertEscalated {
        alert_id: Uuid,
        severity: Severity,
        reason: String,
    },
    DeliveryAttempt {
        alert_id: Uuid,
        channel: String,
        attempt: u32,
        error: Option<String>,
    },
    DeliveryResult {
        alert_id: Uuid,
        channel: String,
        result: DeliveryResult,
    },
    DispatchSummary {
        alert_id: Uuid,
        outcome: DispatchOutcome,
        skipped: Vec<String>,
    },
    ReturnToBaseAcknowledged {
        episode: Uuid,
        attempts: u32,
    },
    ReturnToBaseFailed {
        episode: Uuid,
        attempts: u32,
        error: String,
    },
    ControlReceived {
        command: String,
    },
    Stopped {
        reason: String,
        forced_tasks: usize,
    },
}

impl AuditEvent {
    /// The serialized `kind` tag
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::AgentStarted { .. } => "agent_started",
            AuditEvent::ConfigRejected { .. } => "config_rejected",
            AuditEvent::StateTransition { .. } => "state_transition",
            AuditEvent::FrameAcquisitionFailed { .. } => "frame_acquisition_failed",
            AuditEvent::Detection { .. } => "detection",
            AuditEvent::AlertCreated { .. } => "alert_created",
            AuditEvent::AlertEscalated { .. } => "alert_escalated",
            AuditEvent::DeliveryAttempt { .. } => "delivery_attempt",
            AuditEvent::DeliveryResult { .. } => "delivery_result",
            AuditEvent::DispatchSummary { .. } => "dispatch_summary",
            AuditEvent::ReturnToBaseAcknowledged { .. } => "return_to_base_acknowledged",
            AuditEvent::ReturnToBaseFailed { .. } => "return_to_base_failed",
            AuditEvent::ControlReceived { .. } => "control_received",
            AuditEvent::Stopped { .. } => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

struct AuditWriter {
    file: File,
    next_seq: u64,
}

pub struct Auditor {
    path: PathBuf,
    writer: Mutex<AuditWriter>,
}

impl Auditor {
    /// Open (or create) the log at `path`, continuing its sequence numbers
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            truncate_torn_tail(&path)?;
        }
        let next_seq = if path.exists() {
            last_seq(&path)?.map(|s| s + 1).unwrap_or(0)
        } else {
            0
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(AuditWriter { file, next_seq }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `event`; returns once the line is on disk
    pub fn record(&self, event: AuditEvent) -> Result<AuditRecord, AuditError> {
        let mut writer = self.writer.lock();
        let record = AuditRecord {
            seq: writer.next_seq,
            timestamp: Utc::now(),
            event,
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let len = writer.file.metadata()?.len();
        if let Err(e) = write_line(&mut writer.file, line.as_bytes()) {
            // drop whatever part of the line made it out
            if let Err(rollback) = writer.file.set_len(len) {
                error!("Failed to roll back partial audit line in {}: {}", self.path.display(), rollback);
            }
            return Err(e.into());
        }
        writer.next_seq += 1;

        Ok(record)
    }

    /// Record from the control path: failures are logged, never propagated
    pub fn note(&self, event: AuditEvent) {
        let kind = event.kind();
        if let Err(e) = self.record(event) {
            error!("Failed to write {} audit record to {}: {}", kind, self.path.display(), e);
        }
    }

    /// Every readable record in append order; unreadable lines are skipped
    pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
        readable_records(path)
    }

    /// Terminal delivery outcomes per (alert id, channel), for dedup across restarts
    pub fn delivery_ledger(path: &Path) -> Result<HashMap<(Uuid, String), DeliveryResult>, AuditError> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let mut ledger = HashMap::new();
        for record in Self::read_records(path)? {
            if let AuditEvent::DeliveryResult { alert_id, channel, result } = record.event {
                ledger.insert((alert_id, channel), result);
            }
        }
        Ok(ledger)
    }
}

fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line)?;
    file.flush()?;
    file.sync_data()
}

fn readable_records(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
    let file = File::open(path)?;
    let mut records = Vec::new();

    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping unreadable audit line {} in {}: {}", i + 1, path.display(), e),
        }
    }
    Ok(records)
}

fn last_seq(path: &Path) -> Result<Option<u64>, AuditError> {
    Ok(readable_records(path)?.last().map(|r| r.seq))
}

/// Cut the file back to its last newline when the final line is incomplete
fn truncate_torn_tail(path: &Path) -> Result<(), AuditError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if bytes.last().map_or(true, |&b| b == b'\n') {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    warn!(
        "Truncating torn audit line in {} ({} bytes dropped)",
        path.display(),
        bytes.len() - keep
    );
    file.set_len(keep as u64)?;
    file.sync_data()?;
    Ok(())
}
