//! Idempotent return-to-base command issuer
//!
//! One episode settles exactly once: the first outcome (ack or final error)
//! is cached and audited, later calls for the same episode get the cached
//! outcome without touching the link. Calls are serialised so concurrent
//! duplicates collapse onto the first.

use crate::audit::{AuditEvent, Auditor};
use crate::error::LinkError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Transport to the flight platform
#[async_trait]
pub trait PlatformLink: Send + Sync {
    /// Ask the platform to return to its safe position. `command_id` is the
    /// platform's dedup key.
    async fn send_return_to_base(&self, command_id: Uuid) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub episode: Uuid,
    pub attempts: u32,
    pub acknowledged_at: DateTime<Utc>,
}

pub struct CommandIssuer {
    link: Arc<dyn PlatformLink>,
    auditor: Arc<Auditor>,
    policy: RetryPolicy,
    settled: Mutex<HashMap<Uuid, Result<Ack, LinkError>>>,
}

impl CommandIssuer {
    pub fn new(link: Arc<dyn PlatformLink>, auditor: Arc<Auditor>, policy: RetryPolicy) -> Self {
        Self {
            link,
            auditor,
            policy,
            settled: Mutex::new(HashMap::new()),
        }
    }

    pub async fn send_return_to_base(&self, episode: Uuid) -> Result<Ack, LinkError> {
        let mut settled = self.settled.lock().await;
        if let Some(outcome) = settled.get(&episode) {
            info!(%episode, "Return-to-base already settled, not resending");
            return outcome.clone();
        }

        let mut attempt = 1u32;
        let outcome = loop {
            match self.link.send_return_to_base(episode).await {
                Ok(()) => {
                    break Ok(Ack { episode, attempts: attempt, acknowledged_at: Utc::now() });
                }
                Err(e) if e.is_transient() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay(attempt - 1);
                    warn!(%episode, attempt, ?delay, "Return-to-base attempt failed: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    break Err(LinkError::Exhausted { attempts: attempt, last: e.to_string() });
                }
                Err(e) => break Err(e),
            }
        };

        match &outcome {
            Ok(ack) => {
                info!(%episode, attempts = ack.attempts, "Return-to-base acknowledged");
                self.auditor.note(AuditEvent::ReturnToBaseAcknowledged { episode, attempts: ack.attempts });
            }
            Err(e) => {
                warn!(%episode, attempts = attempt, "Return-to-base failed: {}", e);
                self.auditor.note(AuditEvent::ReturnToBaseFailed {
                    episode,
                    attempts: attempt,
                    error: e.to_string(),
                });
            }
        }
        settled.insert(episode, outcome.clone());
        outcome
    }

    /// Settle `episode` as failed when the caller gave up waiting. No-op if
    /// the episode already settled.
    pub async fn abandon(&self, episode: Uuid, error: LinkError) {
        let mut settled = self.settled.lock().await;
        if settled.contains_key(&episode) {
            return;
        }
        warn!(%episode, "Return-to-base abandoned: {}", error);
        self.auditor.note(AuditEvent::ReturnToBaseFailed {
            episode,
            attempts: 0,
            error: error.to_string(),
        });
        settled.insert(episode, Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyLink {
        calls: AtomicU32,
        failures: u32,
        error: LinkError,
    }

    #[async_trait]
    impl PlatformLink for FlakyLink {
        async fn send_return_to_base(&self, _command_id: Uuid) -> Result<(), LinkError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    fn issuer(failures: u32, error: LinkError) -> (CommandIssuer, Arc<FlakyLink>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let auditor = Arc::new(Auditor::open(dir.path().join("audit.jsonl")).unwrap());
        let link = Arc::new(FlakyLink { calls: AtomicU32::new(0), failures, error });
        let issuer = CommandIssuer::new(link.clone(), auditor, RetryPolicy::new(3, Duration::from_millis(1)));
        (issuer, link, dir)
    }

    fn effect_records(dir: &tempfile::TempDir) -> usize {
        Auditor::read_records(&dir.path().join("audit.jsonl"))
            .unwrap()
            .iter()
            .filter(|r| {
                matches!(
                    r.event,
                    AuditEvent::ReturnToBaseAcknowledged { .. } | AuditEvent::ReturnToBaseFailed { .. }
                )
            })
            .count()
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let (issuer, link, dir) = issuer(2, LinkError::Timeout(100));
        let ack = issuer.send_return_to_base(Uuid::new_v4()).await.unwrap();
        assert_eq!(ack.attempts, 3);
        assert_eq!(link.calls.load(Ordering::SeqCst), 3);
        assert_eq!(effect_records(&dir), 1);
    }

    #[tokio::test]
    async fn test_duplicate_call_is_noop() {
        let (issuer, link, dir) = issuer(0, LinkError::Disconnected);
        let episode = Uuid::new_v4();
        let first = issuer.send_return_to_base(episode).await.unwrap();
        let second = issuer.send_return_to_base(episode).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(link.calls.load(Ordering::SeqCst), 1);
        assert_eq!(effect_records(&dir), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (issuer, link, _dir) = issuer(10, LinkError::Rejected("geofence".into()));
        let err = issuer.send_return_to_base(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, LinkError::Rejected("geofence".into()));
        assert_eq!(link.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let (issuer, link, dir) = issuer(10, LinkError::Disconnected);
        let err = issuer.send_return_to_base(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LinkError::Exhausted { attempts: 4, .. }));
        assert_eq!(link.calls.load(Ordering::SeqCst), 4);
        assert_eq!(effect_records(&dir), 1);
    }

    #[tokio::test]
    async fn test_abandon_after_settle_is_noop() {
        let (issuer, _link, dir) = issuer(0, LinkError::Disconnected);
        let episode = Uuid::new_v4();
        issuer.send_return_to_base(episode).await.unwrap();
        issuer.abandon(episode, LinkError::Timeout(15_000)).await;
        assert_eq!(effect_records(&dir), 1);
        assert!(issuer.send_return_to_base(episode).await.is_ok());
    }
}
