use super::{AlertMessage, ChannelTransport, DeliveryResult, DispatchOutcome, DispatchReport};
use crate::audit::{AuditEvent, Auditor};
use crate::config::ChannelConfig;
use crate::error::ChannelDeliveryError;
use crate::retry::RetryPolicy;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

/// A configured channel bound to the transport that delivers it
#[derive(Clone)]
pub struct ChannelTarget {
    pub config: ChannelConfig,
    pub transport: Arc<dyn ChannelTransport>,
}

impl ChannelTarget {
    pub fn new(config: ChannelConfig, transport: Arc<dyn ChannelTransport>) -> Self {
        Self { config, transport }
    }

    pub fn name(&self) -> String {
        self.config.channel_name()
    }
}

#[derive(Debug, Clone)]
enum Slot {
    InFlight,
    Done(DeliveryResult),
}

type LedgerKey = (Uuid, String);

pub struct Dispatcher {
    targets: Vec<ChannelTarget>,
    auditor: Arc<Auditor>,
    policy: RetryPolicy,
    send_timeout: Duration,
    ledger: Mutex<HashMap<LedgerKey, Slot>>,
}

impl Dispatcher {
    pub fn new(targets: Vec<ChannelTarget>, auditor: Arc<Auditor>, policy: RetryPolicy, send_timeout: Duration) -> Self {
        Self {
            targets,
            auditor,
            policy,
            send_timeout,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    /// Seed terminal outcomes, typically from `Auditor::delivery_ledger`
    pub fn with_ledger(self, terminal: HashMap<LedgerKey, DeliveryResult>) -> Self {
        {
            let mut ledger = self.ledger.lock();
            for (key, result) in terminal {
                ledger.insert(key, Slot::Done(result));
            }
        }
        self
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.targets.iter().map(ChannelTarget::name).collect()
    }

    /// Terminal outcome already recorded for `(alert_id, channel)`
    pub fn delivered(&self, alert_id: Uuid, channel: &str) -> Option<DeliveryResult> {
        match self.ledger.lock().get(&(alert_id, channel.to_string())) {
            Some(Slot::Done(result)) => Some(result.clone()),
            _ => None,
        }
    }

    /// Send `alert` on every channel it targets that has not reached a
    /// terminal outcome yet. Never fails; the report says how it went.
    pub async fn dispatch(&self, alert: &mut AlertMessage) -> DispatchReport {
        let alert_id = alert.id();
        let mut claimed = Vec::new();
        let mut skipped = Vec::new();

        {
            let mut ledger = self.ledger.lock();
            for name in &alert.channels {
                let key = (alert_id, name.clone());
                match ledger.get(&key) {
                    Some(Slot::Done(result)) => {
                        alert.deliveries.insert(name.clone(), result.clone());
                        skipped.push(name.clone());
                    }
                    Some(Slot::InFlight) => skipped.push(name.clone()),
                    None => match self.targets.iter().find(|t| &t.name() == name) {
                        Some(target) => {
                            ledger.insert(key, Slot::InFlight);
                            claimed.push(target);
                        }
                        None => {
                            warn!(%alert_id, channel = %name, "Alert targets an unknown channel");
                            let result = DeliveryResult::Failure { reason: "unknown channel".into(), attempts: 0 };
                            ledger.insert(key, Slot::Done(result.clone()));
                            self.auditor.note(AuditEvent::DeliveryResult {
                                alert_id,
                                channel: name.clone(),
                                result: result.clone(),
                            });
                            alert.deliveries.insert(name.clone(), result);
                        }
                    },
                }
            }
        }

        let text = alert.text().to_string();
        let sends = claimed.iter().map(|target| self.deliver(alert_id, &text, target));
        let delivered = join_all(sends).await;

        let mut results = BTreeMap::new();
        {
            let mut ledger = self.ledger.lock();
            for (name, result) in delivered {
                ledger.insert((alert_id, name.clone()), Slot::Done(result.clone()));
                alert.deliveries.insert(name.clone(), result.clone());
                results.insert(name, result);
            }
        }

        let succeeded = alert
            .channels
            .iter()
            .filter(|c| alert.deliveries.get(*c).is_some_and(DeliveryResult::is_success))
            .count();
        let outcome = if succeeded == 0 {
            DispatchOutcome::Failed
        } else if succeeded == alert.channels.len() {
            DispatchOutcome::Delivered
        } else {
            DispatchOutcome::Degraded
        };

        info!(
            %alert_id,
            sent = results.len(),
            skipped = skipped.len(),
            ?outcome,
            "Alert dispatched"
        );
        self.auditor.note(AuditEvent::DispatchSummary {
            alert_id,
            outcome,
            skipped: skipped.clone(),
        });

        DispatchReport { alert_id, results, skipped, outcome }
    }

    /// Retry one channel until it succeeds, fails permanently, or runs out of attempts
    async fn deliver(&self, alert_id: Uuid, text: &str, target: &ChannelTarget) -> (String, DeliveryResult) {
        let channel = target.name();
        let mut attempt = 1u32;

        let result = loop {
            let sent = match timeout(self.send_timeout, target.transport.send(&target.config.destination, text)).await {
                Ok(sent) => sent,
                Err(_) => Err(ChannelDeliveryError::Transient(format!(
                    "no response within {} ms",
                    self.send_timeout.as_millis()
                ))),
            };

            self.auditor.note(AuditEvent::DeliveryAttempt {
                alert_id,
                channel: channel.clone(),
                attempt,
                error: sent.as_ref().err().map(ToString::to_string),
            });

            match sent {
                Ok(()) => break DeliveryResult::Success { attempts: attempt },
                Err(e) if e.is_transient() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay(attempt - 1);
                    warn!(%alert_id, %channel, attempt, ?delay, "Delivery failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(%alert_id, %channel, attempt, "Delivery failed: {}", e);
                    break DeliveryResult::Failure { reason: e.reason().to_string(), attempts: attempt };
                }
            }
        };

        self.auditor.note(AuditEvent::DeliveryResult {
            alert_id,
            channel: channel.clone(),
            result: result.clone(),
        });
        (channel, result)
    }
}
