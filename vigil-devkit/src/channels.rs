/*!
Transports de notification scriptés

Enregistre chaque envoi (destination, texte) et échoue sur les N premiers
envois selon le scénario choisi.
*/

use async_trait::async_trait;
use std::sync::Mutex;
use vigil_agent::error::ChannelDeliveryError;
use vigil_agent::notify::ChannelTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    Transient,
    Permanent,
}

pub struct ScriptedTransport {
    fail_first: usize,
    mode: FailureMode,
    sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    /// Tous les envois réussissent
    pub fn ok() -> Self {
        Self::transient_failures(0)
    }

    /// Les `count` premiers envois échouent de façon transitoire
    pub fn transient_failures(count: usize) -> Self {
        Self { fail_first: count, mode: FailureMode::Transient, sent: Mutex::new(Vec::new()) }
    }

    /// Panne durable: chaque envoi échoue (transitoire)
    pub fn down() -> Self {
        Self::transient_failures(usize::MAX)
    }

    /// Chaque envoi est rejeté définitivement (destination invalide)
    pub fn rejecting() -> Self {
        Self { fail_first: usize::MAX, mode: FailureMode::Permanent, sent: Mutex::new(Vec::new()) }
    }

    /// Nombre total d'appels à `send`, échecs compris
    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn calls_to(&self, destination: &str) -> usize {
        self.sent.lock().unwrap().iter().filter(|(d, _)| d == destination).count()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn send(&self, destination: &str, text: &str) -> Result<(), ChannelDeliveryError> {
        let attempt = {
            let mut sent = self.sent.lock().unwrap();
            sent.push((destination.to_string(), text.to_string()));
            sent.len()
        };

        if attempt <= self.fail_first {
            log::debug!("📵 scripted failure #{} on {}", attempt, destination);
            return Err(match self.mode {
                FailureMode::Transient => ChannelDeliveryError::Transient(format!("scripted failure #{}", attempt)),
                FailureMode::Permanent => ChannelDeliveryError::Permanent("destination rejected".into()),
            });
        }
        log::debug!("📨 delivered to {}", destination);
        Ok(())
    }
}
