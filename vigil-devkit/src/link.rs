/*!
Liaison plateforme simulée

Rejoue une liste d'erreurs dans l'ordre, puis acquitte. Peut aussi ne jamais
répondre, pour tester le timeout global de la commande.
*/

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use vigil_agent::command::PlatformLink;
use vigil_agent::error::LinkError;
use uuid::Uuid;

pub struct MockPlatformLink {
    script: Mutex<VecDeque<LinkError>>,
    calls: AtomicU32,
    command_ids: Mutex<Vec<Uuid>>,
    hang: bool,
}

impl MockPlatformLink {
    /// Acquitte toujours du premier coup
    pub fn acking() -> Self {
        Self::failing(Vec::new())
    }

    /// Échoue avec `errors` (dans l'ordre), puis acquitte
    pub fn failing(errors: Vec<LinkError>) -> Self {
        Self {
            script: Mutex::new(errors.into()),
            calls: AtomicU32::new(0),
            command_ids: Mutex::new(Vec::new()),
            hang: false,
        }
    }

    /// Ne répond jamais
    pub fn hanging() -> Self {
        Self { hang: true, ..Self::acking() }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn command_ids(&self) -> Vec<Uuid> {
        self.command_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformLink for MockPlatformLink {
    async fn send_return_to_base(&self, command_id: Uuid) -> Result<(), LinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.command_ids.lock().unwrap().push(command_id);
        log::debug!("🛬 return-to-base {} (call #{})", command_id, self.calls());

        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
