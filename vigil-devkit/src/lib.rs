/*!
# Vigil DevKit - Stubs et utilitaires de test pour l'agent

Bibliothèque facilitant les tests de l'agent Vigil sans matériel:
- Sources d'images scriptées (images vides, intrusions, pannes caméra)
- Liaison plateforme simulée (acks, pannes transitoires, rejets)
- Transports de notification scriptés avec comptage des envois
- Harness complet avec journal d'audit temporaire
*/

pub mod channels;
pub mod frames;
pub mod link;
pub mod test_utils;

pub use channels::ScriptedTransport;
pub use frames::{blank_frame, frame_with_square, frame_with_square_at, FrameScript, ScriptedFrameSource};
pub use link::MockPlatformLink;
pub use test_utils::TestHarness;
