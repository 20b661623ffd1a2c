/*!
# LightSwarm DevKit - Simulateurs et utilitaires de test

Bibliothèque facilitant le développement autour du kernel LightSwarm avec:
- Membres d'essaim simulés parlant le protocole du firmware ESP8266
- Transport en mémoire (pas de socket UDP)
- Harness de test démarrant la vraie boucle du kernel
*/

pub mod member_sim;
pub mod memory_transport;
pub mod test_utils;

pub use member_sim::{MemberReaction, MemberSim};
pub use memory_transport::{memory_transport, MemoryNetwork, MemoryTransport};
pub use test_utils::{RecordingDisplay, TestHarness};
