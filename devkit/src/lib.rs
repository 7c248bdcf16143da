/*!
# Opsboard DevKit - Mocks et utilitaires de test du moteur de synchronisation

Bibliothèque facilitant les tests de `opsboard-sync` avec:
- `MockApi` : backend en mémoire scriptable (données, échecs, latence)
- Builders de tokens, profils, deltas push et entités
- `FakeBackend` : serveur axum pour exercer le client HTTP réel
- `TestBroker` : broker MQTT minimal pour exercer le canal push réel
- `TestHarness` : session ouverte + dashboard prêt à monter
*/

pub mod broker;
pub mod builders;
pub mod fake_backend;
pub mod mock_api;
pub mod test_utils;

pub use broker::TestBroker;
pub use builders::{DeltaBuilder, ProfileBuilder, TokenBuilder};
pub use fake_backend::FakeBackend;
pub use mock_api::{Endpoint, Failure, MockApi};
pub use test_utils::{offline_config, wait_for_store, TestHarness};
