/*!
# CropSense DevKit - Fixtures pour les tests

Bibliothèque partagée par les tests du kernel et du moteur:
- Stub MQTT pour tester l'ingestion sans broker
- Générateur de payloads capteurs
- Générateur de datasets CSV d'entraînement
- Répertoires de travail temporaires
*/

pub mod datasets;
pub mod mqtt_stub;
pub mod test_utils;

pub use datasets::DatasetBuilder;
pub use mqtt_stub::{MockMqttClient, SensorPayloadBuilder};
pub use test_utils::{init_test_tracing, TestWorkspace};
