/*!
Mock MQTT Client pour tester l'ingestion sans broker

Enregistre les abonnements et permet de simuler la réception de messages
capteurs. `SensorPayloadBuilder` fabrique les payloads JSON du topic capteurs.
*/

use anyhow::Result;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Mock MQTT Client qui simule la partie abonnement de rumqttc::AsyncClient
#[derive(Clone, Default)]
pub struct MockMqttClient {
    subscriptions: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<bool>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration d'un channel pour recevoir les messages simulés
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock() = Some(sender);
        receiver
    }

    /// Les prochains abonnements échouent (file de requêtes pleine, etc.)
    pub fn fail_subscriptions(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Simule `AsyncClient::try_subscribe`
    pub fn try_subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        if *self.failing.lock() {
            anyhow::bail!("request queue full, cannot subscribe to {}", topic);
        }
        info!("[mock] subscribed to {}", topic);
        self.subscriptions.lock().push(topic);
        Ok(())
    }

    /// Simule la réception d'un message (pour tests)
    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
        };

        if let Some(sender) = self.message_sender.lock().as_ref() {
            sender
                .send(message.clone())
                .map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        }

        info!("[mock] simulated incoming on {}", message.topic);
        Ok(())
    }

    /// Récupère les abonnements (pour assertions de tests)
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }
}

/// Builder de payloads du topic capteurs
#[derive(Debug, Clone)]
pub struct SensorPayloadBuilder {
    fields: Map<String, Value>,
}

impl SensorPayloadBuilder {
    /// Payload complet avec les quatre mesures de base
    pub fn baseline(temperature: f64, humidity: f64, moisture: f64, ph: f64) -> Self {
        let mut fields = Map::new();
        fields.insert("temperature".into(), json!(temperature));
        fields.insert("humidity".into(), json!(humidity));
        fields.insert("moisture".into(), json!(moisture));
        fields.insert("ph".into(), json!(ph));
        Self { fields }
    }

    /// Ajoute les mesures NPK optionnelles
    pub fn with_npk(mut self, nitrogen: f64, phosphorus: f64, potassium: f64) -> Self {
        self.fields.insert("nitrogen".into(), json!(nitrogen));
        self.fields.insert("phosphorus".into(), json!(phosphorus));
        self.fields.insert("potassium".into(), json!(potassium));
        self
    }

    /// Retire un champ
    pub fn without(mut self, field: &str) -> Self {
        self.fields.remove(field);
        self
    }

    /// Ajoute ou remplace un champ arbitraire (champ inconnu, mauvais type...)
    pub fn set<V: Into<Value>>(mut self, field: &str, value: V) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

impl Default for SensorPayloadBuilder {
    fn default() -> Self {
        Self::baseline(25.5, 60.0, 40.0, 6.5)
    }
}
