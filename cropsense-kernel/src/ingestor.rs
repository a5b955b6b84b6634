/**
 * TELEMETRY INGESTOR - Abonnement MQTT au topic capteurs
 *
 * RÔLE :
 * Une connexion broker, une tâche tokio dédiée. Chaque message est décodé,
 * validé puis transmis au Storage Sink en une seule écriture.
 *
 * FONCTIONNEMENT :
 * - ConnectionState = petite machine à états (disconnected/connecting/connected)
 *   avec des transitions pures qui retournent l'action à effectuer
 * - Connexion refusée (code CONNACK MQTT 3.1.1) ou erreur transport ->
 *   attente asynchrone du délai fixe puis nouvelle tentative, sans fin
 * - Les messages sont traités en série sur la même tâche : aucun message
 *   n'est lu pendant qu'une reconnexion est en attente
 * - Message invalide -> abandonné et compté, jamais persisté partiellement
 */

use crate::config::{MqttConf, MIN_KEEP_ALIVE_SECS};
use crate::health::HealthTracker;
use crate::models::{SensorPayload, SensorReading, BASELINE_FIELDS};
use crate::state::SharedSink;
use crate::storage::StorageError;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Action demandée par une transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Subscribe,
    RetryAfter(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub last_error_code: Option<u8>,
    /// Tentatives échouées depuis la dernière connexion réussie.
    pub retry_count: u32,
    retry_delay: Duration,
}

impl ConnectionState {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            last_error_code: None,
            retry_count: 0,
            retry_delay,
        }
    }

    pub fn on_connecting(&mut self) {
        self.phase = ConnectionPhase::Connecting;
    }

    /// `code` = code retour CONNACK (0 = accepté).
    pub fn on_connack(&mut self, code: u8) -> ConnectionAction {
        if code == 0 {
            self.phase = ConnectionPhase::Connected;
            self.last_error_code = None;
            self.retry_count = 0;
            ConnectionAction::Subscribe
        } else {
            self.fail(Some(code))
        }
    }

    /// Perte de connexion ou échec avant CONNACK (DNS, TCP, TLS, IO).
    pub fn on_transport_error(&mut self, code: Option<u8>) -> ConnectionAction {
        self.fail(code)
    }

    fn fail(&mut self, code: Option<u8>) -> ConnectionAction {
        self.phase = ConnectionPhase::Disconnected;
        if code.is_some() {
            self.last_error_code = code;
        }
        self.retry_count = self.retry_count.saturating_add(1);
        ConnectionAction::RetryAfter(self.retry_delay)
    }
}

/// Libellé d'un code retour CONNACK MQTT 3.1.1
pub fn reason_text(code: u8) -> &'static str {
    match code {
        0 => "connection accepted",
        1 => "unacceptable protocol version",
        2 => "client identifier rejected",
        3 => "server unavailable",
        4 => "bad username or password",
        5 => "not authorized",
        _ => "unknown reason code",
    }
}

fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("payload is not UTF-8 JSON: {0}")]
    Decode(String),
    #[error("missing baseline fields {0:?}")]
    MissingFields(Vec<String>),
    #[error("payload rejected: {0}")]
    Schema(String),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

/// Décode et valide un message capteur, puis le persiste.
pub fn ingest_payload(bytes: &[u8], sink: &SharedSink) -> Result<SensorReading, IngestError> {
    let text = std::str::from_utf8(bytes).map_err(|e| IngestError::Decode(e.to_string()))?;
    let value: Value = serde_json::from_str(text).map_err(|e| IngestError::Decode(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(IngestError::Schema("expected a JSON object".into()));
    };
    let missing: Vec<String> = BASELINE_FIELDS
        .iter()
        .filter(|field| object.get(**field).map_or(true, Value::is_null))
        .map(|field| field.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::MissingFields(missing));
    }

    let payload: SensorPayload = serde_json::from_value(value).map_err(|e| IngestError::Schema(e.to_string()))?;
    Ok(sink.append_reading(payload)?)
}

/// Abonnement au topic, implémenté par le client rumqttc et le stub de test.
pub trait TopicSubscriber {
    fn subscribe_topic(&self, topic: &str) -> Result<(), String>;
}

impl TopicSubscriber for AsyncClient {
    fn subscribe_topic(&self, topic: &str) -> Result<(), String> {
        self.try_subscribe(topic, QoS::AtLeastOnce).map_err(|e| e.to_string())
    }
}

pub struct Ingestor<C> {
    client: C,
    topic: String,
    sink: SharedSink,
    health: HealthTracker,
    state: ConnectionState,
}

impl<C: TopicSubscriber> Ingestor<C> {
    pub fn new(client: C, topic: String, sink: SharedSink, health: HealthTracker, retry_delay: Duration) -> Self {
        Self {
            client,
            topic,
            sink,
            health,
            state: ConnectionState::new(retry_delay),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Appelé avant chaque poll : un poll depuis `disconnected` ouvre une connexion.
    pub fn before_poll(&mut self) {
        if self.state.phase == ConnectionPhase::Disconnected {
            self.state.on_connecting();
            self.publish_state();
        }
    }

    /// Traite un événement de la boucle MQTT. Retourne le délai d'attente
    /// avant le prochain poll en cas d'échec de connexion.
    pub fn on_event(&mut self, event: Result<Event, ConnectionError>) -> Option<Duration> {
        let action = match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => self.on_connack(connack_code(ack.code)),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                // le topic configuré peut être un filtre (sensor/#, farm/+/data)
                if rumqttc::matches(&publish.topic, &self.topic) {
                    self.on_message(&publish.payload);
                } else {
                    debug!("[ingestor] ignoring message on {}", publish.topic);
                }
                None
            }
            Ok(_) => None,
            Err(ConnectionError::ConnectionRefused(code)) => self.on_connack(connack_code(code)),
            Err(e) => {
                let action = self.state.on_transport_error(None);
                warn!("[ingestor] transport error: {e} (retry #{})", self.state.retry_count);
                Some(action)
            }
        };

        match action? {
            ConnectionAction::Subscribe => {
                info!("[ingestor] connected, subscribing to {}", self.topic);
                self.publish_state();
                if let Err(e) = self.client.subscribe_topic(&self.topic) {
                    error!("[ingestor] subscribe to {} failed: {e}", self.topic);
                }
                None
            }
            ConnectionAction::RetryAfter(delay) => {
                info!("[ingestor] reconnecting in {}s", delay.as_secs());
                self.health.increment_reconnects();
                self.publish_state();
                Some(delay)
            }
        }
    }

    fn on_connack(&mut self, code: u8) -> Option<ConnectionAction> {
        let action = self.state.on_connack(code);
        if code != 0 {
            warn!(
                "[ingestor] connection refused (code {code}: {}), retry #{}",
                reason_text(code),
                self.state.retry_count
            );
        }
        Some(action)
    }

    /// Un message du topic capteurs : au plus une écriture dans le sink.
    pub fn on_message(&self, bytes: &[u8]) {
        match ingest_payload(bytes, &self.sink) {
            Ok(reading) => {
                self.health.record_accepted();
                debug!("[ingestor] stored reading {}", reading.id);
            }
            Err(IngestError::Decode(e)) => {
                self.health.record_decode_error();
                warn!("[ingestor] dropping undecodable message: {e}");
            }
            Err(IngestError::MissingFields(fields)) => {
                self.health.record_rejected();
                warn!("[ingestor] dropping message missing {}", fields.join(", "));
            }
            Err(IngestError::Schema(e)) => {
                self.health.record_rejected();
                warn!("[ingestor] dropping message: {e}");
            }
            Err(IngestError::Storage(e)) => {
                self.health.record_storage_failure();
                error!("[ingestor] failed to store reading: {e}");
            }
        }
    }

    fn publish_state(&self) {
        self.health.set_connection(self.state.phase, self.state.last_error_code);
    }
}

pub fn mqtt_options(cfg: &MqttConf) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS)));
    if let Some(user) = &cfg.username {
        opts.set_credentials(user, cfg.password.as_deref().unwrap_or_default());
    }
    if cfg.tls {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

/// Démarre la tâche d'ingestion.
pub fn spawn_ingestor(cfg: &MqttConf, sink: SharedSink, health: HealthTracker) -> JoinHandle<()> {
    let (client, eventloop) = AsyncClient::new(mqtt_options(cfg), 10);
    info!(
        "[ingestor] broker {}:{} (tls: {}), topic {}",
        cfg.host, cfg.port, cfg.tls, cfg.topic
    );
    let ingestor = Ingestor::new(
        client,
        cfg.topic.clone(),
        sink,
        health,
        Duration::from_secs(cfg.retry_delay_secs),
    );
    task::spawn(run(ingestor, eventloop))
}

async fn run(mut ingestor: Ingestor<AsyncClient>, mut eventloop: EventLoop) {
    loop {
        ingestor.before_poll();
        let event = eventloop.poll().await;
        if let Some(delay) = ingestor.on_event(event) {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
impl TopicSubscriber for cropsense_devkit::MockMqttClient {
    fn subscribe_topic(&self, topic: &str) -> Result<(), String> {
        self.try_subscribe(topic, QoS::AtLeastOnce).map_err(|e| e.to_string())
    }
}
