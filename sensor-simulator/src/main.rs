//! Publishes synthetic soil/climate readings to the sensor topic.
//!
//! Configuration comes from the environment (and `.env`), using the same
//! `MQTT_*` variables as the kernel:
//!
//! - `MQTT_BROKER`, `MQTT_PORT`, `MQTT_USER`, `MQTT_PASSWORD`, `MQTT_TOPIC`
//! - `MQTT_TLS` (`true`/`false`, default `false` for a local broker)
//! - `SIM_INTERVAL_SECS` (default 5), `SIM_COUNT` (0 = forever), `SIM_SEED`
//! - `SIM_NPK` (`true` to include nitrogen/phosphorus/potassium)

use anyhow::{Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct SimConfig {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    topic: String,
    tls: bool,
    interval: Duration,
    count: u64,
    seed: u64,
    npk: bool,
}

impl SimConfig {
    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let parse = |name: &str, default: u64| -> Result<u64> {
            match var(name) {
                Some(value) => value.parse().with_context(|| format!("{name}={value} is not a number")),
                None => Ok(default),
            }
        };
        let flag = |name: &str| var(name).is_some_and(|value| matches!(value.as_str(), "1" | "true" | "yes"));

        let port = parse("MQTT_PORT", 1883)?;
        Ok(Self {
            host: var("MQTT_BROKER").unwrap_or_else(|| "localhost".into()),
            port: u16::try_from(port).with_context(|| format!("MQTT_PORT={port} out of range"))?,
            username: var("MQTT_USER"),
            password: var("MQTT_PASSWORD"),
            topic: var("MQTT_TOPIC").unwrap_or_else(|| "sensor/data".into()),
            tls: flag("MQTT_TLS"),
            interval: Duration::from_secs(parse("SIM_INTERVAL_SECS", 5)?.max(1)),
            count: parse("SIM_COUNT", 0)?,
            seed: parse("SIM_SEED", 7)?,
            npk: flag("SIM_NPK"),
        })
    }
}

/// Same wire shape as the kernel's sensor topic.
#[derive(Debug, Clone, Serialize)]
struct SensorMessage {
    temperature: f64,
    humidity: f64,
    moisture: f64,
    ph: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    nitrogen: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phosphorus: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    potassium: Option<f64>,
}

/// Bounded random walk around a field's typical values.
struct ReadingGenerator {
    rng: ChaCha8Rng,
    current: SensorMessage,
    npk: bool,
}

impl ReadingGenerator {
    fn new(seed: u64, npk: bool) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            current: SensorMessage {
                temperature: 24.0,
                humidity: 65.0,
                moisture: 40.0,
                ph: 6.5,
                nitrogen: npk.then_some(80.0),
                phosphorus: npk.then_some(45.0),
                potassium: npk.then_some(40.0),
            },
            npk,
        }
    }

    fn next_reading(&mut self) -> SensorMessage {
        let step = |rng: &mut ChaCha8Rng, value: f64, delta: f64, min: f64, max: f64| {
            (value + rng.gen_range(-delta..=delta)).clamp(min, max)
        };

        let c = &mut self.current;
        c.temperature = round1(step(&mut self.rng, c.temperature, 0.5, -10.0, 50.0));
        c.humidity = round1(step(&mut self.rng, c.humidity, 2.0, 0.0, 100.0));
        c.moisture = round1(step(&mut self.rng, c.moisture, 1.5, 0.0, 100.0));
        c.ph = round1(step(&mut self.rng, c.ph, 0.1, 3.5, 9.5));
        if self.npk {
            c.nitrogen = c.nitrogen.map(|n| round1(step(&mut self.rng, n, 2.0, 0.0, 140.0)));
            c.phosphorus = c.phosphorus.map(|p| round1(step(&mut self.rng, p, 2.0, 5.0, 145.0)));
            c.potassium = c.potassium.map(|k| round1(step(&mut self.rng, k, 2.0, 5.0, 205.0)));
        }
        c.clone()
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = SimConfig::from_lookup(|name| std::env::var(name).ok())?;
    info!(
        "[simulator] publishing to {}:{} topic {} every {}s",
        cfg.host,
        cfg.port,
        cfg.topic,
        cfg.interval.as_secs()
    );

    let mut opts = MqttOptions::new("cropsense-sensor-simulator", &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(30));
    if let Some(user) = &cfg.username {
        opts.set_credentials(user, cfg.password.as_deref().unwrap_or_default());
    }
    if cfg.tls {
        opts.set_transport(Transport::tls_with_default_config());
    }
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    // publishes only leave while the event loop is polled
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => info!("[simulator] connected ({:?})", ack.code),
                Ok(_) => {}
                Err(e) => {
                    warn!("[simulator] MQTT connection error: {e}. Reconnecting...");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    let mut generator = ReadingGenerator::new(cfg.seed, cfg.npk);
    let mut interval = tokio::time::interval(cfg.interval);
    let mut sent = 0u64;
    while cfg.count == 0 || sent < cfg.count {
        interval.tick().await;
        let reading = generator.next_reading();
        let payload = serde_json::to_vec(&reading)?;
        client
            .publish(cfg.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .context("queueing sensor reading")?;
        sent += 1;
        debug!("[simulator] #{sent}: {reading:?}");
    }

    // let the last publishes flush
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("[simulator] sent {sent} readings");
    Ok(())
}
