mod sim;

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sim::{SolarSim, Weather};

/// Commands the monitor firmware understands.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    ToggleLoad { state: bool },
}

fn parse_command(payload: &[u8]) -> Option<Command> {
    serde_json::from_slice(payload).ok()
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn now_s() -> f64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp_nanos() as f64 / 1e9
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let host = env_or("MQTT_HOST", "127.0.0.1");
    let port: u16 = env_parse("MQTT_PORT", 1883);
    let tls = env_or("MQTT_TLS", "false").eq_ignore_ascii_case("true");
    let device_id = env_or("DEVICE_ID", "esp32-sim");
    let data_topic = env_or("MQTT_TOPIC_DATA", "fensterkraftwerk/data");
    let command_topic = env_or("MQTT_TOPIC_COMMAND", "fensterkraftwerk/command");
    let sample_every_s: u64 = env_parse("SAMPLE_EVERY_S", 10).max(1);
    let day_period_s: f64 = env_parse("DAY_PERIOD_S", 86_400.0_f64).max(60.0);
    let weather = Weather::from_str_lossy(&env_or("SIM_WEATHER", "clear"));

    info!(%device_id, %weather, sample_every_s, day_period_s, "starting solar simulator");

    let mut opts = MqttOptions::new(format!("solar-sim-{device_id}"), host.clone(), port);
    opts.set_keep_alive(Duration::from_secs(30));
    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USERNAME"), env::var("MQTT_PASSWORD")) {
        opts.set_credentials(user, pass);
    }
    if tls {
        opts.set_transport(Transport::tls_with_default_config());
    }

    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    let load_enabled = Arc::new(AtomicBool::new(true));

    // Event loop: keeps the session alive and applies incoming commands.
    {
        let client = client.clone();
        let load_enabled = Arc::clone(&load_enabled);
        let command_topic = command_topic.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(%host, port, "connected to mqtt");
                        if let Err(e) = client.try_subscribe(&command_topic, QoS::AtLeastOnce) {
                            warn!(error = %e, "command subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == command_topic => {
                        match parse_command(&p.payload) {
                            Some(Command::ToggleLoad { state }) => {
                                load_enabled.store(state, Ordering::SeqCst);
                                info!(state, "load output switched");
                            }
                            None => warn!(bytes = p.payload.len(), "unrecognised command ignored"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt error, retrying");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    let mut sim = SolarSim::new(device_id, weather, day_period_s);
    let started = Instant::now();
    let mut last = now_s();

    loop {
        let now = now_s();
        sim.set_load(load_enabled.load(Ordering::SeqCst));
        let telemetry = sim.tick(now, (now - last).max(0.0), started.elapsed().as_secs());
        last = now;

        let payload = serde_json::to_vec(&telemetry).context("failed to encode telemetry")?;
        match client
            .publish(&data_topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(()) => debug!(
                pv_power = telemetry.pv.power,
                soc = telemetry.battery.soc,
                load = telemetry.load.enabled,
                "published reading"
            ),
            Err(e) => warn!(error = %e, "publish failed"),
        }

        tokio::select! {
            _ = sleep(Duration::from_secs(sample_every_s)) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "disconnect not sent");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
