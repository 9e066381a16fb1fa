/**
 * OBSERVATORY SIMDAEMON - Simulated hardware daemons on the MQTT device bus
 *
 * ROLE:
 * Lets the supervisor run a full night without hardware. Each simulated
 * daemon listens on `observatory/<daemon>/request@v1` and answers on
 * `observatory/<daemon>/reply@v1`.
 *
 * CONFIGURATION (environment, `.env` supported):
 * - MQTT_HOST / MQTT_PORT: broker (localhost:1883)
 * - SIM_DAEMONS: comma separated daemon names (camera,mount,ephem)
 * - SIM_SUN_ALT: initial sun altitude in degrees (-20)
 * - SIM_COOL_S / SIM_WARM_S / SIM_SLEW_S / SIM_SHUTTER_S: simulated durations
 *   in seconds
 */

mod devices;

use anyhow::{bail, Context};
use devices::{SimDevice, SimTimings};
use observatory_kernel::bus::{daemon_from_topic, reply_topic, request_topic, BusReply, BusRequest};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| anyhow::anyhow!("{key}: cannot parse {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn build_devices() -> anyhow::Result<BTreeMap<String, SimDevice>> {
    let timings = SimTimings {
        cool_down: Duration::from_secs_f64(env_or("SIM_COOL_S", 20.0)?),
        warm_up: Duration::from_secs_f64(env_or("SIM_WARM_S", 20.0)?),
        slew: Duration::from_secs_f64(env_or("SIM_SLEW_S", 5.0)?),
        shutter: Duration::from_secs_f64(env_or("SIM_SHUTTER_S", 30.0)?),
    };
    let sun_alt: f64 = env_or("SIM_SUN_ALT", -20.0)?;
    let names: String = env_or("SIM_DAEMONS", "camera,mount,ephem".to_string())?;

    let mut devices = BTreeMap::new();
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match SimDevice::for_daemon(name, &timings, sun_alt) {
            Some(dev) => {
                devices.insert(name.to_string(), dev);
            }
            None => bail!("no simulation for daemon {name:?}"),
        }
    }
    if devices.is_empty() {
        bail!("SIM_DAEMONS names no daemon");
    }
    Ok(devices)
}

fn answer(client: &AsyncClient, devices: &mut BTreeMap<String, SimDevice>, topic: &str, payload: &[u8]) {
    let Some(daemon) = daemon_from_topic(topic) else {
        return;
    };
    let Some(device) = devices.get_mut(daemon) else {
        return;
    };
    let request: BusRequest = match serde_json::from_slice(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!("[sim] invalid request on {topic}: {e}");
            return;
        }
    };

    debug!("[sim] {daemon} <- {} {:?}", request.method, request.args);
    let reply = match device.handle(&request.method, &request.args, Instant::now()) {
        Ok(result) => BusReply::success(&request.request_id, result),
        Err(e) => {
            info!("[sim] {daemon} refused {}: {e}", request.method);
            BusReply::failure(&request.request_id, e)
        }
    };
    let payload = match serde_json::to_vec(&reply) {
        Ok(p) => p,
        Err(e) => {
            warn!("[sim] encode reply: {e}");
            return;
        }
    };
    // Called from the event loop task, so it must not await the client.
    if let Err(e) = client.try_publish(reply_topic(daemon), QoS::AtLeastOnce, false, payload) {
        warn!("[sim] publish reply for {daemon} failed: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut devices = build_devices()?;
    let host: String = env_or("MQTT_HOST", "localhost".to_string())?;
    let port: u16 = env_or("MQTT_PORT", 1883)?;

    let mut opts = MqttOptions::new("observatory-simdaemon", &host, port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 64);
    let topics: Vec<String> = devices.keys().map(|d| request_topic(d)).collect();
    info!("[sim] simulating {} on {host}:{port}", devices.keys().cloned().collect::<Vec<_>>().join(", "));

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("[sim] connected");
                    for topic in &topics {
                        client
                            .try_subscribe(topic.as_str(), QoS::AtLeastOnce)
                            .with_context(|| format!("subscribing to {topic}"))?;
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    answer(&client, &mut devices, &p.topic, &p.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[sim] MQTT loop error: {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("[sim] stopping");
                return Ok(());
            }
        }
    }
}
