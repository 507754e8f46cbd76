//! MQTT transport: broker session, topic routing, and the daemon's run
//! loop.
//!
//! The daemon is clocked by the broker itself: `$SYS/broker/uptime` arrives
//! once per second and drives the tick. Everything runs on one task; the
//! event loop is polled inline and handler work happens between polls,
//! which is what keeps the single-threaded discipline of the core honest.

use crate::compact::CompactStep;
use crate::daemon::Daemon;
use crate::error::{Result, TmpoError};
use crate::publish::Publisher;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Broker heartbeat topic; one message per second.
const UPTIME_TOPIC: &str = "$SYS/broker/uptime";

/// Sensor uplink topic filter.
const UPLINK_TOPIC: &str = "tmpo/devices/+/up";

/// Maximum MQTT packet size, incoming and outgoing. Coarse blocks can grow
/// to tens of megabytes.
const MAX_PACKET: usize = 64 * 1024 * 1024;

/// Delay before re-polling a failed broker connection.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker hostname or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// This daemon's 32-hex device id; selects the sync request topic.
    pub device_id: String,
}

/// [`Publisher`] backed by the rumqttc client.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl Publisher for MqttPublisher {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|err| TmpoError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Wall clock as a UNIX timestamp; 0 (treated as unsynced) if the clock is
/// before the epoch.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Asks jemalloc to return unused pages to the OS. Called after each
/// compaction group so transient merge buffers do not linger as RSS on
/// small-memory devices.
fn release_memory_to_os() {
    // SAFETY: mallctl with a valid name and no in/out parameters.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

fn route(daemon: &mut Daemon, publisher: &mut MqttPublisher, sync_topic: &str, publish: &Publish) {
    let topic = publish.topic.as_str();
    if topic == UPTIME_TOPIC {
        match daemon.handle_tick(unix_now(), publisher) {
            Ok(report) => {
                if report.compact == Some(CompactStep::Merged) {
                    release_memory_to_os();
                }
            }
            Err(err) => error!("tick aborted: {err}"),
        }
    } else if topic == sync_topic {
        daemon.handle_sync_request(&publish.payload);
    } else if topic.starts_with("tmpo/devices/") && topic.ends_with("/up") {
        daemon.handle_uplink(&publish.payload, publish.retain);
    }
}

/// Connects to the broker and runs the daemon until SIGINT.
///
/// Subscriptions are re-issued on every ConnAck so a broker restart does
/// not silence the daemon; poll errors back off for one second before the
/// next attempt, which is also rumqttc's reconnect point.
///
/// # Errors
///
/// Only the final forced flush can fail here; broker errors are retried
/// forever.
pub async fn run(mut daemon: Daemon, cfg: MqttConfig) -> Result<()> {
    let mut options = MqttOptions::new(format!("tmpod_{}", cfg.device_id), &cfg.host, cfg.port);
    options.set_keep_alive(Duration::from_secs(5));
    options.set_max_packet_size(MAX_PACKET, MAX_PACKET);

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let mut publisher = MqttPublisher {
        client: client.clone(),
    };
    let sync_topic = format!("/d/device/{}/tmpo/sync", cfg.device_id);

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(host = %cfg.host, port = cfg.port, "connected to broker");
                    for topic in [UPTIME_TOPIC, sync_topic.as_str(), UPLINK_TOPIC] {
                        if let Err(err) = client.subscribe(topic, QoS::AtMostOnce).await {
                            error!("subscribe {topic} failed: {err}");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    route(&mut daemon, &mut publisher, &sync_topic, &publish);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("broker connection lost: {err}");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested, flushing open buckets");
                daemon.flush_on_shutdown(unix_now(), &mut publisher)?;
                return Ok(());
            }
        }
    }
}
