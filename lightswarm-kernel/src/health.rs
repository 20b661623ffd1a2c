use crate::config::MqttConf;
use crate::coordinator::{CoordinatorState, SwarmSnapshot};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task;
use tracing::{debug, info, warn};

pub const HEALTH_TOPIC: &str = "lightswarm/kernel/health@v1";

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub state: CoordinatorState,
    pub members_present: u32,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub evictions: u64,
    pub resets: u64,
    pub send_failures: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, snapshot: &SwarmSnapshot) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            state: snapshot.state,
            members_present: snapshot.members_present() as u32,
            packets_received: snapshot.counters.received,
            packets_dropped: snapshot.counters.dropped,
            evictions: snapshot.counters.evictions,
            resets: snapshot.counters.resets,
            send_failures: snapshot.counters.send_failures,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Démarre la publication auto du health kernel sur MQTT
    pub fn spawn_health_publisher(&self, mqtt: MqttConf, snapshots: watch::Receiver<SwarmSnapshot>) {
        let health_tracker = self.clone();
        *health_tracker.mqtt_status.lock() = "connecting".to_string();

        task::spawn(async move {
            let mut opts = MqttOptions::new("lightswarm-kernel-health", &mqtt.host, mqtt.port);
            opts.set_keep_alive(Duration::from_secs(15));
            let (client, mut eventloop) = AsyncClient::new(opts, 10);

            // publish health toutes les 30s
            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = health_tracker.get_health(&snapshots.borrow());
                        match serde_json::to_string(&health) {
                            Ok(payload) => {
                                if let Err(e) = client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                                    warn!("[health] failed to publish: {e:?}");
                                } else {
                                    debug!(
                                        uptime = health.uptime_seconds,
                                        members = health.members_present,
                                        "[health] published kernel health"
                                    );
                                }
                            }
                            Err(e) => warn!("[health] encoding failed: {e}"),
                        }
                    },
                    event = eventloop.poll() => {
                        match event {
                            Ok(rumqttc::Event::Incoming(rumqttc::Incoming::ConnAck(_))) => {
                                info!(host = %mqtt.host, port = mqtt.port, "[health] MQTT connected");
                                health_tracker.mark_mqtt_connected();
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("[health] MQTT error: {e:?}");
                                health_tracker.increment_reconnects();
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                        }
                    }
                }
            }
        });
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{SwarmCoordinator, SwarmSettings};
    use crate::display::{DisplayScheduler, DisplaySurface};
    use crate::journal::MemorySink;
    use crate::protocol::{MemberId, Packet};
    use std::net::Ipv4Addr;

    struct NoDisplay;

    impl DisplayScheduler for NoDisplay {
        fn request_refresh(&self, _surface: DisplaySurface, _value: u32) {}
        fn arm_indicator(&self, _duration: Duration) {}
    }

    #[test]
    fn test_health_reflects_snapshot() {
        let now = Instant::now();
        let settings = SwarmSettings::new(MemberId::MIN, Ipv4Addr::LOCALHOST);
        let mut coordinator = SwarmCoordinator::new(settings, Arc::new(NoDisplay), Box::new(MemorySink::new()), now);
        let source = "10.0.0.3:2910".parse().unwrap();
        let light = Packet::LightUpdate {
            member: MemberId::new(3).unwrap(),
            report: Default::default(),
        };
        coordinator.handle_datagram(&light.encode(), source, now);
        coordinator.handle_datagram(&[0xF0, 0x09], source, now);

        let tracker = HealthTracker::new();
        let health = tracker.get_health(&coordinator.snapshot(now));
        assert_eq!(health.members_present, 1);
        assert_eq!(health.packets_received, 2);
        assert_eq!(health.packets_dropped, 1);
        assert_eq!(health.mqtt_status, "disabled");
        assert_eq!(health.state, CoordinatorState::Idle);

        tracker.increment_reconnects();
        let health = tracker.get_health(&coordinator.snapshot(now));
        assert_eq!(health.mqtt_reconnects, 1);
        assert_eq!(health.mqtt_status, "reconnecting");
    }
}
