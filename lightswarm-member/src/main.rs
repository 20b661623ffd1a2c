/**
 * LIGHTSWARM MEMBER - Émulateur d'un capteur de l'essaim
 *
 * RÔLE : Se comporte comme un ESP8266 LightSwarm sur le réseau : diffuse
 * LIGHT_UPDATE, élit le maître, envoie son log au serveur annoncé par
 * DEFINE_SERVER_LOGGER, obéit à RESET_SWARM / RESET_ME / BLINK_BRIGHT_LED.
 *
 * CONFIG (env) : LIGHTSWARM_MEMBER_ID, LIGHTSWARM_BIND, LIGHTSWARM_BROADCAST,
 * LIGHTSWARM_INTERVAL (ex: "1s", "250ms"), LIGHTSWARM_CLEAR (valeur fixe).
 */

use anyhow::Context;
use lightswarm_devkit::{MemberReaction, MemberSim};
use lightswarm_kernel::protocol::{MemberId, Packet};
use local_ip_address::local_ip;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
struct MemberConfig {
    id: MemberId,
    bind: SocketAddr,
    broadcast: SocketAddr,
    interval: Duration,
    clear: Option<u16>,
}

impl MemberConfig {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>, default_id: u8) -> anyhow::Result<Self> {
        let raw_id = match lookup("LIGHTSWARM_MEMBER_ID") {
            Some(v) => v.parse::<u8>().context("LIGHTSWARM_MEMBER_ID must be 1..=255")?,
            None => default_id,
        };
        let id = MemberId::new(raw_id).context("member id 0 is reserved")?;
        let bind = lookup("LIGHTSWARM_BIND")
            .unwrap_or_else(|| "0.0.0.0:2910".into())
            .parse()
            .context("LIGHTSWARM_BIND")?;
        let broadcast = lookup("LIGHTSWARM_BROADCAST")
            .unwrap_or_else(|| "255.255.255.255:2910".into())
            .parse()
            .context("LIGHTSWARM_BROADCAST")?;
        let interval = humantime::parse_duration(&lookup("LIGHTSWARM_INTERVAL").unwrap_or_else(|| "1s".into()))
            .context("LIGHTSWARM_INTERVAL")?;
        let clear = lookup("LIGHTSWARM_CLEAR")
            .map(|v| v.parse::<u16>())
            .transpose()
            .context("LIGHTSWARM_CLEAR")?;
        Ok(Self { id, bind, broadcast, interval, clear })
    }
}

/// Photorésistance simulée : dent de scie 0..1023 sur ~20s
fn simulated_clear(started: Instant) -> u16 {
    let step = (started.elapsed().as_millis() / 20) % 2046;
    let step = step as u16;
    if step < 1023 { step } else { 2046 - step }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Identité : dernier octet de l'IP locale, comme le firmware
    let default_id = match local_ip() {
        Ok(IpAddr::V4(ip)) => ip.octets()[3],
        _ => 2,
    };
    let cfg = MemberConfig::from_lookup(|k| std::env::var(k).ok(), default_id)?;

    let socket = UdpSocket::bind(cfg.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.bind))?;
    socket.set_broadcast(true)?;
    info!(id = %cfg.id, bind = %cfg.bind, broadcast = %cfg.broadcast, "[member] started");

    let started = Instant::now();
    let mut sim = MemberSim::new(cfg.id);
    let mut tick = tokio::time::interval(cfg.interval);
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            _ = tick.tick() => {
                sim.set_clear(cfg.clear.unwrap_or_else(|| simulated_clear(started)));
                let now = Instant::now();
                sim.check_master(now);

                if let Err(e) = socket.send_to(&sim.light_update_bytes(), cfg.broadcast).await {
                    warn!("[member] light update failed: {e}");
                }
                if let (true, Some(server)) = (sim.should_log(), sim.server()) {
                    let target = SocketAddr::from((server, cfg.broadcast.port()));
                    match socket.send_to(&sim.log_report_bytes(now), target).await {
                        Ok(_) => debug!(%target, clear = sim.clear(), "[member] log sent"),
                        Err(e) => warn!(%target, "[member] log failed: {e}"),
                    }
                }
            },
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("[member] receive failed: {e}");
                        continue;
                    }
                };
                let packet = match Packet::decode(&buf[..len]) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(%from, "[member] ignored datagram: {e}");
                        continue;
                    }
                };
                match sim.handle(&packet, Instant::now()) {
                    MemberReaction::BecameMaster => info!("[member] I just became master"),
                    MemberReaction::ServerDefined(server) => info!(%server, "[member] log server defined"),
                    MemberReaction::Blink(duration) => info!(?duration, "[member] blinking bright LED"),
                    MemberReaction::PeerUpdated { slot } => debug!(slot, peer = %packet.member(), "[member] peer update"),
                    MemberReaction::Ignored => debug!(kind = %packet.kind(), "[member] packet ignored"),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = MemberConfig::from_lookup(lookup(&[]), 42).unwrap();
        assert_eq!(cfg.id.get(), 42);
        assert_eq!(cfg.bind.port(), 2910);
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.clear, None);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = MemberConfig::from_lookup(
            lookup(&[
                ("LIGHTSWARM_MEMBER_ID", "17"),
                ("LIGHTSWARM_BIND", "0.0.0.0:0"),
                ("LIGHTSWARM_INTERVAL", "250ms"),
                ("LIGHTSWARM_CLEAR", "800"),
            ]),
            42,
        )
        .unwrap();
        assert_eq!(cfg.id.get(), 17);
        assert_eq!(cfg.bind.port(), 0);
        assert_eq!(cfg.interval, Duration::from_millis(250));
        assert_eq!(cfg.clear, Some(800));
    }

    #[test]
    fn test_reserved_id_rejected() {
        assert!(MemberConfig::from_lookup(lookup(&[("LIGHTSWARM_MEMBER_ID", "0")]), 42).is_err());
        assert!(MemberConfig::from_lookup(lookup(&[]), 0).is_err());
    }

    #[test]
    fn test_simulated_clear_in_sensor_range() {
        assert!(simulated_clear(Instant::now()) <= 1023);
    }
}
