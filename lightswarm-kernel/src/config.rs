use crate::coordinator::{SwarmSettings, PROTOCOL_VERSION};
use crate::display::Renderer;
use crate::protocol::MemberId;
use crate::stats::StatsSettings;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub bind: SocketAddr,
    pub broadcast: SocketAddr,
    /// IPv4 annoncée aux membres ; sinon adresse locale détectée
    pub advertise_address: Option<Ipv4Addr>,
    /// Octet d'en-tête des trames diffusées ; sinon dernier octet de l'IP annoncée
    pub node_id: Option<u8>,
    pub protocol_version: u8,
    pub announce_interval_secs: u64,
    pub log_dir: Option<PathBuf>,
    pub stats: StatsConf,
    pub display: DisplayConf,
    pub http: Option<HttpConf>,
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StatsConf {
    pub slice_window_secs: u64,
    pub max_slices: usize,
    pub trim_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConf {
    pub activity_scale: f64,
    pub activity_levels: u32,
    pub armed_indicator_secs: u64,
    pub refresh_hold_ms: u64,
    pub master_command: Option<String>,   // ex: "seven-seg --value {value}"
    pub activity_command: Option<String>, // ex: "ledbar {value}"
    pub indicator_command: Option<String>, // ex: "gpio-led armed {state}"
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub listen: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 2910)),
            broadcast: SocketAddr::from(([255, 255, 255, 255], 2910)),
            advertise_address: None,
            node_id: None,
            protocol_version: PROTOCOL_VERSION,
            announce_interval_secs: 30,
            log_dir: Some(PathBuf::from("./logs")),
            stats: StatsConf::default(),
            display: DisplayConf::default(),
            http: Some(HttpConf {
                listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            }),
            mqtt: None,
        }
    }
}

impl Default for StatsConf {
    fn default() -> Self {
        let s = StatsSettings::default();
        Self {
            slice_window_secs: s.slice_window.as_secs(),
            max_slices: s.max_slices,
            trim_interval_secs: s.trim_interval.as_secs(),
        }
    }
}

impl Default for DisplayConf {
    fn default() -> Self {
        Self {
            activity_scale: 145.0,
            activity_levels: 8,
            armed_indicator_secs: 3,
            refresh_hold_ms: 2000,
            master_command: None,
            activity_command: None,
            indicator_command: None,
        }
    }
}

impl KernelConfig {
    /// Adresse annoncée : config, puis IPv4 locale, puis loopback
    pub fn resolve_advertise(&self) -> Ipv4Addr {
        if let Some(addr) = self.advertise_address {
            return addr;
        }
        match local_ip_address::local_ip() {
            Ok(IpAddr::V4(addr)) => addr,
            Ok(other) => {
                warn!(%other, "local address is not IPv4, advertising loopback");
                Ipv4Addr::LOCALHOST
            }
            Err(e) => {
                warn!("could not detect local IPv4 ({e}), advertising loopback");
                Ipv4Addr::LOCALHOST
            }
        }
    }

    pub fn resolve_node_id(&self, advertise: Ipv4Addr) -> MemberId {
        self.node_id
            .and_then(MemberId::new)
            .or_else(|| MemberId::new(advertise.octets()[3]))
            .unwrap_or(MemberId::MIN)
    }

    pub fn swarm_settings(&self, advertise: Ipv4Addr) -> SwarmSettings {
        SwarmSettings {
            node_id: self.resolve_node_id(advertise),
            advertise,
            protocol_version: self.protocol_version,
            stats: StatsSettings {
                slice_window: Duration::from_secs(self.stats.slice_window_secs.max(1)),
                max_slices: self.stats.max_slices.max(1),
                trim_interval: Duration::from_secs(self.stats.trim_interval_secs.max(1)),
            },
            activity_scale: self.display.activity_scale,
            activity_levels: self.display.activity_levels,
            armed_indicator: Duration::from_secs(self.display.armed_indicator_secs),
        }
    }

    pub fn renderer(&self) -> Renderer {
        Renderer {
            hold: Duration::from_millis(self.display.refresh_hold_ms),
            master_command: self.display.master_command.clone(),
            activity_command: self.display.activity_command.clone(),
            indicator_command: self.display.indicator_command.clone(),
        }
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    Ok(serde_yaml::from_str(txt)?)
}

pub async fn read_config(path: &str) -> Result<KernelConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    parse_config(&txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("LIGHTSWARM_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        info!(%path, "no config file, using defaults");
        return KernelConfig::default();
    }
    read_config(&path).await.unwrap_or_else(|e| {
        warn!(%path, "{e}, using defaults");
        KernelConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_swarm_protocol() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.bind.port(), 2910);
        assert_eq!(cfg.broadcast, "255.255.255.255:2910".parse().unwrap());
        assert_eq!(cfg.announce_interval(), Duration::from_secs(30));
        assert!(cfg.mqtt.is_none());

        let settings = cfg.swarm_settings(Ipv4Addr::new(192, 168, 1, 40));
        assert_eq!(settings.node_id.get(), 40);
        assert_eq!(settings.protocol_version, 7);
        assert_eq!(settings.stats.slice_window, Duration::from_secs(4));
        assert_eq!(settings.stats.max_slices, 8);
        assert_eq!(settings.stats.trim_interval, Duration::from_secs(30));
        assert_eq!(settings.activity_scale, 145.0);
        assert_eq!(settings.activity_levels, 8);
        assert_eq!(settings.armed_indicator, Duration::from_secs(3));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            r#"
bind: "0.0.0.0:4000"
node_id: 9
log_dir: null
display:
  activity_scale: 100.0
  master_command: "seven-seg {value}"
mqtt:
  host: broker.local
  port: 1883
"#,
        )
        .unwrap();
        assert_eq!(cfg.bind.port(), 4000);
        assert_eq!(cfg.broadcast.port(), 2910);
        assert!(cfg.log_dir.is_none());
        assert_eq!(cfg.display.activity_scale, 100.0);
        assert_eq!(cfg.display.activity_levels, 8);
        assert_eq!(cfg.renderer().master_command.as_deref(), Some("seven-seg {value}"));
        assert_eq!(cfg.mqtt.as_ref().map(|m| m.host.as_str()), Some("broker.local"));
        assert_eq!(cfg.resolve_node_id(Ipv4Addr::new(10, 0, 0, 77)).get(), 9);
    }

    #[test]
    fn test_empty_and_invalid_yaml() {
        assert_eq!(parse_config("  \n").unwrap().bind.port(), 2910);
        assert!(matches!(
            parse_config("bind: [not, an, address]"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[tokio::test]
    async fn test_read_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.yaml");
        std::fs::write(&path, "announce_interval_secs: 5\n").unwrap();

        let cfg = read_config(path.to_str().unwrap()).await.unwrap();
        assert_eq!(cfg.announce_interval(), Duration::from_secs(5));

        let missing = dir.path().join("absent.yaml");
        assert!(matches!(
            read_config(missing.to_str().unwrap()).await,
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_node_id_zero_falls_back() {
        let cfg = KernelConfig {
            node_id: Some(0),
            ..KernelConfig::default()
        };
        assert_eq!(cfg.resolve_node_id(Ipv4Addr::new(10, 0, 0, 12)).get(), 12);
        assert_eq!(cfg.resolve_node_id(Ipv4Addr::new(10, 0, 0, 0)).get(), 1);
    }
}
