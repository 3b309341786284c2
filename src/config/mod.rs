use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub listener: ListenerConfig,
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub meshes: Vec<MeshConfig>,
    pub geoip: GeoIpConfig,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub sweeper: SweeperConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    /// Upper bound on concurrent sessions; 0 means unbounded.
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

/// One VPN mesh. The order of `[[meshes]]` entries in the config file is the
/// classification priority order: the first mesh is primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub name: String,
    pub enabled: bool,
    pub cidr: String,
    pub api_url: String,
    pub api_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoIpConfig {
    pub enabled: bool,
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub busy_timeout_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub classify_timeout_secs: u64,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    pub sweep_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub activity_retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub file_path: String,
    pub console_enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            listener: ListenerConfig {
                listen_address: "0.0.0.0".to_string(),
                listen_port: 30004,
                max_connections: 1000,
            },
            downstream: DownstreamConfig {
                host: "readsb".to_string(),
                port: 30006,
                connect_timeout_secs: 5,
                retry_attempts: 4,
                retry_base_delay_ms: 500,
            },
            meshes: vec![
                MeshConfig {
                    name: "netbird".to_string(),
                    enabled: false,
                    cidr: "100.64.0.0/10".to_string(),
                    api_url: "http://localhost:33073".to_string(),
                    api_token: String::new(),
                },
                MeshConfig {
                    name: "tailscale".to_string(),
                    enabled: false,
                    cidr: "100.64.0.0/10".to_string(),
                    api_url: "http://localhost:41641".to_string(),
                    api_token: String::new(),
                },
            ],
            geoip: GeoIpConfig {
                enabled: false,
                db_path: "GeoLite2-City.mmdb".to_string(),
            },
            database: DatabaseConfig {
                path: "aggregator.db".to_string(),
                busy_timeout_ms: 5000,
            },
            session: SessionConfig {
                classify_timeout_secs: 3,
                flush_interval_secs: 30,
            },
            sweeper: SweeperConfig {
                sweep_interval_secs: 30,
                stale_threshold_secs: 120,
                activity_retention_days: 7,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_enabled: true,
                file_path: "skyfeed.log".to_string(),
                console_enabled: true,
            },
        }
    }
}

pub struct ConfigManager {
    config_path: std::path::PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: std::path::PathBuf) -> Self {
        Self { config_path }
    }

    pub async fn load_or_default(&self) -> Result<IngestConfig, std::io::Error> {
        if self.config_path.exists() {
            match tokio::fs::read_to_string(&self.config_path).await {
                Ok(content) => {
                    toml::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(IngestConfig::default())
        }
    }

    pub async fn save(&self, config: &IngestConfig) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(config).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.config_path, content).await
    }
}
