use std::collections::BTreeMap;
use std::path::Path;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::wgconf::OBFUSCATION_KEYS;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/peerwarden/engines.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exec: ExecSettings,
    pub wireguard: WireguardSettings,
    pub tunnel: TunnelSettings,
    pub owners: OwnerSettings,
    pub endpoint: EndpointSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecSettings {
    pub docker_bin: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            timeout_secs: 10,
            retries: 1,
            retry_delay_secs: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardSettings {
    pub engine: String,
    pub interface: String,
    /// Engine binary; `<bin>-quick` is used for stripping.
    pub bin: String,
    pub config_path: String,
    pub clients_table_path: String,
    pub server_public_key_path: String,
    pub lock_path: String,
    /// Used when neither the running interface nor the config reveal a subnet.
    pub default_subnet: String,
    pub listen_port: Option<u16>,
    pub keepalive: u16,
    pub connect_host: Option<String>,
    /// Host name of the DNS engine, resolved from inside the WireGuard engine.
    pub dns_engine: Option<String>,
    pub dns_fallback: String,
    pub dns_secondary: String,
    pub client_allowed_ips: String,
    pub peer_wait_attempts: u32,
    pub peer_wait_interval_ms: u64,
    /// Fallback values for interface obfuscation parameters (`Jc`, `S1`, `H1`, ...).
    pub obfuscation: BTreeMap<String, i64>,
}

impl Default for WireguardSettings {
    fn default() -> Self {
        Self {
            engine: "amnezia-awg".into(),
            interface: "wg0".into(),
            bin: "wg".into(),
            config_path: "/opt/amnezia/awg/wg0.conf".into(),
            clients_table_path: "/opt/amnezia/awg/clientsTable".into(),
            server_public_key_path: "/opt/amnezia/awg/wireguard_server_public_key.key".into(),
            lock_path: "/opt/amnezia/awg/.conf.lock".into(),
            default_subnet: "10.8.1.0/24".into(),
            listen_port: None,
            keepalive: 25,
            connect_host: None,
            dns_engine: Some("amnezia-dns".into()),
            dns_fallback: "1.1.1.1".into(),
            dns_secondary: "1.0.0.1".into(),
            client_allowed_ips: "0.0.0.0/0, ::/0".into(),
            peer_wait_attempts: 10,
            peer_wait_interval_ms: 200,
            obfuscation: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub engine: String,
    pub bin: String,
    pub config_path: String,
    pub clients_table_path: String,
    pub inbound_index: usize,
    pub backup_keep: usize,
    pub connect_host: Option<String>,
    pub default_flow: String,
    pub default_sni: String,
    pub default_port: u16,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            engine: "amnezia-xray".into(),
            bin: "xray".into(),
            config_path: "/opt/amnezia/xray/server.json".into(),
            clients_table_path: "/opt/amnezia/xray/clientsTable".into(),
            inbound_index: 0,
            backup_keep: 10,
            connect_host: None,
            default_flow: "xtls-rprx-vision".into(),
            default_sni: "www.cloudflare.com".into(),
            default_port: 443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerSettings {
    pub state_path: String,
    pub backups_dir: String,
    pub backups_keep: usize,
}

impl Default for OwnerSettings {
    fn default() -> Self {
        Self {
            state_path: "/var/lib/peerwarden/state.json".into(),
            backups_dir: "/var/lib/peerwarden/backups".into(),
            backups_keep: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Host-side public address lookup, tried after the engine-side probes.
    pub lookup_url: Option<String>,
    pub http_timeout_secs: u64,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            lookup_url: Some("https://ifconfig.me/ip".into()),
            http_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {key}: {value:?}")]
    Override { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub async fn load(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: Config = toml::from_str(&contents)?;
            info!(
                path = %path.display(),
                awg = %config.wireguard.engine,
                xray = %config.tunnel.engine,
                "loaded config"
            );
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(ConfigError::Read(e)),
    }
}

pub async fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = toml::to_string_pretty(config)?;
    tokio::fs::write(path, contents).await?;
    info!(path = %path.display(), "saved config");
    Ok(())
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Override {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

impl Config {
    /// Layer environment-style overrides on top of the file values.
    /// `lookup` maps a variable name to its value; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let wg = &mut self.wireguard;
        if let Some(v) = get("AWG_CONTAINER") {
            wg.engine = v;
        }
        if let Some(v) = get("AWG_CONFIG_PATH") {
            wg.config_path = v;
        }
        if let Some(v) = get("AWG_IFACE") {
            wg.interface = v;
        }
        if let Some(v) = get("AWG_BIN") {
            wg.bin = v;
        }
        if let Some(v) = get("AWG_CONNECT_HOST") {
            wg.connect_host = Some(v);
        }
        for key in OBFUSCATION_KEYS {
            let var = format!("AWG_{}", key.to_uppercase());
            if let Some(v) = get(&var) {
                wg.obfuscation.insert(key.to_string(), parse_override(&var, &v)?);
            }
        }

        let xray = &mut self.tunnel;
        if let Some(v) = get("XRAY_CONTAINER") {
            xray.engine = v;
        }
        if let Some(v) = get("XRAY_CONFIG_PATH") {
            xray.config_path = v;
        }
        if let Some(v) = get("XRAY_INBOUND_INDEX") {
            xray.inbound_index = parse_override("XRAY_INBOUND_INDEX", &v)?;
        }
        if let Some(v) = get("XRAY_CONNECT_HOST") {
            xray.connect_host = Some(v);
        }
        if let Some(v) = get("XRAY_BACKUP_KEEP") {
            xray.backup_keep = parse_override("XRAY_BACKUP_KEEP", &v)?;
        }

        if let Some(v) = get("DOCKER_EXEC_TIMEOUT") {
            self.exec.timeout_secs = parse_override("DOCKER_EXEC_TIMEOUT", &v)?;
        }
        if let Some(v) = get("DOCKER_EXEC_RETRIES") {
            self.exec.retries = parse_override("DOCKER_EXEC_RETRIES", &v)?;
        }
        if let Some(v) = get("DOCKER_EXEC_RETRY_SECS") {
            self.exec.retry_delay_secs = parse_override("DOCKER_EXEC_RETRY_SECS", &v)?;
        }
        if let Some(v) = get("STATE_PATH") {
            self.owners.state_path = v;
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wireguard.engine.is_empty() || self.tunnel.engine.is_empty() {
            return Err(ConfigError::Invalid("engine names must not be empty".into()));
        }
        let subnet: Ipv4Network = self.wireguard.default_subnet.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "default subnet {:?} is not an IPv4 network",
                self.wireguard.default_subnet
            ))
        })?;
        if subnet.prefix() > 30 {
            return Err(ConfigError::Invalid(format!(
                "default subnet {subnet} has no allocatable host"
            )));
        }
        for key in self.wireguard.obfuscation.keys() {
            if !OBFUSCATION_KEYS.contains(&key.as_str()) {
                warn!(key = %key, "unknown obfuscation parameter");
                return Err(ConfigError::Invalid(format!(
                    "unknown obfuscation parameter {key:?}"
                )));
            }
        }
        if self.exec.timeout_secs == 0 {
            return Err(ConfigError::Invalid("exec timeout must be positive".into()));
        }
        debug!("config validated");
        Ok(())
    }

    /// Engines the exec adapter is allowed to reach.
    pub fn engines(&self) -> Vec<String> {
        let mut engines = vec![self.wireguard.engine.clone(), self.tunnel.engine.clone()];
        engines.extend(self.wireguard.dns_engine.clone());
        engines
    }
}
