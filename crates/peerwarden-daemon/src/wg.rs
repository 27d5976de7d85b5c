// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use tracing::{debug, warn};

use crate::config::WireguardSettings;
use crate::error::{CoreError, Result};
use crate::exec::{EngineExec, shell_quote};
use crate::wgconf::parse_interface_params;

// -- Dump parsing --

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpPeer {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub latest_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub keepalive: Option<u16>,
}

impl DumpPeer {
    /// First allowed address, without its prefix.
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.allowed_ips
            .first()
            .and_then(|a| a.split('/').next())
            .and_then(|a| a.parse().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgDump {
    pub public_key: Option<String>,
    pub listen_port: Option<u16>,
    pub peers: Vec<DumpPeer>,
}

fn present(field: Option<&str>) -> Option<String> {
    field
        .map(str::trim)
        .filter(|f| !f.is_empty() && *f != "(none)" && *f != "off")
        .map(str::to_string)
}

impl WgDump {
    /// Parse `show <iface> dump`: one interface row, then one row per peer.
    pub fn parse(text: &str) -> Self {
        let mut rows = text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(|l| l.split('\t').collect::<Vec<_>>());

        let Some(iface) = rows.next() else {
            return Self::default();
        };

        let peers = rows
            .filter(|parts| parts.len() >= 4)
            .map(|parts| DumpPeer {
                public_key: parts[0].to_string(),
                preshared_key: present(parts.get(1).copied()),
                endpoint: present(parts.get(2).copied()),
                allowed_ips: present(parts.get(3).copied())
                    .map(|a| a.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
                latest_handshake: parts.get(4).and_then(|v| v.parse().ok()).unwrap_or(0),
                rx_bytes: parts.get(5).and_then(|v| v.parse().ok()).unwrap_or(0),
                tx_bytes: parts.get(6).and_then(|v| v.parse().ok()).unwrap_or(0),
                keepalive: parts.get(7).and_then(|v| v.parse().ok()),
            })
            .collect();

        Self {
            public_key: present(iface.get(1).copied()),
            listen_port: iface.get(2).and_then(|v| v.parse().ok()),
            peers,
        }
    }

    pub fn peer(&self, public_key: &str) -> Option<&DumpPeer> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }

    pub fn has_peer(&self, public_key: &str) -> bool {
        self.peer(public_key).is_some()
    }
}

/// `key: value` lines of the human-readable `show <iface>` output with
/// integer values, keyed by lowercased name.
pub fn parse_show_params(text: &str) -> BTreeMap<String, i64> {
    text.lines()
        .filter_map(|line| {
            let (k, v) = line.trim().split_once(':')?;
            let value = v.trim().parse().ok()?;
            Some((k.trim().to_lowercase(), value))
        })
        .collect()
}

// -- Key material --

pub fn decode_key(b64: &str) -> Result<[u8; 32]> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| CoreError::ValidationFailed(format!("failed to decode base64 key: {e}")))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        CoreError::ValidationFailed(format!("invalid key length: expected 32 bytes, got {len}"))
    })
}

fn checked_key(raw: &str, what: &str) -> Result<String> {
    let key = raw.trim().to_string();
    decode_key(&key).map_err(|e| CoreError::ValidationFailed(format!("{what}: {e}")))?;
    Ok(key)
}

/// First IPv4 network in an `Address` value (`10.8.1.1/24, fd00::1/64`),
/// normalized to its network address.
pub fn subnet_from_address(value: &str) -> Option<Ipv4Network> {
    value
        .split([',', ' ', '\t'])
        .filter(|s| s.contains('/'))
        .find_map(|s| s.trim().parse::<Ipv4Network>().ok())
        .and_then(|n| Ipv4Network::new(n.network(), n.prefix()).ok())
}

// -- Runtime access through the engine --

pub struct WgRuntime<E> {
    exec: Arc<E>,
    engine: String,
    interface: String,
    bin: String,
    server_public_key_path: String,
    default_subnet: String,
    wait_attempts: u32,
    wait_interval: Duration,
}

impl<E: EngineExec> WgRuntime<E> {
    pub fn new(exec: Arc<E>, settings: &WireguardSettings) -> Self {
        Self {
            exec,
            engine: settings.engine.clone(),
            interface: settings.interface.clone(),
            bin: settings.bin.clone(),
            server_public_key_path: settings.server_public_key_path.clone(),
            default_subnet: settings.default_subnet.clone(),
            wait_attempts: settings.peer_wait_attempts,
            wait_interval: Duration::from_millis(settings.peer_wait_interval_ms),
        }
    }

    pub async fn dump(&self) -> Result<WgDump> {
        let command = format!("{} show {} dump", self.bin, shell_quote(&self.interface));
        let out = self.exec.exec_ok(&self.engine, &command).await?;
        Ok(WgDump::parse(&out))
    }

    /// Runtime interface parameters. Empty when the engine cannot be read.
    pub async fn show_params(&self) -> BTreeMap<String, i64> {
        let command = format!("{} show {}", self.bin, shell_quote(&self.interface));
        match self.exec.exec_ok(&self.engine, &command).await {
            Ok(out) => parse_show_params(&out),
            Err(e) => {
                warn!(engine = %self.engine, error = %e, "could not read runtime interface parameters");
                BTreeMap::new()
            }
        }
    }

    /// Returns `(private, public)`.
    pub async fn generate_keypair(&self) -> Result<(String, String)> {
        let out = self
            .exec
            .exec_ok(&self.engine, &format!("{} genkey", self.bin))
            .await?;
        let private = checked_key(&out, "genkey")?;
        let command = format!("printf %s {} | {} pubkey", shell_quote(&private), self.bin);
        let out = self.exec.exec_ok(&self.engine, &command).await?;
        let public = checked_key(&out, "pubkey")?;
        debug!(engine = %self.engine, "generated keypair");
        Ok((private, public))
    }

    pub async fn generate_psk(&self) -> Result<String> {
        let out = self
            .exec
            .exec_ok(&self.engine, &format!("{} genpsk", self.bin))
            .await?;
        checked_key(&out, "genpsk")
    }

    /// Key file first, running interface second.
    pub async fn server_public_key(&self) -> Result<String> {
        match self
            .exec
            .read_file(&self.engine, &self.server_public_key_path)
            .await
        {
            Ok(key) if decode_key(&key).is_ok() => return Ok(key.trim().to_string()),
            Ok(_) => warn!(path = %self.server_public_key_path, "server key file is malformed"),
            Err(e) => debug!(error = %e, "server key file unreadable"),
        }
        let command = format!("{} show {} public-key", self.bin, shell_quote(&self.interface));
        let out = self.exec.exec_ok(&self.engine, &command).await?;
        checked_key(&out, "server public key")
    }

    /// Running interface address, then `[Interface] Address`, then the
    /// configured default.
    pub async fn subnet(&self, conf_text: &str) -> Result<Ipv4Network> {
        let command = format!("ip -brief addr show dev {}", shell_quote(&self.interface));
        if let Ok(out) = self.exec.exec_ok(&self.engine, &command).await
            && let Some(net) = out.lines().find_map(|line| {
                line.split_whitespace()
                    .skip(1)
                    .find_map(|tok| subnet_from_address(tok))
            })
        {
            debug!(subnet = %net, "subnet from running interface");
            return Ok(net);
        }
        if let Some(net) = parse_interface_params(conf_text)
            .get("Address")
            .and_then(|a| subnet_from_address(a))
        {
            debug!(subnet = %net, "subnet from config address");
            return Ok(net);
        }
        subnet_from_address(&self.default_subnet).ok_or_else(|| {
            CoreError::ValidationFailed(format!("cannot determine subnet from {:?}", self.default_subnet))
        })
    }

    /// Poll the dump until `public_key` shows up. Best effort.
    pub async fn wait_for_peer(&self, public_key: &str) -> bool {
        for _ in 0..self.wait_attempts {
            if matches!(self.dump().await, Ok(d) if d.has_peer(public_key)) {
                return true;
            }
            tokio::time::sleep(self.wait_interval).await;
        }
        warn!(engine = %self.engine, "peer did not appear in runtime dump");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const DUMP: &str = "srvpriv=\tsrvpub=\t51820\toff\n\
peerA=\tpskA=\t203.0.113.5:40000\t10.8.1.2/32\t1700000000\t100\t200\t25\n\
peerB=\t(none)\t(none)\t10.8.1.3/32, fd00::3/128\t0\t0\t0\toff\n\
short\n";

    #[test]
    fn parses_dump() {
        let dump = WgDump::parse(DUMP);
        assert_eq!(dump.listen_port, Some(51820));
        assert_eq!(dump.public_key.as_deref(), Some("srvpub="));
        assert_eq!(dump.peers.len(), 2);

        let a = dump.peer("peerA=").unwrap();
        assert_eq!(a.preshared_key.as_deref(), Some("pskA="));
        assert_eq!(a.keepalive, Some(25));
        assert_eq!(a.rx_bytes, 100);
        assert_eq!(a.address(), Some(Ipv4Addr::new(10, 8, 1, 2)));

        let b = dump.peer("peerB=").unwrap();
        assert_eq!(b.preshared_key, None);
        assert_eq!(b.endpoint, None);
        assert_eq!(b.keepalive, None);
        assert_eq!(b.allowed_ips, vec!["10.8.1.3/32", "fd00::3/128"]);
    }

    #[test]
    fn empty_dump() {
        assert_eq!(WgDump::parse(""), WgDump::default());
    }

    #[test]
    fn parses_show_params() {
        let text = "interface: wg0\n  public key: abc=\n  listening port: 51820\n  jc: 4\n  jmin: 40\n  h1: 1234567\n";
        let params = parse_show_params(text);
        assert_eq!(params["jc"], 4);
        assert_eq!(params["h1"], 1234567);
        assert_eq!(params["listening port"], 51820);
        assert!(!params.contains_key("interface"));
    }

    #[test_case("YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=", true; "32 bytes")]
    #[test_case("YWFh", false; "too short")]
    #[test_case("not base64!", false; "garbage")]
    fn key_validation(key: &str, ok: bool) {
        assert_eq!(decode_key(key).is_ok(), ok);
    }

    #[test_case("10.8.1.1/24", Some("10.8.1.0/24"); "host address")]
    #[test_case("10.8.1.1/24, fd00::1/64", Some("10.8.1.0/24"); "dual stack")]
    #[test_case("fd00::1/64", None; "v6 only")]
    #[test_case("10.8.1.1", None; "no prefix")]
    fn subnet_parsing(input: &str, expected: Option<&str>) {
        assert_eq!(
            subnet_from_address(input).map(|n| n.to_string()),
            expected.map(str::to_string)
        );
    }
}
