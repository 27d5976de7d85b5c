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

//! Text-level editing of WireGuard-style configuration files and the
//! guarded write-then-apply path onto the running interface.
//!
//! A document is one `[Interface]` section followed by zero or more `[Peer]`
//! sections. Every edit works on lines, so comments and keys this module does
//! not understand pass through untouched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::WireguardSettings;
use crate::error::{CoreError, Result};
use crate::exec::{EngineExec, shell_quote};
use crate::lock::PathLocks;

pub const OBFUSCATION_KEYS: &[&str] = &["Jc", "Jmin", "Jmax", "S1", "S2", "H1", "H2", "H3", "H4"];

pub const INTERFACE_KEYS: &[&str] = &[
    "Address",
    "ListenPort",
    "DNS",
    "MTU",
    "Jc",
    "Jmin",
    "Jmax",
    "S1",
    "S2",
    "H1",
    "H2",
    "H3",
    "H4",
];

/// Anything shorter than this is treated as truncated.
pub const MIN_CONFIG_BYTES: usize = 40;

// ---------------------------------------------------------------------------
// Line helpers
// ---------------------------------------------------------------------------

fn is_section(line: &str, name: &str) -> bool {
    let t = line.trim();
    t.len() == name.len() + 2
        && t.starts_with('[')
        && t.ends_with(']')
        && t[1..t.len() - 1].eq_ignore_ascii_case(name)
}

fn is_any_section(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('[') && t.ends_with(']')
}

fn is_peer(line: &str) -> bool {
    is_section(line, "Peer")
}

fn is_interface(line: &str) -> bool {
    is_section(line, "Interface")
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let t = line.trim();
    if t.is_empty() || t.starts_with('#') || t.starts_with(';') {
        return None;
    }
    let (k, v) = t.split_once('=')?;
    Some((k.trim(), v.trim()))
}

fn canonical_key(key: &str) -> Option<&'static str> {
    INTERFACE_KEYS
        .iter()
        .find(|k| k.eq_ignore_ascii_case(key))
        .copied()
}

fn join_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

struct Sections<'a> {
    head: Vec<&'a str>,
    peers: Vec<Vec<&'a str>>,
}

fn sections(text: &str) -> Sections<'_> {
    let mut head = Vec::new();
    let mut peers: Vec<Vec<&str>> = Vec::new();
    for line in text.lines() {
        if is_peer(line) {
            peers.push(vec![line]);
        } else if let Some(block) = peers.last_mut() {
            block.push(line);
        } else {
            head.push(line);
        }
    }
    Sections { head, peers }
}

fn block_key<'a>(block: &[&'a str]) -> Option<&'a str> {
    block.iter().find_map(|line| match key_value(line) {
        Some((k, v)) if k.eq_ignore_ascii_case("PublicKey") => Some(v),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Interface parameters
// ---------------------------------------------------------------------------

/// Recognized `[Interface]` keys with their raw values, under canonical names.
pub fn parse_interface_params(text: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut in_interface = false;
    for line in text.lines() {
        if is_any_section(line) {
            if in_interface {
                break;
            }
            in_interface = is_interface(line);
            continue;
        }
        if !in_interface {
            continue;
        }
        if let Some((k, v)) = key_value(line)
            && let Some(key) = canonical_key(k)
        {
            params.insert(key.to_string(), v.to_string());
        }
    }
    params
}

/// Where missing interface values come from: the running engine first, then
/// configured defaults.
#[derive(Debug, Clone, Copy)]
pub struct ParamSource<'a> {
    pub runtime: &'a BTreeMap<String, i64>,
    pub defaults: &'a BTreeMap<String, i64>,
}

impl ParamSource<'_> {
    fn lookup(map: &BTreeMap<String, i64>, key: &str) -> Option<i64> {
        map.get(key).copied().or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| *v)
        })
    }

    pub fn value(&self, key: &str) -> Option<i64> {
        Self::lookup(self.runtime, key).or_else(|| Self::lookup(self.defaults, key))
    }
}

/// Fill every `wanted` key missing from `[Interface]`. New lines go at the end
/// of the interface section, ahead of the first `[Peer]`. Keys with no value in
/// either source are left out.
pub fn ensure_interface_params(text: &str, wanted: &[&str], source: &ParamSource<'_>) -> String {
    let have = parse_interface_params(text);
    let additions: Vec<String> = wanted
        .iter()
        .map(|k| canonical_key(k).unwrap_or(k))
        .filter(|k| !have.contains_key(*k))
        .filter_map(|k| source.value(k).map(|v| format!("{k} = {v}")))
        .collect();
    if additions.is_empty() {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    let Some(start) = lines.iter().position(|l| is_interface(l)) else {
        warn!("no [Interface] section, not inserting parameters");
        return text.to_string();
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| is_any_section(l))
        .map_or(lines.len(), |p| p + start + 1);
    let mut at = end;
    while at > start + 1 && lines[at - 1].trim().is_empty() {
        at -= 1;
    }

    debug!(added = additions.len(), "inserting interface parameters");
    join_lines(
        lines[..at]
            .iter()
            .copied()
            .chain(additions.iter().map(String::as_str))
            .chain(lines[at..].iter().copied()),
    )
}

// ---------------------------------------------------------------------------
// Peer blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBlock {
    pub public_key: String,
    pub preshared_key: Option<String>,
    /// Always a single host, `a.b.c.d/32`.
    pub allowed_ips: String,
    pub keepalive: Option<u16>,
}

/// Normalize an address, with or without a prefix, to `/32`.
pub fn host_cidr(address: &str) -> Result<String> {
    let ip = address.trim().split('/').next().unwrap_or_default();
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| CoreError::ValidationFailed(format!("invalid peer address {address:?}")))?;
    Ok(format!("{ip}/32"))
}

impl PeerBlock {
    pub fn new(
        public_key: &str,
        preshared_key: Option<&str>,
        address: &str,
        keepalive: Option<u16>,
    ) -> Result<Self> {
        Ok(Self {
            public_key: public_key.to_string(),
            preshared_key: preshared_key.map(str::to_string),
            allowed_ips: host_cidr(address)?,
            keepalive,
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!("[Peer]\nPublicKey = {}\n", self.public_key);
        if let Some(psk) = &self.preshared_key {
            out.push_str(&format!("PresharedKey = {psk}\n"));
        }
        out.push_str(&format!("AllowedIPs = {}\n", self.allowed_ips));
        if let Some(keepalive) = self.keepalive {
            out.push_str(&format!("PersistentKeepalive = {keepalive}\n"));
        }
        out
    }
}

fn push_block(out: &mut String, body: &str) {
    out.push('\n');
    out.push_str(body.trim_end());
    out.push('\n');
}

/// Remove every `[Peer]` block for `public_key`; everything else is unchanged.
pub fn drop_peer_block(text: &str, public_key: &str) -> String {
    let doc = sections(text);
    join_lines(
        doc.head.iter().copied().chain(
            doc.peers
                .iter()
                .filter(|b| block_key(b) != Some(public_key))
                .flatten()
                .copied(),
        ),
    )
}

/// Replace any block for `block.public_key` with a fresh one at the end.
pub fn upsert_peer_block(text: &str, block: &PeerBlock) -> String {
    let mut out = drop_peer_block(text, &block.public_key)
        .trim_end()
        .to_string();
    out.push('\n');
    push_block(&mut out, &block.render());
    out
}

/// Everything before the first `[Peer]`.
pub fn strip_to_interface_only(text: &str) -> String {
    let head = sections(text).head;
    let mut out = join_lines(head).trim_end().to_string();
    out.push('\n');
    out
}

pub fn has_peer(text: &str, public_key: &str) -> bool {
    sections(text)
        .peers
        .iter()
        .any(|b| block_key(b) == Some(public_key))
}

pub fn peer_keys(text: &str) -> Vec<String> {
    sections(text)
        .peers
        .iter()
        .filter_map(|b| block_key(b).map(str::to_string))
        .collect()
}

/// Regenerate the peer section from `managed`. Existing blocks for a managed
/// key are replaced in place, blocks for a key in `known` but not managed are
/// dropped, and blocks for any other key are kept verbatim.
pub fn rebuild_peer_section(text: &str, managed: &[PeerBlock], known: &HashSet<String>) -> String {
    let doc = sections(text);
    let by_key: HashMap<&str, &PeerBlock> = managed
        .iter()
        .map(|b| (b.public_key.as_str(), b))
        .collect();
    let mut emitted: HashSet<&str> = HashSet::new();

    let mut out = join_lines(doc.head.iter().copied()).trim_end().to_string();
    out.push('\n');

    for block in &doc.peers {
        match block_key(block) {
            Some(key) if by_key.contains_key(key) => {
                if emitted.insert(key) {
                    push_block(&mut out, &by_key[key].render());
                }
            }
            Some(key) if known.contains(key) => {
                debug!("dropping unmanaged block for a registry key");
            }
            _ => push_block(&mut out, &join_lines(block.iter().copied())),
        }
    }
    for block in managed {
        if emitted.insert(block.public_key.as_str()) {
            push_block(&mut out, &block.render());
        }
    }
    out
}

pub fn validate(text: &str) -> Result<()> {
    if !text.lines().any(is_interface) {
        return Err(CoreError::ValidationFailed("missing [Interface] section".into()));
    }
    let len = text.trim().len();
    if len < MIN_CONFIG_BYTES {
        return Err(CoreError::ValidationFailed(format!(
            "config is suspiciously small ({len} bytes)"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Guarded write and apply
// ---------------------------------------------------------------------------

pub struct ConfigWriter<E> {
    exec: Arc<E>,
    locks: PathLocks,
    engine: String,
    interface: String,
    bin: String,
    path: String,
    lock_path: String,
}

impl<E: EngineExec> ConfigWriter<E> {
    pub fn new(exec: Arc<E>, locks: PathLocks, settings: &WireguardSettings) -> Self {
        Self {
            exec,
            locks,
            engine: settings.engine.clone(),
            interface: settings.interface.clone(),
            bin: settings.bin.clone(),
            path: settings.config_path.clone(),
            lock_path: settings.lock_path.clone(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn read(&self) -> Result<String> {
        Ok(self.exec.read_file(&self.engine, &self.path).await?)
    }

    async fn has_flock(&self) -> bool {
        matches!(
            self.exec
                .exec(&self.engine, "command -v flock >/dev/null 2>&1")
                .await,
            Ok(out) if out.success()
        )
    }

    async fn secure_permissions(&self) -> Result<()> {
        let path = shell_quote(&self.path);
        let dir = self
            .path
            .rsplit_once('/')
            .map(|(d, _)| d)
            .filter(|d| !d.is_empty())
            .unwrap_or("/");
        let command = format!(
            "chown root:root {path} 2>/dev/null || true; chmod 600 {path} 2>/dev/null || true; chmod 700 {dir} 2>/dev/null || true",
            dir = shell_quote(dir),
        );
        self.exec.exec(&self.engine, &command).await?;
        Ok(())
    }

    /// Validate, write, read back, then push the file onto the running
    /// interface with strip + syncconf.
    #[tracing::instrument(skip_all, fields(engine = %self.engine, path = %self.path))]
    pub async fn write_and_apply(&self, text: &str) -> Result<()> {
        validate(text).inspect_err(|e| warn!(error = %e, "refusing to write config"))?;
        let mut text = text.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }

        let _guard = self.locks.lock(&self.engine, &self.path).await;

        let staged = format!("{}.staged", self.path);
        self.exec
            .write_file_atomic(&self.engine, &staged, &text)
            .await?;
        let mv = format!("mv -f {} {}", shell_quote(&staged), shell_quote(&self.path));
        if self.has_flock().await {
            let locked = format!(
                "flock -x {} -c {}",
                shell_quote(&self.lock_path),
                shell_quote(&mv)
            );
            self.exec.exec_ok(&self.engine, &locked).await?;
        } else {
            debug!("flock unavailable, moving without engine-side lock");
            self.exec.exec_ok(&self.engine, &mv).await?;
        }
        self.secure_permissions().await?;

        let written = self.read().await?;
        validate(&written).map_err(|e| {
            CoreError::ValidationFailed(format!("post-write check failed: {e}"))
        })?;

        let stripped = format!("/tmp/{}.stripped", self.interface);
        self.exec
            .exec_ok(
                &self.engine,
                &format!(
                    "{}-quick strip {} > {}",
                    self.bin,
                    shell_quote(&self.path),
                    shell_quote(&stripped)
                ),
            )
            .await?;
        self.exec
            .exec_ok(
                &self.engine,
                &format!(
                    "{} syncconf {} {}",
                    self.bin,
                    shell_quote(&self.interface),
                    shell_quote(&stripped)
                ),
            )
            .await?;

        info!(bytes = text.len(), peers = peer_keys(&text).len(), "config written and applied");
        Ok(())
    }
}
