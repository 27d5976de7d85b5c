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

//! Tunnel engine client manager. Edits the VLESS inbound's client list in the
//! engine's JSON document and keeps the engine's registry alongside it.

use std::sync::Arc;

use chrono::Utc;
use peerwarden_types::{
    AddInfo, ClientRecord, EngineKind, LiveEntry, SOURCE_BOT, SkipReason, SuspendSnapshot,
    UserData, identity_tag, normalize_name, now_ctime, now_iso,
};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::{EndpointSettings, TunnelSettings};
use crate::endpoint::{first_hit, host_chain};
use crate::error::{CoreError, Result};
use crate::exec::{EngineExec, shell_quote};
use crate::lock::PathLocks;
use crate::table::{ClientTable, check_name_available};

// -- Document helpers --

fn inbound(doc: &Value, index: usize) -> Result<&Value> {
    let inbound = doc
        .get("inbounds")
        .and_then(Value::as_array)
        .and_then(|a| a.get(index))
        .ok_or_else(|| CoreError::ValidationFailed(format!("no inbound at index {index}")))?;
    match inbound.get("protocol").and_then(Value::as_str) {
        Some("vless") => Ok(inbound),
        other => Err(CoreError::ValidationFailed(format!(
            "inbound {index} has protocol {other:?}, expected \"vless\""
        ))),
    }
}

fn inbound_mut(doc: &mut Value, index: usize) -> Result<&mut Value> {
    inbound(doc, index)?;
    doc.get_mut("inbounds")
        .and_then(|v| v.get_mut(index))
        .ok_or_else(|| CoreError::ValidationFailed(format!("no inbound at index {index}")))
}

fn clients_mut(inbound: &mut Value) -> Result<&mut Vec<Value>> {
    let obj = inbound
        .as_object_mut()
        .ok_or_else(|| CoreError::ValidationFailed("inbound is not an object".into()))?;
    let settings = obj
        .entry("settings")
        .or_insert_with(|| Value::Object(Map::new()));
    let settings = settings
        .as_object_mut()
        .ok_or_else(|| CoreError::ValidationFailed("inbound settings is not an object".into()))?;
    settings
        .entry("clients")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| CoreError::ValidationFailed("inbound clients is not an array".into()))
}

fn client_str(client: &Value, key: &str) -> Option<String> {
    client
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn live_entries(inbound: &Value) -> Vec<LiveEntry> {
    inbound
        .pointer("/settings/clients")
        .and_then(Value::as_array)
        .map(|clients| {
            clients
                .iter()
                .map(|c| {
                    LiveEntry::from_client(
                        client_str(c, "id").unwrap_or_default(),
                        client_str(c, "flow"),
                        client_str(c, "email").unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn tag_of(client: &Value) -> &str {
    client.get("email").and_then(Value::as_str).unwrap_or_default()
}

fn client_entry(id: &str, flow: &str, tag: &str) -> Value {
    json!({"id": id, "flow": flow, "email": tag})
}

/// Connection parameters of one VLESS-REALITY client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessLink {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub sni: String,
    pub public_key: String,
    pub short_id: String,
    pub flow: String,
}

impl VlessLink {
    pub fn uri(&self) -> String {
        format!(
            "vless://{}@{}:{}?encryption=none&security=reality&sni={}&fp=chrome&pbk={}&sid={}&type=tcp&flow={}#{}",
            self.id,
            self.host,
            self.port,
            self.sni,
            self.public_key,
            self.short_id,
            self.flow,
            urlencoding::encode(&self.host),
        )
    }

    /// Client-side config with a local SOCKS inbound and this link as the
    /// only outbound.
    pub fn client_config(&self) -> Value {
        json!({
            "inbounds": [
                {"listen": "127.0.0.1", "port": 10808, "protocol": "socks", "settings": {"udp": true}}
            ],
            "log": {"loglevel": "error"},
            "outbounds": [{
                "protocol": "vless",
                "settings": {
                    "vnext": [{
                        "address": self.host,
                        "port": self.port,
                        "users": [{"id": self.id, "flow": self.flow, "encryption": "none"}]
                    }]
                },
                "streamSettings": {
                    "network": "tcp",
                    "security": "reality",
                    "realitySettings": {
                        "fingerprint": "chrome",
                        "serverName": self.sni,
                        "publicKey": self.public_key,
                        "shortId": self.short_id,
                        "spiderX": ""
                    }
                }
            }]
        })
    }
}

fn parse_x25519_public(out: &str) -> Option<String> {
    out.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        let v = v.trim();
        (k.trim().eq_ignore_ascii_case("public key") && !v.is_empty()).then(|| v.to_string())
    })
}

fn tunnel_record(owner: i64, name: &str, id: &str, flow: &str) -> ClientRecord {
    ClientRecord {
        client_id: id.to_string(),
        user_data: UserData {
            name: name.to_string(),
            creation_date: now_ctime(),
            private_key: None,
            psk: None,
            ip: None,
            flow: Some(flow.to_string()),
            created: None,
            extra: Map::new(),
        },
        add_info: AddInfo {
            kind: EngineKind::Tunnel,
            uuid: id.to_string(),
            owner_tid: Some(owner),
            email: Some(identity_tag(owner, name)),
            created_at: now_iso(),
            deleted: false,
            deleted_at: None,
            source: SOURCE_BOT.to_string(),
            notes: String::new(),
            suspended: false,
            suspended_at: None,
            last_sync_at: None,
            extra: Map::new(),
        },
        extra: Map::new(),
    }
}

pub struct TunnelClients<E> {
    exec: Arc<E>,
    locks: PathLocks,
    settings: TunnelSettings,
    endpoint: EndpointSettings,
    table: ClientTable<E>,
}

impl<E: EngineExec + 'static> TunnelClients<E> {
    pub fn new(
        exec: Arc<E>,
        locks: PathLocks,
        settings: &TunnelSettings,
        endpoint: &EndpointSettings,
    ) -> Self {
        Self {
            table: ClientTable::new(
                Arc::clone(&exec),
                locks.clone(),
                &settings.engine,
                &settings.clients_table_path,
                EngineKind::Tunnel,
            ),
            exec,
            locks,
            settings: settings.clone(),
            endpoint: endpoint.clone(),
        }
    }

    pub fn table(&self) -> &ClientTable<E> {
        &self.table
    }

    async fn load(&self) -> Result<Value> {
        let text = self
            .exec
            .read_file(&self.settings.engine, &self.settings.config_path)
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Back up, write, restart. Backup failures only warn.
    async fn save(&self, doc: &Value) -> Result<()> {
        let path = shell_quote(&self.settings.config_path);
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let backup = format!("if [ -f {path} ]; then cp -f {path} {path}.bak-{stamp}; fi");
        if let Err(e) = self.exec.exec_ok(&self.settings.engine, &backup).await {
            warn!(error = %e, "config backup failed");
        }
        let rotate = format!(
            "ls -1 {path}.bak-* 2>/dev/null | sort -r | awk 'NR>{}' | xargs -r rm -f",
            self.settings.backup_keep
        );
        if let Err(e) = self.exec.exec_ok(&self.settings.engine, &rotate).await {
            warn!(error = %e, "backup rotation failed");
        }

        let text = serde_json::to_string_pretty(doc)?;
        self.exec
            .write_file_atomic(&self.settings.engine, &self.settings.config_path, &text)
            .await?;
        self.exec.restart(&self.settings.engine).await?;
        info!(engine = %self.settings.engine, "tunnel config written, engine restarted");
        Ok(())
    }

    /// Run `f` over the inbound's client list under the path lock. `f` gets the
    /// flow new clients should use and reports whether it changed anything;
    /// only then is the document written.
    async fn modify<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Value>, &str) -> Result<(T, bool)>,
    {
        let _guard = self
            .locks
            .lock(&self.settings.engine, &self.settings.config_path)
            .await;
        let mut doc = self.load().await?;
        let (out, changed) = {
            let inbound = inbound_mut(&mut doc, self.settings.inbound_index)?;
            let flow = live_entries(inbound)
                .into_iter()
                .find_map(|e| e.flow)
                .unwrap_or_else(|| self.settings.default_flow.clone());
            f(clients_mut(inbound)?, &flow)?
        };
        if changed {
            self.save(&doc).await?;
        }
        Ok(out)
    }

    // -- Live view --

    pub async fn list_all(&self) -> Result<Vec<LiveEntry>> {
        let doc = self.load().await?;
        Ok(live_entries(inbound(&doc, self.settings.inbound_index)?))
    }

    pub async fn find_live(&self, owner: i64, name: &str) -> Result<Option<LiveEntry>> {
        let tag = identity_tag(owner, name);
        Ok(self.list_all().await?.into_iter().find(|e| e.tag == tag))
    }

    /// Insert the client with a known identity unless its tag is already live.
    /// Returns whether anything was written.
    pub async fn restore_client(&self, owner: i64, name: &str, id: &str, flow: Option<&str>) -> Result<bool> {
        let tag = identity_tag(owner, name);
        self.modify(|clients, default_flow| {
            if clients.iter().any(|c| tag_of(c) == tag) {
                return Ok((false, false));
            }
            clients.push(client_entry(id, flow.unwrap_or(default_flow), &tag));
            Ok((true, true))
        })
        .await
    }

    /// Make the live client for `(owner, name)` carry exactly `id` and `flow`,
    /// inserting it if missing. Returns whether anything was written.
    pub async fn ensure_client_identity(&self, owner: i64, name: &str, id: &str, flow: Option<&str>) -> Result<bool> {
        let tag = identity_tag(owner, name);
        self.modify(|clients, default_flow| {
            let flow = flow.unwrap_or(default_flow);
            match clients.iter_mut().find(|c| tag_of(c) == tag) {
                Some(client) => {
                    let same = client_str(client, "id").as_deref() == Some(id)
                        && client_str(client, "flow").as_deref() == Some(flow);
                    if !same {
                        *client = client_entry(id, flow, &tag);
                    }
                    Ok((!same, !same))
                }
                None => {
                    clients.push(client_entry(id, flow, &tag));
                    Ok((true, true))
                }
            }
        })
        .await
    }

    /// Drop the live bot client for `(owner, name)`. Returns what was removed.
    pub async fn remove_live(&self, owner: i64, name: &str) -> Result<Option<SuspendSnapshot>> {
        let tag = identity_tag(owner, name);
        self.modify(|clients, _| {
            let Some(idx) = clients.iter().position(|c| tag_of(c) == tag) else {
                return Ok((None, false));
            };
            let removed = clients.remove(idx);
            let snapshot = SuspendSnapshot {
                identity: client_str(&removed, "id").unwrap_or_default(),
                flow: client_str(&removed, "flow").filter(|f| !f.is_empty()),
                tag: tag.clone(),
            };
            Ok((Some(snapshot), true))
        })
        .await
    }

    // -- Lifecycle --

    async fn registry_record(&self, owner: i64, name: &str) -> Result<Option<ClientRecord>> {
        let record = self.table.find_by_name(owner, name).await?;
        if let Some(record) = &record
            && !record.is_bot()
        {
            return Err(CoreError::Skipped(SkipReason::Foreign));
        }
        Ok(record)
    }

    /// New client with a fresh identity, live and in the registry.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn add_client(&self, owner: i64, name: &str) -> Result<ClientRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::ValidationFailed("profile name must not be empty".into()));
        }
        let records = self.table.read_all().await?;
        check_name_available(&records, EngineKind::Tunnel, owner, name)?;

        let tag = identity_tag(owner, name);
        let id = uuid::Uuid::new_v4().to_string();
        let flow = self
            .modify(|clients, default_flow| {
                if clients.iter().any(|c| tag_of(c) == tag) {
                    return Err(CoreError::AlreadyPresent(tag.clone()));
                }
                clients.push(client_entry(&id, default_flow, &tag));
                Ok((default_flow.to_string(), true))
            })
            .await?;

        let record = tunnel_record(owner, name, &id, &flow);
        self.table.upsert(record.clone()).await?;
        info!(tag = %tag, "tunnel client added");
        Ok(record)
    }

    /// Remove the client live and from the registry. Returns whether either
    /// side had it.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn remove_client_by_name(&self, owner: i64, name: &str) -> Result<bool> {
        let record = self.registry_record(owner, name).await?;
        let live_name = record.as_ref().map_or(name, |r| r.name());
        let live = self.remove_live(owner, live_name).await?;
        if let Some(record) = &record {
            self.table.remove_by_uuid(record.uuid()).await?;
        }
        let removed = live.is_some() || record.is_some();
        info!(removed, "tunnel client removed");
        Ok(removed)
    }

    /// Take the client offline, keeping its identity in the registry.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn suspend_client_by_name(&self, owner: i64, name: &str) -> Result<Option<SuspendSnapshot>> {
        let record = self.registry_record(owner, name).await?;
        let live_name = record.as_ref().map_or(name, |r| r.name());
        let snapshot = self.remove_live(owner, live_name).await?;

        if let Some(record) = record {
            let snap = snapshot.clone();
            self.table
                .update(|records| {
                    let r = records
                        .iter_mut()
                        .find(|r| r.uuid() == record.uuid())
                        .ok_or_else(|| CoreError::not_found("profile", record.uuid()))?;
                    r.add_info.suspended = true;
                    r.add_info.suspended_at = Some(now_iso());
                    if let Some(snap) = snap {
                        r.client_id = snap.identity;
                        if snap.flow.is_some() {
                            r.user_data.flow = snap.flow;
                        }
                    }
                    Ok(())
                })
                .await?;
        }
        info!(was_live = snapshot.is_some(), "tunnel client suspended");
        Ok(snapshot)
    }

    /// Bring a suspended client back with its recorded identity.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn resume_client_by_name(&self, owner: i64, name: &str) -> Result<ClientRecord> {
        let record = self
            .registry_record(owner, name)
            .await?
            .ok_or_else(|| CoreError::not_found("profile", identity_tag(owner, name)))?;
        if record.client_id.is_empty() {
            return Err(CoreError::Skipped(SkipReason::NoIdentity));
        }

        self.restore_client(owner, record.name(), &record.client_id, record.user_data.flow.as_deref())
            .await?;
        let record = self
            .table
            .update(|records| {
                let r = records
                    .iter_mut()
                    .find(|r| r.uuid() == record.uuid())
                    .ok_or_else(|| CoreError::not_found("profile", record.uuid()))?;
                r.add_info.suspended = false;
                r.add_info.suspended_at = None;
                Ok(r.clone())
            })
            .await?;
        info!("tunnel client resumed");
        Ok(record)
    }

    /// Registry records of this engine, optionally for one owner.
    pub async fn list_records(&self, owner: Option<i64>) -> Result<Vec<ClientRecord>> {
        Ok(self
            .table
            .read_all()
            .await?
            .into_iter()
            .filter(|r| !r.is_deleted())
            .filter(|r| owner.is_none_or(|o| r.owner() == Some(o)))
            .collect())
    }

    async fn reality_public_key(&self, reality: Option<&Value>) -> String {
        let field = |key: &str| {
            reality
                .and_then(|r| r.get(key))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(key) = field("publicKey") {
            return key;
        }
        let Some(private) = field("privateKey") else {
            warn!("inbound has no reality keys");
            return String::new();
        };
        let command = format!("{} x25519 -i {}", self.settings.bin, shell_quote(&private));
        match self.exec.exec_ok(&self.settings.engine, &command).await {
            Ok(out) => parse_x25519_public(&out).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "could not derive reality public key");
                String::new()
            }
        }
    }

    /// Connection parameters for `(owner, name)`'s live client.
    pub async fn share_link(&self, owner: i64, name: &str) -> Result<VlessLink> {
        let doc = self.load().await?;
        let inbound = inbound(&doc, self.settings.inbound_index)?;
        let tag = identity_tag(owner, name);
        let entry = live_entries(inbound)
            .into_iter()
            .find(|e| e.tag == tag)
            .ok_or_else(|| CoreError::not_found("tunnel client", tag.clone()))?;

        let reality = inbound.pointer("/streamSettings/realitySettings");
        let first = |key: &str| {
            reality
                .and_then(|r| r.get(key))
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let probes = host_chain(
            self.settings.connect_host.as_deref(),
            Arc::clone(&self.exec),
            &self.settings.engine,
            &self.endpoint,
        );
        let (probe, host) = first_hit(&probes)
            .await
            .ok_or_else(|| CoreError::ValidationFailed("cannot determine public host".into()))?;
        debug!(probe = %probe, host = %host, "resolved tunnel host");

        Ok(VlessLink {
            id: entry.id,
            host,
            port: inbound
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(self.settings.default_port),
            sni: first("serverNames").unwrap_or_else(|| self.settings.default_sni.clone()),
            public_key: self.reality_public_key(reality).await,
            short_id: first("shortIds").unwrap_or_default(),
            flow: entry.flow.unwrap_or_else(|| self.settings.default_flow.clone()),
        })
    }

    /// Whether a registry name is taken, for callers validating input early.
    pub async fn name_in_use(&self, owner: i64, name: &str) -> Result<bool> {
        let wanted = normalize_name(name);
        Ok(self
            .table
            .read_all()
            .await?
            .iter()
            .any(|r| !r.is_deleted() && r.matches(owner, &wanted)))
    }
}
