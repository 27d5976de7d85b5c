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

//! WireGuard peer lifecycle: create, delete, suspend, resume, render, drift.

use std::collections::HashSet;
use std::sync::Arc;

use peerwarden_types::{
    AddInfo, ClientRecord, EngineKind, PeerProfile, SOURCE_BOT, SkipReason, UserData, now_ctime,
    now_iso,
};
use serde::Serialize;
use serde_json::Map;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::alloc::{first_free_address, used_addresses};
use crate::config::{EndpointSettings, WireguardSettings};
use crate::endpoint::{EngineCommandProbe, Probe, StaticProbe, first_hit, host_chain};
use crate::error::{CoreError, Result};
use crate::exec::EngineExec;
use crate::lock::PathLocks;
use crate::table::{ClientTable, check_name_available};
use crate::wg::{WgDump, WgRuntime};
use crate::wgconf::{
    ConfigWriter, OBFUSCATION_KEYS, ParamSource, PeerBlock, drop_peer_block,
    ensure_interface_params, host_cidr, parse_interface_params, peer_keys, rebuild_peer_section,
    strip_to_interface_only, upsert_peer_block,
};

/// Peer-side configuration, ready to import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub address: String,
    pub dns: Vec<String>,
    pub private_key: String,
    /// Obfuscation values copied from the server interface, in canonical order.
    pub interface_params: Vec<(String, String)>,
    pub server_public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: String,
    pub endpoint: String,
    pub keepalive: u16,
}

impl ClientConfig {
    pub fn render(&self) -> String {
        let mut out = String::from("[Interface]\n");
        out.push_str(&format!("Address = {}\n", self.address));
        if !self.dns.is_empty() {
            out.push_str(&format!("DNS = {}\n", self.dns.join(", ")));
        }
        out.push_str(&format!("PrivateKey = {}\n", self.private_key));
        for (k, v) in &self.interface_params {
            out.push_str(&format!("{k} = {v}\n"));
        }
        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", self.server_public_key));
        if let Some(psk) = &self.preshared_key {
            out.push_str(&format!("PresharedKey = {psk}\n"));
        }
        out.push_str(&format!("AllowedIPs = {}\n", self.allowed_ips));
        out.push_str(&format!("Endpoint = {}\n", self.endpoint));
        out.push_str(&format!("PersistentKeepalive = {}\n", self.keepalive));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRef {
    pub uuid: String,
    pub owner: Option<i64>,
    pub name: String,
    pub client_id: String,
}

impl From<&ClientRecord> for PeerRef {
    fn from(record: &ClientRecord) -> Self {
        Self {
            uuid: record.uuid().to_string(),
            owner: record.owner(),
            name: record.name().to_string(),
            client_id: record.client_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressMismatch {
    pub peer: PeerRef,
    pub recorded: String,
    pub live: String,
}

/// Registry versus running interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Active records the interface does not have.
    pub missing_live: Vec<PeerRef>,
    /// Live peers no record knows about.
    pub unknown_live: Vec<String>,
    pub address_mismatch: Vec<AddressMismatch>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing_live.is_empty() && self.unknown_live.is_empty() && self.address_mismatch.is_empty()
    }
}

pub fn drift_between(records: &[ClientRecord], dump: &WgDump) -> DriftReport {
    let mut report = DriftReport::default();
    let registered: HashSet<&str> = records.iter().map(|r| r.client_id.as_str()).collect();

    for record in records.iter().filter(|r| r.is_active()) {
        let Some(live) = dump.peer(&record.client_id) else {
            if record.is_bot() {
                report.missing_live.push(record.into());
            }
            continue;
        };
        if let Some(ip) = &record.user_data.ip
            && let Ok(recorded) = host_cidr(ip)
            && let Some(address) = live.address()
            && format!("{address}/32") != recorded
        {
            report.address_mismatch.push(AddressMismatch {
                peer: record.into(),
                recorded,
                live: live.allowed_ips.join(", "),
            });
        }
    }
    report.unknown_live = dump
        .peers
        .iter()
        .filter(|p| !registered.contains(p.public_key.as_str()))
        .map(|p| p.public_key.clone())
        .collect();
    report
}

fn peer_block(record: &ClientRecord, keepalive: u16) -> Result<PeerBlock> {
    let ip = record.user_data.ip.as_deref().ok_or_else(|| {
        CoreError::ValidationFailed(format!("record {} has no address", record.uuid()))
    })?;
    PeerBlock::new(
        &record.client_id,
        record.user_data.psk.as_deref(),
        ip,
        Some(keepalive),
    )
}

/// Blocks for every active bot record with an address.
fn managed_blocks(records: &[ClientRecord], keepalive: u16) -> Vec<PeerBlock> {
    records
        .iter()
        .filter(|r| r.is_bot() && r.is_active() && r.user_data.ip.is_some())
        .filter_map(|r| {
            peer_block(r, keepalive)
                .inspect_err(|e| warn!(uuid = %r.uuid(), error = %e, "skipping unrenderable record"))
                .ok()
        })
        .collect()
}

fn refuse_foreign(record: &ClientRecord) -> Result<()> {
    if record.is_bot() {
        Ok(())
    } else {
        warn!(uuid = %record.uuid(), source = %record.add_info.source, "refusing to touch foreign record");
        Err(CoreError::Skipped(SkipReason::Foreign))
    }
}

pub struct WgPeers<E> {
    exec: Arc<E>,
    settings: WireguardSettings,
    endpoint: EndpointSettings,
    table: ClientTable<E>,
    writer: ConfigWriter<E>,
    runtime: WgRuntime<E>,
    ops: Mutex<()>,
}

impl<E: EngineExec + 'static> WgPeers<E> {
    pub fn new(
        exec: Arc<E>,
        locks: PathLocks,
        settings: &WireguardSettings,
        endpoint: &EndpointSettings,
    ) -> Self {
        Self {
            table: ClientTable::new(
                Arc::clone(&exec),
                locks.clone(),
                &settings.engine,
                &settings.clients_table_path,
                EngineKind::Wireguard,
            ),
            writer: ConfigWriter::new(Arc::clone(&exec), locks, settings),
            runtime: WgRuntime::new(Arc::clone(&exec), settings),
            exec,
            settings: settings.clone(),
            endpoint: endpoint.clone(),
            ops: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &ClientTable<E> {
        &self.table
    }

    pub fn runtime(&self) -> &WgRuntime<E> {
        &self.runtime
    }

    async fn with_interface_params(&self, text: &str) -> String {
        let runtime = self.runtime.show_params().await;
        let source = ParamSource {
            runtime: &runtime,
            defaults: &self.settings.obfuscation,
        };
        ensure_interface_params(text, OBFUSCATION_KEYS, &source)
    }

    /// Rebuild the peer section from `records`. `also_known` names keys that
    /// must go even though no record holds them any more.
    fn rebuild(&self, text: &str, records: &[ClientRecord], also_known: &[&str]) -> String {
        let managed = managed_blocks(records, self.settings.keepalive);
        let known: HashSet<String> = records
            .iter()
            .filter(|r| r.is_bot())
            .map(|r| r.client_id.clone())
            .chain(also_known.iter().map(|k| k.to_string()))
            .collect();
        rebuild_peer_section(text, &managed, &known)
    }

    async fn find_bot_record(&self, uuid: &str) -> Result<ClientRecord> {
        let record = self.table.find_by_uuid(uuid).await?;
        refuse_foreign(&record)?;
        Ok(record)
    }

    /// Allocate, generate keys, record, then add the peer to the interface.
    /// The returned record carries the private key.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn create_peer(&self, owner: i64, name: &str, contact: Option<&str>) -> Result<ClientRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::ValidationFailed("profile name must not be empty".into()));
        }
        let _op = self.ops.lock().await;

        let records = self.table.read_all().await?;
        check_name_available(&records, EngineKind::Wireguard, owner, name)?;

        let conf = self.writer.read().await?;
        let subnet = self.runtime.subnet(&conf).await?;
        let dump = self.runtime.dump().await?;
        let address = first_free_address(subnet, &used_addresses(&dump, &records))?;
        let (private_key, public_key) = self.runtime.generate_keypair().await?;
        let psk = self.runtime.generate_psk().await?;

        let record = ClientRecord {
            client_id: public_key.clone(),
            user_data: UserData {
                name: name.to_string(),
                creation_date: now_ctime(),
                private_key: Some(private_key),
                psk: Some(psk),
                ip: Some(address.to_string()),
                flow: None,
                created: Some(now_iso()),
                extra: Map::new(),
            },
            add_info: AddInfo {
                kind: EngineKind::Wireguard,
                uuid: uuid::Uuid::new_v4().to_string(),
                owner_tid: Some(owner),
                email: contact.map(str::to_string),
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
        };

        let stored = record.clone();
        self.table
            .update(move |records| {
                check_name_available(records, EngineKind::Wireguard, owner, &stored.user_data.name)?;
                if records.iter().any(|r| r.client_id == stored.client_id) {
                    return Err(CoreError::ValidationFailed("generated key already registered".into()));
                }
                records.push(stored);
                Ok(())
            })
            .await?;

        let block = peer_block(&record, self.settings.keepalive)?;
        let conf = self.with_interface_params(&conf).await;
        self.writer
            .write_and_apply(&upsert_peer_block(&conf, &block))
            .await?;
        self.runtime.wait_for_peer(&record.client_id).await;

        info!(uuid = %record.uuid(), address = %address, "peer created");
        Ok(record)
    }

    /// Remove the record, then rebuild the interface's peer section from what
    /// remains.
    #[tracing::instrument(skip_all, fields(uuid = %uuid))]
    pub async fn delete_peer(&self, uuid: &str) -> Result<ClientRecord> {
        let _op = self.ops.lock().await;
        self.find_bot_record(uuid).await?;

        let (removed, remaining) = self
            .table
            .update(|records| {
                let idx = records
                    .iter()
                    .position(|r| r.uuid() == uuid)
                    .ok_or_else(|| CoreError::not_found("profile", uuid))?;
                let removed = records.remove(idx);
                Ok((removed, records.clone()))
            })
            .await?;

        let conf = self.writer.read().await?;
        let conf = drop_peer_block(&conf, &removed.client_id);
        let conf = self.rebuild(&conf, &remaining, &[removed.client_id.as_str()]);
        self.writer.write_and_apply(&conf).await?;

        info!(owner = ?removed.owner(), name = %removed.name(), "peer deleted");
        Ok(removed)
    }

    /// Drop the peer from the interface, keeping key, secret and address.
    #[tracing::instrument(skip_all, fields(uuid = %uuid))]
    pub async fn suspend_peer(&self, uuid: &str) -> Result<ClientRecord> {
        let _op = self.ops.lock().await;
        let record = self.find_bot_record(uuid).await?;
        if record.is_suspended() {
            debug!("already suspended");
            return Ok(record);
        }

        let record = self
            .table
            .update(|records| {
                let record = records
                    .iter_mut()
                    .find(|r| r.uuid() == uuid)
                    .ok_or_else(|| CoreError::not_found("profile", uuid))?;
                record.add_info.suspended = true;
                record.add_info.suspended_at = Some(now_iso());
                Ok(record.clone())
            })
            .await?;

        let conf = self.writer.read().await?;
        self.writer
            .write_and_apply(&drop_peer_block(&conf, &record.client_id))
            .await?;
        info!(name = %record.name(), "peer suspended");
        Ok(record)
    }

    /// Put the peer back with the identity it had before suspension.
    #[tracing::instrument(skip_all, fields(uuid = %uuid))]
    pub async fn resume_peer(&self, uuid: &str) -> Result<ClientRecord> {
        let _op = self.ops.lock().await;
        let record = self.find_bot_record(uuid).await?;
        let block = peer_block(&record, self.settings.keepalive)?;

        let record = if record.is_suspended() {
            self.table
                .update(|records| {
                    let record = records
                        .iter_mut()
                        .find(|r| r.uuid() == uuid)
                        .ok_or_else(|| CoreError::not_found("profile", uuid))?;
                    record.add_info.suspended = false;
                    record.add_info.suspended_at = None;
                    Ok(record.clone())
                })
                .await?
        } else {
            record
        };

        let conf = self.writer.read().await?;
        let conf = self.with_interface_params(&conf).await;
        self.writer
            .write_and_apply(&upsert_peer_block(&conf, &block))
            .await?;
        self.runtime.wait_for_peer(&record.client_id).await;
        info!(name = %record.name(), "peer resumed");
        Ok(record)
    }

    async fn dns_servers(&self) -> Vec<String> {
        let mut probes: Vec<Box<dyn Probe>> = Vec::new();
        if let Some(host) = &self.settings.dns_engine {
            probes.push(Box::new(EngineCommandProbe::resolve(
                Arc::clone(&self.exec),
                &self.settings.engine,
                host,
            )));
        }
        probes.push(Box::new(StaticProbe::new("dns-fallback", Some(self.settings.dns_fallback.as_str()))));

        let mut servers: Vec<String> = first_hit(&probes).await.map(|(_, v)| v).into_iter().collect();
        if !self.settings.dns_secondary.trim().is_empty() {
            servers.push(self.settings.dns_secondary.trim().to_string());
        }
        servers
    }

    async fn public_endpoint(&self, conf: &str) -> Result<String> {
        let probes = host_chain(
            self.settings.connect_host.as_deref(),
            Arc::clone(&self.exec),
            &self.settings.engine,
            &self.endpoint,
        );
        let (probe, host) = first_hit(&probes)
            .await
            .ok_or_else(|| CoreError::ValidationFailed("cannot determine public host".into()))?;

        let port = match self.runtime.dump().await.ok().and_then(|d| d.listen_port) {
            Some(port) => Some(port),
            None => self.settings.listen_port.or_else(|| {
                parse_interface_params(conf)
                    .get("ListenPort")
                    .and_then(|p| p.parse().ok())
            }),
        }
        .ok_or_else(|| CoreError::ValidationFailed("cannot determine listen port".into()))?;

        debug!(probe = %probe, host = %host, port, "resolved endpoint");
        Ok(format!("{host}:{port}"))
    }

    /// Importable peer-side configuration for `uuid`.
    #[tracing::instrument(skip_all, fields(uuid = %uuid))]
    pub async fn render_client_config(&self, uuid: &str) -> Result<String> {
        let record = self.table.find_by_uuid(uuid).await?;
        let private_key = record.user_data.private_key.clone().ok_or_else(|| {
            CoreError::ValidationFailed(format!("no private key recorded for {uuid}"))
        })?;
        let address = host_cidr(record.user_data.ip.as_deref().unwrap_or_default())?;

        let conf = self.writer.read().await?;
        let params = parse_interface_params(&conf);
        let interface_params = OBFUSCATION_KEYS
            .iter()
            .filter_map(|k| params.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();

        let config = ClientConfig {
            address,
            dns: self.dns_servers().await,
            private_key,
            interface_params,
            server_public_key: self.runtime.server_public_key().await?,
            preshared_key: record.user_data.psk.clone(),
            allowed_ips: self.settings.client_allowed_ips.clone(),
            endpoint: self.public_endpoint(&conf).await?,
            keepalive: self.settings.keepalive,
        };
        Ok(config.render())
    }

    /// Key-less view of every non-deleted record, optionally for one owner.
    pub async fn list_profiles(&self, owner: Option<i64>) -> Result<Vec<PeerProfile>> {
        let records = self.table.read_all().await?;
        let dump = self
            .runtime
            .dump()
            .await
            .inspect_err(|e| warn!(error = %e, "runtime dump unavailable, using registry addresses"))
            .unwrap_or_default();

        Ok(records
            .iter()
            .filter(|r| !r.is_deleted())
            .filter(|r| owner.is_none_or(|o| r.owner() == Some(o)))
            .map(|r| {
                let live = dump
                    .peer(&r.client_id)
                    .map(|p| p.allowed_ips.join(", "))
                    .filter(|a| !a.is_empty());
                let allowed = live
                    .or_else(|| r.user_data.ip.as_deref().and_then(|ip| host_cidr(ip).ok()))
                    .unwrap_or_default();
                r.profile(allowed)
            })
            .collect())
    }

    pub async fn find_profile(&self, uuid: &str) -> Result<PeerProfile> {
        self.list_profiles(None)
            .await?
            .into_iter()
            .find(|p| p.uuid == uuid)
            .ok_or_else(|| CoreError::not_found("profile", uuid))
    }

    /// Leave only `[Interface]` in the config. The registry is not touched.
    #[tracing::instrument(skip_all)]
    pub async fn clean_all_peers(&self) -> Result<usize> {
        let _op = self.ops.lock().await;
        let conf = self.writer.read().await?;
        let dropped = peer_keys(&conf).len();
        let conf = self
            .with_interface_params(&strip_to_interface_only(&conf))
            .await;
        self.writer.write_and_apply(&conf).await?;
        warn!(dropped, "removed every peer from the interface");
        Ok(dropped)
    }

    pub async fn drift(&self) -> Result<DriftReport> {
        let (records, dump) = futures::try_join!(self.table.read_all(), self.runtime.dump())?;
        let report = drift_between(&records, &dump);
        debug!(
            missing = report.missing_live.len(),
            unknown = report.unknown_live.len(),
            mismatched = report.address_mismatch.len(),
            "drift computed"
        );
        Ok(report)
    }

    /// Rewrite the managed peer section from the registry and apply it.
    /// Returns the number of managed peers written.
    #[tracing::instrument(skip_all)]
    pub async fn resync(&self) -> Result<usize> {
        let _op = self.ops.lock().await;
        let records = self.table.read_all().await?;
        let conf = self.writer.read().await?;
        let conf = self.with_interface_params(&conf).await;
        let conf = self.rebuild(&conf, &records, &[]);
        self.writer.write_and_apply(&conf).await?;

        let managed = managed_blocks(&records, self.settings.keepalive).len();
        info!(managed, "interface resynced from registry");
        Ok(managed)
    }
}
