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

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use peerwarden_types::{
    BatchSummary, ClientRecord, DivergedField, EngineKind, ItemOutcome, LiveEntry, SkipReason,
    SyncItem, SyncSnapshot, identity_tag, normalize_name, now_iso,
};
use tracing::{debug, error, info};

use crate::error::{CoreError, Result};
use crate::exec::EngineExec;
use crate::owners::OwnerStore;
use crate::tunnel::TunnelClients;

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn present(s: &str) -> Option<&str> {
    non_empty(Some(s))
}

/// Registry records that take part in classification.
fn classified(records: &[ClientRecord]) -> impl Iterator<Item = (&ClientRecord, i64, String)> {
    records
        .iter()
        .filter(|r| r.add_info.kind == EngineKind::Tunnel && !r.is_deleted() && r.is_bot())
        .filter_map(|r| r.owner().map(|o| (r, o, identity_tag(o, r.name()))))
}

/// Partition registry and live entries. Pure; both inputs are snapshots.
pub fn classify_snapshot(records: &[ClientRecord], live: &[LiveEntry]) -> SyncSnapshot {
    let live_by_tag: HashMap<&str, &LiveEntry> = live
        .iter()
        .filter(|e| e.is_bot())
        .map(|e| (e.tag.as_str(), e))
        .collect();

    // Every owned record claims its tag, even ones we do not classify, so a
    // live client backed by any record is never reported as extra.
    let registry_tags: HashSet<String> = records
        .iter()
        .filter(|r| !r.is_deleted())
        .filter_map(|r| r.owner().map(|o| identity_tag(o, r.name())))
        .collect();

    let mut snapshot = SyncSnapshot::default();
    for (record, owner, tag) in classified(records) {
        let found = live_by_tag.get(tag.as_str()).copied();
        let mut item = SyncItem {
            owner,
            name: record.name().to_string(),
            tag,
            identity: present(&record.client_id).map(str::to_string),
            live_identity: found.and_then(|e| present(&e.id)).map(str::to_string),
            live: found.is_some(),
            diffs: Vec::new(),
        };

        if record.is_suspended() {
            snapshot.suspended.push(item);
            continue;
        }
        let Some(entry) = found else {
            snapshot.absent.push(item);
            continue;
        };

        if let (Some(ours), Some(theirs)) = (item.identity.as_deref(), item.live_identity.as_deref())
            && ours != theirs
        {
            item.diffs.push(DivergedField::Identity);
        }
        if let (Some(ours), Some(theirs)) = (
            non_empty(record.user_data.flow.as_deref()),
            non_empty(entry.flow.as_deref()),
        ) && ours != theirs
        {
            item.diffs.push(DivergedField::Flow);
        }

        if item.diffs.is_empty() {
            snapshot.active.push(item);
        } else {
            snapshot.diverged.push(item);
        }
    }

    for entry in live {
        if !entry.is_bot() {
            snapshot.foreign.push(entry.clone());
            continue;
        }
        if registry_tags.contains(&entry.tag) {
            continue;
        }
        if let (Some(owner), Some(name)) = (entry.owner, &entry.name) {
            snapshot.extra.push(SyncItem {
                owner,
                name: name.clone(),
                tag: entry.tag.clone(),
                identity: None,
                live_identity: present(&entry.id).map(str::to_string),
                live: true,
                diffs: Vec::new(),
            });
        }
    }

    snapshot.recount();
    snapshot
}

/// The non-deleted record for `(owner, name)`: normalized name first, then
/// identity tag.
fn record_for(records: &[ClientRecord], owner: i64, name: &str) -> Option<ClientRecord> {
    let wanted = normalize_name(name);
    let tag = identity_tag(owner, name);
    let live = || records.iter().filter(|r| !r.is_deleted());
    live()
        .find(|r| r.matches(owner, &wanted))
        .or_else(|| live().find(|r| r.owner() == Some(owner) && identity_tag(owner, r.name()) == tag))
        .cloned()
}

/// How a single repair result is accounted for in a batch.
pub fn outcome_of(result: &Result<()>) -> ItemOutcome {
    match result {
        Ok(()) => ItemOutcome::Done,
        Err(e) => match e.skip_reason() {
            Some(reason) => ItemOutcome::Skipped { reason },
            None => ItemOutcome::Failed {
                error: e.to_string(),
            },
        },
    }
}

pub struct Reconciler<E> {
    tunnel: Arc<TunnelClients<E>>,
    owners: Arc<OwnerStore>,
}

impl<E: EngineExec + 'static> Reconciler<E> {
    pub fn new(tunnel: Arc<TunnelClients<E>>, owners: Arc<OwnerStore>) -> Self {
        Self { tunnel, owners }
    }

    #[tracing::instrument(skip_all)]
    pub async fn classify(&self) -> Result<SyncSnapshot> {
        let (records, live) =
            futures::try_join!(self.tunnel.table().read_all(), self.tunnel.list_all())?;
        let snapshot = classify_snapshot(&records, &live);
        let c = snapshot.counters;
        info!(
            active = c.active,
            diverged = c.diverged,
            suspended = c.suspended,
            absent = c.absent,
            extra = c.extra,
            foreign = c.foreign,
            "classified tunnel clients"
        );
        Ok(snapshot)
    }

    async fn bot_record(&self, owner: i64, name: &str) -> Result<ClientRecord> {
        let records = self.tunnel.table().read_all().await?;
        let record = record_for(&records, owner, name)
            .ok_or_else(|| CoreError::not_found("profile", identity_tag(owner, name)))?;
        if !record.is_bot() {
            return Err(CoreError::Skipped(SkipReason::Foreign));
        }
        Ok(record)
    }

    async fn require_allowed(&self, owner: i64) -> Result<()> {
        if self.owners.is_allowed(owner).await? {
            Ok(())
        } else {
            Err(CoreError::Skipped(SkipReason::OwnerRevoked))
        }
    }

    async fn mark_synced(&self, uuid: &str, live: Option<&LiveEntry>) -> Result<()> {
        self.tunnel
            .table()
            .update(|records| {
                if let Some(live) = live
                    && records
                        .iter()
                        .any(|r| r.client_id == live.id && r.uuid() != uuid)
                {
                    return Err(CoreError::ValidationFailed(format!(
                        "identity {} belongs to another record",
                        live.id
                    )));
                }
                let record = records
                    .iter_mut()
                    .find(|r| r.uuid() == uuid)
                    .ok_or_else(|| CoreError::not_found("profile", uuid))?;
                if let Some(live) = live {
                    record.client_id = live.id.clone();
                    if live.flow.is_some() {
                        record.user_data.flow = live.flow.clone();
                    }
                }
                record.add_info.last_sync_at = Some(now_iso());
                Ok(())
            })
            .await
    }

    /// Put a registry-only client back into the engine, with its recorded
    /// identity when it has one. Owner access is not consulted.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn repair_absent(&self, owner: i64, name: &str) -> Result<()> {
        let record = self.bot_record(owner, name).await?;
        let tag = identity_tag(owner, name);
        if record.is_suspended() {
            return Err(CoreError::Suspended(tag));
        }
        if self.tunnel.find_live(owner, record.name()).await?.is_some() {
            return Err(CoreError::AlreadyPresent(tag));
        }

        let id = present(&record.client_id)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.tunnel
            .restore_client(owner, record.name(), &id, record.user_data.flow.as_deref())
            .await?;
        let live = self.tunnel.find_live(owner, record.name()).await?;
        self.mark_synced(record.uuid(), live.as_ref()).await?;
        info!(identity = %id, "absent client restored");
        Ok(())
    }

    /// Remove an engine-only bot client, after confirming it is still there
    /// and still unregistered.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn repair_extra(&self, owner: i64, name: &str) -> Result<()> {
        let tag = identity_tag(owner, name);
        let entry = self
            .tunnel
            .find_live(owner, name)
            .await?
            .ok_or_else(|| CoreError::not_found("tunnel client", tag.clone()))?;
        if !entry.is_bot() {
            return Err(CoreError::Skipped(SkipReason::Foreign));
        }
        let records = self.tunnel.table().read_all().await?;
        if record_for(&records, owner, name).is_some() {
            return Err(CoreError::Skipped(SkipReason::Registered));
        }
        if self.tunnel.remove_live(owner, name).await?.is_none() {
            return Err(CoreError::not_found("tunnel client", tag));
        }
        info!(identity = %entry.id, "extra client removed");
        Ok(())
    }

    /// Copy the live identity and flow into the registry. Allowed for
    /// suspended profiles and revoked owners.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn sync_registry_from_engine(&self, owner: i64, name: &str) -> Result<()> {
        let record = self.bot_record(owner, name).await?;
        let live = self
            .tunnel
            .find_live(owner, record.name())
            .await?
            .ok_or_else(|| CoreError::not_found("tunnel client", identity_tag(owner, name)))?;
        self.mark_synced(record.uuid(), Some(&live)).await?;
        info!(identity = %live.id, "registry updated from engine");
        Ok(())
    }

    /// Push the registry's identity and flow into the engine.
    #[tracing::instrument(skip_all, fields(owner = owner, name = %name))]
    pub async fn rebuild_engine_from_registry(&self, owner: i64, name: &str) -> Result<()> {
        let record = self.bot_record(owner, name).await?;
        if record.is_suspended() {
            return Err(CoreError::Skipped(SkipReason::Suspended));
        }
        self.require_allowed(owner).await?;
        let Some(id) = present(&record.client_id) else {
            return Err(CoreError::Skipped(SkipReason::NoIdentity));
        };

        let changed = self
            .tunnel
            .ensure_client_identity(owner, record.name(), id, non_empty(record.user_data.flow.as_deref()))
            .await?;
        self.mark_synced(record.uuid(), None).await?;
        info!(identity = %id, changed, "engine updated from registry");
        Ok(())
    }

    async fn batch<'a, F, Fut>(&'a self, op: &'static str, items: &[SyncItem], f: F) -> BatchSummary
    where
        F: Fn(i64, String) -> Fut,
        Fut: Future<Output = Result<()>> + 'a,
    {
        let mut summary = BatchSummary::default();
        for item in items {
            let result = f(item.owner, item.name.clone()).await;
            let outcome = outcome_of(&result);
            match &outcome {
                ItemOutcome::Done => debug!(op, owner = item.owner, name = %item.name, "item repaired"),
                ItemOutcome::Skipped { reason } => {
                    info!(op, owner = item.owner, name = %item.name, reason = %reason, "item skipped")
                }
                ItemOutcome::Failed { error } => {
                    error!(op, owner = item.owner, name = %item.name, error = %error, "item failed, continuing")
                }
            }
            summary.record(item.owner, &item.name, outcome);
        }
        info!(
            op,
            total = summary.total,
            done = summary.done,
            skipped = summary.skipped,
            errors = summary.errors,
            "batch complete"
        );
        summary
    }

    pub async fn repair_all_absent(&self) -> Result<BatchSummary> {
        let snapshot = self.classify().await?;
        Ok(self
            .batch("repair_absent", &snapshot.absent, |owner, name| async move {
                self.repair_absent(owner, &name).await
            })
            .await)
    }

    pub async fn repair_all_extra(&self) -> Result<BatchSummary> {
        let snapshot = self.classify().await?;
        Ok(self
            .batch("repair_extra", &snapshot.extra, |owner, name| async move {
                self.repair_extra(owner, &name).await
            })
            .await)
    }

    pub async fn sync_all_from_engine(&self) -> Result<BatchSummary> {
        let snapshot = self.classify().await?;
        Ok(self
            .batch("sync_from_engine", &snapshot.diverged, |owner, name| async move {
                self.sync_registry_from_engine(owner, &name).await
            })
            .await)
    }

    pub async fn rebuild_all_from_registry(&self) -> Result<BatchSummary> {
        let snapshot = self.classify().await?;
        Ok(self
            .batch("rebuild_from_registry", &snapshot.diverged, |owner, name| async move {
                self.rebuild_engine_from_registry(owner, &name).await
            })
            .await)
    }
}
