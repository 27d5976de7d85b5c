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

//! The per-engine client registry (`clientsTable`).

use std::sync::Arc;

use peerwarden_types::{
    ClientRecord, EngineKind, SOURCE_BOT, identity_tag, normalize_name, now_ctime, now_iso,
};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::exec::{EngineExec, ExecError};
use crate::lock::PathLocks;

/// Provenance given to records that arrive without one and have no owner.
pub const SOURCE_EXTERNAL: &str = "external";

fn is_missing_file(err: &ExecError) -> bool {
    matches!(err, ExecError::Failed { stderr, .. } if stderr.contains("No such file"))
}

fn fill(map: &mut Map<String, Value>, key: &str, default: Value) -> bool {
    if map.contains_key(key) {
        return false;
    }
    map.insert(key.to_string(), default);
    true
}

/// Fill in every field a record is guaranteed to have. Returns `None` for
/// entries that cannot be records at all.
fn normalize_record(
    mut value: Value,
    key_hint: Option<&str>,
    kind: EngineKind,
) -> Option<(Value, bool)> {
    let obj = value.as_object_mut()?;
    let mut changed = false;

    let client_id = match obj.get("clientId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let id = key_hint.filter(|k| !k.is_empty())?.to_string();
            obj.insert("clientId".into(), Value::String(id.clone()));
            changed = true;
            id
        }
    };

    for section in ["userData", "addInfo"] {
        if !obj.get(section).is_some_and(Value::is_object) {
            obj.insert(section.into(), Value::Object(Map::new()));
            changed = true;
        }
    }

    if let Some(user_data) = obj.get_mut("userData").and_then(Value::as_object_mut) {
        let prefix = match kind {
            EngineKind::Wireguard => "AWG",
            EngineKind::Tunnel => "XRAY",
        };
        let short: String = client_id.chars().take(8).collect();
        changed |= fill(user_data, "clientName", json!(format!("{prefix}-{short}")));
        changed |= fill(user_data, "creationDate", json!(now_ctime()));
    }

    if let Some(add_info) = obj.get_mut("addInfo").and_then(Value::as_object_mut) {
        // Owners written as strings by older tooling.
        if let Some(Value::String(s)) = add_info.get("owner_tid") {
            let owner = s.trim().parse::<i64>().map_or(Value::Null, |o| json!(o));
            add_info.insert("owner_tid".into(), owner);
            changed = true;
        }
        let has_owner = add_info.get("owner_tid").is_some_and(Value::is_i64);
        let source = if has_owner { SOURCE_BOT } else { SOURCE_EXTERNAL };

        changed |= fill(add_info, "type", json!(kind.as_str()));
        changed |= fill(add_info, "uuid", json!(client_id));
        changed |= fill(add_info, "owner_tid", Value::Null);
        changed |= fill(add_info, "email", Value::Null);
        changed |= fill(add_info, "created_at", json!(now_iso()));
        changed |= fill(add_info, "source", json!(source));
        changed |= fill(add_info, "notes", json!(""));
    }

    Some((value, changed))
}

/// Accept a keyed map or an array; always produce the array form.
fn normalize_document(raw: Value, kind: EngineKind) -> (Vec<Value>, bool) {
    let (entries, mut changed): (Vec<(Option<String>, Value)>, bool) = match raw {
        Value::Array(items) => (items.into_iter().map(|v| (None, v)).collect(), false),
        Value::Object(map) => (
            map.into_iter()
                .map(|(k, mut v)| {
                    if let Some(obj) = v.as_object_mut() {
                        obj.entry("clientId").or_insert_with(|| Value::String(k.clone()));
                    }
                    (Some(k), v)
                })
                .collect(),
            true,
        ),
        Value::Null => (Vec::new(), false),
        other => {
            warn!(kind = %kind, found = %other, "registry document has unexpected shape");
            (Vec::new(), true)
        }
    };

    let mut out = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match normalize_record(value, key.as_deref(), kind) {
            Some((value, c)) => {
                changed |= c;
                out.push(value);
            }
            None => {
                warn!(kind = %kind, "dropping registry entry without an identity");
                changed = true;
            }
        }
    }
    (out, changed)
}

pub struct ClientTable<E> {
    exec: Arc<E>,
    locks: PathLocks,
    engine: String,
    path: String,
    kind: EngineKind,
}

impl<E: EngineExec> ClientTable<E> {
    pub fn new(exec: Arc<E>, locks: PathLocks, engine: &str, path: &str, kind: EngineKind) -> Self {
        Self {
            exec,
            locks,
            engine: engine.to_string(),
            path: path.to_string(),
            kind,
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn load(&self) -> Result<Vec<ClientRecord>> {
        let text = match self.exec.read_file(&self.engine, &self.path).await {
            Ok(text) => text,
            Err(e) if is_missing_file(&e) => {
                debug!(path = %self.path, "registry file missing, starting empty");
                String::new()
            }
            Err(e) => return Err(e.into()),
        };
        let raw: Value = if text.trim().is_empty() {
            Value::Array(Vec::new())
        } else {
            serde_json::from_str(&text)?
        };

        let (values, changed) = normalize_document(raw, self.kind);
        let records = values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<ClientRecord>, _>>()?;

        if changed {
            info!(kind = %self.kind, count = records.len(), "persisting normalized registry");
            self.store(&records).await?;
        }
        Ok(records)
    }

    async fn store(&self, records: &[ClientRecord]) -> Result<()> {
        let text = serde_json::to_string_pretty(records)?;
        self.exec
            .write_file_atomic(&self.engine, &self.path, &text)
            .await?;
        debug!(kind = %self.kind, count = records.len(), "registry written");
        Ok(())
    }

    /// Every record, normalized. Persists the normalized form if it differs.
    pub async fn read_all(&self) -> Result<Vec<ClientRecord>> {
        let _guard = self.locks.lock(&self.engine, &self.path).await;
        self.load().await
    }

    pub async fn write_all(&self, records: &[ClientRecord]) -> Result<()> {
        let _guard = self.locks.lock(&self.engine, &self.path).await;
        self.store(records).await
    }

    /// Read, modify and write back under the path lock. Nothing is written
    /// when `f` fails.
    pub async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<ClientRecord>) -> Result<T>,
    {
        let _guard = self.locks.lock(&self.engine, &self.path).await;
        let mut records = self.load().await?;
        let out = f(&mut records)?;
        self.store(&records).await?;
        Ok(out)
    }

    /// Insert, or replace the record with the same `uuid`. A different record
    /// already holding the `clientId` is a conflict.
    pub async fn upsert(&self, record: ClientRecord) -> Result<()> {
        self.update(|records| {
            if records
                .iter()
                .any(|r| r.client_id == record.client_id && r.uuid() != record.uuid())
            {
                return Err(CoreError::ValidationFailed(format!(
                    "client id already registered to another record ({})",
                    record.uuid()
                )));
            }
            match records.iter_mut().find(|r| r.uuid() == record.uuid()) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_by_uuid(&self, uuid: &str) -> Result<ClientRecord> {
        self.update(|records| {
            let idx = records
                .iter()
                .position(|r| r.uuid() == uuid)
                .ok_or_else(|| CoreError::not_found("profile", uuid))?;
            Ok(records.remove(idx))
        })
        .await
    }

    pub async fn find_by_uuid(&self, uuid: &str) -> Result<ClientRecord> {
        self.read_all()
            .await?
            .into_iter()
            .find(|r| r.uuid() == uuid && !r.is_deleted())
            .ok_or_else(|| CoreError::not_found("profile", uuid))
    }

    /// The live (non-deleted) record of `owner` named `name`, compared normalized.
    pub async fn find_by_name(&self, owner: i64, name: &str) -> Result<Option<ClientRecord>> {
        let wanted = normalize_name(name);
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|r| !r.is_deleted() && r.matches(owner, &wanted)))
    }
}

/// Reject a new `(owner, name)` that collides with an existing non-deleted
/// record. For the tunnel engine two names that map to the same identity tag
/// collide as well.
pub fn check_name_available(
    records: &[ClientRecord],
    kind: EngineKind,
    owner: i64,
    name: &str,
) -> Result<()> {
    let wanted = normalize_name(name);
    let tag = identity_tag(owner, name);
    let conflict = records.iter().filter(|r| !r.is_deleted()).any(|r| {
        r.matches(owner, &wanted)
            || (kind == EngineKind::Tunnel
                && r.owner() == Some(owner)
                && identity_tag(owner, r.name()) == tag)
    });
    if conflict {
        warn!(owner, name, "name already in use");
        return Err(CoreError::NameConflict {
            owner,
            name: name.to_string(),
        });
    }
    Ok(())
}
