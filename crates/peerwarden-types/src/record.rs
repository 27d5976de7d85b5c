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

//! Registry records, as stored in each engine's `clientsTable`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::EngineKind;

/// Provenance tag for records created by this system.
pub const SOURCE_BOT: &str = "bot";

/// One provisioned peer in an engine's registry.
///
/// Field names follow the on-disk `clientsTable` layout so that other tools
/// reading the same document keep working. Unknown fields are carried in
/// `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Engine identity: public key (WireGuard) or client id (tunnel).
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// Engine-facing attributes.
    #[serde(rename = "userData")]
    pub user_data: UserData,
    /// Registry-facing metadata.
    #[serde(rename = "addInfo")]
    pub add_info: AddInfo,
    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Engine-facing attributes of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    /// Display name.
    #[serde(rename = "clientName")]
    pub name: String,
    /// Creation time in ctime-like format.
    #[serde(rename = "creationDate")]
    pub creation_date: String,
    /// WireGuard private key, kept so the peer config can be re-rendered.
    #[serde(rename = "privateKey", default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// WireGuard pre-shared secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    /// Allocated tunnel address (host only, no prefix).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Tunnel-engine flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Creation time, ISO-8601.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Registry-facing metadata of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddInfo {
    /// Engine this record belongs to.
    #[serde(rename = "type")]
    pub kind: EngineKind,
    /// Permanent identity, survives suspend/resume.
    pub uuid: String,
    /// Owning user, absent on records created elsewhere.
    pub owner_tid: Option<i64>,
    /// Contact tag.
    #[serde(default)]
    pub email: Option<String>,
    /// Creation time, ISO-8601.
    pub created_at: String,
    /// Legacy soft-delete flag. Read, never newly written as `true`.
    #[serde(default)]
    pub deleted: bool,
    /// Legacy soft-delete time.
    #[serde(default)]
    pub deleted_at: Option<String>,
    /// Provenance: [`SOURCE_BOT`] or anything else for foreign records.
    pub source: String,
    /// Free-text notes.
    #[serde(default)]
    pub notes: String,
    /// Engine-side peer removed, identity retained.
    #[serde(default)]
    pub suspended: bool,
    /// When the record was last suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<String>,
    /// When reconciliation last touched the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
    /// Fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Collapse whitespace runs and lowercase, for name-uniqueness checks.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl ClientRecord {
    /// Permanent identity.
    pub fn uuid(&self) -> &str {
        &self.add_info.uuid
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.user_data.name
    }

    /// Owning user, if any.
    pub fn owner(&self) -> Option<i64> {
        self.add_info.owner_tid
    }

    /// Whether this system created the record.
    pub fn is_bot(&self) -> bool {
        self.add_info.source == SOURCE_BOT
    }

    /// Whether the record carries the legacy soft-delete flag.
    pub fn is_deleted(&self) -> bool {
        self.add_info.deleted
    }

    /// Whether the record is suspended.
    pub fn is_suspended(&self) -> bool {
        self.add_info.suspended
    }

    /// Not deleted and not suspended: the engine should have this peer.
    pub fn is_active(&self) -> bool {
        !self.is_deleted() && !self.is_suspended()
    }

    /// Whether this record is owned by `owner` under the normalized `name`.
    pub fn matches(&self, owner: i64, normalized: &str) -> bool {
        self.owner() == Some(owner) && normalize_name(self.name()) == normalized
    }

    /// Key-less view of this record.
    pub fn profile(&self, allowed_ips: String) -> PeerProfile {
        PeerProfile {
            uuid: self.add_info.uuid.clone(),
            client_id: self.client_id.clone(),
            kind: self.add_info.kind,
            name: self.user_data.name.clone(),
            owner: self.add_info.owner_tid,
            contact: self.add_info.email.clone(),
            allowed_ips,
            suspended: self.add_info.suspended,
            source: self.add_info.source.clone(),
            created_at: self.add_info.created_at.clone(),
        }
    }
}

/// What callers get back when listing peers. Never carries key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    /// Permanent identity.
    pub uuid: String,
    /// Engine identity.
    pub client_id: String,
    /// Engine.
    pub kind: EngineKind,
    /// Display name.
    pub name: String,
    /// Owning user.
    pub owner: Option<i64>,
    /// Contact tag.
    pub contact: Option<String>,
    /// Allowed addresses as seen live, or the registry address as `/32`.
    pub allowed_ips: String,
    /// Whether the peer is suspended.
    pub suspended: bool,
    /// Provenance tag.
    pub source: String,
    /// Creation time, ISO-8601.
    pub created_at: String,
}
