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

//! Reconciliation reports: classification snapshots and batch summaries.

use serde::{Deserialize, Serialize};

use crate::live::LiveEntry;

/// A field that differs between the registry and the live engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DivergedField {
    /// Client identity.
    #[serde(rename = "uuid")]
    Identity,
    /// Flow.
    Flow,
}

/// One classified `(owner, name)` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Owning user.
    pub owner: i64,
    /// Display name (registry name, or the name parsed from the tag).
    pub name: String,
    /// Identity tag the key was matched on.
    pub tag: String,
    /// Identity recorded in the registry, if any.
    pub identity: Option<String>,
    /// Identity seen live, if any.
    pub live_identity: Option<String>,
    /// Whether a live entry exists for the key.
    pub live: bool,
    /// Differing fields, diverged items only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<DivergedField>,
}

/// Per-class totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    /// Registry entries matched live with no divergence.
    pub active: usize,
    /// Registry entries matched live with differing fields.
    pub diverged: usize,
    /// Registry entries marked suspended.
    pub suspended: usize,
    /// Registry entries missing live.
    pub absent: usize,
    /// Live bot entries unknown to the registry.
    pub extra: usize,
    /// Live entries outside the tag convention.
    pub foreign: usize,
}

/// Where a key landed in a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Present and matching.
    Active,
    /// Present with differing fields.
    Diverged,
    /// Suspended in the registry.
    Suspended,
    /// Only in the registry.
    Absent,
    /// Only in the engine.
    Extra,
    /// Not classified at all.
    Unknown,
}

/// Full classification of one engine at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Totals.
    pub counters: SyncCounters,
    /// Present and matching.
    pub active: Vec<SyncItem>,
    /// Present with differing fields.
    pub diverged: Vec<SyncItem>,
    /// Suspended in the registry.
    pub suspended: Vec<SyncItem>,
    /// Only in the registry.
    pub absent: Vec<SyncItem>,
    /// Only in the engine.
    pub extra: Vec<SyncItem>,
    /// Live entries outside the tag convention.
    pub foreign: Vec<LiveEntry>,
}

impl SyncSnapshot {
    /// Recompute `counters` from the item lists.
    pub fn recount(&mut self) {
        self.counters = SyncCounters {
            active: self.active.len(),
            diverged: self.diverged.len(),
            suspended: self.suspended.len(),
            absent: self.absent.len(),
            extra: self.extra.len(),
            foreign: self.foreign.len(),
        };
    }

    /// Which class `(owner, name)` landed in.
    pub fn status_of(&self, owner: i64, name: &str) -> SyncStatus {
        let hit = |items: &[SyncItem]| items.iter().any(|i| i.owner == owner && i.name == name);
        if hit(&self.active) {
            SyncStatus::Active
        } else if hit(&self.diverged) {
            SyncStatus::Diverged
        } else if hit(&self.suspended) {
            SyncStatus::Suspended
        } else if hit(&self.absent) {
            SyncStatus::Absent
        } else if hit(&self.extra) {
            SyncStatus::Extra
        } else {
            SyncStatus::Unknown
        }
    }
}

/// Why a repair declined an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The key is no longer where classification saw it.
    NotFound,
    /// The client is already live.
    AlreadyPresent,
    /// The registry marks the profile suspended.
    Suspended,
    /// The owner's access has been revoked.
    OwnerRevoked,
    /// The registry has no identity to push.
    NoIdentity,
    /// The live entry does not follow the tag convention.
    Foreign,
    /// The live entry has since been registered.
    Registered,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::AlreadyPresent => "already present",
            Self::Suspended => "suspended",
            Self::OwnerRevoked => "owner revoked",
            Self::NoIdentity => "no identity",
            Self::Foreign => "foreign",
            Self::Registered => "registered",
        };
        f.write_str(s)
    }
}

/// Result of one repair within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ItemOutcome {
    /// Repaired.
    Done,
    /// Declined for a business reason.
    Skipped {
        /// Why.
        reason: SkipReason,
    },
    /// Failed.
    Failed {
        /// Error message.
        error: String,
    },
}

/// One entry of a batch's per-item list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    /// Owning user.
    pub owner: i64,
    /// Display name.
    pub name: String,
    /// What happened.
    pub outcome: ItemOutcome,
}

/// Totals and per-item outcomes of a bulk repair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Items attempted.
    pub total: usize,
    /// Items repaired.
    pub done: usize,
    /// Items declined.
    pub skipped: usize,
    /// Items that failed.
    pub errors: usize,
    /// Per-item outcomes, in processing order.
    pub items: Vec<ItemResult>,
}

impl BatchSummary {
    /// Account for one item.
    pub fn record(&mut self, owner: i64, name: &str, outcome: ItemOutcome) {
        self.total += 1;
        match outcome {
            ItemOutcome::Done => self.done += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
            ItemOutcome::Failed { .. } => self.errors += 1,
        }
        self.items.push(ItemResult {
            owner,
            name: name.to_string(),
            outcome,
        });
    }
}
