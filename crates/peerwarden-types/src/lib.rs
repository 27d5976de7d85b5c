//! peerwarden-types: Shared data model for the peerwarden ecosystem.
//!
//! This crate contains the registry record shapes, the live tunnel-engine
//! view, and the reconciliation report types shared between the daemon
//! library, its CLI, and anything rendering results to end users.

#![warn(missing_docs)]

pub mod live;
pub mod record;
pub mod sync;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use live::{LiveEntry, LiveSource, SuspendSnapshot, identity_tag, parse_tag};
pub use record::{AddInfo, ClientRecord, PeerProfile, SOURCE_BOT, UserData, normalize_name};
pub use sync::{
    BatchSummary, DivergedField, ItemOutcome, ItemResult, SkipReason, SyncCounters, SyncItem,
    SyncSnapshot, SyncStatus,
};

/// Which tunnel engine a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    /// The WireGuard-family engine.
    #[serde(rename = "awg")]
    Wireguard,
    /// The proxy/tunnel engine (VLESS inbound).
    #[serde(rename = "xray")]
    Tunnel,
}

impl EngineKind {
    /// The tag stored in `addInfo.type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wireguard => "awg",
            Self::Tunnel => "xray",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current UTC time as ISO-8601 without sub-seconds (`2025-11-10T08:35:32Z`).
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Current UTC time in the registry's display format (`Mon Nov 10 08:35:32 2025`).
pub fn now_ctime() -> String {
    Utc::now().format("%a %b %d %H:%M:%S %Y").to_string()
}
