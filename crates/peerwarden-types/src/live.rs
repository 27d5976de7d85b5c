//! The tunnel engine's live client list, as seen through its JSON document.

use serde::{Deserialize, Serialize};

/// Whether a live entry follows this system's tag convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveSource {
    /// Tag is `<digits>-<name>`.
    Bot,
    /// Anything else. Observed, never mutated.
    Foreign,
}

/// One client of the tunnel engine's inbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEntry {
    /// Client identity.
    pub id: String,
    /// Flow, if set.
    pub flow: Option<String>,
    /// Raw identity tag (`email` field).
    pub tag: String,
    /// Owner parsed from the tag, bot entries only.
    pub owner: Option<i64>,
    /// Name parsed from the tag, bot entries only.
    pub name: Option<String>,
    /// Provenance.
    pub source: LiveSource,
}

impl LiveEntry {
    /// Build an entry from the raw client fields, parsing the tag.
    pub fn from_client(id: String, flow: Option<String>, tag: String) -> Self {
        let flow = flow.filter(|f| !f.is_empty());
        match parse_tag(&tag) {
            Some((owner, name)) => Self {
                id,
                flow,
                owner: Some(owner),
                name: Some(name.to_string()),
                tag,
                source: LiveSource::Bot,
            },
            None => Self {
                id,
                flow,
                owner: None,
                name: None,
                tag,
                source: LiveSource::Foreign,
            },
        }
    }

    /// Whether the entry follows the bot tag convention.
    pub fn is_bot(&self) -> bool {
        self.source == LiveSource::Bot
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The identity tag stored in a client's `email` field.
pub fn identity_tag(owner: i64, name: &str) -> String {
    format!("{owner}-{}", sanitize_name(name))
}

/// Split a tag into `(owner, name)` when the part before the first `-` is all
/// digits and the rest is non-empty.
pub fn parse_tag(tag: &str) -> Option<(i64, &str)> {
    let (head, rest) = tag.split_once('-')?;
    if head.is_empty() || rest.is_empty() || !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((head.parse().ok()?, rest))
}

/// What a suspend removed from the live document, enough to put it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendSnapshot {
    /// Client identity.
    pub identity: String,
    /// Flow, if one was set.
    pub flow: Option<String>,
    /// Identity tag.
    pub tag: String,
}
