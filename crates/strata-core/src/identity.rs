//! Identity resolver
//!
//! Maps `(tenant, entity kind, natural key)` to a stable, fixed-width
//! identity key. The mapping is a pure function: the same inputs always
//! produce the same key, the same natural key under two tenants produces
//! two different keys, and the entity kind acts as a domain separator so a
//! key is never shared between kinds.
//!
//! Link keys and satellite change fingerprints are derived the same way so
//! the whole key scheme can be tested without a storage engine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result, TenantId};

const SEPARATOR: u8 = 0x1f;

/// Kinds of business-layer entities (hubs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Visitor,
    Page,
    Event,
    BusinessItem,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Session,
        EntityKind::Visitor,
        EntityKind::Page,
        EntityKind::Event,
        EntityKind::BusinessItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Session => "session",
            EntityKind::Visitor => "visitor",
            EntityKind::Page => "page",
            EntityKind::Event => "event",
            EntityKind::BusinessItem => "business_item",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Internal(format!("Unknown entity kind: {}", s)))
    }
}

/// Kinds of relationships (links) between hubs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    SessionVisitor,
    EventSession,
    EventPage,
    SessionPage,
    EventBusinessItem,
    VisitorBusinessItem,
}

impl LinkKind {
    pub const ALL: [LinkKind; 6] = [
        LinkKind::SessionVisitor,
        LinkKind::EventSession,
        LinkKind::EventPage,
        LinkKind::SessionPage,
        LinkKind::EventBusinessItem,
        LinkKind::VisitorBusinessItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::SessionVisitor => "session_visitor",
            LinkKind::EventSession => "event_session",
            LinkKind::EventPage => "event_page",
            LinkKind::SessionPage => "session_page",
            LinkKind::EventBusinessItem => "event_business_item",
            LinkKind::VisitorBusinessItem => "visitor_business_item",
        }
    }

    /// Occurrence links get one row per event rather than one per pair.
    pub fn is_occurrence_based(&self) -> bool {
        matches!(
            self,
            LinkKind::SessionPage | LinkKind::EventBusinessItem | LinkKind::VisitorBusinessItem
        )
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LinkKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Internal(format!("Unknown link kind: {}", s)))
    }
}

/// Fixed-width opaque identity key (SHA-256 digest)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey([u8; 32]);

impl IdentityKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidKey(format!("Invalid identity key encoding: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("Identity key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.to_hex())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for IdentityKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for IdentityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IdentityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Resolve the identity key of an entity occurrence.
///
/// # Errors
/// - `Error::InvalidKey` if the natural key is empty or whitespace only
pub fn resolve(tenant_id: TenantId, kind: EntityKind, natural_key: &str) -> Result<IdentityKey> {
    if natural_key.trim().is_empty() {
        return Err(Error::InvalidKey(format!(
            "Empty natural key for {}",
            kind
        )));
    }

    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(natural_key.as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(tenant_id.as_uuid().as_bytes());
    Ok(IdentityKey(hasher.finalize().into()))
}

/// Derive the primary key of a link row from its participants.
///
/// For occurrence-based links the caller appends the occurrence (event) key
/// to `parts`, which yields one row per occurrence while keeping replays
/// of the same occurrence idempotent.
pub fn link_key(tenant_id: TenantId, kind: LinkKind, parts: &[&IdentityKey]) -> IdentityKey {
    let mut hasher = Sha256::new();
    hasher.update(b"link:");
    hasher.update(kind.as_str().as_bytes());
    for part in parts {
        hasher.update([SEPARATOR]);
        hasher.update(part.as_bytes());
    }
    hasher.update([SEPARATOR]);
    hasher.update(tenant_id.as_uuid().as_bytes());
    IdentityKey(hasher.finalize().into())
}

/// Change fingerprint of a satellite attribute set.
///
/// Object keys are hashed in sorted order so that two attribute sets with
/// equal content always fingerprint the same.
pub fn fingerprint(attributes: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(attributes, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
