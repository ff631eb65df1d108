//! Persisted entity records

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity families the ingester reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Team / organization
    Organization,
    /// Player
    Player,
    /// Tournament
    Tournament,
    /// Prize-money entry
    Earning,
    /// Roster move
    Transfer,
}

impl EntityKind {
    /// All kinds in dependency order
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Organization,
        EntityKind::Player,
        EntityKind::Tournament,
        EntityKind::Earning,
        EntityKind::Transfer,
    ];

    /// Storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::Player => "player",
            EntityKind::Tournament => "tournament",
            EntityKind::Earning => "earning",
            EntityKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(EntityKind::Organization),
            "player" => Ok(EntityKind::Player),
            "tournament" => Ok(EntityKind::Tournament),
            "earning" => Ok(EntityKind::Earning),
            "transfer" => Ok(EntityKind::Transfer),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}

/// Field name to JSON value
pub type FieldMap = BTreeMap<String, Value>;

/// Null, blank strings, and empty arrays/objects carry no information
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// A persisted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Entity family
    pub kind: EntityKind,
    /// Stable id, unique per kind
    pub canonical_id: String,
    /// Source that first created the record
    pub source: String,
    /// Enrichment fields
    pub fields: FieldMap,
    /// Authoritative last-modified time reported by the source
    pub source_updated_at: Option<DateTime<Utc>>,
    /// When this record was last reconciled
    pub last_reconciled_at: DateTime<Utc>,
    /// False once the entity disappears upstream
    pub active: bool,
}

impl LocalRecord {
    /// Create an empty active record
    pub fn new(kind: EntityKind, canonical_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind,
            canonical_id: canonical_id.into(),
            source: source.into(),
            fields: FieldMap::new(),
            source_updated_at: None,
            last_reconciled_at: Utc::now(),
            active: true,
        }
    }

    /// Set a field; empty values are dropped
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !is_empty_value(&value) {
            self.fields.insert(name.into(), value);
        }
        self
    }

    /// Set an optional field
    pub fn with_opt_field<V: Into<Value>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with_field(name, v),
            None => self,
        }
    }

    /// Set the source's last-modified time
    pub fn with_source_updated_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.source_updated_at = at;
        self
    }

    /// A populated field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !is_empty_value(v))
    }

    /// A populated string field
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// True when every named field is populated
    pub fn has_fields(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.field(n).is_some())
    }
}

/// Result of a merge-upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed
    Created,
    /// An existing record was reconciled
    Updated,
}

/// Selection over stored records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Restrict to one kind
    pub kind: Option<EntityKind>,
    /// Restrict to these canonical ids
    pub ids: Option<Vec<String>>,
    /// Only active records
    pub active_only: bool,
}

impl RecordFilter {
    /// All records of one kind
    pub fn kind(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Restrict to ids
    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Only active records
    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }
}
