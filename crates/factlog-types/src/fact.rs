//! The immutable fact record.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single immutable entry in the fact log.
///
/// Two facts are equal when their ids are equal; every other field is
/// ignored for identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Globally unique fact id, chosen by the publisher.
    pub id: Uuid,
    /// Namespace the fact belongs to. Never the wildcard.
    pub ns: String,
    /// Optional fact type within the namespace.
    #[serde(rename = "type")]
    pub fact_type: Option<String>,
    /// Payload schema version. `0` means unversioned.
    pub version: i32,
    /// Aggregates this fact concerns.
    #[serde(default)]
    pub aggregate_ids: BTreeSet<Uuid>,
    /// Opaque JSON header. `meta` is an object of string pairs that specs
    /// can match against.
    pub header: Value,
    /// Opaque JSON payload.
    pub payload: Value,
    /// Position in the log. `None` until the fact is appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<i64>,
}

impl Fact {
    /// Creates an unpublished fact with a fresh id, an empty header and an
    /// empty payload.
    pub fn new(ns: impl Into<String>, fact_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ns: ns.into(),
            fact_type: Some(fact_type.into()),
            version: 0,
            aggregate_ids: BTreeSet::new(),
            header: Value::Object(Default::default()),
            payload: Value::Object(Default::default()),
            serial: None,
        }
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Sets the payload version.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Adds an aggregate id.
    pub fn with_aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.insert(id);
        self
    }

    /// Sets the JSON payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Adds a `meta` entry to the header.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if !self.header.is_object() {
            self.header = Value::Object(Default::default());
        }
        if let Value::Object(header) = &mut self.header {
            let meta = header
                .entry("meta")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(meta) = meta {
                meta.insert(key.into(), Value::String(value.into()));
            }
        }
        self
    }

    /// Looks up a `meta` entry in the header.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.header.get("meta")?.get(key)?.as_str()
    }
}

impl PartialEq for Fact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Fact {}

impl Hash for Fact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
