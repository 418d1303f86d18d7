//! Read predicates over the fact log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{is_wildcard, WILDCARD_NS};

/// A read predicate. A list of specs is OR'd: a fact matches the list if
/// any spec matches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSpec {
    /// Namespace to match, or `*` for every namespace.
    pub ns: String,
    /// Restricts matches to a single fact type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<String>,
    /// Payload version the reader wants delivered. `None` accepts the
    /// version the fact was published with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    /// Restricts matches to facts carrying this aggregate id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<Uuid>,
    /// Payload properties that must hold a given aggregate id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate_id_properties: Vec<AggregateIdProperty>,
    /// Header `meta` entries that must be present with the given values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// Source of a filter expression evaluated by a pluggable engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_script: Option<String>,
}

/// A payload property, addressed by a dotted path, whose string value must
/// equal an aggregate id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateIdProperty {
    /// Dotted path into the payload, e.g. `order.customerId`.
    pub path: String,
    /// The id the property must hold.
    pub id: Uuid,
}

impl FactSpec {
    /// A spec matching every fact in `ns`.
    pub fn ns(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            fact_type: None,
            version: None,
            aggregate_id: None,
            aggregate_id_properties: Vec::new(),
            meta: BTreeMap::new(),
            filter_script: None,
        }
    }

    /// A spec matching every fact in the log.
    pub fn wildcard() -> Self {
        Self::ns(WILDCARD_NS)
    }

    pub fn fact_type(mut self, fact_type: impl Into<String>) -> Self {
        self.fact_type = Some(fact_type.into());
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_id_property(mut self, path: impl Into<String>, id: Uuid) -> Self {
        self.aggregate_id_properties.push(AggregateIdProperty {
            path: path.into(),
            id,
        });
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn filter_script(mut self, source: impl Into<String>) -> Self {
        self.filter_script = Some(source.into());
        self
    }

    /// Returns `true` if this spec reads every namespace.
    pub fn is_wildcard(&self) -> bool {
        is_wildcard(&self.ns)
    }

    /// Returns `true` if matching needs more than namespace, type and
    /// aggregate id, which a storage scan can check on its own.
    pub fn needs_post_filter(&self) -> bool {
        !self.aggregate_id_properties.is_empty()
            || !self.meta.is_empty()
            || self.filter_script.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_spec_needs_no_post_filter() {
        let spec = FactSpec::ns("orders")
            .fact_type("placed")
            .aggregate_id(Uuid::new_v4());
        assert!(!spec.needs_post_filter());
        assert!(!spec.is_wildcard());
    }

    #[test]
    fn meta_and_script_need_post_filter() {
        assert!(FactSpec::ns("orders").meta("tenant", "acme").needs_post_filter());
        assert!(FactSpec::ns("orders")
            .filter_script("fact.amount > 10")
            .needs_post_filter());
        assert!(FactSpec::ns("orders")
            .aggregate_id_property("customer", Uuid::new_v4())
            .needs_post_filter());
    }

    #[test]
    fn specs_survive_json() {
        let spec = FactSpec::wildcard().fact_type("placed").version(2).meta("k", "v");
        let json = serde_json::to_string(&spec).expect("spec should serialise");
        let back: FactSpec = serde_json::from_str(&json).expect("spec should deserialise");
        assert_eq!(back, spec);
        assert!(back.is_wildcard());
    }
}
