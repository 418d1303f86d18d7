//! Post-query predicate evaluation.
//!
//! The SQL scan constrains namespace, type and aggregate id. Everything a
//! spec can express beyond that (payload aggregate-id properties, header
//! `meta` entries, filter scripts) is checked here, row by row.

use factlog_types::{Fact, FactSpec};
use serde_json::Value;
use uuid::Uuid;

/// Errors raised while evaluating a spec against a fact.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MatchError {
    /// The spec carries a filter script but no script engine is installed.
    #[error("no filter script engine available for namespace '{ns}'")]
    ScriptUnsupported {
        /// Namespace of the offending spec.
        ns: String,
    },

    /// The script engine failed to evaluate a filter.
    #[error("filter script failed: {0}")]
    Script(String),
}

/// Decides whether a fact satisfies a spec.
pub trait FactMatcher: Send + Sync {
    /// Evaluates a single spec.
    fn matches(&self, fact: &Fact, spec: &FactSpec) -> Result<bool, MatchError>;

    /// Returns `true` when a scan over `specs` needs no per-row evaluation
    /// because the storage query already enforces every constraint.
    fn can_skip(&self, specs: &[FactSpec]) -> bool {
        specs.iter().all(|spec| !spec.needs_post_filter())
    }

    /// Returns `true` if any of `specs` matches.
    fn matches_any(&self, fact: &Fact, specs: &[FactSpec]) -> Result<bool, MatchError> {
        for spec in specs {
            if self.matches(fact, spec)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// The built-in matcher. It evaluates every spec field except filter
/// scripts, which fail with [`MatchError::ScriptUnsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecMatcher;

impl FactMatcher for SpecMatcher {
    fn matches(&self, fact: &Fact, spec: &FactSpec) -> Result<bool, MatchError> {
        if !spec.is_wildcard() && spec.ns != fact.ns {
            return Ok(false);
        }
        if let Some(fact_type) = &spec.fact_type {
            if fact.fact_type.as_deref() != Some(fact_type.as_str()) {
                return Ok(false);
            }
        }
        if let Some(aggregate_id) = &spec.aggregate_id {
            if !fact.aggregate_ids.contains(aggregate_id) {
                return Ok(false);
            }
        }
        for property in &spec.aggregate_id_properties {
            if property_id(&fact.payload, &property.path) != Some(property.id) {
                return Ok(false);
            }
        }
        for (key, value) in &spec.meta {
            if fact.meta(key) != Some(value.as_str()) {
                return Ok(false);
            }
        }
        if spec.filter_script.is_some() {
            return Err(MatchError::ScriptUnsupported {
                ns: spec.ns.clone(),
            });
        }
        Ok(true)
    }
}

/// Resolves a dotted path in a JSON payload to a UUID.
fn property_id(payload: &Value, path: &str) -> Option<Uuid> {
    path.split('.')
        .try_fold(payload, |value, segment| value.get(segment))?
        .as_str()
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespace_and_type() {
        let fact = Fact::new("orders", "placed");
        assert!(SpecMatcher.matches(&fact, &FactSpec::ns("orders")).unwrap());
        assert!(SpecMatcher
            .matches(&fact, &FactSpec::ns("orders").fact_type("placed"))
            .unwrap());
        assert!(!SpecMatcher
            .matches(&fact, &FactSpec::ns("orders").fact_type("shipped"))
            .unwrap());
        assert!(!SpecMatcher.matches(&fact, &FactSpec::ns("users")).unwrap());
        assert!(SpecMatcher.matches(&fact, &FactSpec::wildcard()).unwrap());
    }

    #[test]
    fn aggregate_ids_and_properties() {
        let customer = Uuid::new_v4();
        let order = Uuid::new_v4();
        let fact = Fact::new("orders", "placed")
            .with_aggregate_id(order)
            .with_payload(json!({ "order": { "customer": customer.to_string() } }));

        let by_aggregate = FactSpec::ns("orders").aggregate_id(order);
        assert!(SpecMatcher.matches(&fact, &by_aggregate).unwrap());

        let by_property = FactSpec::ns("orders").aggregate_id_property("order.customer", customer);
        assert!(SpecMatcher.matches(&fact, &by_property).unwrap());

        let wrong_property =
            FactSpec::ns("orders").aggregate_id_property("order.customer", Uuid::new_v4());
        assert!(!SpecMatcher.matches(&fact, &wrong_property).unwrap());

        let missing_path = FactSpec::ns("orders").aggregate_id_property("order.nope", customer);
        assert!(!SpecMatcher.matches(&fact, &missing_path).unwrap());
    }

    #[test]
    fn meta_entries() {
        let fact = Fact::new("orders", "placed").with_meta("tenant", "acme");
        assert!(SpecMatcher
            .matches(&fact, &FactSpec::ns("orders").meta("tenant", "acme"))
            .unwrap());
        assert!(!SpecMatcher
            .matches(&fact, &FactSpec::ns("orders").meta("tenant", "other"))
            .unwrap());
    }

    #[test]
    fn scripts_are_rejected_only_after_cheap_checks_pass() {
        let fact = Fact::new("orders", "placed");
        let scripted = FactSpec::ns("orders").filter_script("true");
        assert!(matches!(
            SpecMatcher.matches(&fact, &scripted),
            Err(MatchError::ScriptUnsupported { .. })
        ));

        let other_ns = FactSpec::ns("users").filter_script("true");
        assert!(!SpecMatcher.matches(&fact, &other_ns).unwrap());
    }

    #[test]
    fn can_skip_only_without_post_filters() {
        assert!(SpecMatcher.can_skip(&[FactSpec::ns("a"), FactSpec::ns("b").fact_type("t")]));
        assert!(!SpecMatcher.can_skip(&[FactSpec::ns("a"), FactSpec::ns("b").meta("k", "v")]));
    }
}
