//! Payload version transformation seam.

use factlog_types::{Fact, FactSpec};

use crate::error::TransformError;

/// Brings a fact to one of the versions a subscription asked for.
pub trait FactTransformer: Send + Sync {
    /// `requested` holds the distinct versions asked for by the specs that
    /// select this fact; empty means any version is acceptable.
    fn transform(&self, fact: Fact, requested: &[i32]) -> Result<Fact, TransformError>;
}

/// Passes facts through unchanged and fails when a different version is
/// required.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl FactTransformer for IdentityTransformer {
    fn transform(&self, fact: Fact, requested: &[i32]) -> Result<Fact, TransformError> {
        if requested.is_empty() || requested.contains(&fact.version) {
            return Ok(fact);
        }
        Err(TransformError::Unavailable {
            fact_id: fact.id,
            ns: fact.ns,
            from: fact.version,
            requested: requested.to_vec(),
        })
    }
}

/// Versions requested by the specs whose namespace and type select `fact`.
pub(crate) fn requested_versions(specs: &[FactSpec], fact: &Fact) -> Vec<i32> {
    let mut versions: Vec<i32> = specs
        .iter()
        .filter(|spec| spec.is_wildcard() || spec.ns == fact.ns)
        .filter(|spec| {
            spec.fact_type
                .as_deref()
                .map_or(true, |ty| fact.fact_type.as_deref() == Some(ty))
        })
        .filter_map(|spec| spec.version)
        .collect();
    versions.sort_unstable();
    versions.dedup();
    versions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_accepts_requested_or_unversioned() {
        let fact = Fact::new("orders", "placed").with_version(2);
        assert!(IdentityTransformer.transform(fact.clone(), &[]).is_ok());
        assert!(IdentityTransformer.transform(fact.clone(), &[1, 2]).is_ok());
        assert!(matches!(
            IdentityTransformer.transform(fact, &[3]),
            Err(TransformError::Unavailable { from: 2, .. })
        ));
    }

    #[test]
    fn versions_come_from_selecting_specs_only() {
        let fact = Fact::new("orders", "placed");
        let specs = vec![
            FactSpec::ns("orders").fact_type("placed").version(2),
            FactSpec::ns("orders").fact_type("shipped").version(5),
            FactSpec::ns("users").version(7),
            FactSpec::wildcard().version(2),
            FactSpec::ns("orders"),
        ];
        assert_eq!(requested_versions(&specs, &fact), vec![2]);
    }
}
