//! SQL operations on the `fact` table.
//!
//! Everything here takes a borrowed connection or transaction; pooling and
//! locking live in [`crate::store`].

use std::collections::BTreeSet;

use factlog_types::{is_wildcard, Fact, FactSpec};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::fact_log::{HighWater, ScanFlow, ScanRequest};
use crate::matcher::FactMatcher;

const FACT_COLUMNS: &str = "serial, id, ns, type, version, aggregate_ids, header, payload";

/// Rejects facts that can never be appended.
pub(crate) fn validate_facts(facts: &[Fact]) -> Result<(), StoreError> {
    for fact in facts {
        if fact.ns.trim().is_empty() {
            return Err(StoreError::InvalidFact(format!(
                "fact {} has an empty namespace",
                fact.id
            )));
        }
        if is_wildcard(&fact.ns) {
            return Err(StoreError::InvalidFact(format!(
                "fact {} cannot be published to the wildcard namespace",
                fact.id
            )));
        }
        if fact.serial.is_some() {
            return Err(StoreError::InvalidFact(format!(
                "fact {} already carries a serial",
                fact.id
            )));
        }
    }
    Ok(())
}

/// Inserts `facts` inside `tx`, assigning serials in order.
///
/// The caller commits. A unique violation on the id maps to
/// [`StoreError::DuplicateFact`].
pub(crate) fn insert_facts(tx: &Transaction<'_>, facts: Vec<Fact>) -> Result<Vec<Fact>, StoreError> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO fact (id, ns, type, version, aggregate_ids, header, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING serial",
    )?;

    let mut published = Vec::with_capacity(facts.len());
    for mut fact in facts {
        let aggregate_ids = serde_json::to_string(&fact.aggregate_ids)?;
        let header = serde_json::to_string(&fact.header)?;
        let payload = serde_json::to_string(&fact.payload)?;

        let serial: i64 = stmt
            .query_row(
                params![
                    fact.id.to_string(),
                    fact.ns,
                    fact.fact_type,
                    fact.version,
                    aggregate_ids,
                    header,
                    payload,
                ],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    StoreError::DuplicateFact(fact.id)
                }
                other => StoreError::Database(other),
            })?;

        fact.serial = Some(serial);
        published.push(fact);
    }

    Ok(published)
}

/// Serial of the newest fact, `0` on an empty log.
pub(crate) fn highest_serial(conn: &Connection) -> Result<i64, StoreError> {
    let serial = conn.query_row("SELECT COALESCE(MAX(serial), 0) FROM fact", [], |row| {
        row.get(0)
    })?;
    Ok(serial)
}

pub(crate) fn serial_of(conn: &Connection, id: Uuid) -> Result<Option<i64>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT serial FROM fact WHERE id = ?1")?;
    let mut rows = stmt.query([id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

pub(crate) fn latest_fact(conn: &Connection) -> Result<Option<HighWater>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT serial, id FROM fact ORDER BY serial DESC LIMIT 1")?;
    let mut rows = stmt.query([])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let serial: i64 = row.get(0)?;
    let raw_id: String = row.get(1)?;
    let fact_id = parse_uuid(serial, &raw_id)?;
    Ok(Some(HighWater { fact_id, serial }))
}

/// Builds the `WHERE` fragment for a list of OR'd specs, appending bind
/// values to `values` in placeholder order.
///
/// Only namespace, type and aggregate id are expressed in SQL.
pub(crate) fn spec_clause(specs: &[FactSpec], values: &mut Vec<SqlValue>) -> String {
    if specs.is_empty() {
        return "0".to_string();
    }

    let alternatives: Vec<String> = specs
        .iter()
        .map(|spec| {
            let mut conditions = Vec::new();
            if !spec.is_wildcard() {
                conditions.push("fact.ns = ?".to_string());
                values.push(SqlValue::Text(spec.ns.clone()));
            }
            if let Some(fact_type) = &spec.fact_type {
                conditions.push("fact.type = ?".to_string());
                values.push(SqlValue::Text(fact_type.clone()));
            }
            if let Some(aggregate_id) = &spec.aggregate_id {
                conditions.push(
                    "EXISTS (SELECT 1 FROM json_each(fact.aggregate_ids) WHERE json_each.value = ?)"
                        .to_string(),
                );
                values.push(SqlValue::Text(aggregate_id.to_string()));
            }
            if conditions.is_empty() {
                "1".to_string()
            } else {
                format!("({})", conditions.join(" AND "))
            }
        })
        .collect();

    format!("({})", alternatives.join(" OR "))
}

/// Runs an ordered scan, streaming decoded rows into `on_row`.
pub(crate) fn scan_facts(
    conn: &Connection,
    request: ScanRequest<'_>,
    on_row: &mut dyn FnMut(Fact) -> ScanFlow,
) -> Result<(), StoreError> {
    let mut values = vec![SqlValue::Integer(request.after_serial)];
    let filter = spec_clause(request.specs, &mut values);
    let hint = if request.use_index { "" } else { " NOT INDEXED" };
    let limit = match request.limit {
        Some(limit) => {
            values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            " LIMIT ?"
        }
        None => "",
    };

    let sql = format!(
        "SELECT {FACT_COLUMNS} FROM fact{hint}
         WHERE fact.serial > ? AND {filter}
         ORDER BY fact.serial ASC{limit}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    while let Some(row) = rows.next()? {
        let fact = decode_fact(row)?;
        if on_row(fact) == ScanFlow::Stop {
            break;
        }
    }
    Ok(())
}

/// Serial of the newest fact matching any of `specs`, `0` if none does.
///
/// Specs that need per-row evaluation are checked with `matcher`, walking
/// candidate rows newest first.
pub(crate) fn serial_of_last_matching(
    conn: &Connection,
    matcher: &dyn FactMatcher,
    specs: &[FactSpec],
) -> Result<i64, StoreError> {
    let mut values = Vec::new();
    let filter = spec_clause(specs, &mut values);

    if matcher.can_skip(specs) {
        let sql = format!("SELECT COALESCE(MAX(fact.serial), 0) FROM fact WHERE {filter}");
        let serial = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        return Ok(serial);
    }

    let sql = format!("SELECT {FACT_COLUMNS} FROM fact WHERE {filter} ORDER BY fact.serial DESC");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    while let Some(row) = rows.next()? {
        let fact = decode_fact(row)?;
        if matcher.matches_any(&fact, specs)? {
            return Ok(fact.serial.unwrap_or_default());
        }
    }
    Ok(0)
}

fn decode_fact(row: &Row<'_>) -> Result<Fact, StoreError> {
    let serial: i64 = row.get(0)?;
    let raw_id: String = row.get(1)?;
    let aggregate_ids: String = row.get(5)?;
    let header: String = row.get(6)?;
    let payload: String = row.get(7)?;

    let corrupt = |reason: String| StoreError::CorruptRow { serial, reason };

    let aggregate_ids: BTreeSet<Uuid> = serde_json::from_str(&aggregate_ids)
        .map_err(|e| corrupt(format!("aggregate ids: {e}")))?;
    let header =
        serde_json::from_str(&header).map_err(|e| corrupt(format!("header: {e}")))?;
    let payload =
        serde_json::from_str(&payload).map_err(|e| corrupt(format!("payload: {e}")))?;

    Ok(Fact {
        id: parse_uuid(serial, &raw_id)?,
        ns: row.get(2)?,
        fact_type: row.get(3)?,
        version: row.get(4)?,
        aggregate_ids,
        header,
        payload,
        serial: Some(serial),
    })
}

fn parse_uuid(serial: i64, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::CorruptRow {
        serial,
        reason: format!("fact id '{raw}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_clause_binds_in_order() {
        let aggregate = Uuid::new_v4();
        let specs = vec![
            FactSpec::ns("orders").fact_type("placed"),
            FactSpec::wildcard().aggregate_id(aggregate),
        ];
        let mut values = Vec::new();
        let clause = spec_clause(&specs, &mut values);

        assert_eq!(
            clause,
            "((fact.ns = ? AND fact.type = ?) OR (EXISTS (SELECT 1 FROM json_each(fact.aggregate_ids) WHERE json_each.value = ?)))"
        );
        assert_eq!(
            values,
            vec![
                SqlValue::Text("orders".to_string()),
                SqlValue::Text("placed".to_string()),
                SqlValue::Text(aggregate.to_string()),
            ]
        );
    }

    #[test]
    fn bare_wildcard_matches_everything_and_empty_list_nothing() {
        let mut values = Vec::new();
        assert_eq!(spec_clause(&[FactSpec::wildcard()], &mut values), "(1)");
        assert_eq!(spec_clause(&[], &mut values), "0");
        assert!(values.is_empty());
    }

    #[test]
    fn validation_rejects_wildcard_and_empty_namespaces() {
        assert!(validate_facts(&[Fact::new("orders", "placed")]).is_ok());
        assert!(matches!(
            validate_facts(&[Fact::new("*", "placed")]),
            Err(StoreError::InvalidFact(_))
        ));
        assert!(matches!(
            validate_facts(&[Fact::new(" ", "placed")]),
            Err(StoreError::InvalidFact(_))
        ));
    }
}
