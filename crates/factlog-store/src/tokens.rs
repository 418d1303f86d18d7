//! Persistence of compare-and-swap state tokens.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use factlog_db::DbPool;
use factlog_types::{FactSpec, StateToken};
use rusqlite::params;
use uuid::Uuid;

use crate::error::StoreError;

/// Issues, resolves and expires [`StateToken`]s.
///
/// Timestamps are stored as fixed-width RFC 3339 strings so that string
/// comparison in SQL orders them chronologically.
#[derive(Debug, Clone)]
pub struct StateTokenStore {
    pool: DbPool,
}

impl StateTokenStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persists a new token for `specs` at `serial`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Serialization` if the specs cannot be encoded
    /// or `StoreError::Database` on SQL failure.
    pub fn create(&self, specs: Vec<FactSpec>, serial: i64) -> Result<StateToken, StoreError> {
        let token = StateToken {
            token: Uuid::new_v4(),
            specs,
            serial_of_last_matching_fact: serial,
            created_at: Utc::now(),
        };
        let specs_json = serde_json::to_string(&token.specs)?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO state_token (token, specs, serial, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                token.token.to_string(),
                specs_json,
                token.serial_of_last_matching_fact,
                format_timestamp(token.created_at),
            ],
        )?;

        tracing::debug!(token = %token.token, serial, "issued state token");
        Ok(token)
    }

    /// Looks a token up. Unknown, invalidated and compacted tokens all
    /// resolve to `None`.
    pub fn resolve(&self, token: Uuid) -> Result<Option<StateToken>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT specs, serial, created_at FROM state_token WHERE token = ?1",
        )?;
        let mut rows = stmt.query([token.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let specs_json: String = row.get(0)?;
        let serial: i64 = row.get(1)?;
        let created_at: String = row.get(2)?;

        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| StoreError::CorruptRow {
                serial,
                reason: format!("state token {token} timestamp '{created_at}': {e}"),
            })?;

        Ok(Some(StateToken {
            token,
            specs: serde_json::from_str(&specs_json)?,
            serial_of_last_matching_fact: serial,
            created_at,
        }))
    }

    /// Deletes a token. Returns `false` if it did not exist.
    pub fn invalidate(&self, token: Uuid) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM state_token WHERE token = ?1",
            [token.to_string()],
        )?;
        Ok(deleted > 0)
    }

    /// Deletes every token older than `retention`. Returns how many were
    /// removed. Already applied publishes are unaffected.
    pub fn compact(&self, retention: Duration) -> Result<usize, StoreError> {
        self.compact_created_before(Utc::now() - retention)
    }

    pub(crate) fn compact_created_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM state_token WHERE created_at < ?1",
            [format_timestamp(cutoff)],
        )?;
        if deleted > 0 {
            tracing::debug!(deleted, "compacted state tokens");
        }
        Ok(deleted)
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
