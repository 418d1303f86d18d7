//! The storage seam the subscription engine reads through.

use factlog_types::{Fact, FactSpec};
use uuid::Uuid;

use crate::cancel::StatementCancel;
use crate::error::StoreError;

/// Parameters of an ordered, predicate-filtered scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest<'a> {
    /// Rows must match at least one of these specs on namespace, type and
    /// aggregate id. Further spec fields are left to the caller.
    pub specs: &'a [FactSpec],
    /// Only rows with a greater serial are returned.
    pub after_serial: i64,
    /// Upper bound on returned rows.
    pub limit: Option<usize>,
    /// `true` lets the planner use the namespace index (large catch-up
    /// ranges); `false` forces a plain serial-order table scan, which wins
    /// when few rows match.
    pub use_index: bool,
}

/// What the scan should do after a row was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFlow {
    Continue,
    Stop,
}

/// Latest position of the log as seen by the fast-forward tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighWater {
    pub fact_id: Uuid,
    pub serial: i64,
}

/// Append-only store of facts, ordered by serial.
pub trait FactLog: Send + Sync {
    /// Appends `facts` atomically and returns them with serials assigned.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateFact`] if any id already exists; nothing is
    /// appended in that case.
    fn append(&self, facts: Vec<Fact>) -> Result<Vec<Fact>, StoreError>;

    /// Streams matching rows in ascending serial order into `on_row`.
    ///
    /// The statement is registered with `cancel` while it runs.
    fn scan(
        &self,
        request: ScanRequest<'_>,
        cancel: &StatementCancel,
        on_row: &mut dyn FnMut(Fact) -> ScanFlow,
    ) -> Result<(), StoreError>;

    /// Serial of the newest fact, `0` on an empty log.
    fn highest_serial(&self) -> Result<i64, StoreError>;

    /// Serial of the fact with the given id.
    fn serial_of(&self, id: Uuid) -> Result<Option<i64>, StoreError>;

    /// Id and serial of the newest fact.
    fn latest_fact(&self) -> Result<Option<HighWater>, StoreError>;
}
