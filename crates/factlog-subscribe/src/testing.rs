//! In-memory fact log for unit tests.

use std::sync::{Mutex, PoisonError};

use factlog_store::{FactLog, HighWater, ScanFlow, ScanRequest, StatementCancel, StoreError};
use factlog_types::{Fact, FactSpec};
use uuid::Uuid;

#[derive(Debug, Default)]
pub(crate) struct MemoryLog {
    facts: Mutex<Vec<Fact>>,
}

impl MemoryLog {
    /// Appends one fact and returns its id.
    pub(crate) fn push(&self, fact: Fact) -> Uuid {
        let id = fact.id;
        self.append(vec![fact]).unwrap();
        id
    }

    fn facts(&self) -> std::sync::MutexGuard<'_, Vec<Fact>> {
        self.facts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn selects(spec: &FactSpec, fact: &Fact) -> bool {
    (spec.is_wildcard() || spec.ns == fact.ns)
        && spec
            .fact_type
            .as_deref()
            .map_or(true, |ty| fact.fact_type.as_deref() == Some(ty))
        && spec
            .aggregate_id
            .map_or(true, |id| fact.aggregate_ids.contains(&id))
}

impl FactLog for MemoryLog {
    fn append(&self, facts: Vec<Fact>) -> Result<Vec<Fact>, StoreError> {
        let mut log = self.facts();
        let mut appended = Vec::with_capacity(facts.len());
        for mut fact in facts {
            if log.iter().any(|existing| existing.id == fact.id) {
                return Err(StoreError::DuplicateFact(fact.id));
            }
            fact.serial = Some(log.len() as i64 + 1);
            log.push(fact.clone());
            appended.push(fact);
        }
        Ok(appended)
    }

    fn scan(
        &self,
        request: ScanRequest<'_>,
        cancel: &StatementCancel,
        on_row: &mut dyn FnMut(Fact) -> ScanFlow,
    ) -> Result<(), StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let rows: Vec<Fact> = self
            .facts()
            .iter()
            .filter(|fact| fact.serial.unwrap_or_default() > request.after_serial)
            .filter(|fact| request.specs.iter().any(|spec| selects(spec, fact)))
            .take(request.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        for fact in rows {
            if on_row(fact) == ScanFlow::Stop {
                break;
            }
        }
        Ok(())
    }

    fn highest_serial(&self) -> Result<i64, StoreError> {
        Ok(self.facts().len() as i64)
    }

    fn serial_of(&self, id: Uuid) -> Result<Option<i64>, StoreError> {
        Ok(self.facts().iter().find(|f| f.id == id).and_then(|f| f.serial))
    }

    fn latest_fact(&self) -> Result<Option<HighWater>, StoreError> {
        Ok(self.facts().last().map(|f| HighWater {
            fact_id: f.id,
            serial: f.serial.unwrap_or_default(),
        }))
    }
}
