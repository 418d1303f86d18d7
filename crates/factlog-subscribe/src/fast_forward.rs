//! Tracking of the log head for fast-forward notifications.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use factlog_store::{FactLog, HighWater, StoreError};

/// Age after which a connecting subscription re-reads the head itself.
pub const DEFAULT_FAST_FORWARD_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Reading {
    high_water: Option<HighWater>,
    read_at: Instant,
}

/// The most recently observed head of the log.
///
/// Meant to be refreshed periodically rather than per subscription, so the
/// value may trail the log. A trailing value only means a fast-forward is
/// skipped. Readings older than `max_age` are replaced on the next
/// [`current`](Self::current) call, which bounds how far the head can trail
/// when nothing refreshes it.
#[derive(Debug)]
pub struct FastForwardTarget {
    max_age: Duration,
    latest: RwLock<Option<Reading>>,
}

impl Default for FastForwardTarget {
    fn default() -> Self {
        Self::with_max_age(DEFAULT_FAST_FORWARD_MAX_AGE)
    }
}

impl FastForwardTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Duration::ZERO` makes every [`current`](Self::current) call read
    /// the log.
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            max_age,
            latest: RwLock::new(None),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// The cached head, without touching the log.
    pub fn get(&self) -> Option<HighWater> {
        self.reading().and_then(|reading| reading.high_water)
    }

    pub fn set(&self, high_water: Option<HighWater>) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(Reading {
            high_water,
            read_at: Instant::now(),
        });
    }

    /// Re-reads the head from `log`.
    pub fn refresh(&self, log: &dyn FactLog) -> Result<Option<HighWater>, StoreError> {
        let latest = log.latest_fact()?;
        self.set(latest);
        tracing::trace!(serial = ?latest.map(|h| h.serial), "fast-forward target refreshed");
        Ok(latest)
    }

    /// The cached head while it is younger than `max_age`, otherwise a
    /// fresh read from `log`.
    pub fn current(&self, log: &dyn FactLog) -> Result<Option<HighWater>, StoreError> {
        match self.reading() {
            Some(reading) if reading.read_at.elapsed() < self.max_age => Ok(reading.high_water),
            _ => self.refresh(log),
        }
    }

    fn reading(&self) -> Option<Reading> {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryLog;
    use factlog_types::Fact;

    #[test]
    fn refresh_tracks_the_newest_fact() {
        let log = MemoryLog::default();
        let target = FastForwardTarget::new();
        assert_eq!(target.current(&log).unwrap(), None);

        let first = log.push(Fact::new("x", "a"));
        assert_eq!(target.refresh(&log).unwrap().map(|h| h.fact_id), Some(first));

        let second = log.push(Fact::new("x", "a"));
        assert_eq!(target.current(&log).unwrap().map(|h| h.fact_id), Some(first));
        assert_eq!(
            target.refresh(&log).unwrap(),
            Some(HighWater { fact_id: second, serial: 2 })
        );
    }

    #[test]
    fn stale_reading_is_replaced_on_access() {
        let log = MemoryLog::default();
        let first = log.push(Fact::new("x", "a"));
        let target = FastForwardTarget::with_max_age(Duration::ZERO);
        assert_eq!(target.current(&log).unwrap().map(|h| h.fact_id), Some(first));

        let second = log.push(Fact::new("x", "a"));
        assert_eq!(target.get().map(|h| h.fact_id), Some(first));
        assert_eq!(target.current(&log).unwrap().map(|h| h.fact_id), Some(second));
        assert_eq!(target.get().map(|h| h.fact_id), Some(second));
    }

    #[test]
    fn reading_expires_after_max_age() {
        let log = MemoryLog::default();
        let target = FastForwardTarget::with_max_age(Duration::from_millis(50));
        assert_eq!(target.current(&log).unwrap(), None);

        let newest = log.push(Fact::new("x", "a"));
        assert_eq!(target.current(&log).unwrap(), None);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(target.current(&log).unwrap().map(|h| h.fact_id), Some(newest));
    }
}
