//! Key-value store seam.
//!
//! The lifecycle engine never mutates a record it has read into memory. Every state
//! change is a [`Condition`] plus a list of [`Mutation`]s handed to
//! [`KvStore::update_if`], which the backend evaluates and applies inside a single
//! write transaction. Backends must guarantee at most one winner per evaluation.

use thiserror::Error;

use super::model::{AccessMode, SecretRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The predicate did not hold, or the record does not exist.
    #[error("condition failed")]
    ConditionFailed,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Predicate over a stored record. An absent record satisfies nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    /// Holds for any stored record.
    Exists,
    NotDownloaded,
    /// `expires_at > t`
    ExpiresAfter(i64),
    /// No reservation, or one taken before `cutoff`.
    ReservationClaimable { cutoff: i64 },
    /// `reserved_at` present.
    Reserved,
    AccessMode(AccessMode),
    NotAccessMode(AccessMode),
    /// PIN session expiry strictly after `t`.
    SessionActive(i64),
    /// No lockout, or one that ended at or before `t`.
    NotLocked(i64),
    /// PIN attempts left above zero.
    AttemptsRemaining,
    /// `locked_until` equals the given value (compare-and-swap on the lockout).
    LockedUntil(Option<i64>),
    All(Vec<Condition>),
}

impl Condition {
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::All(conditions.into_iter().collect())
    }

    pub fn holds(&self, record: &SecretRecord) -> bool {
        match self {
            Self::Always | Self::Exists => true,
            Self::NotDownloaded => !record.downloaded,
            Self::ExpiresAfter(t) => record.expires_at > *t,
            Self::ReservationClaimable { cutoff } => match record.reserved_at {
                None => true,
                Some(at) => at < *cutoff,
            },
            Self::Reserved => record.reserved_at.is_some(),
            Self::AccessMode(mode) => record.access_mode == *mode,
            Self::NotAccessMode(mode) => record.access_mode != *mode,
            Self::SessionActive(t) => record.pin.as_ref().is_some_and(|p| p.session_active(*t)),
            Self::NotLocked(t) => record.pin.as_ref().is_some_and(|p| !p.is_locked(*t)),
            Self::AttemptsRemaining => record.pin.as_ref().is_some_and(|p| p.attempts_left > 0),
            Self::LockedUntil(expected) => record
                .pin
                .as_ref()
                .is_some_and(|p| p.locked_until == *expected),
            Self::All(conditions) => conditions.iter().all(|c| c.holds(record)),
        }
    }
}

/// Field-level change applied atomically with its condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Reserve { at: i64 },
    MarkDownloaded { at: i64 },
    /// Initialise-if-absent then add one.
    IncrementDownloadCount { at: i64 },
    OpenSession { started: i64, expires: i64 },
    CloseSession,
    /// Restore attempts to `max` and clear the lockout.
    ResetAttempts { max: u32 },
    /// Spend one PIN attempt; spending the last one sets `locked_until`.
    ConsumeAttempt { lock_until: i64 },
    IncrementReportCount,
}

impl Mutation {
    pub fn apply(&self, record: &mut SecretRecord) {
        match self {
            Self::Reserve { at } => record.reserved_at = Some(*at),
            Self::MarkDownloaded { at } => {
                record.downloaded = true;
                record.downloaded_at = Some(*at);
            }
            Self::IncrementDownloadCount { at } => {
                record.download_count = Some(record.download_count.unwrap_or(0) + 1);
                record.last_downloaded_at = Some(*at);
            }
            Self::OpenSession { started, expires } => {
                if let Some(pin) = record.pin.as_mut() {
                    pin.session_started = Some(*started);
                    pin.session_expires = Some(*expires);
                }
            }
            Self::CloseSession => {
                if let Some(pin) = record.pin.as_mut() {
                    pin.session_expires = None;
                }
            }
            Self::ResetAttempts { max } => {
                if let Some(pin) = record.pin.as_mut() {
                    pin.attempts_left = *max;
                    pin.locked_until = None;
                }
            }
            Self::ConsumeAttempt { lock_until } => {
                if let Some(pin) = record.pin.as_mut() {
                    pin.attempts_left = pin.attempts_left.saturating_sub(1);
                    if pin.attempts_left == 0 {
                        pin.locked_until = Some(*lock_until);
                    }
                }
            }
            Self::IncrementReportCount => {
                record.report_count = record.report_count.saturating_add(1);
            }
        }
    }
}

/// One page of a full scan, in key order.
#[derive(Debug, Default)]
pub struct Page {
    pub records: Vec<SecretRecord>,
    /// First key of the following page, `None` when the scan is complete.
    pub next_cursor: Option<String>,
}

/// Strongly-consistent single-row store.
pub trait KvStore: Send + Sync {
    /// Unconditional insert-or-overwrite.
    fn put(&self, record: &SecretRecord) -> Result<(), StoreError>;

    /// Insert only when no record with this id exists, else `ConditionFailed`.
    fn put_if_absent(&self, record: &SecretRecord) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<SecretRecord>, StoreError>;

    /// Apply `mutations` if `condition` holds, returning the new record.
    fn update_if(
        &self,
        id: &str,
        condition: &Condition,
        mutations: &[Mutation],
    ) -> Result<SecretRecord, StoreError>;

    /// Idempotent; returns whether a record was removed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Up to `limit` records starting at `cursor` (inclusive).
    fn scan(&self, cursor: Option<&str>, limit: usize) -> Result<Page, StoreError>;

    /// Atomically add each delta to `key.field` (absent counts start at zero).
    /// Returns the new values in input order.
    fn increment_counters(&self, key: &str, deltas: &[(&str, u64)]) -> Result<Vec<u64>, StoreError>;

    /// Current values, zero for counters never written.
    fn read_counters(&self, key: &str, fields: &[&str]) -> Result<Vec<u64>, StoreError>;
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Wraps a real store and fails selected operations on demand.
    pub struct FaultyStore {
        inner: Arc<dyn KvStore>,
        fail_counters: AtomicBool,
        fail_updates: AtomicBool,
    }

    impl FaultyStore {
        pub fn new(inner: Arc<dyn KvStore>) -> Self {
            Self {
                inner,
                fail_counters: AtomicBool::new(false),
                fail_updates: AtomicBool::new(false),
            }
        }

        pub fn fail_counters(&self, on: bool) {
            self.fail_counters.store(on, Ordering::SeqCst);
        }

        /// Every `update_if` reports a lost condition, as under constant contention.
        pub fn fail_updates(&self, on: bool) {
            self.fail_updates.store(on, Ordering::SeqCst);
        }
    }

    impl KvStore for FaultyStore {
        fn put(&self, record: &SecretRecord) -> Result<(), StoreError> {
            self.inner.put(record)
        }

        fn put_if_absent(&self, record: &SecretRecord) -> Result<(), StoreError> {
            self.inner.put_if_absent(record)
        }

        fn get(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
            self.inner.get(id)
        }

        fn update_if(
            &self,
            id: &str,
            condition: &Condition,
            mutations: &[Mutation],
        ) -> Result<SecretRecord, StoreError> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(StoreError::ConditionFailed);
            }
            self.inner.update_if(id, condition, mutations)
        }

        fn delete(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete(id)
        }

        fn scan(&self, cursor: Option<&str>, limit: usize) -> Result<Page, StoreError> {
            self.inner.scan(cursor, limit)
        }

        fn increment_counters(&self, key: &str, deltas: &[(&str, u64)]) -> Result<Vec<u64>, StoreError> {
            if self.fail_counters.load(Ordering::SeqCst) {
                return Err(StoreError::Backend(anyhow::anyhow!("counters table unavailable")));
            }
            self.inner.increment_counters(key, deltas)
        }

        fn read_counters(&self, key: &str, fields: &[&str]) -> Result<Vec<u64>, StoreError> {
            self.inner.read_counters(key, fields)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{DraftAccess, DraftContent, RecordDraft};

    fn pin_record() -> SecretRecord {
        let draft = RecordDraft {
            content: DraftContent::File { size: 10 },
            access: DraftAccess::Pin {
                pin_hash: "h".into(),
                salt: "s".into(),
            },
            ttl_seconds: 100,
            ip_hash: None,
        };
        SecretRecord::new("000001", &draft, 0, 2).unwrap()
    }

    #[test]
    fn reservation_claimable_respects_cutoff() {
        let mut r = pin_record();
        assert!(Condition::ReservationClaimable { cutoff: 10 }.holds(&r));
        r.reserved_at = Some(10);
        assert!(!Condition::ReservationClaimable { cutoff: 10 }.holds(&r));
        assert!(Condition::ReservationClaimable { cutoff: 11 }.holds(&r));
    }

    #[test]
    fn all_requires_every_condition() {
        let r = pin_record();
        let c = Condition::all([Condition::NotDownloaded, Condition::ExpiresAfter(99)]);
        assert!(c.holds(&r));
        let c = Condition::all([Condition::NotDownloaded, Condition::ExpiresAfter(100)]);
        assert!(!c.holds(&r));
    }

    #[test]
    fn consume_attempt_locks_on_last() {
        let mut r = pin_record();
        Mutation::ConsumeAttempt { lock_until: 500 }.apply(&mut r);
        assert_eq!(r.pin.as_ref().unwrap().attempts_left, 1);
        assert!(r.pin.as_ref().unwrap().locked_until.is_none());
        Mutation::ConsumeAttempt { lock_until: 500 }.apply(&mut r);
        let pin = r.pin.as_ref().unwrap();
        assert_eq!(pin.attempts_left, 0);
        assert_eq!(pin.locked_until, Some(500));
        assert!(!Condition::AttemptsRemaining.holds(&r));
        assert!(!Condition::NotLocked(499).holds(&r));
        assert!(Condition::NotLocked(500).holds(&r));
    }

    #[test]
    fn reset_attempts_clears_lockout() {
        let mut r = pin_record();
        Mutation::ConsumeAttempt { lock_until: 5 }.apply(&mut r);
        Mutation::ConsumeAttempt { lock_until: 5 }.apply(&mut r);
        Mutation::ResetAttempts { max: 2 }.apply(&mut r);
        let pin = r.pin.as_ref().unwrap();
        assert_eq!(pin.attempts_left, 2);
        assert!(pin.locked_until.is_none());
        assert!(Condition::LockedUntil(None).holds(&r));
    }

    #[test]
    fn download_count_initialises_when_absent() {
        let mut r = pin_record();
        r.download_count = None;
        Mutation::IncrementDownloadCount { at: 7 }.apply(&mut r);
        assert_eq!(r.download_count, Some(1));
        assert_eq!(r.last_downloaded_at, Some(7));
    }

    #[test]
    fn pin_conditions_fail_on_non_pin_records() {
        let mut r = pin_record();
        r.pin = None;
        assert!(!Condition::SessionActive(0).holds(&r));
        assert!(!Condition::AttemptsRemaining.holds(&r));
        assert!(!Condition::NotLocked(0).holds(&r));
    }
}
