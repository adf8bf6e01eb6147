//! Record lifecycle state machine.
//!
//! Every transition is a single [`KvStore::update_if`] whose [`Condition`] encodes
//! the precondition, so concurrent callers race inside the store and at most one
//! wins. After a failed condition the record is re-read only to pick the error to
//! report; that read never feeds another write, except in
//! [`Lifecycle::pin_initiate_session`], which compares-and-swaps on the lockout it
//! observed and retries once.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::stats::{read_statistics, Statistics, StatsAggregator};
use crate::store::kv::{Condition, KvStore, Mutation, StoreError};
use crate::store::model::{
    new_share_id, AccessMode, DraftAccess, PinState, RecordDraft, SecretRecord, ValidationError,
};
use crate::store::pin;

/// Tunables for the state machine. Durations are seconds.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a reservation blocks other downloaders.
    pub reservation_timeout: i64,
    /// How long a PIN session accepts verification.
    pub session_timeout: i64,
    pub pin_max_attempts: u32,
    pub lockout_duration: i64,
    /// Key of the statistics aggregate.
    pub stats_key: String,
    /// Candidate ids tried before giving up on a PIN share.
    pub pin_id_retries: u32,
    /// Report count at which a share is flagged for moderation.
    pub report_threshold: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reservation_timeout: 600,
            session_timeout: 60,
            pin_max_attempts: 3,
            lockout_duration: 43_200,
            stats_key: "STATS".into(),
            pin_id_retries: 5,
            report_threshold: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("share not found")]
    NotFound,
    #[error("share has expired")]
    Expired,
    #[error("share has already been downloaded")]
    AlreadyConsumed,
    #[error("download already in progress, try again later")]
    Reserved,
    #[error("PIN session expired or not started")]
    SessionExpired,
    #[error("too many incorrect PIN attempts, try again in {retry_after_secs} seconds")]
    Locked { retry_after_secs: i64 },
    #[error("incorrect PIN, {attempts_left} attempts left")]
    IncorrectPin { attempts_left: u32 },
    #[error("could not allocate a share id after {attempts} attempts")]
    IdExhausted { attempts: u32 },
    #[error("invalid operation: {0}")]
    InvalidState(String),
    #[error("storage unavailable")]
    StoreUnavailable(#[source] anyhow::Error),
}

impl LifecycleError {
    /// Stable snake_case identifier for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AlreadyConsumed => "already_consumed",
            Self::Reserved => "reserved",
            Self::SessionExpired => "session_expired",
            Self::Locked { .. } => "locked",
            Self::IncorrectPin { .. } => "incorrect_pin",
            Self::IdExhausted { .. } => "id_exhausted",
            Self::InvalidState(_) => "invalid_state",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Transient failures a client may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Reserved | Self::Locked { .. } | Self::SessionExpired | Self::IdExhausted { .. }
        )
    }

    fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Backend(e) => Self::StoreUnavailable(e),
            StoreError::ConditionFailed => {
                Self::StoreUnavailable(anyhow::anyhow!("unclassified conditional write failure"))
            }
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Result of opening a PIN session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSession {
    pub attempts_left: u32,
    pub session_expires: i64,
}

pub struct Lifecycle {
    store: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    stats: StatsAggregator,
    config: LifecycleConfig,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        stats: StatsAggregator,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            stats,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Validate `pin` and derive the access input for a new PIN share.
    pub fn pin_access(pin: &str) -> LifecycleResult<DraftAccess> {
        pin::validate_pin(pin)?;
        let salt = pin::generate_salt();
        let pin_hash = pin::hash_pin(pin, &salt).map_err(LifecycleError::StoreUnavailable)?;
        Ok(DraftAccess::Pin { pin_hash, salt })
    }

    // ── Create ──────────────────────────────────────────────────────────────

    /// Persist a new record. PIN shares get a six-digit id inserted only if unused.
    pub fn create(&self, draft: &RecordDraft) -> LifecycleResult<SecretRecord> {
        let record = match draft.access {
            DraftAccess::Pin { .. } => self.create_pin(draft, pin::new_pin_id)?,
            DraftAccess::OneTime | DraftAccess::Multi(_) => {
                let record = SecretRecord::new(
                    &new_share_id(),
                    draft,
                    self.now(),
                    self.config.pin_max_attempts,
                )?;
                self.store.put(&record)?;
                record
            }
        };
        info!(
            id = %record.id,
            access_mode = %record.access_mode,
            size = record.file_size,
            expires_at = record.expires_at,
            "share created"
        );
        Ok(record)
    }

    fn create_pin(
        &self,
        draft: &RecordDraft,
        mut next_id: impl FnMut() -> String,
    ) -> LifecycleResult<SecretRecord> {
        let attempts = self.config.pin_id_retries.max(1);
        for attempt in 1..=attempts {
            let record =
                SecretRecord::new(&next_id(), draft, self.now(), self.config.pin_max_attempts)?;
            match self.store.put_if_absent(&record) {
                Ok(()) => return Ok(record),
                Err(StoreError::ConditionFailed) => {
                    debug!(attempt, "PIN share id collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(attempts, "exhausted PIN share id candidates");
        Err(LifecycleError::IdExhausted { attempts })
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Fetch a live record. Expired records are reported as such until swept.
    pub fn get(&self, id: &str) -> LifecycleResult<SecretRecord> {
        let record = self.store.get(id)?.ok_or(LifecycleError::NotFound)?;
        if record.is_expired(self.now()) {
            return Err(LifecycleError::Expired);
        }
        Ok(record)
    }

    pub fn statistics(&self) -> LifecycleResult<Statistics> {
        Ok(read_statistics(self.store.as_ref(), &self.config.stats_key)?)
    }

    // ── One-time consumption ────────────────────────────────────────────────

    /// Claim a one-time share for download.
    pub fn reserve(&self, id: &str) -> LifecycleResult<SecretRecord> {
        let now = self.now();
        let condition = Condition::all([
            Condition::AccessMode(AccessMode::OneTime),
            Condition::NotDownloaded,
            Condition::ExpiresAfter(now),
            Condition::ReservationClaimable {
                cutoff: self.reservation_cutoff(now),
            },
        ]);
        let record = self
            .transition(id, now, &condition, &[Mutation::Reserve { at: now }], |r| {
                self.one_time_failure(r)
            })?;
        debug!(id, "share reserved");
        Ok(record)
    }

    /// Consume a one-time share without the reserve/confirm handshake.
    pub fn mark_downloaded(&self, id: &str) -> LifecycleResult<SecretRecord> {
        let now = self.now();
        let condition = Condition::all([
            Condition::AccessMode(AccessMode::OneTime),
            Condition::NotDownloaded,
            Condition::ExpiresAfter(now),
            Condition::ReservationClaimable {
                cutoff: self.reservation_cutoff(now),
            },
        ]);
        let record = self.transition(
            id,
            now,
            &condition,
            &[Mutation::MarkDownloaded { at: now }],
            |r| self.one_time_failure(r),
        )?;
        self.stats.record_download(record.file_size);
        info!(id, "share downloaded");
        Ok(record)
    }

    /// Finish a download started by [`reserve`](Self::reserve) or a PIN verification.
    pub fn confirm_download(&self, id: &str) -> LifecycleResult<SecretRecord> {
        let now = self.now();
        let condition = Condition::all([
            Condition::NotAccessMode(AccessMode::Multi),
            Condition::NotDownloaded,
            Condition::Reserved,
            Condition::ExpiresAfter(now),
        ]);
        let record = self.transition(
            id,
            now,
            &condition,
            &[Mutation::MarkDownloaded { at: now }],
            |r| {
                if r.access_mode == AccessMode::Multi {
                    LifecycleError::invalid("multi-access shares are never confirmed")
                } else if r.downloaded {
                    LifecycleError::AlreadyConsumed
                } else {
                    LifecycleError::invalid("no download reservation to confirm")
                }
            },
        )?;
        self.stats.record_download(record.file_size);
        info!(id, access_mode = %record.access_mode, "download confirmed");
        Ok(record)
    }

    // ── Multi-access ────────────────────────────────────────────────────────

    /// Count one more download of a multi-access share.
    pub fn vault_increment(&self, id: &str) -> LifecycleResult<SecretRecord> {
        let now = self.now();
        let condition = Condition::all([
            Condition::AccessMode(AccessMode::Multi),
            Condition::ExpiresAfter(now),
        ]);
        let record = self.transition(
            id,
            now,
            &condition,
            &[Mutation::IncrementDownloadCount { at: now }],
            |r| {
                LifecycleError::invalid(format!(
                    "{} shares do not support vault downloads",
                    r.access_mode
                ))
            },
        )?;
        self.stats.record_download(record.file_size);
        debug!(id, download_count = record.download_count.unwrap_or(0), "vault download");
        Ok(record)
    }

    // ── PIN gate ────────────────────────────────────────────────────────────

    /// Open a short verification window, resetting an elapsed lockout.
    pub fn pin_initiate_session(&self, id: &str) -> LifecycleResult<PinSession> {
        // One retry: a concurrent caller may have changed the lockout between read and write.
        for _ in 0..2 {
            let now = self.now();
            let record = self.store.get(id)?.ok_or(LifecycleError::NotFound)?;
            let pin = session_gate(&record, now)?;

            let mut mutations = Vec::with_capacity(2);
            if pin.lockout_elapsed(now) {
                mutations.push(Mutation::ResetAttempts {
                    max: self.config.pin_max_attempts,
                });
            }
            let expires = now + self.config.session_timeout;
            mutations.push(Mutation::OpenSession {
                started: now,
                expires,
            });

            let condition = Condition::all([
                Condition::AccessMode(AccessMode::Pin),
                Condition::NotDownloaded,
                Condition::ExpiresAfter(now),
                Condition::LockedUntil(pin.locked_until),
            ]);
            match self.store.update_if(id, &condition, &mutations) {
                Ok(updated) => {
                    let attempts_left = updated.pin.as_ref().map_or(0, |p| p.attempts_left);
                    debug!(id, attempts_left, "PIN session opened");
                    return Ok(PinSession {
                        attempts_left,
                        session_expires: expires,
                    });
                }
                Err(StoreError::ConditionFailed) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        // Both swaps lost to concurrent session changes. Report a definite gate
        // failure if the record moved into one, else the retryable contention error.
        let now = self.now();
        let record = self.store.get(id)?.ok_or(LifecycleError::NotFound)?;
        session_gate(&record, now)?;
        warn!(id, "PIN session contention, giving up");
        Err(LifecycleError::Reserved)
    }

    /// Check `pin` inside an open session. A match reserves the share and closes the session.
    pub fn pin_verify(&self, id: &str, candidate: &str) -> LifecycleResult<SecretRecord> {
        pin::validate_pin(candidate)?;
        let now = self.now();
        let record = self.store.get(id)?.ok_or(LifecycleError::NotFound)?;
        let state = verify_gate(&record, now)?;

        let matches = pin::verify_pin(candidate, &state.salt, &state.pin_hash)
            .map_err(LifecycleError::StoreUnavailable)?;

        if !matches {
            return Err(self.spend_attempt(id, now));
        }

        if record.downloaded {
            return Err(LifecycleError::AlreadyConsumed);
        }
        // The PIN holder may re-verify while an earlier reservation of theirs is live.
        let condition = Condition::all([
            Condition::AccessMode(AccessMode::Pin),
            Condition::NotDownloaded,
            Condition::ExpiresAfter(now),
        ]);
        let mutations = [Mutation::Reserve { at: now }, Mutation::CloseSession];
        let reserved = self.transition(id, now, &condition, &mutations, |_| {
            LifecycleError::AlreadyConsumed
        })?;
        info!(id, "PIN verified, share reserved");
        Ok(reserved)
    }

    fn spend_attempt(&self, id: &str, now: i64) -> LifecycleError {
        let condition = Condition::all([
            Condition::AccessMode(AccessMode::Pin),
            Condition::ExpiresAfter(now),
            Condition::SessionActive(now),
            Condition::NotLocked(now),
            Condition::AttemptsRemaining,
        ]);
        let lock_until = now + self.config.lockout_duration;
        match self
            .store
            .update_if(id, &condition, &[Mutation::ConsumeAttempt { lock_until }])
        {
            Ok(updated) => {
                let attempts_left = updated.pin.as_ref().map_or(0, |p| p.attempts_left);
                if attempts_left == 0 {
                    warn!(id, locked_until = lock_until, "PIN attempts exhausted, share locked");
                    LifecycleError::Locked {
                        retry_after_secs: self.config.lockout_duration,
                    }
                } else {
                    debug!(id, attempts_left, "incorrect PIN");
                    LifecycleError::IncorrectPin { attempts_left }
                }
            }
            Err(StoreError::ConditionFailed) => match self.store.get(id) {
                Ok(Some(r)) => match verify_gate(&r, now) {
                    Err(e) => e,
                    Ok(_) => LifecycleError::Reserved,
                },
                Ok(None) => LifecycleError::NotFound,
                Err(e) => e.into(),
            },
            Err(e) => e.into(),
        }
    }

    // ── Reports and deletion ────────────────────────────────────────────────

    /// Count an abuse report. Crossing the threshold is logged, not enforced.
    pub fn increment_report_count(&self, id: &str) -> LifecycleResult<u32> {
        let now = self.now();
        let record = self.transition(
            id,
            now,
            &Condition::ExpiresAfter(now),
            &[Mutation::IncrementReportCount],
            |_| LifecycleError::Expired,
        )?;
        let count = record.report_count;
        if count >= self.config.report_threshold {
            error!(
                id,
                report_count = count,
                threshold = self.config.report_threshold,
                "share reached abuse report threshold"
            );
        } else {
            info!(id, report_count = count, "share reported");
        }
        Ok(count)
    }

    /// Remove a record and its blob. Returns whether a record existed.
    pub fn delete(&self, id: &str) -> LifecycleResult<bool> {
        if let Some(record) = self.store.get(id)? {
            if let Some(key) = record.blob_key() {
                self.blobs
                    .delete(key)
                    .map_err(LifecycleError::StoreUnavailable)?;
            }
        }
        let existed = self.store.delete(id)?;
        if existed {
            info!(id, "share deleted");
        }
        Ok(existed)
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn reservation_cutoff(&self, now: i64) -> i64 {
        now - self.config.reservation_timeout
    }

    fn one_time_failure(&self, record: &SecretRecord) -> LifecycleError {
        if record.access_mode != AccessMode::OneTime {
            LifecycleError::invalid(format!(
                "{} shares cannot be reserved directly",
                record.access_mode
            ))
        } else if record.downloaded {
            LifecycleError::AlreadyConsumed
        } else {
            // A live reservation, or one that lapsed between the write and this read.
            LifecycleError::Reserved
        }
    }

    /// Run one conditional transition. On failure re-read to classify:
    /// missing and expired come first, then `classify` decides.
    fn transition(
        &self,
        id: &str,
        now: i64,
        condition: &Condition,
        mutations: &[Mutation],
        classify: impl FnOnce(&SecretRecord) -> LifecycleError,
    ) -> LifecycleResult<SecretRecord> {
        match self.store.update_if(id, condition, mutations) {
            Ok(record) => Ok(record),
            Err(StoreError::ConditionFailed) => {
                let current = self.store.get(id)?;
                Err(match current {
                    None => LifecycleError::NotFound,
                    Some(r) if r.is_expired(now) => LifecycleError::Expired,
                    Some(r) => classify(&r),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Checks shared by session opening: mode, expiry, consumption, lockout.
fn session_gate(record: &SecretRecord, now: i64) -> LifecycleResult<&PinState> {
    let pin = pin_state(record)?;
    if record.is_expired(now) {
        return Err(LifecycleError::Expired);
    }
    if record.downloaded {
        return Err(LifecycleError::AlreadyConsumed);
    }
    if pin.is_locked(now) {
        return Err(LifecycleError::Locked {
            retry_after_secs: pin.retry_after(now),
        });
    }
    Ok(pin)
}

/// Checks before comparing a PIN: mode, expiry, lockout, session, attempts.
fn verify_gate(record: &SecretRecord, now: i64) -> LifecycleResult<&PinState> {
    let pin = pin_state(record)?;
    if record.is_expired(now) {
        return Err(LifecycleError::Expired);
    }
    if pin.is_locked(now) {
        return Err(LifecycleError::Locked {
            retry_after_secs: pin.retry_after(now),
        });
    }
    if !pin.session_active(now) {
        return Err(LifecycleError::SessionExpired);
    }
    if pin.attempts_left == 0 {
        return Err(LifecycleError::Locked {
            retry_after_secs: pin.retry_after(now),
        });
    }
    Ok(pin)
}

fn pin_state(record: &SecretRecord) -> LifecycleResult<&PinState> {
    match (&record.access_mode, &record.pin) {
        (AccessMode::Pin, Some(pin)) => Ok(pin),
        _ => Err(LifecycleError::invalid(format!(
            "{} shares have no PIN",
            record.access_mode
        ))),
    }
}
