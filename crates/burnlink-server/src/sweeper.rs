use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::store::{KvStore, SecretRecord, StoreError};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: u64,
    pub errors: u64,
}

/// Deletes records that are expired or consumed, blob first.
///
/// Safe to run concurrently with itself and with live traffic: every delete is
/// idempotent, so a record removed by someone else is simply gone.
pub struct Sweeper {
    store: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    stats_key: String,
    page_size: usize,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        stats_key: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            stats_key: stats_key.into(),
            page_size: page_size.max(1),
        }
    }

    /// One full paginated pass. Fails only if a page cannot be read.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.store.scan(cursor.as_deref(), self.page_size)?;
            for record in &page.records {
                if record.id == self.stats_key || !record.is_finished(now) {
                    continue;
                }
                match self.remove(record) {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        report.errors += 1;
                        warn!(id = %record.id, error = %e, "failed to sweep share");
                    }
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if report.deleted > 0 || report.errors > 0 {
            info!(deleted = report.deleted, errors = report.errors, "sweep complete");
        }
        Ok(report)
    }

    fn remove(&self, record: &SecretRecord) -> anyhow::Result<()> {
        if let Some(key) = record.blob_key() {
            self.blobs.delete(key)?;
        }
        if self.store.delete(&record.id)? {
            debug!(id = %record.id, downloaded = record.downloaded, "swept share");
        }
        Ok(())
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the Tokio runtime.
    pub fn spawn(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep() {
                    warn!(error = %e, "background sweep error");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::clock::testing::ManualClock;
    use crate::store::kv::{Condition, Mutation};
    use crate::store::model::{DraftAccess, DraftContent, RecordDraft};
    use crate::store::RedbStore;
    use tempfile::tempdir;

    const T0: i64 = 1_000_000;

    struct Fixture {
        sweeper: Sweeper,
        store: Arc<dyn KvStore>,
        blobs: Arc<LocalBlobStore>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn fixture(page_size: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(T0));
        let store: Arc<dyn KvStore> = Arc::new(RedbStore::open(&dir.path().join("s.db")).unwrap());
        let blobs = Arc::new(LocalBlobStore::open(dir.path(), "http://x", clock.clone()).unwrap());
        let sweeper = Sweeper::new(store.clone(), blobs.clone(), clock.clone(), "STATS", page_size);
        Fixture {
            sweeper,
            store,
            blobs,
            clock,
            _dir: dir,
        }
    }

    fn put(f: &Fixture, id: &str, content: DraftContent, ttl: i64) -> SecretRecord {
        let draft = RecordDraft {
            content,
            access: DraftAccess::OneTime,
            ttl_seconds: ttl,
            ip_hash: None,
        };
        let record = SecretRecord::new(id, &draft, f.clock.now(), 3).unwrap();
        f.store.put(&record).unwrap();
        record
    }

    fn text() -> DraftContent {
        DraftContent::Text {
            ciphertext: "abc".into(),
        }
    }

    #[test]
    fn deletes_expired_and_consumed_only() {
        let f = fixture(DEFAULT_PAGE_SIZE);
        put(&f, "live", text(), 10_000);
        put(&f, "old", text(), 10);
        put(&f, "used", text(), 10_000);
        f.store
            .update_if("used", &Condition::Always, &[Mutation::MarkDownloaded { at: T0 }])
            .unwrap();

        f.clock.advance(10);
        let report = f.sweeper.sweep().unwrap();
        assert_eq!(report, SweepReport { deleted: 2, errors: 0 });
        assert!(f.store.get("live").unwrap().is_some());
        assert!(f.store.get("old").unwrap().is_none());
        assert!(f.store.get("used").unwrap().is_none());

        // Idempotent.
        assert_eq!(f.sweeper.sweep().unwrap(), SweepReport::default());
    }

    #[test]
    fn removes_blob_with_file_record() {
        let f = fixture(DEFAULT_PAGE_SIZE);
        let r = put(&f, "file-1", DraftContent::File { size: 4 }, 5);
        f.blobs.write(r.blob_key().unwrap(), b"data").unwrap();

        f.clock.advance(5);
        assert_eq!(f.sweeper.sweep().unwrap().deleted, 1);
        assert!(f.blobs.read("files/file-1").unwrap().is_none());
    }

    #[test]
    fn missing_blob_is_not_an_error() {
        let f = fixture(DEFAULT_PAGE_SIZE);
        put(&f, "file-2", DraftContent::File { size: 4 }, 5);
        f.clock.advance(5);
        assert_eq!(f.sweeper.sweep().unwrap(), SweepReport { deleted: 1, errors: 0 });
    }

    #[test]
    fn bad_blob_key_counts_as_error_and_continues() {
        let f = fixture(DEFAULT_PAGE_SIZE);
        // Not a valid blob id, so blob deletion fails.
        put(&f, "bad.id", DraftContent::File { size: 4 }, 5);
        put(&f, "good", text(), 5);
        f.clock.advance(5);

        let report = f.sweeper.sweep().unwrap();
        assert_eq!(report, SweepReport { deleted: 1, errors: 1 });
        assert!(f.store.get("bad.id").unwrap().is_some());
    }

    #[test]
    fn walks_every_page() {
        let f = fixture(3);
        for i in 0..10 {
            put(&f, &format!("r{i:02}"), text(), 1);
        }
        put(&f, "STATS", text(), 1);
        f.clock.advance(1);

        let report = f.sweeper.sweep().unwrap();
        assert_eq!(report.deleted, 10);
        assert!(f.store.get("STATS").unwrap().is_some());
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_on_interval() {
        let f = fixture(DEFAULT_PAGE_SIZE);
        put(&f, "soon", text(), 1);
        f.clock.advance(1);

        let Fixture { sweeper, store, _dir, .. } = f;
        let handle = sweeper.spawn(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        assert!(store.get("soon").unwrap().is_none());
    }
}
