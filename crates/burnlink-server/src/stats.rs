//! Download statistics.
//!
//! Consumption paths hand deltas to a [`StatsAggregator`] and return immediately.
//! A single [`StatsWriter`] applies them to the store's counters, so a slow or
//! failing counter update can never unwind the transition that produced it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::{KvStore, StoreError};

const DOWNLOADS: &str = "downloads";
const TOTAL_BYTES: &str = "total_bytes";

#[derive(Debug, Clone, Copy)]
struct DownloadDelta {
    bytes: u64,
}

/// Totals served by `GET /stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub downloads: u64,
    pub total_bytes: u64,
}

/// Clonable producer side. Never fails the caller.
#[derive(Clone)]
pub struct StatsAggregator {
    tx: mpsc::UnboundedSender<DownloadDelta>,
}

impl StatsAggregator {
    pub fn record_download(&self, bytes: u64) {
        if self.tx.send(DownloadDelta { bytes }).is_err() {
            debug!(bytes, "statistics writer gone; dropping download delta");
        }
    }
}

/// Consumer side, owns the receiver.
pub struct StatsWriter {
    rx: mpsc::UnboundedReceiver<DownloadDelta>,
    store: Arc<dyn KvStore>,
    key: String,
}

/// Build a connected aggregator/writer pair writing under `key`.
pub fn channel(store: Arc<dyn KvStore>, key: impl Into<String>) -> (StatsAggregator, StatsWriter) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StatsAggregator { tx },
        StatsWriter {
            rx,
            store,
            key: key.into(),
        },
    )
}

impl StatsWriter {
    /// Apply deltas until every aggregator has been dropped.
    pub async fn run(mut self) {
        while let Some(delta) = self.rx.recv().await {
            self.apply(delta);
        }
        debug!("statistics writer stopped");
    }

    /// Apply everything queued so far without waiting. Returns the number applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(delta) = self.rx.try_recv() {
            self.apply(delta);
            applied += 1;
        }
        applied
    }

    fn apply(&self, delta: DownloadDelta) {
        let deltas = [(DOWNLOADS, 1), (TOTAL_BYTES, delta.bytes)];
        if let Err(e) = self.store.increment_counters(&self.key, &deltas) {
            warn!(error = %e, bytes = delta.bytes, "failed to update download statistics");
        }
    }
}

/// Read path. Missing counters read as zero.
pub fn read_statistics(store: &dyn KvStore, key: &str) -> Result<Statistics, StoreError> {
    let values = store.read_counters(key, &[DOWNLOADS, TOTAL_BYTES])?;
    Ok(Statistics {
        downloads: values.first().copied().unwrap_or(0),
        total_bytes: values.get(1).copied().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::testing::FaultyStore;
    use crate::store::RedbStore;
    use tempfile::tempdir;

    fn make_store() -> (Arc<dyn KvStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("stats.db")).unwrap();
        (Arc::new(store), dir)
    }

    #[test]
    fn empty_store_reads_zero() {
        let (store, _dir) = make_store();
        assert_eq!(read_statistics(store.as_ref(), "STATS").unwrap(), Statistics::default());
    }

    #[test]
    fn drain_applies_queued_deltas() {
        let (store, _dir) = make_store();
        let (agg, mut writer) = channel(store.clone(), "STATS");
        agg.record_download(100);
        agg.clone().record_download(23);
        assert_eq!(writer.drain(), 2);
        assert_eq!(writer.drain(), 0);

        let stats = read_statistics(store.as_ref(), "STATS").unwrap();
        assert_eq!(stats.downloads, 2);
        assert_eq!(stats.total_bytes, 123);
    }

    #[test]
    fn record_after_writer_dropped_is_silent() {
        let (store, _dir) = make_store();
        let (agg, writer) = channel(store.clone(), "STATS");
        drop(writer);
        agg.record_download(5);
        assert_eq!(read_statistics(store.as_ref(), "STATS").unwrap().downloads, 0);
    }

    #[test]
    fn counter_failure_is_dropped_not_raised() {
        let (inner, _dir) = make_store();
        let faulty = Arc::new(FaultyStore::new(inner));
        let (agg, mut writer) = channel(faulty.clone(), "STATS");

        faulty.fail_counters(true);
        agg.record_download(40);
        assert_eq!(writer.drain(), 1);
        assert_eq!(read_statistics(faulty.as_ref(), "STATS").unwrap(), Statistics::default());

        // Later deltas still land once the store recovers.
        faulty.fail_counters(false);
        agg.record_download(2);
        assert_eq!(writer.drain(), 1);
        let stats = read_statistics(faulty.as_ref(), "STATS").unwrap();
        assert_eq!(stats, Statistics { downloads: 1, total_bytes: 2 });
    }

    #[tokio::test]
    async fn run_stops_when_senders_drop() {
        let (store, _dir) = make_store();
        let (agg, writer) = channel(store.clone(), "STATS");
        let handle = tokio::spawn(writer.run());
        agg.record_download(7);
        drop(agg);
        handle.await.unwrap();

        let stats = read_statistics(store.as_ref(), "STATS").unwrap();
        assert_eq!(stats, Statistics { downloads: 1, total_bytes: 7 });
    }
}
