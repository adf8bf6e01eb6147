use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::kv::{Condition, KvStore, Mutation, Page, StoreError};
use super::model::SecretRecord;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Leading byte of every encoded record, bumped when the layout changes.
const RECORD_V1_MARKER: u8 = 0x01;

/// Thread-safe handle to the redb store.
///
/// redb runs one write transaction at a time, so every `update_if` evaluates its
/// condition against the latest committed record and no two callers can both win.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(RECORDS)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    fn insert(&self, record: &SecretRecord, only_if_absent: bool) -> Result<bool> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(RECORDS)?;
            if only_if_absent && table.get(record.id.as_str())?.is_some() {
                false
            } else {
                table.insert(record.id.as_str(), bytes.as_slice())?;
                true
            }
        };
        if inserted {
            write_txn.commit()?;
            debug!(id = %record.id, "stored record");
        } else {
            write_txn.abort()?;
        }
        Ok(inserted)
    }

    fn load(&self, id: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|b| decode(&b)).transpose()
    }

    /// Returns `None` when the record is absent or the condition fails.
    fn conditional_update(
        &self,
        id: &str,
        condition: &Condition,
        mutations: &[Mutation],
    ) -> Result<Option<SecretRecord>> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(RECORDS)?;

            // Copy the bytes out so the AccessGuard (which borrows `table`) is
            // dropped before the insert.
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;
                    if condition.holds(&record) {
                        for m in mutations {
                            m.apply(&mut record);
                        }
                        let bytes = encode(&record)?;
                        table.insert(id, bytes.as_slice())?;
                        Some(record)
                    } else {
                        None
                    }
                }
            }
        };
        if updated.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(updated)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(RECORDS)?;
            // Bind first so the AccessGuard drops before `table` does.
            let existed = table.remove(id)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn page(&self, cursor: Option<&str>, limit: usize) -> Result<Page> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;

        let iter = match cursor {
            Some(start) => table.range(start..)?,
            None => table.iter()?,
        };

        let mut page = Page::default();
        for item in iter {
            let (k, v) = item?;
            if page.records.len() == limit {
                page.next_cursor = Some(k.value().to_owned());
                break;
            }
            page.records.push(decode(v.value())?);
        }
        Ok(page)
    }

    fn add_counters(&self, key: &str, deltas: &[(&str, u64)]) -> Result<Vec<u64>> {
        let write_txn = self.db.begin_write()?;
        let values = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let mut values = Vec::with_capacity(deltas.len());
            for (field, delta) in deltas {
                let name = counter_name(key, field);
                let current = counters.get(name.as_str())?.map(|g| g.value()).unwrap_or(0);
                let next = current.saturating_add(*delta);
                counters.insert(name.as_str(), next)?;
                values.push(next);
            }
            values
        };
        write_txn.commit()?;
        Ok(values)
    }

    fn counters(&self, key: &str, fields: &[&str]) -> Result<Vec<u64>> {
        let read_txn = self.db.begin_read()?;
        let counters = read_txn.open_table(COUNTERS)?;
        fields
            .iter()
            .map(|field| {
                let name = counter_name(key, field);
                Ok(counters.get(name.as_str())?.map(|g| g.value()).unwrap_or(0))
            })
            .collect()
    }
}

impl KvStore for RedbStore {
    fn put(&self, record: &SecretRecord) -> Result<(), StoreError> {
        self.insert(record, false)?;
        Ok(())
    }

    fn put_if_absent(&self, record: &SecretRecord) -> Result<(), StoreError> {
        if self.insert(record, true)? {
            Ok(())
        } else {
            Err(StoreError::ConditionFailed)
        }
    }

    fn get(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.load(id)?)
    }

    fn update_if(
        &self,
        id: &str,
        condition: &Condition,
        mutations: &[Mutation],
    ) -> Result<SecretRecord, StoreError> {
        self.conditional_update(id, condition, mutations)?
            .ok_or(StoreError::ConditionFailed)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.remove(id)?)
    }

    fn scan(&self, cursor: Option<&str>, limit: usize) -> Result<Page, StoreError> {
        Ok(self.page(cursor, limit.max(1))?)
    }

    fn increment_counters(&self, key: &str, deltas: &[(&str, u64)]) -> Result<Vec<u64>, StoreError> {
        Ok(self.add_counters(key, deltas)?)
    }

    fn read_counters(&self, key: &str, fields: &[&str]) -> Result<Vec<u64>, StoreError> {
        Ok(self.counters(key, fields)?)
    }
}

fn counter_name(key: &str, field: &str) -> String {
    format!("{key}.{field}")
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        None => anyhow::bail!("empty record"),
        Some((&RECORD_V1_MARKER, rest)) => {
            let (record, _) = bincode::serde::decode_from_slice(rest, bincode::config::standard())
                .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format marker {marker:#04x}"),
    }
}
