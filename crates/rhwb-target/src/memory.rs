//! In-process target table with the same staging and commit behavior as a
//! Postgres transaction. Used to exercise pipelines without a database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::{
    upsert_in_batches, TargetConnection, TargetConnector, TargetError, UpsertRecord, UpsertSink,
};

/// A committed row plus the commit number that last wrote it, standing in for
/// the server-side `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow<R> {
    pub record: R,
    pub updated_in: usize,
}

#[derive(Debug)]
struct TableState<R: UpsertRecord> {
    rows: BTreeMap<R::Key, StoredRow<R>>,
    commits: usize,
    connections: usize,
    closes: usize,
    fail_on_batch: Option<usize>,
}

#[derive(Debug)]
pub struct MemoryTable<R: UpsertRecord> {
    state: Arc<Mutex<TableState<R>>>,
}

impl<R: UpsertRecord> Clone for MemoryTable<R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<R: UpsertRecord> Default for MemoryTable<R> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState {
                rows: BTreeMap::new(),
                commits: 0,
                connections: 0,
                closes: 0,
                fail_on_batch: None,
            })),
        }
    }
}

impl<R: UpsertRecord + Clone> MemoryTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next transaction rejects its `batch`-th batch (1-based).
    pub fn fail_on_batch(self, batch: usize) -> Self {
        self.lock().fail_on_batch = Some(batch);
        self
    }

    fn lock(&self) -> MutexGuard<'_, TableState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().rows.is_empty()
    }

    pub fn get(&self, key: &R::Key) -> Option<StoredRow<R>> {
        self.lock().rows.get(key).cloned()
    }

    /// Committed records ordered by natural key.
    pub fn records(&self) -> Vec<R> {
        self.lock()
            .rows
            .values()
            .map(|row| row.record.clone())
            .collect()
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }
}

#[async_trait]
impl<R: UpsertRecord + Clone> TargetConnector<R> for MemoryTable<R> {
    type Connection = MemoryConnection<R>;

    async fn connect(&self) -> Result<MemoryConnection<R>, TargetError> {
        self.lock().connections += 1;
        Ok(MemoryConnection {
            table: self.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection<R: UpsertRecord> {
    table: MemoryTable<R>,
}

#[async_trait]
impl<R: UpsertRecord + Clone> TargetConnection<R> for MemoryConnection<R> {
    async fn upsert(&mut self, records: &[R], batch_size: usize) -> Result<usize, TargetError> {
        let mut tx = MemoryTransaction {
            table: &self.table,
            staged: Vec::new(),
            batches: 0,
        };
        upsert_in_batches(&mut tx, records, batch_size).await
    }

    async fn close(self) -> Result<(), TargetError> {
        self.table.lock().closes += 1;
        Ok(())
    }
}

struct MemoryTransaction<'t, R: UpsertRecord> {
    table: &'t MemoryTable<R>,
    staged: Vec<R>,
    batches: usize,
}

#[async_trait]
impl<'t, R: UpsertRecord + Clone> UpsertSink<R> for MemoryTransaction<'t, R> {
    async fn write_batch(&mut self, batch: &[R]) -> Result<u64, TargetError> {
        self.batches += 1;
        // Postgres refuses an ON CONFLICT statement that touches one key twice.
        let mut keys = BTreeSet::new();
        if !batch.iter().all(|record| keys.insert(record.key())) {
            return Err(TargetError::Rejected {
                table: R::TABLE,
                batch: self.batches,
            });
        }
        {
            let mut state = self.table.lock();
            if state.fail_on_batch == Some(self.batches) {
                state.fail_on_batch = None;
                return Err(TargetError::Rejected {
                    table: R::TABLE,
                    batch: self.batches,
                });
            }
        }
        self.staged.extend_from_slice(batch);
        Ok(batch.len() as u64)
    }

    async fn commit(&mut self) -> Result<(), TargetError> {
        let mut state = self.table.lock();
        state.commits += 1;
        let commit_no = state.commits;
        for record in self.staged.drain(..) {
            state.rows.insert(
                record.key(),
                StoredRow {
                    record,
                    updated_in: commit_no,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhwb_core::{QualScoreRecord, RunnerId, SourceTable};

    fn qual(runner: &str, season: i32, meso: i32, score: &str) -> QualScoreRecord {
        QualScoreRecord {
            runner_id: RunnerId::new(runner),
            season,
            meso,
            qual_score: score.to_string(),
            source_table: SourceTable::RhwbMesoScores,
        }
    }

    fn many(count: usize) -> Vec<QualScoreRecord> {
        (0..count)
            .map(|i| qual(&format!("R{i}"), 13, 1, "Q"))
            .collect()
    }

    #[tokio::test]
    async fn rerunning_the_same_records_converges() {
        let table = MemoryTable::new();
        let records = vec![qual("R1", 13, 1, "Q0"), qual("R1", 13, 2, "Q1")];

        let mut conn = table.connect().await.expect("connect");
        assert_eq!(conn.upsert(&records, 500).await.expect("first run"), 2);
        let first = table.get(&records[0].key()).expect("row");

        assert_eq!(conn.upsert(&records, 500).await.expect("second run"), 2);
        let second = table.get(&records[0].key()).expect("row");
        conn.close().await.expect("close");

        assert_eq!(table.len(), 2);
        assert_eq!(first.record, second.record);
        assert!(second.updated_in > first.updated_in);
    }

    #[tokio::test]
    async fn later_values_overwrite_non_key_columns() {
        let table = MemoryTable::new();
        let mut conn = table.connect().await.expect("connect");
        conn.upsert(&[qual("R1", 13, 1, "old")], 500)
            .await
            .expect("first run");

        let mut newer = qual("R1", 13, 1, "new");
        newer.source_table = SourceTable::RhwbCoachInput;
        conn.upsert(&[newer.clone()], 500).await.expect("second run");

        assert_eq!(table.records(), vec![newer]);
    }

    #[tokio::test]
    async fn batches_are_committed_once_at_the_end() {
        let table = MemoryTable::new();
        let mut conn = table.connect().await.expect("connect");
        let written = conn.upsert(&many(1201), 500).await.expect("upsert");

        assert_eq!(written, 1201);
        assert_eq!(table.len(), 1201);
        assert_eq!(table.commits(), 1);
    }

    #[tokio::test]
    async fn failing_batch_leaves_nothing_committed() {
        let table = MemoryTable::new().fail_on_batch(3);
        let mut conn = table.connect().await.expect("connect");
        let err = conn.upsert(&many(1201), 500).await.unwrap_err();

        assert!(matches!(err, TargetError::Rejected { batch: 3, .. }));
        assert!(table.is_empty());
        assert_eq!(table.commits(), 0);
    }

    #[tokio::test]
    async fn repeated_key_in_one_batch_is_rejected() {
        let table = MemoryTable::new();
        let mut conn = table.connect().await.expect("connect");
        let records = vec![qual("R1", 14, 1, "a"), qual("R1", 14, 1, "b")];

        let err = conn.upsert(&records, 500).await.unwrap_err();

        assert!(matches!(err, TargetError::Rejected { batch: 1, .. }));
        assert!(table.is_empty());
        assert_eq!(table.commits(), 0);
    }

    #[tokio::test]
    async fn repeated_key_across_batches_is_accepted() {
        let table = MemoryTable::new();
        let mut conn = table.connect().await.expect("connect");
        let records = vec![qual("R1", 14, 1, "a"), qual("R1", 14, 1, "b")];

        assert_eq!(conn.upsert(&records, 1).await.expect("upsert"), 2);
        assert_eq!(table.records(), vec![qual("R1", 14, 1, "b")]);
    }

    #[tokio::test]
    async fn empty_input_skips_the_transaction() {
        let table: MemoryTable<QualScoreRecord> = MemoryTable::new();
        let mut conn = table.connect().await.expect("connect");

        assert_eq!(conn.upsert(&[], 500).await.expect("upsert"), 0);
        assert_eq!(table.commits(), 0);
    }
}
