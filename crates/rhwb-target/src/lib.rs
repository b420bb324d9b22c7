//! Batched, conflict-resolving writes into the Cloud SQL target tables.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use rhwb_core::{QualScoreRecord, RunnerId, VeerFeedbackRecord};
use sqlx::postgres::{PgConnectOptions, Postgres};
use sqlx::query_builder::Separated;
use sqlx::{Connection, PgConnection, QueryBuilder, Transaction};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub mod memory;

pub use memory::{MemoryConnection, MemoryTable, StoredRow};

pub const CRATE_NAME: &str = "rhwb-target";

/// Records per `INSERT ... ON CONFLICT` statement.
pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("connecting to database {database}: {source}")]
    Connect {
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("upserting {rows} rows into {table}: {source}")]
    Batch {
        table: &'static str,
        rows: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("committing {table}: {source}")]
    Commit {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("transaction on {0} already finished")]
    TransactionFinished(&'static str),
    #[error("batch {batch} rejected by {table}")]
    Rejected { table: &'static str, batch: usize },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Connection settings for the target database. `host` may be a host name or
/// an absolute Unix socket directory such as `/cloudsql/<instance>`.
#[derive(Clone)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl TargetConfig {
    pub fn uses_socket(&self) -> bool {
        self.host.starts_with('/')
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password);
        if self.uses_socket() {
            options.socket(Path::new(&self.host))
        } else {
            options.host(&self.host)
        }
    }
}

/// A normalized record that knows its target table and natural key.
pub trait UpsertRecord: Send + Sync {
    type Key: Ord + Clone + fmt::Debug + Send + Sync;

    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    const CONFLICT_KEY: &'static [&'static str];
    /// Columns overwritten on conflict, besides `updated_at`.
    const UPDATE_COLUMNS: &'static [&'static str];

    fn key(&self) -> Self::Key;

    /// Push one bind per entry of [`Self::COLUMNS`], in order.
    fn bind_row<'args>(&'args self, row: &mut Separated<'_, 'args, Postgres, &'static str>);
}

impl UpsertRecord for QualScoreRecord {
    type Key = (RunnerId, i32, i32);

    const TABLE: &'static str = "qual_scores";
    const COLUMNS: &'static [&'static str] =
        &["runner_id", "season", "meso", "qual_score", "source_table"];
    const CONFLICT_KEY: &'static [&'static str] = &["runner_id", "season", "meso"];
    const UPDATE_COLUMNS: &'static [&'static str] = &["qual_score", "source_table"];

    fn key(&self) -> Self::Key {
        QualScoreRecord::key(self)
    }

    fn bind_row<'args>(&'args self, row: &mut Separated<'_, 'args, Postgres, &'static str>) {
        row.push_bind(self.runner_id.as_str())
            .push_bind(self.season)
            .push_bind(self.meso)
            .push_bind(self.qual_score.as_str())
            .push_bind(self.source_table.as_str());
    }
}

impl UpsertRecord for VeerFeedbackRecord {
    type Key = (String, RunnerId);

    const TABLE: &'static str = "veer_feedback";
    const COLUMNS: &'static [&'static str] = &[
        "message_id",
        "runner_id",
        "feedback",
        "user_question",
        "assistant_response",
        "comment",
        "created_at",
    ];
    const CONFLICT_KEY: &'static [&'static str] = &["message_id", "runner_id"];
    const UPDATE_COLUMNS: &'static [&'static str] =
        &["feedback", "user_question", "assistant_response", "comment"];

    fn key(&self) -> Self::Key {
        VeerFeedbackRecord::key(self)
    }

    fn bind_row<'args>(&'args self, row: &mut Separated<'_, 'args, Postgres, &'static str>) {
        row.push_bind(self.message_id.as_str())
            .push_bind(self.runner_id.as_str())
            .push_bind(self.feedback.as_deref())
            .push_bind(self.user_question.as_deref())
            .push_bind(self.assistant_response.as_deref())
            .push_bind(self.comment.as_deref())
            .push_bind(self.created_at);
    }
}

/// `ON CONFLICT (key) DO UPDATE SET ...` tail shared by every batch of `R`.
pub fn conflict_clause<R: UpsertRecord>() -> String {
    let assignments = R::UPDATE_COLUMNS
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .chain(std::iter::once("updated_at = NOW()".to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        " ON CONFLICT ({}) DO UPDATE SET {assignments}",
        R::CONFLICT_KEY.join(", ")
    )
}

/// Multi-row upsert statement for one batch.
pub fn upsert_statement<R: UpsertRecord>(batch: &[R]) -> QueryBuilder<'_, Postgres> {
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        R::TABLE,
        R::COLUMNS.join(", ")
    ));
    qb.push_values(batch, |mut b, record| record.bind_row(&mut b));
    qb.push(conflict_clause::<R>());
    qb
}

/// Receives batches inside one open transaction.
#[async_trait]
pub trait UpsertSink<R: UpsertRecord>: Send {
    /// Returns the number of rows the batch wrote.
    async fn write_batch(&mut self, batch: &[R]) -> Result<u64, TargetError>;
    async fn commit(&mut self) -> Result<(), TargetError>;
}

/// Write `records` in chunks of `batch_size`, committing once after the last
/// chunk. An error on any chunk returns before the commit.
#[instrument(skip_all, fields(table = R::TABLE, records = records.len()))]
pub async fn upsert_in_batches<R, S>(
    sink: &mut S,
    records: &[R],
    batch_size: usize,
) -> Result<usize, TargetError>
where
    R: UpsertRecord,
    S: UpsertSink<R> + ?Sized,
{
    if records.is_empty() {
        info!("No records to upsert.");
        return Ok(0);
    }

    let batch_size = batch_size.max(1);
    let mut total = 0usize;
    for (index, batch) in records.chunks(batch_size).enumerate() {
        let written = sink.write_batch(batch).await.inspect_err(|err| {
            warn!(batch = index + 1, error = %err, "batch failed; nothing from this run is committed");
        })?;
        total += written as usize;
        info!("Upserted {total}/{} records...", records.len());
    }

    sink.commit().await?;
    Ok(total)
}

/// Opens the single connection used for the upsert phase.
#[async_trait]
pub trait TargetConnector<R: UpsertRecord>: Send + Sync {
    type Connection: TargetConnection<R>;

    async fn connect(&self) -> Result<Self::Connection, TargetError>;
}

#[async_trait]
pub trait TargetConnection<R: UpsertRecord>: Send + Sized {
    async fn upsert(&mut self, records: &[R], batch_size: usize) -> Result<usize, TargetError>;

    async fn close(self) -> Result<(), TargetError>;
}

/// One Postgres connection held for the whole upsert phase.
#[derive(Debug)]
pub struct PgTarget {
    conn: PgConnection,
}

impl PgTarget {
    #[instrument(skip(config), fields(host = %config.host, database = %config.database))]
    pub async fn connect(config: &TargetConfig) -> Result<Self, TargetError> {
        let conn = PgConnection::connect_with(&config.connect_options())
            .await
            .map_err(|source| TargetError::Connect {
                database: config.database.clone(),
                source,
            })?;
        info!("connected to target database");
        Ok(Self { conn })
    }
}

#[async_trait]
impl<R: UpsertRecord> TargetConnector<R> for TargetConfig {
    type Connection = PgTarget;

    async fn connect(&self) -> Result<PgTarget, TargetError> {
        PgTarget::connect(self).await
    }
}

#[async_trait]
impl<R: UpsertRecord> TargetConnection<R> for PgTarget {
    async fn upsert(&mut self, records: &[R], batch_size: usize) -> Result<usize, TargetError> {
        let tx = self.conn.begin().await?;
        let mut sink = PgTransactionSink { tx: Some(tx) };
        // An uncommitted transaction rolls back when the sink drops.
        upsert_in_batches(&mut sink, records, batch_size).await
    }

    async fn close(self) -> Result<(), TargetError> {
        self.conn.close().await?;
        info!("closed target database connection");
        Ok(())
    }
}

struct PgTransactionSink<'c> {
    tx: Option<Transaction<'c, Postgres>>,
}

#[async_trait]
impl<'c, R: UpsertRecord> UpsertSink<R> for PgTransactionSink<'c> {
    async fn write_batch(&mut self, batch: &[R]) -> Result<u64, TargetError> {
        let tx = self
            .tx
            .as_mut()
            .ok_or(TargetError::TransactionFinished(R::TABLE))?;
        let mut qb = upsert_statement(batch);
        let result = qb
            .build()
            .execute(&mut **tx)
            .await
            .map_err(|source| TargetError::Batch {
                table: R::TABLE,
                rows: batch.len(),
                source,
            })?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), TargetError> {
        let tx = self
            .tx
            .take()
            .ok_or(TargetError::TransactionFinished(R::TABLE))?;
        tx.commit().await.map_err(|source| TargetError::Commit {
            table: R::TABLE,
            source,
        })
    }
}
