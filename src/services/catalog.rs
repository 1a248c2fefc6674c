//! Metadata catalog: the `files` table in SQLite.
//!
//! The catalog is the system of record for reference counts. It knows nothing
//! about where objects live on disk; records and objects are related only by
//! the digest stored in `files.hash`.

use crate::models::{
    digest::Digest,
    file_record::{FileRecord, NewFileRecord},
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::debug;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str =
    "id, owner_id, filename, mime_type, size, hash, upload_date, download_count";

#[derive(Clone)]
pub struct Catalog {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    /// Number of upcoming `count_by_digest` calls that fail. Shared by clones.
    #[cfg(test)]
    count_faults: Arc<std::sync::atomic::AtomicUsize>,
}

impl Catalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            #[cfg(test)]
            count_faults: Arc::default(),
        }
    }

    /// Open a pool for `database_url`, creating the database file if missing.
    ///
    /// Acquiring a connection gives up after `acquire_timeout`; callers see
    /// that as a failed catalog operation.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> sqlx::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> sqlx::Result<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    pub async fn insert_record(&self, new: NewFileRecord<'_>) -> sqlx::Result<FileRecord> {
        let sql = format!(
            "INSERT INTO files (owner_id, filename, mime_type, size, hash, upload_date, download_count)
             VALUES (?, ?, ?, ?, ?, ?, 0)
             RETURNING {RECORD_COLUMNS}"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(new.owner_id)
            .bind(new.filename)
            .bind(new.mime_type)
            .bind(new.size)
            .bind(new.hash)
            .bind(new.upload_date)
            .fetch_one(&*self.db)
            .await
    }

    pub async fn find_record(&self, id: i64) -> sqlx::Result<Option<FileRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM files WHERE id = ?");
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await
    }

    /// Page through an owner's records, newest first.
    ///
    /// `before_id` is the id of the last record of the previous page.
    pub async fn list_records(
        &self,
        owner_id: i64,
        before_id: Option<i64>,
        limit: i64,
    ) -> sqlx::Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM files
             WHERE owner_id = ? AND id < ?
             ORDER BY id DESC
             LIMIT ?"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(owner_id)
            .bind(before_id.unwrap_or(i64::MAX))
            .bind(limit)
            .fetch_all(&*self.db)
            .await
    }

    /// Number of records referencing `digest`.
    pub async fn count_by_digest(&self, digest: &Digest) -> sqlx::Result<i64> {
        #[cfg(test)]
        if self.take_count_fault() {
            return Err(sqlx::Error::PoolTimedOut);
        }

        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files WHERE hash = ?")
            .bind(digest)
            .fetch_one(&*self.db)
            .await
    }

    /// Delete one record owned by `owner_id`. Returns whether a row went away.
    pub async fn delete_record(&self, id: i64, owner_id: i64) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn increment_download_count(&self, id: i64) -> sqlx::Result<()> {
        sqlx::query("UPDATE files SET download_count = download_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Liveness probe used by `/readyz`.
    pub async fn ping(&self) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
    }
}

#[cfg(test)]
impl Catalog {
    /// Make the next `n` reference counts fail as if the pool timed out.
    pub(crate) fn fail_next_counts(&self, n: usize) {
        self.count_faults
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Injected count failures not yet consumed.
    pub(crate) fn pending_count_faults(&self) -> usize {
        self.count_faults.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn take_count_fault(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.count_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}
