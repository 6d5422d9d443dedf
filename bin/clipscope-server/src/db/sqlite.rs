//! SQLite implementation of [`JobJournal`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are embedded at compile
//! time from `./migrations` and run by [`SqliteStore::connect`].
//!
//! The runtime-checked `sqlx::query` form is used so that no `DATABASE_URL`
//! is needed at compile time.

use std::str::FromStr;

use async_trait::async_trait;
use clipscope_core::{JobId, JobJournal, JobSnapshot, JournalError};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::warn;

/// SQLite-backed job journal.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL, e.g. `"sqlite://clipscope.db"` or
    /// `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl JobJournal for SqliteStore {
    async fn save(&self, snapshot: &JobSnapshot) -> Result<(), JournalError> {
        let body = serde_json::to_string(snapshot).map_err(JournalError::new)?;
        sqlx::query(
            "INSERT INTO jobs (id, status, snapshot, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(id) DO UPDATE SET \
                status = excluded.status, \
                snapshot = excluded.snapshot, \
                updated_at = excluded.updated_at",
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.status.as_str())
        .bind(&body)
        .bind(snapshot.created_at.to_rfc3339())
        .bind(snapshot.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(JournalError::new)?;
        Ok(())
    }

    async fn remove(&self, job_id: JobId) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(JournalError::new)?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<JobSnapshot>, JournalError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, snapshot FROM jobs ORDER BY updated_at")
                .fetch_all(&self.pool)
                .await
                .map_err(JournalError::new)?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, body)| match serde_json::from_str(&body) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "skipping unreadable journal row");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use clipscope_core::{JobInput, JobStatus, StatusEvent};

    use super::*;

    fn snapshot(status: JobStatus) -> JobSnapshot {
        let id = JobId::new();
        let now = Utc::now();
        JobSnapshot {
            id,
            input: JobInput::Url {
                url: "https://www.tiktok.com/@a/video/1".into(),
            },
            status,
            stage_results: Vec::new(),
            artifacts: Default::default(),
            error: None,
            transitions: vec![StatusEvent {
                job_id: id,
                status,
                stage: None,
                timestamp: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let mut job = snapshot(JobStatus::Queued);
        store.save(&job).await.unwrap();

        job.status = JobStatus::Downloading;
        job.updated_at = Utc::now();
        store.save(&job).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![job]);
    }

    #[tokio::test]
    async fn remove_deletes_the_row() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let a = snapshot(JobStatus::Complete);
        let b = snapshot(JobStatus::Failed);
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        store.remove(a.id).await.unwrap();
        store.remove(a.id).await.unwrap();

        let ids: Vec<JobId> = store.load().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[tokio::test]
    async fn unreadable_rows_are_skipped() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "INSERT INTO jobs (id, status, snapshot, created_at, updated_at) \
             VALUES ('x', 'queued', '{not json', '', '')",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        let good = snapshot(JobStatus::Complete);
        store.save(&good).await.unwrap();

        assert_eq!(store.load().await.unwrap(), vec![good]);
    }
}
