use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::{ResultStore, SessionSummary};

/// Storage location of the results database.
#[derive(Debug, Clone)]
pub enum SqlitePath {
    File(PathBuf),
    Memory,
}

impl SqlitePath {
    fn to_manager(&self) -> SqliteConnectionManager {
        match self {
            SqlitePath::File(path) => {
                SqliteConnectionManager::file(path).with_flags(Self::open_flags())
            }
            SqlitePath::Memory => SqliteConnectionManager::memory().with_flags(Self::open_flags()),
        }
    }

    fn open_flags() -> OpenFlags {
        OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    }

    fn as_path(&self) -> Option<&Path> {
        match self {
            SqlitePath::File(path) => Some(path.as_path()),
            SqlitePath::Memory => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub path: SqlitePath,
    pub pool_size: u32,
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: SqlitePath::File(path.into()),
            pool_size: 4,
            busy_timeout: Duration::from_millis(250),
        }
    }

    /// Every pooled in-memory connection is its own database, so the pool
    /// is pinned to one connection.
    pub fn memory() -> Self {
        Self {
            path: SqlitePath::Memory,
            pool_size: 1,
            busy_timeout: Duration::from_millis(250),
        }
    }
}

/// SQLite backed [`ResultStore`].
#[derive(Clone)]
pub struct SqliteResultStore {
    pool: Pool<SqliteConnectionManager>,
    db_path: Option<PathBuf>,
}

impl SqliteResultStore {
    /// Builds the connection pool and runs the migrations.
    pub fn bootstrap(config: SqliteConfig) -> Result<Self> {
        let busy_timeout = config.busy_timeout;
        let manager = config
            .path
            .to_manager()
            .with_init(move |conn| Self::configure_connection(conn, busy_timeout));
        let pool_size = match config.path {
            SqlitePath::Memory => 1,
            SqlitePath::File(_) => config.pool_size.max(1),
        };

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .context("failed to create results connection pool")?;

        {
            let mut conn = pool
                .get()
                .context("failed to acquire results bootstrap connection")?;
            Self::run_migrations(&mut conn)?;
        }

        Ok(Self {
            pool,
            db_path: config.path.as_path().map(Path::to_path_buf),
        })
    }

    pub fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|err| anyhow!("failed to obtain results connection: {err}"))
    }

    fn configure_connection(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(())
    }

    fn run_migrations(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS exam_results (
                result_id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                paper_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                outcome TEXT NOT NULL,
                started_at_ms INTEGER NOT NULL,
                completed_at_ms INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                answers INTEGER NOT NULL,
                overall_score REAL,
                feedback TEXT,
                summary TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS exam_results_candidate
                ON exam_results(candidate_id, completed_at_ms);

            CREATE TABLE IF NOT EXISTS exam_artifacts (
                artifact_id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                content BLOB NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            "#,
        )
        .context("failed to run results migrations")?;
        Ok(())
    }

    pub fn insert_result(&self, summary: &SessionSummary) -> Result<String> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to open transaction for result insert")?;

        let encoded = serde_json::to_string(summary).context("failed to serialize session summary")?;
        tx.execute(
            "INSERT INTO exam_results (
                session_id,
                candidate_id,
                paper_id,
                kind,
                outcome,
                started_at_ms,
                completed_at_ms,
                duration_ms,
                answers,
                overall_score,
                feedback,
                summary
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                summary.session_id,
                summary.candidate_id,
                summary.paper_id,
                summary.kind.as_str(),
                summary.outcome,
                summary.started_at_ms,
                summary.completed_at_ms,
                summary.duration_ms(),
                summary.answers as i64,
                summary.scores.as_ref().map(|scores| f64::from(scores.overall)),
                summary.feedback.as_deref(),
                encoded,
            ],
        )
        .context("failed to insert exam result")?;
        let result_id = tx.last_insert_rowid();

        tx.commit().context("failed to commit result insert")?;
        Ok(format!("result-{result_id}"))
    }

    pub fn insert_artifact(&self, owner_id: &str, bytes: &[u8], mime_type: &str) -> Result<String> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO exam_artifacts(owner_id, mime_type, size_bytes, content, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![owner_id, mime_type, bytes.len() as i64, bytes, now_ms()],
        )
        .context("failed to insert artifact")?;
        Ok(format!("artifact-{}", conn.last_insert_rowid()))
    }

    /// Most recent stored summary for `session_id`.
    pub fn load_result(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let conn = self.connection()?;
        let encoded: Option<String> = conn
            .query_row(
                "SELECT summary FROM exam_results WHERE session_id = ?1
                 ORDER BY result_id DESC LIMIT 1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        encoded
            .map(|json| serde_json::from_str(&json).context("stored summary is not valid JSON"))
            .transpose()
    }

    pub fn count_results(&self, session_id: &str) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM exam_results WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn load_artifact(&self, artifact_id: &str) -> Result<Option<(String, Vec<u8>)>> {
        let Some(rowid) = artifact_id
            .strip_prefix("artifact-")
            .and_then(|id| id.parse::<i64>().ok())
        else {
            return Ok(None);
        };
        let conn = self.connection()?;
        let artifact = conn
            .query_row(
                "SELECT mime_type, content FROM exam_artifacts WHERE artifact_id = ?1",
                params![rowid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(artifact)
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn submit_result(&self, summary: &SessionSummary) -> Result<String> {
        let store = self.clone();
        let summary = summary.clone();
        tokio::task::spawn_blocking(move || store.insert_result(&summary))
            .await
            .context("result insert worker panicked")?
    }

    async fn create_artifact(&self, owner_id: &str, bytes: Bytes, mime_type: &str) -> Result<String> {
        let store = self.clone();
        let owner_id = owner_id.to_string();
        let mime_type = mime_type.to_string();
        tokio::task::spawn_blocking(move || store.insert_artifact(&owner_id, &bytes, &mime_type))
            .await
            .context("artifact insert worker panicked")?
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
impl SqliteResultStore {
    pub fn run_migrations_for_tests(conn: &mut Connection) -> Result<()> {
        Self::run_migrations(conn)
    }
}
