//! PostgreSQL sink backed by a `deadpool-postgres` connection pool.
//!
//! Each insert checks a connection out of the pool, runs inside its own
//! transaction and commits. A transaction that is dropped before commit
//! (error, timeout, cancelled future) rolls back, and the pooled object goes
//! back to the pool when it falls out of scope.
//!
//! The target table is expected to exist (see `sql/news_updates.sql`).

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod};
use thiserror::Error;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{debug, info};

use super::{PersistError, PersistenceSink};
use crate::config::PostgresConfig;
use crate::metrics::{metrics, Timer};
use crate::types::NewsEvent;

const COLUMNS: &str =
    "id, headline, summary, author, content, symbols, source, url, created_at, updated_at";

/// Errors raised while building the sink
#[derive(Debug, Error)]
pub enum SinkSetupError {
    #[error("invalid table name {0:?}")]
    InvalidTable(String),

    #[error("pool creation failed: {0}")]
    Pool(String),
}

/// Pooled PostgreSQL implementation of [`PersistenceSink`]
pub struct PostgresSink {
    pool: Pool,
    table: String,
    insert_sql: String,
    query_timeout: Duration,
}

impl PostgresSink {
    /// Build the pool. No connection is opened until the first insert.
    pub fn new(config: &PostgresConfig) -> Result<Self, SinkSetupError> {
        if !is_valid_table_name(&config.table) {
            return Err(SinkSetupError::InvalidTable(config.table.clone()));
        }

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .dbname(&config.dbname)
            .user(&config.user)
            .password(config.password.as_str())
            .application_name("news-ingest")
            .connect_timeout(Duration::from_secs(config.query_timeout_secs));
        if let Some(port) = config.port {
            pg_config.port(port);
        }

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);

        let pool = Pool::builder(mgr)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| SinkSetupError::Pool(e.to_string()))?;

        info!(
            host = %config.host,
            port = ?config.port,
            dbname = %config.dbname,
            table = %config.table,
            pool_size = config.pool_size,
            "PostgreSQL sink configured"
        );

        Ok(Self {
            pool,
            insert_sql: insert_statement(&config.table),
            table: config.table.clone(),
            query_timeout: Duration::from_secs(config.query_timeout_secs),
        })
    }

    async fn insert(&self, event: &NewsEvent) -> Result<(), PersistError> {
        let mut client = self.pool.get().await.map_err(classify_pool_error)?;
        let tx = client.transaction().await.map_err(classify_pg_error)?;

        tx.execute(
            self.insert_sql.as_str(),
            &[
                &event.id,
                &event.headline,
                &event.summary,
                &event.author,
                &event.content,
                &event.symbols,
                &event.source,
                &event.url,
                &event.created_at,
                &event.updated_at,
            ],
        )
        .await
        .map_err(classify_pg_error)?;

        tx.commit().await.map_err(classify_pg_error)
    }

    /// Read a stored event back by id.
    pub async fn fetch(&self, id: i64) -> Result<Option<NewsEvent>, PersistError> {
        let client = self.pool.get().await.map_err(classify_pool_error)?;
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = $1", self.table);
        let row = client
            .query_opt(sql.as_str(), &[&id])
            .await
            .map_err(classify_pg_error)?;

        Ok(row.map(|row| NewsEvent {
            id: row.get("id"),
            headline: row.get("headline"),
            summary: row.get("summary"),
            author: row.get("author"),
            content: row.get("content"),
            symbols: row.get("symbols"),
            source: row.get("source"),
            url: row.get("url"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }
}

#[async_trait]
impl PersistenceSink for PostgresSink {
    async fn persist(&self, event: &NewsEvent) -> Result<(), PersistError> {
        let timer = Timer::new();
        let result = match tokio::time::timeout(self.query_timeout, self.insert(event)).await {
            Ok(result) => result,
            Err(_) => Err(PersistError::Unavailable(format!(
                "insert timed out after {:?}",
                self.query_timeout
            ))),
        };
        timer.observe_duration(&metrics().persist_latency);
        result
    }

    async fn close(&self) {
        debug!(table = %self.table, "closing PostgreSQL pool");
        self.pool.close();
    }
}

fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
    )
}

/// Plain or schema-qualified identifier, no quoting needed.
fn is_valid_table_name(table: &str) -> bool {
    !table.is_empty()
        && table.split('.').count() <= 2
        && table.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn classify_pool_error(err: PoolError) -> PersistError {
    match err {
        PoolError::Backend(e) => classify_pg_error(e),
        PoolError::Timeout(kind) => PersistError::Unavailable(format!("pool timeout ({kind:?})")),
        PoolError::Closed => PersistError::Unavailable("pool closed".into()),
        other => PersistError::Unknown(other.to_string()),
    }
}

fn classify_pg_error(err: tokio_postgres::Error) -> PersistError {
    if let Some(state) = err.code() {
        let message = err
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| err.to_string());
        return classify_sqlstate(state, message);
    }

    if err.is_closed() {
        return PersistError::Unavailable(err.to_string());
    }

    let io_failure = std::error::Error::source(&err)
        .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
    if io_failure {
        PersistError::Unavailable(err.to_string())
    } else {
        PersistError::Unknown(err.to_string())
    }
}

/// Map a SQLSTATE to a failure class.
fn classify_sqlstate(state: &SqlState, message: String) -> PersistError {
    if *state == SqlState::UNIQUE_VIOLATION {
        return PersistError::DuplicateKey(message);
    }

    let code = state.code();
    if code.starts_with("23") {
        // integrity constraint violation class
        PersistError::ConstraintViolation(message)
    } else if code.starts_with("08") || code.starts_with("57P") || code.starts_with("53") {
        // connection exception, operator intervention, insufficient resources
        PersistError::Unavailable(message)
    } else {
        PersistError::Unknown(message)
    }
}
