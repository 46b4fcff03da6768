//! SQLite connection pools for the conversation store.
//!
//! Writes go through a single connection so the queue consumers never race
//! each other for the write lock; reads (history, session listing, restore)
//! get a pool of read-only connections that WAL lets run alongside the
//! writer.

use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::debug;

const READ_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One writer connection and a read-only reader pool over the same file.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open `database_url`, creating the file if needed, and bring the
    /// schema up to date before any reader connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = connect_options(database_url)?;

        let writer = open(options.clone(), 1).await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = open(options.read_only(true), READ_CONNECTIONS).await?;
        debug!(url = %database_url, readers = READ_CONNECTIONS, "database opened");

        Ok(Self { reader, writer })
    }
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(database_url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        // NORMAL is durable under WAL except across power loss.
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT))
}

async fn open(options: SqliteConnectOptions, size: u32) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(size)
        .connect_with(options)
        .await
}
