use anyhow::Result;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Shared `SQLite` handle for the durable stores. Uses connection pooling
/// for concurrent access; migrations run once at open.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the database and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns error if the connection or migrations fail.
    pub async fn open(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns error if connection fails.
    pub async fn open_in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
