use crate::error::DbError;
use dotenvy::dotenv;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::env;
use std::time::Duration;
use tracing::{debug, info};

/// Reads `DATABASE_URL`, loading a `.env` file first when one exists.
///
/// `None` means no database is configured and the caller should fall back to
/// an in-memory store.
pub fn database_url() -> Option<String> {
    // A missing .env file is fine; the variable may come from the environment.
    let _ = dotenv();
    env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty())
}

/// Establishes a connection pool to the PostgreSQL database at `database_url`.
pub async fn connect(database_url: &str) -> Result<PgPool, DbError> {
    if database_url.trim().is_empty() {
        return Err(DbError::ConnectionConfigError(
            "DATABASE_URL must be set.".to_string(),
        ));
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    debug!(max_connections = 10, "database pool connected");

    Ok(pool)
}

/// A utility function to run database migrations automatically.
///
/// Applied at startup so the schema is always current before the engine
/// rehydrates its state.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    // Use a relative path from the crate root
    let migrator = sqlx::migrate!("./migrations");
    migrator.run(pool).await?;
    info!(migrations = migrator.iter().count(), "database schema is current");
    Ok(())
}
