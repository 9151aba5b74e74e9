//! Embedded schema migrations.

use crate::error::DbError;
use crate::pool::DbPool;

/// Applies any pending migrations from `migrations/`, in filename order.
///
/// ```rust,ignore
/// let pool = DbPool::connect("postgres://localhost/rollcall").await?;
/// run_migrations(&pool).await?;
/// ```
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    tracing::info!("running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool.inner())
        .await
        .map_err(DbError::MigrationFailed)?;

    tracing::info!("migrations complete");
    Ok(())
}
