use sqlx::PgPool;
use tracing::info;

/// Apply pending migrations from `migrations/`
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Running file cache migrations...");
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
    info!("File cache migrations completed");
    Ok(())
}
