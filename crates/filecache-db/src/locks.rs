use sqlx::PgPool;
use std::time::Duration;

/// Take the lock for `lock_key` if it is free or its lease has run out.
/// Returns whether this caller now holds it under `token`.
pub async fn try_acquire(
    pool: &PgPool,
    lock_key: &str,
    token: i64,
    holder: &str,
    lease: Duration,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO fill_locks (lock_key, token, holder, expires_at)
        VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
        ON CONFLICT (lock_key) DO UPDATE
            SET token = EXCLUDED.token,
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE fill_locks.expires_at < NOW()
        RETURNING token
        "#,
    )
    .bind(lock_key)
    .bind(token)
    .bind(holder)
    .bind(lease.as_secs_f64())
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some_and(|(t,)| t == token))
}

/// Release the lock if `token` still owns it
pub async fn release(pool: &PgPool, lock_key: &str, token: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM fill_locks WHERE lock_key = $1 AND token = $2")
        .bind(lock_key)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Push the lease of a held lock out to `lease` from now.
/// Returns `false` when `token` no longer owns the lock.
pub async fn renew(
    pool: &PgPool,
    lock_key: &str,
    token: i64,
    lease: Duration,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE fill_locks
        SET expires_at = NOW() + make_interval(secs => $3)
        WHERE lock_key = $1 AND token = $2
        "#,
    )
    .bind(lock_key)
    .bind(token)
    .bind(lease.as_secs_f64())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Drop locks whose lease has expired
pub async fn purge_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM fill_locks WHERE expires_at < NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
