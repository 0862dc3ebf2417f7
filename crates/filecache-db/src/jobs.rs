use crate::types::{EnqueueStatus, JobRow, NewJob, QueueCounts};
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use tracing::debug;

/// A conflicting active row can finish between the insert and the lookup;
/// in that case the insert is tried again.
const MERGE_ATTEMPTS: usize = 3;

/// Enqueue a job, merging into an existing ready or leased job with the same identity.
///
/// When merging into a ready job, its `available_at` moves earlier if the new
/// job would become eligible sooner.
pub async fn enqueue_on(conn: &mut PgConnection, job: &NewJob) -> Result<EnqueueStatus, sqlx::Error> {
    for _ in 0..MERGE_ATTEMPTS {
        let row: Option<(i64, bool)> = sqlx::query_as(
            r#"
            INSERT INTO fill_jobs (identity, kind, payload, available_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (identity) WHERE state IN ('ready', 'leased')
            DO UPDATE SET available_at = LEAST(fill_jobs.available_at, EXCLUDED.available_at),
                          updated_at = NOW()
                WHERE fill_jobs.state = 'ready'
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&job.identity)
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(job.delay.as_secs_f64())
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some((id, true)) => return Ok(EnqueueStatus::Accepted(id)),
            Some((id, false)) => return Ok(EnqueueStatus::Merged(id)),
            None => {}
        }

        // Conflict with a leased job: the update was skipped
        let leased: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM fill_jobs WHERE identity = $1 AND state IN ('ready', 'leased')",
        )
        .bind(&job.identity)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some((id,)) = leased {
            return Ok(EnqueueStatus::Merged(id));
        }
        debug!(identity = %job.identity, "Active job vanished during merge, retrying insert");
    }
    Err(sqlx::Error::Protocol(format!(
        "could not enqueue job {} after {} attempts",
        job.identity, MERGE_ATTEMPTS
    )))
}

pub async fn enqueue(pool: &PgPool, job: &NewJob) -> Result<EnqueueStatus, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    enqueue_on(&mut conn, job).await
}

/// Enqueue a batch in a single transaction
pub async fn enqueue_many(pool: &PgPool, jobs: &[NewJob]) -> Result<Vec<EnqueueStatus>, sqlx::Error> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let mut tx = pool.begin().await?;
    let mut statuses = Vec::with_capacity(jobs.len());
    for job in jobs {
        statuses.push(enqueue_on(&mut *tx, job).await?);
    }
    tx.commit().await?;
    Ok(statuses)
}

/// Lease the next eligible job. Leases that expired without completion are
/// reclaimed here, which is how jobs survive a crashed worker.
pub async fn dequeue(
    pool: &PgPool,
    worker: &str,
    lease: Duration,
) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as::<_, JobRow>(
        r#"
        WITH next AS (
            SELECT id FROM fill_jobs
            WHERE (state = 'ready' AND available_at <= NOW())
               OR (state = 'leased' AND lease_expires_at < NOW())
            ORDER BY available_at, id
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE fill_jobs j
        SET state = 'leased',
            attempts = j.attempts + 1,
            lease_owner = $1,
            lease_expires_at = NOW() + make_interval(secs => $2),
            updated_at = NOW()
        FROM next
        WHERE j.id = next.id
        RETURNING j.id, j.identity, j.kind, j.payload, j.attempts
        "#,
    )
    .bind(worker)
    .bind(lease.as_secs_f64())
    .fetch_optional(pool)
    .await
}

/// Remove a finished job. Returns `false` when `worker` no longer holds the
/// lease, in which case the row is left to its current owner.
pub async fn complete(pool: &PgPool, id: i64, worker: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM fill_jobs WHERE id = $1 AND state = 'leased' AND lease_owner = $2",
    )
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Put a leased job back, eligible again after `delay`
pub async fn retry(
    pool: &PgPool,
    id: i64,
    worker: &str,
    delay: Duration,
    reason: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE fill_jobs
        SET state = 'ready',
            available_at = NOW() + make_interval(secs => $3),
            lease_owner = NULL,
            lease_expires_at = NULL,
            last_error = $4,
            updated_at = NOW()
        WHERE id = $1 AND state = 'leased' AND lease_owner = $2
        "#,
    )
    .bind(id)
    .bind(worker)
    .bind(delay.as_secs_f64())
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Park a job as failed. It no longer blocks new jobs with the same identity.
pub async fn fail(pool: &PgPool, id: i64, worker: &str, reason: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE fill_jobs
        SET state = 'failed',
            lease_owner = NULL,
            lease_expires_at = NULL,
            last_error = $3,
            updated_at = NOW()
        WHERE id = $1 AND state = 'leased' AND lease_owner = $2
        "#,
    )
    .bind(id)
    .bind(worker)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn counts(pool: &PgPool) -> Result<QueueCounts, sqlx::Error> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT state, COUNT(*) FROM fill_jobs GROUP BY state")
            .fetch_all(pool)
            .await?;

    let mut counts = QueueCounts::default();
    for (state, n) in rows {
        match state.as_str() {
            "ready" => counts.ready = n,
            "leased" => counts.leased = n,
            "failed" => counts.failed = n,
            _ => {}
        }
    }
    Ok(counts)
}
