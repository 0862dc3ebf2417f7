use crate::types::{CachedFileRow, NewCachedFile};
use sqlx::PgPool;
use std::collections::HashSet;

const COLUMNS: &str = "id, object_id, object_type, message_id, chat_id, created_at";

/// Look up the entry for one `(object_id, object_type)`
pub async fn get(
    pool: &PgPool,
    object_id: i32,
    object_type: &str,
) -> Result<Option<CachedFileRow>, sqlx::Error> {
    sqlx::query_as::<_, CachedFileRow>(&format!(
        "SELECT {COLUMNS} FROM cached_files WHERE object_id = $1 AND object_type = $2"
    ))
    .bind(object_id)
    .bind(object_type)
    .fetch_optional(pool)
    .await
}

/// All cached `(object_id, object_type)` pairs for a batch of objects, in one query
pub async fn existing_for_objects(
    pool: &PgPool,
    object_ids: &[i32],
) -> Result<HashSet<(i32, String)>, sqlx::Error> {
    if object_ids.is_empty() {
        return Ok(HashSet::new());
    }
    let rows: Vec<(i32, String)> = sqlx::query_as(
        "SELECT object_id, object_type FROM cached_files WHERE object_id = ANY($1)",
    )
    .bind(object_ids)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Insert an entry; returns `None` if the key is already cached
pub async fn insert(
    pool: &PgPool,
    file: &NewCachedFile,
) -> Result<Option<CachedFileRow>, sqlx::Error> {
    sqlx::query_as::<_, CachedFileRow>(&format!(
        r#"
        INSERT INTO cached_files (object_id, object_type, message_id, chat_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (object_id, object_type) DO NOTHING
        RETURNING {COLUMNS}
        "#
    ))
    .bind(file.object_id)
    .bind(&file.object_type)
    .bind(file.message_id)
    .bind(file.chat_id)
    .fetch_optional(pool)
    .await
}

/// Insert or repoint an entry (administrative path)
pub async fn upsert(pool: &PgPool, file: &NewCachedFile) -> Result<CachedFileRow, sqlx::Error> {
    sqlx::query_as::<_, CachedFileRow>(&format!(
        r#"
        INSERT INTO cached_files (object_id, object_type, message_id, chat_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (object_id, object_type)
        DO UPDATE SET message_id = EXCLUDED.message_id, chat_id = EXCLUDED.chat_id
        RETURNING {COLUMNS}
        "#
    ))
    .bind(file.object_id)
    .bind(&file.object_type)
    .bind(file.message_id)
    .bind(file.chat_id)
    .fetch_one(pool)
    .await
}

/// Delete an entry, returning it if it existed
pub async fn delete(
    pool: &PgPool,
    object_id: i32,
    object_type: &str,
) -> Result<Option<CachedFileRow>, sqlx::Error> {
    sqlx::query_as::<_, CachedFileRow>(&format!(
        "DELETE FROM cached_files WHERE object_id = $1 AND object_type = $2 RETURNING {COLUMNS}"
    ))
    .bind(object_id)
    .bind(object_type)
    .fetch_optional(pool)
    .await
}

/// Delete an entry only while it still points at the given message.
/// A concurrent refill that already repointed the row is left alone.
pub async fn delete_if_pointer(
    pool: &PgPool,
    object_id: i32,
    object_type: &str,
    chat_id: i64,
    message_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM cached_files
        WHERE object_id = $1 AND object_type = $2 AND chat_id = $3 AND message_id = $4
        "#,
    )
    .bind(object_id)
    .bind(object_type)
    .bind(chat_id)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Keyset page over all entries ordered by id
pub async fn list_after(
    pool: &PgPool,
    after_id: i64,
    limit: i64,
) -> Result<Vec<CachedFileRow>, sqlx::Error> {
    sqlx::query_as::<_, CachedFileRow>(&format!(
        "SELECT {COLUMNS} FROM cached_files WHERE id > $1 ORDER BY id LIMIT $2"
    ))
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cached_files")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
