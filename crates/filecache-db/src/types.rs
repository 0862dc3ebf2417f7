use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::time::Duration;

/// Row of the `cached_files` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CachedFileRow {
    pub id: i64,
    pub object_id: i32,
    pub object_type: String,
    pub message_id: i64,
    pub chat_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCachedFile {
    pub object_id: i32,
    pub object_type: String,
    pub message_id: i64,
    pub chat_id: i64,
}

/// Job to insert into `fill_jobs`
#[derive(Debug, Clone)]
pub struct NewJob {
    pub identity: String,
    pub kind: String,
    pub payload: serde_json::Value,
    /// Delay before the job becomes eligible for dequeue
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// A new job row was created
    Accepted(i64),
    /// An active job with the same identity already existed
    Merged(i64),
}

impl EnqueueStatus {
    pub fn id(&self) -> i64 {
        match self {
            EnqueueStatus::Accepted(id) | EnqueueStatus::Merged(id) => *id,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueStatus::Accepted(_))
    }
}

/// A leased job handed to a worker
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub identity: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub ready: i64,
    pub leased: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_status_id() {
        assert_eq!(EnqueueStatus::Accepted(3).id(), 3);
        assert_eq!(EnqueueStatus::Merged(7).id(), 7);
        assert!(EnqueueStatus::Accepted(3).is_accepted());
        assert!(!EnqueueStatus::Merged(7).is_accepted());
    }

    #[test]
    fn test_cached_file_row_serializes_with_column_names() {
        let row = CachedFileRow {
            id: 1,
            object_id: 42,
            object_type: "fb2".into(),
            message_id: 10,
            chat_id: -100,
            created_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["object_id"], 42);
        assert_eq!(json["object_type"], "fb2");
        assert_eq!(json["chat_id"], -100);
    }
}
