//! Shared fixtures for the crate's tests.

use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domains::mutation::repository::SqliteMutationRepository;
use crate::domains::mutation::types::{
    LocationOfInterestMutation, Mutation, MutationType, SubmissionMutation, SyncStatus, TaskType,
    ValueDelta,
};

pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory store for tests. A single connection keeps every query on the
/// same memory database.
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    crate::db_migration::run(&pool).await.expect("run migrations");
    pool
}

pub(crate) async fn memory_repo() -> SqliteMutationRepository {
    SqliteMutationRepository::new(memory_pool().await)
}

pub(crate) fn photo_delta(task_id: &str, file_name: &str) -> ValueDelta {
    ValueDelta {
        task_id: task_id.to_string(),
        task_type: TaskType::Photo,
        value: serde_json::json!(file_name),
    }
}

pub(crate) fn text_delta(task_id: &str, text: &str) -> ValueDelta {
    ValueDelta {
        task_id: task_id.to_string(),
        task_type: TaskType::Text,
        value: serde_json::json!(text),
    }
}

pub(crate) fn submission_mutation(status: SyncStatus, deltas: Vec<ValueDelta>) -> Mutation {
    Mutation::Submission(SubmissionMutation {
        id: Uuid::new_v4(),
        mutation_type: MutationType::Create,
        sync_status: status,
        survey_id: "survey_1".to_string(),
        location_of_interest_id: "loi_1".to_string(),
        user_id: "user_1".to_string(),
        job_id: "job_1".to_string(),
        collection_id: "collection_1".to_string(),
        submission_id: "submission_1".to_string(),
        deltas,
        uploaded_media: Default::default(),
        retry_count: 0,
        last_error: None,
        client_timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    })
}

pub(crate) fn pending_loi_mutation() -> Mutation {
    Mutation::LocationOfInterest(LocationOfInterestMutation {
        id: Uuid::new_v4(),
        mutation_type: MutationType::Create,
        sync_status: SyncStatus::Pending,
        survey_id: "survey_1".to_string(),
        location_of_interest_id: "loi_1".to_string(),
        user_id: "user_1".to_string(),
        job_id: "job_1".to_string(),
        collection_id: "collection_1".to_string(),
        retry_count: 0,
        last_error: None,
        client_timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    })
}
