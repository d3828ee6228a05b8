use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domains::mutation::types::{Mutation, MutationRow, StatusCounts, SyncStatus};
use crate::errors::{DbError, DomainError, DomainResult};

const MUTATION_COLUMNS: &str = "id, kind, mutation_type, sync_status, survey_id, \
     location_of_interest_id, user_id, job_id, collection_id, submission_id, \
     deltas, uploaded_media, retry_count, last_error, client_timestamp, last_attempt_at";

/// Query and transition layer over the durable mutation queue. The single
/// source of truth for what must still be sent; every status change goes
/// through here as one committed write.
#[async_trait]
pub trait MutationRepository: Send + Sync {
    /// Insert or replace the stored mutation. Idempotent for an identical
    /// id and payload.
    async fn enqueue(&self, mutation: &Mutation) -> DomainResult<()>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<Mutation>;

    /// Mutations with data-phase work outstanding (pending, in progress, or
    /// failed).
    async fn get_incomplete_uploads(&self) -> DomainResult<Vec<Mutation>>;

    /// Mutations with media-phase work outstanding.
    async fn get_incomplete_media_mutations(&self) -> DomainResult<Vec<Mutation>>;

    async fn list_by_status(&self, status: SyncStatus) -> DomainResult<Vec<Mutation>>;

    async fn count_by_status(&self, status: SyncStatus) -> DomainResult<i64>;

    /// Apply a lawful status transition as a single durable write. An
    /// unlawful edge is a programming error and returns
    /// `DomainError::IllegalTransition`.
    async fn transition(&self, id: Uuid, to: SyncStatus) -> DomainResult<()>;

    /// Data push failed non-transiently: `InProgress -> Failed`, retaining
    /// the error on the row for diagnostics and manual retry.
    async fn mark_failed(&self, id: Uuid, error: &str) -> DomainResult<()>;

    /// Media phase failed for at least one delta:
    /// `MediaUploadInProgress -> MediaUploadAwaitingRetry`, bumping the
    /// retry count and retaining the error.
    async fn mark_media_retry(&self, id: Uuid, error: &str) -> DomainResult<()>;

    /// Every photo delta uploaded: `MediaUploadInProgress -> Completed`,
    /// recording the remote keys in the same write.
    async fn complete_with_media(
        &self,
        id: Uuid,
        uploaded: &BTreeMap<String, String>,
    ) -> DomainResult<()>;

    /// Crash repair: requeue mutations stranded in `InProgress` or
    /// `MediaUploadInProgress` by an ungraceful stop. Returns the number of
    /// rows repaired. Only the recovery hook calls this.
    async fn requeue_interrupted(&self) -> DomainResult<u64>;

    /// Backoff-policy entry point:
    /// `MediaUploadAwaitingRetry -> MediaUploadPending` in bulk. Returns the
    /// number of rows requeued.
    async fn requeue_media_retries(&self) -> DomainResult<u64>;

    /// Manual retry of failed data mutations, triggered by the application
    /// layer on the user's behalf: `Failed -> Pending` in bulk.
    async fn requeue_failed(&self) -> DomainResult<u64>;

    /// Subscribe to per-status count snapshots. A new snapshot is published
    /// after every committed store change; subscribers always converge on
    /// the latest state, intermediate snapshots may be skipped.
    fn watch(&self) -> watch::Receiver<StatusCounts>;
}

/// SQLite implementation of the mutation repository.
pub struct SqliteMutationRepository {
    pool: SqlitePool,
    counts_tx: watch::Sender<StatusCounts>,
}

impl SqliteMutationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        let (counts_tx, _) = watch::channel(StatusCounts::default());
        Self { pool, counts_tx }
    }

    async fn current_status(&self, id: Uuid) -> DomainResult<SyncStatus> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT sync_status FROM mutations WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::from)?;

        raw.map(|s| SyncStatus::from_db(&s))
            .ok_or_else(|| DomainError::EntityNotFound("mutation".to_string(), id))
    }

    async fn list_by_statuses(&self, statuses: &[SyncStatus]) -> DomainResult<Vec<Mutation>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM mutations WHERE sync_status IN ({}) ORDER BY client_timestamp ASC",
            MUTATION_COLUMNS, placeholders
        );

        let mut query = sqlx::query_as::<_, MutationRow>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query.fetch_all(&self.pool).await.map_err(DbError::from)?;
        rows.into_iter().map(Mutation::try_from).collect()
    }

    /// Recompute and publish the per-status counts after a committed write.
    async fn publish_counts(&self) -> DomainResult<()> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT sync_status, COUNT(*) FROM mutations GROUP BY sync_status")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::from)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.insert(SyncStatus::from_db(&status), count);
        }
        self.counts_tx.send_replace(counts);
        Ok(())
    }
}

#[async_trait]
impl MutationRepository for SqliteMutationRepository {
    async fn enqueue(&self, mutation: &Mutation) -> DomainResult<()> {
        let (submission_id, deltas, uploaded_media) = match mutation {
            Mutation::LocationOfInterest(_) => (None, "[]".to_string(), "{}".to_string()),
            Mutation::Submission(m) => (
                Some(m.submission_id.clone()),
                serde_json::to_string(&m.deltas)
                    .map_err(|e| DomainError::Internal(format!("Delta serialization: {}", e)))?,
                serde_json::to_string(&m.uploaded_media).map_err(|e| {
                    DomainError::Internal(format!("Uploaded media serialization: {}", e))
                })?,
            ),
        };

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO mutations (
                id, kind, mutation_type, sync_status, survey_id,
                location_of_interest_id, user_id, job_id, collection_id, submission_id,
                deltas, uploaded_media, retry_count, last_error, client_timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(mutation.id().to_string())
        .bind(mutation.kind_str())
        .bind(mutation.mutation_type().as_str())
        .bind(mutation.sync_status().as_str())
        .bind(mutation.survey_id())
        .bind(mutation.location_of_interest_id())
        .bind(mutation.user_id())
        .bind(mutation.job_id())
        .bind(mutation.collection_id())
        .bind(submission_id)
        .bind(deltas)
        .bind(uploaded_media)
        .bind(mutation.retry_count())
        .bind(mutation.last_error())
        .bind(mutation.client_timestamp().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.publish_counts().await
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<Mutation> {
        let sql = format!("SELECT {} FROM mutations WHERE id = ?", MUTATION_COLUMNS);
        let row = sqlx::query_as::<_, MutationRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("mutation".to_string(), id))?;

        Mutation::try_from(row)
    }

    async fn get_incomplete_uploads(&self) -> DomainResult<Vec<Mutation>> {
        self.list_by_statuses(&[
            SyncStatus::Pending,
            SyncStatus::InProgress,
            SyncStatus::Failed,
        ])
        .await
    }

    async fn get_incomplete_media_mutations(&self) -> DomainResult<Vec<Mutation>> {
        self.list_by_statuses(&[
            SyncStatus::MediaUploadPending,
            SyncStatus::MediaUploadInProgress,
            SyncStatus::MediaUploadAwaitingRetry,
        ])
        .await
    }

    async fn list_by_status(&self, status: SyncStatus) -> DomainResult<Vec<Mutation>> {
        self.list_by_statuses(&[status]).await
    }

    async fn count_by_status(&self, status: SyncStatus) -> DomainResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mutations WHERE sync_status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::from)?;
        Ok(count)
    }

    async fn transition(&self, id: Uuid, to: SyncStatus) -> DomainResult<()> {
        let from = self.current_status(id).await?;
        if !from.can_transition_to(to) {
            return Err(DomainError::IllegalTransition { id, from, to });
        }

        // The WHERE guard on the expected current status keeps the write
        // atomic under concurrent access: either the full transition lands
        // or nothing does.
        let result = sqlx::query(
            "UPDATE mutations SET sync_status = ?, last_attempt_at = ? \
             WHERE id = ? AND sync_status = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Database(DbError::Conflict(format!(
                "Mutation {} changed status concurrently during {:?} -> {:?}",
                id, from, to
            ))));
        }

        self.publish_counts().await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> DomainResult<()> {
        let from = self.current_status(id).await?;
        if !from.can_transition_to(SyncStatus::Failed) {
            return Err(DomainError::IllegalTransition {
                id,
                from,
                to: SyncStatus::Failed,
            });
        }

        sqlx::query(
            "UPDATE mutations SET sync_status = ?, last_error = ? \
             WHERE id = ? AND sync_status = ?",
        )
        .bind(SyncStatus::Failed.as_str())
        .bind(error)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.publish_counts().await
    }

    async fn mark_media_retry(&self, id: Uuid, error: &str) -> DomainResult<()> {
        let from = self.current_status(id).await?;
        if !from.can_transition_to(SyncStatus::MediaUploadAwaitingRetry) {
            return Err(DomainError::IllegalTransition {
                id,
                from,
                to: SyncStatus::MediaUploadAwaitingRetry,
            });
        }

        sqlx::query(
            "UPDATE mutations SET sync_status = ?, last_error = ?, retry_count = retry_count + 1 \
             WHERE id = ? AND sync_status = ?",
        )
        .bind(SyncStatus::MediaUploadAwaitingRetry.as_str())
        .bind(error)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.publish_counts().await
    }

    async fn complete_with_media(
        &self,
        id: Uuid,
        uploaded: &BTreeMap<String, String>,
    ) -> DomainResult<()> {
        let from = self.current_status(id).await?;
        if !from.can_transition_to(SyncStatus::Completed) {
            return Err(DomainError::IllegalTransition {
                id,
                from,
                to: SyncStatus::Completed,
            });
        }

        let uploaded_json = serde_json::to_string(uploaded)
            .map_err(|e| DomainError::Internal(format!("Uploaded media serialization: {}", e)))?;

        sqlx::query(
            "UPDATE mutations SET sync_status = ?, uploaded_media = ?, last_error = NULL \
             WHERE id = ? AND sync_status = ?",
        )
        .bind(SyncStatus::Completed.as_str())
        .bind(uploaded_json)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.publish_counts().await
    }

    async fn requeue_interrupted(&self) -> DomainResult<u64> {
        // An ungraceful stop can strand rows in an in-progress state with no
        // worker ever coming back for them. Reset each to its queue state so
        // the next worker run picks it up again.
        let data = sqlx::query("UPDATE mutations SET sync_status = ? WHERE sync_status = ?")
            .bind(SyncStatus::Pending.as_str())
            .bind(SyncStatus::InProgress.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        let media = sqlx::query("UPDATE mutations SET sync_status = ? WHERE sync_status = ?")
            .bind(SyncStatus::MediaUploadPending.as_str())
            .bind(SyncStatus::MediaUploadInProgress.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        let repaired = data.rows_affected() + media.rows_affected();
        if repaired > 0 {
            self.publish_counts().await?;
        }
        Ok(repaired)
    }

    async fn requeue_media_retries(&self) -> DomainResult<u64> {
        let result = sqlx::query("UPDATE mutations SET sync_status = ? WHERE sync_status = ?")
            .bind(SyncStatus::MediaUploadPending.as_str())
            .bind(SyncStatus::MediaUploadAwaitingRetry.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            self.publish_counts().await?;
        }
        Ok(requeued)
    }

    async fn requeue_failed(&self) -> DomainResult<u64> {
        let result = sqlx::query(
            "UPDATE mutations SET sync_status = ?, last_error = NULL WHERE sync_status = ?",
        )
        .bind(SyncStatus::Pending.as_str())
        .bind(SyncStatus::Failed.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            self.publish_counts().await?;
        }
        Ok(requeued)
    }

    fn watch(&self) -> watch::Receiver<StatusCounts> {
        self.counts_tx.subscribe()
    }
}
