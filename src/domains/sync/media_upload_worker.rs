use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::domains::core::media_store::{remote_media_path, MediaStore, MediaStoreError};
use crate::domains::mutation::repository::MutationRepository;
use crate::domains::mutation::types::{Mutation, SyncStatus};
use crate::domains::sync::remote::RemoteDataStore;
use crate::domains::sync::types::WorkerSummary;
use crate::errors::{DomainError, DomainResult, SyncError, ValidationError};

/// Media-phase worker: uploads the photo files referenced by mutations whose
/// data push already succeeded.
pub struct MediaUploadWorker {
    repo: Arc<dyn MutationRepository>,
    remote: Arc<dyn RemoteDataStore>,
    media: Arc<dyn MediaStore>,
    batch_limit: usize,
}

impl MediaUploadWorker {
    pub fn new(
        repo: Arc<dyn MutationRepository>,
        remote: Arc<dyn RemoteDataStore>,
        media: Arc<dyn MediaStore>,
        batch_limit: usize,
    ) -> Self {
        Self {
            repo,
            remote,
            media,
            batch_limit,
        }
    }

    /// Process every mutation currently awaiting media upload. Mutations in
    /// any other status are never touched. One mutation's failure moves it to
    /// awaiting-retry and the run continues with the rest.
    pub async fn run(&self) -> DomainResult<WorkerSummary> {
        let eligible = self
            .repo
            .list_by_status(SyncStatus::MediaUploadPending)
            .await?;
        if eligible.is_empty() {
            debug!("No media uploads pending");
            return Ok(WorkerSummary::default());
        }

        info!("Uploading media for {} mutations", eligible.len());
        let mut summary = WorkerSummary::default();
        for mutation in eligible.into_iter().take(self.batch_limit) {
            summary.processed += 1;
            if !self.upload_one(&mutation).await? {
                summary.failed += 1;
            }
        }

        if summary.failed > 0 {
            warn!(
                "Media upload run left {} of {} mutations awaiting retry",
                summary.failed, summary.processed
            );
        }
        Ok(summary)
    }

    /// Upload every photo delta of one mutation. The mutation completes only
    /// if all of them succeed; any failed or missing file parks the whole
    /// mutation in awaiting-retry with nothing recorded, so the next attempt
    /// replays it from scratch.
    async fn upload_one(&self, mutation: &Mutation) -> DomainResult<bool> {
        self.repo
            .transition(mutation.id(), SyncStatus::MediaUploadInProgress)
            .await?;

        let mut uploaded = BTreeMap::new();
        let mut failures: Vec<String> = Vec::new();
        for delta in mutation.photo_deltas() {
            let file_name = delta.photo_file_name().ok_or_else(|| {
                DomainError::Validation(ValidationError::invalid_value(
                    "mutations.deltas",
                    &format!("Photo delta {} carries no file name", delta.task_id),
                ))
            })?;

            match self.upload_photo(mutation, file_name).await {
                Ok(remote_key) => {
                    uploaded.insert(delta.task_id.clone(), remote_key);
                }
                Err(e) => {
                    warn!(
                        "Photo upload failed for mutation {} task {}: {}",
                        mutation.id(),
                        delta.task_id,
                        e
                    );
                    failures.push(format!("{}: {}", delta.task_id, e));
                }
            }
        }

        if failures.is_empty() {
            self.repo
                .complete_with_media(mutation.id(), &uploaded)
                .await?;
            Ok(true)
        } else {
            self.repo
                .mark_media_retry(mutation.id(), &failures.join("; "))
                .await?;
            Ok(false)
        }
    }

    async fn upload_photo(&self, mutation: &Mutation, file_name: &str) -> Result<String, SyncError> {
        let path = self.media.resolve(file_name).await.map_err(|e| match e {
            MediaStoreError::NotFound(f) => SyncError::MediaMissing(f),
            other => SyncError::Other(other.to_string()),
        })?;
        let destination_key = remote_media_path(mutation.survey_id(), file_name);
        self.remote.upload_media(&path, &destination_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::media_store::LocalMediaStore;
    use crate::domains::sync::data_sync_worker::DataSyncWorker;
    use crate::domains::sync::remote::FakeRemoteDataStore;
    use crate::test_support::{memory_repo, photo_delta, submission_mutation, text_delta};
    use tempfile::TempDir;

    struct MediaHarness {
        repo: Arc<dyn MutationRepository>,
        remote: Arc<FakeRemoteDataStore>,
        worker: MediaUploadWorker,
        media_dir: TempDir,
    }

    async fn harness() -> MediaHarness {
        let repo: Arc<dyn MutationRepository> = Arc::new(memory_repo().await);
        let remote = Arc::new(FakeRemoteDataStore::new());
        let media_dir = tempfile::tempdir().unwrap();
        let media: Arc<dyn MediaStore> =
            Arc::new(LocalMediaStore::new(media_dir.path().to_str().unwrap()).unwrap());
        let worker = MediaUploadWorker::new(repo.clone(), remote.clone(), media, 100);
        MediaHarness {
            repo,
            remote,
            worker,
            media_dir,
        }
    }

    impl MediaHarness {
        fn write_photo(&self, file_name: &str) {
            std::fs::write(self.media_dir.path().join(file_name), b"jpeg bytes").unwrap();
        }

        async fn count(&self, status: SyncStatus) -> i64 {
            self.repo.count_by_status(status).await.unwrap()
        }
    }

    #[tokio::test]
    async fn succeeds_on_existing_photo() {
        let h = harness().await;
        h.write_photo("well.jpg");
        let mutation = submission_mutation(
            SyncStatus::MediaUploadPending,
            vec![photo_delta("photo_task", "well.jpg")],
        );
        h.repo.enqueue(&mutation).await.unwrap();

        let summary = h.worker.run().await.unwrap();

        assert!(summary.all_succeeded());
        assert_eq!(h.count(SyncStatus::Completed).await, 1);

        // Remote keys are recorded on the row for idempotent replay.
        match h.repo.find_by_id(mutation.id()).await.unwrap() {
            Mutation::Submission(m) => {
                assert_eq!(
                    m.uploaded_media.get("photo_task").map(String::as_str),
                    Some("user-media/survey_1/well.jpg")
                );
            }
            other => panic!("Expected submission mutation, got {:?}", other),
        }
        assert_eq!(
            h.remote.uploaded_keys(),
            vec!["user-media/survey_1/well.jpg".to_string()]
        );
    }

    #[tokio::test]
    async fn fails_on_missing_photo() {
        let h = harness().await;
        let mutation = submission_mutation(
            SyncStatus::MediaUploadPending,
            vec![photo_delta("photo_task", "does_not_exist.jpg")],
        );
        h.repo.enqueue(&mutation).await.unwrap();

        let summary = h.worker.run().await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(h.count(SyncStatus::MediaUploadAwaitingRetry).await, 1);

        let stored = h.repo.find_by_id(mutation.id()).await.unwrap();
        assert!(stored.last_error().unwrap().contains("does_not_exist.jpg"));
        assert_eq!(stored.retry_count(), 1);

        // The row stays parked until an external requeue; another run must
        // not pick it up.
        let second = h.worker.run().await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(h.count(SyncStatus::MediaUploadAwaitingRetry).await, 1);
    }

    #[tokio::test]
    async fn one_bad_delta_parks_the_whole_mutation() {
        let h = harness().await;
        h.write_photo("good.jpg");
        let mutation = submission_mutation(
            SyncStatus::MediaUploadPending,
            vec![
                photo_delta("photo_task", "good.jpg"),
                photo_delta("second_photo_task", "missing.jpg"),
            ],
        );
        h.repo.enqueue(&mutation).await.unwrap();

        h.worker.run().await.unwrap();

        assert_eq!(h.count(SyncStatus::MediaUploadAwaitingRetry).await, 1);
        assert_eq!(h.count(SyncStatus::MediaUploadPending).await, 0);
        assert_eq!(h.count(SyncStatus::MediaUploadInProgress).await, 0);
        assert_eq!(h.count(SyncStatus::Completed).await, 0);

        // No partial success is recorded even though one delta uploaded.
        match h.repo.find_by_id(mutation.id()).await.unwrap() {
            Mutation::Submission(m) => assert!(m.uploaded_media.is_empty()),
            other => panic!("Expected submission mutation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn upload_rejection_parks_the_mutation() {
        let h = harness().await;
        h.write_photo("rejected.jpg");
        h.remote.fail_upload_of("rejected.jpg");
        let mutation = submission_mutation(
            SyncStatus::MediaUploadPending,
            vec![photo_delta("photo_task", "rejected.jpg")],
        );
        h.repo.enqueue(&mutation).await.unwrap();

        h.worker.run().await.unwrap();

        assert_eq!(h.count(SyncStatus::MediaUploadAwaitingRetry).await, 1);
    }

    #[tokio::test]
    async fn ignores_non_media_mutations() {
        let h = harness().await;
        for status in [
            SyncStatus::Pending,
            SyncStatus::Failed,
            SyncStatus::InProgress,
            SyncStatus::Completed,
            SyncStatus::Unknown,
        ] {
            h.repo
                .enqueue(&submission_mutation(status, vec![]))
                .await
                .unwrap();
        }

        let summary = h.worker.run().await.unwrap();

        assert_eq!(summary.processed, 0);
        assert_eq!(h.count(SyncStatus::Pending).await, 1);
        assert_eq!(h.count(SyncStatus::Failed).await, 1);
        assert_eq!(h.count(SyncStatus::InProgress).await, 1);
        assert_eq!(h.count(SyncStatus::Completed).await, 1);
        assert_eq!(h.count(SyncStatus::Unknown).await, 1);
        assert_eq!(h.count(SyncStatus::MediaUploadAwaitingRetry).await, 0);
        assert_eq!(h.count(SyncStatus::MediaUploadPending).await, 0);
        assert_eq!(h.count(SyncStatus::MediaUploadInProgress).await, 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_batch() {
        let h = harness().await;
        h.write_photo("a.jpg");
        h.write_photo("b.jpg");
        let good_a = submission_mutation(
            SyncStatus::MediaUploadPending,
            vec![photo_delta("photo_task", "a.jpg")],
        );
        let bad = submission_mutation(
            SyncStatus::MediaUploadPending,
            vec![photo_delta("photo_task", "gone.jpg")],
        );
        let good_b = submission_mutation(
            SyncStatus::MediaUploadPending,
            vec![photo_delta("photo_task", "b.jpg")],
        );
        for m in [&good_a, &bad, &good_b] {
            h.repo.enqueue(m).await.unwrap();
        }

        let summary = h.worker.run().await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(h.count(SyncStatus::Completed).await, 2);
        assert_eq!(h.count(SyncStatus::MediaUploadAwaitingRetry).await, 1);
        assert_eq!(
            h.repo.find_by_id(bad.id()).await.unwrap().sync_status(),
            SyncStatus::MediaUploadAwaitingRetry
        );
    }

    #[tokio::test]
    async fn photo_mutation_travels_both_phases() {
        let h = harness().await;
        h.write_photo("site.jpg");
        let mutation = submission_mutation(
            SyncStatus::Pending,
            vec![text_delta("notes", "clear water"), photo_delta("photo_task", "site.jpg")],
        );
        h.repo.enqueue(&mutation).await.unwrap();

        let data_worker = DataSyncWorker::new(h.repo.clone(), h.remote.clone(), 1000);
        data_worker.run().await.unwrap();
        assert_eq!(
            h.repo.find_by_id(mutation.id()).await.unwrap().sync_status(),
            SyncStatus::MediaUploadPending
        );

        h.worker.run().await.unwrap();
        assert_eq!(
            h.repo.find_by_id(mutation.id()).await.unwrap().sync_status(),
            SyncStatus::Completed
        );
    }
}
