use std::sync::Arc;

use log::{debug, info, warn};

use crate::domains::mutation::repository::MutationRepository;
use crate::domains::mutation::types::{Mutation, SyncStatus};
use crate::domains::sync::remote::{MutationPayload, RemoteDataStore};
use crate::domains::sync::types::WorkerSummary;
use crate::errors::DomainResult;

/// Data-phase worker: drains pending mutations and replays them against the
/// remote store.
pub struct DataSyncWorker {
    repo: Arc<dyn MutationRepository>,
    remote: Arc<dyn RemoteDataStore>,
    batch_limit: usize,
}

impl DataSyncWorker {
    pub fn new(
        repo: Arc<dyn MutationRepository>,
        remote: Arc<dyn RemoteDataStore>,
        batch_limit: usize,
    ) -> Self {
        Self {
            repo,
            remote,
            batch_limit,
        }
    }

    /// Process every pending mutation. One mutation's delivery failure marks
    /// that mutation failed and moves on; it never aborts the batch.
    pub async fn run(&self) -> DomainResult<WorkerSummary> {
        let pending = self.repo.list_by_status(SyncStatus::Pending).await?;
        if pending.is_empty() {
            debug!("No pending mutations to sync");
            return Ok(WorkerSummary::default());
        }

        info!("Syncing {} pending mutations", pending.len());
        let mut summary = WorkerSummary::default();
        for mutation in pending.into_iter().take(self.batch_limit) {
            summary.processed += 1;
            match self.sync_one(&mutation).await? {
                SyncStatus::MediaUploadPending => summary.routed_to_media += 1,
                SyncStatus::Failed => summary.failed += 1,
                _ => {}
            }
        }

        if summary.failed > 0 {
            warn!(
                "Data sync run left {} of {} mutations failed",
                summary.failed, summary.processed
            );
        }
        Ok(summary)
    }

    /// Deliver a single mutation, returning the status it ended in. Delivery
    /// errors are retained on the row; store and invariant errors propagate.
    async fn sync_one(&self, mutation: &Mutation) -> DomainResult<SyncStatus> {
        self.repo
            .transition(mutation.id(), SyncStatus::InProgress)
            .await?;

        let payload = MutationPayload::from(mutation);
        match self.remote.push_mutation(&payload).await {
            Ok(()) => {
                // A mutation with no photo deltas is done; one with photos
                // owes a media phase before it can complete.
                let next = if mutation.has_photo_deltas() {
                    SyncStatus::MediaUploadPending
                } else {
                    SyncStatus::Completed
                };
                self.repo.transition(mutation.id(), next).await?;
                Ok(next)
            }
            Err(e) => {
                warn!("Failed to push mutation {}: {}", mutation.id(), e);
                self.repo.mark_failed(mutation.id(), &e.to_string()).await?;
                Ok(SyncStatus::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::remote::FakeRemoteDataStore;
    use crate::test_support::{
        memory_repo, pending_loi_mutation, photo_delta, submission_mutation, text_delta,
    };

    async fn worker_with_fake() -> (Arc<dyn MutationRepository>, Arc<FakeRemoteDataStore>, DataSyncWorker)
    {
        let repo: Arc<dyn MutationRepository> = Arc::new(memory_repo().await);
        let remote = Arc::new(FakeRemoteDataStore::new());
        let worker = DataSyncWorker::new(repo.clone(), remote.clone(), 1000);
        (repo, remote, worker)
    }

    #[tokio::test]
    async fn completes_mutation_without_media() {
        let (repo, remote, worker) = worker_with_fake().await;
        let mutation = pending_loi_mutation();
        repo.enqueue(&mutation).await.unwrap();

        let summary = worker.run().await.unwrap();

        assert_eq!(summary.processed, 1);
        assert!(summary.all_succeeded());
        assert_eq!(
            repo.find_by_id(mutation.id()).await.unwrap().sync_status(),
            SyncStatus::Completed
        );
        assert_eq!(remote.pushed_ids(), vec![mutation.id()]);
    }

    #[tokio::test]
    async fn routes_photo_mutation_to_media_phase() {
        let (repo, _remote, worker) = worker_with_fake().await;
        let mutation = submission_mutation(
            SyncStatus::Pending,
            vec![text_delta("notes", "dry well"), photo_delta("photo_task", "well.jpg")],
        );
        repo.enqueue(&mutation).await.unwrap();

        let summary = worker.run().await.unwrap();

        assert_eq!(summary.routed_to_media, 1);
        assert_eq!(
            repo.find_by_id(mutation.id()).await.unwrap().sync_status(),
            SyncStatus::MediaUploadPending
        );
    }

    #[tokio::test]
    async fn submission_without_photos_never_enters_media_phase() {
        let (repo, _remote, worker) = worker_with_fake().await;
        let mutation =
            submission_mutation(SyncStatus::Pending, vec![text_delta("notes", "dry well")]);
        repo.enqueue(&mutation).await.unwrap();

        worker.run().await.unwrap();

        assert_eq!(
            repo.find_by_id(mutation.id()).await.unwrap().sync_status(),
            SyncStatus::Completed
        );
    }

    #[tokio::test]
    async fn push_failure_is_isolated_per_mutation() {
        let (repo, remote, worker) = worker_with_fake().await;
        let doomed = submission_mutation(SyncStatus::Pending, vec![]);
        let healthy = pending_loi_mutation();
        repo.enqueue(&doomed).await.unwrap();
        repo.enqueue(&healthy).await.unwrap();
        remote.fail_push_of(doomed.id());

        let summary = worker.run().await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_succeeded());

        let failed = repo.find_by_id(doomed.id()).await.unwrap();
        assert_eq!(failed.sync_status(), SyncStatus::Failed);
        assert!(failed.last_error().unwrap().contains("rejected"));

        assert_eq!(
            repo.find_by_id(healthy.id()).await.unwrap().sync_status(),
            SyncStatus::Completed
        );
    }

    #[tokio::test]
    async fn failed_mutations_are_not_retried_automatically() {
        let (repo, remote, worker) = worker_with_fake().await;
        let mutation = pending_loi_mutation();
        repo.enqueue(&mutation).await.unwrap();
        remote.fail_push_of(mutation.id());

        worker.run().await.unwrap();
        let summary = worker.run().await.unwrap();

        // The second run sees no pending work; the failed row waits for a
        // manual requeue.
        assert_eq!(summary.processed, 0);
        assert_eq!(
            repo.find_by_id(mutation.id()).await.unwrap().sync_status(),
            SyncStatus::Failed
        );
    }
}
