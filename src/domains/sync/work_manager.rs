use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domains::core::media_store::MediaStore;
use crate::domains::mutation::repository::MutationRepository;
use crate::domains::mutation::types::Mutation;
use crate::domains::sync::data_sync_worker::DataSyncWorker;
use crate::domains::sync::media_upload_worker::MediaUploadWorker;
use crate::domains::sync::remote::RemoteDataStore;
use crate::domains::sync::types::{SyncConfig, WorkerKind, WorkerSummary};
use crate::errors::DomainResult;

/// Schedules the two worker kinds as unique background jobs.
///
/// Each kind has a single-slot request channel: while a run is active or a
/// request is already parked, further requests coalesce into it instead of
/// stacking. At most one run per kind is ever active; the two kinds run
/// concurrently with each other.
pub struct SyncWorkManager {
    repo: Arc<dyn MutationRepository>,
    data_tx: mpsc::Sender<()>,
    media_tx: mpsc::Sender<()>,
    data_runs: Arc<AtomicU64>,
    media_runs: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncWorkManager {
    pub fn new(
        repo: Arc<dyn MutationRepository>,
        remote: Arc<dyn RemoteDataStore>,
        media: Arc<dyn MediaStore>,
        config: SyncConfig,
    ) -> Self {
        let (data_tx, mut data_rx) = mpsc::channel::<()>(1);
        let (media_tx, mut media_rx) = mpsc::channel::<()>(1);
        let data_runs = Arc::new(AtomicU64::new(0));
        let media_runs = Arc::new(AtomicU64::new(0));

        let data_worker =
            DataSyncWorker::new(repo.clone(), remote.clone(), config.data_batch_limit);
        let media_worker = MediaUploadWorker::new(
            repo.clone(),
            remote,
            media,
            config.media_batch_limit,
        );

        let data_task = {
            let runs = data_runs.clone();
            let media_trigger = media_tx.clone();
            tokio::spawn(async move {
                while data_rx.recv().await.is_some() {
                    runs.fetch_add(1, Ordering::SeqCst);
                    match data_worker.run().await {
                        Ok(summary) => {
                            if summary.routed_to_media > 0 {
                                // The data phase produced media work; hand it
                                // straight to the media job.
                                let _ = media_trigger.try_send(());
                            }
                            log_summary(WorkerKind::DataSync, summary);
                        }
                        Err(e) => error!("Data sync run aborted: {}", e),
                    }
                }
            })
        };

        let media_task = {
            let runs = media_runs.clone();
            tokio::spawn(async move {
                while media_rx.recv().await.is_some() {
                    runs.fetch_add(1, Ordering::SeqCst);
                    match media_worker.run().await {
                        Ok(summary) => log_summary(WorkerKind::MediaUpload, summary),
                        Err(e) => error!("Media upload run aborted: {}", e),
                    }
                }
            })
        };

        Self {
            repo,
            data_tx,
            media_tx,
            data_runs,
            media_runs,
            tasks: vec![data_task, media_task],
        }
    }

    /// Request a data-phase run. Fire-and-forget, idempotent, safe to call
    /// redundantly.
    pub fn enqueue_data_sync(&self) {
        match self.data_tx.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Data sync already requested; coalescing")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Data sync dispatcher is shut down")
            }
        }
    }

    /// Request a media-phase run. Fire-and-forget, idempotent, safe to call
    /// redundantly.
    pub fn enqueue_media_upload(&self) {
        match self.media_tx.try_send(()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Media upload already requested; coalescing")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Media upload dispatcher is shut down")
            }
        }
    }

    /// Persist a freshly produced mutation and trigger its delivery.
    pub async fn apply_and_enqueue(&self, mutation: &Mutation) -> DomainResult<()> {
        self.repo.enqueue(mutation).await?;
        self.enqueue_data_sync();
        Ok(())
    }

    /// Application-start reconciliation. Repairs mutations stranded
    /// in-progress by an ungraceful stop, then re-fires each worker kind
    /// whose queue is non-empty. Heals work lost to process death or missed
    /// scheduling; harmless to call when nothing is outstanding.
    pub async fn recover(&self) -> DomainResult<()> {
        let repaired = self.repo.requeue_interrupted().await?;
        if repaired > 0 {
            info!(
                "Requeued {} mutations interrupted by an earlier shutdown",
                repaired
            );
        }

        if !self.repo.get_incomplete_uploads().await?.is_empty() {
            self.enqueue_data_sync();
        }
        if !self.repo.get_incomplete_media_mutations().await?.is_empty() {
            self.enqueue_media_upload();
        }
        Ok(())
    }

    /// Give media uploads that are awaiting retry another attempt. Called by
    /// the external backoff/connectivity policy; returns how many mutations
    /// were requeued.
    pub async fn requeue_media_retries(&self) -> DomainResult<u64> {
        let requeued = self.repo.requeue_media_retries().await?;
        if requeued > 0 {
            info!("Requeued {} mutations for media retry", requeued);
            self.enqueue_media_upload();
        }
        Ok(requeued)
    }

    /// Retry failed data mutations on the user's behalf; returns how many
    /// were requeued.
    pub async fn requeue_failed_uploads(&self) -> DomainResult<u64> {
        let requeued = self.repo.requeue_failed().await?;
        if requeued > 0 {
            info!("Requeued {} failed mutations", requeued);
            self.enqueue_data_sync();
        }
        Ok(requeued)
    }

    /// Number of runs started for the given worker kind since construction.
    pub fn runs_started(&self, kind: WorkerKind) -> u64 {
        match kind {
            WorkerKind::DataSync => self.data_runs.load(Ordering::SeqCst),
            WorkerKind::MediaUpload => self.media_runs.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting requests and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        drop(self.data_tx);
        drop(self.media_tx);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn log_summary(kind: WorkerKind, summary: WorkerSummary) {
    if summary.all_succeeded() {
        debug!(
            "{:?} run processed {} mutations",
            kind, summary.processed
        );
    } else {
        warn!(
            "{:?} run left {} of {} mutations unresolved",
            kind, summary.failed, summary.processed
        );
    }
}
