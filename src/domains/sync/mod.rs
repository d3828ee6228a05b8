pub mod data_sync_worker;
pub mod media_upload_worker;
pub mod remote;
pub mod types;
pub mod work_manager;

// Re-exports
pub use remote::{HttpRemoteDataStore, MutationPayload, RemoteDataStore};
pub use types::{RetryPolicy, SyncConfig, WorkerKind, WorkerSummary};
pub use work_manager::SyncWorkManager;
