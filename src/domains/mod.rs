pub mod core;
pub mod mutation;
pub mod sync;

pub use mutation::repository::{MutationRepository, SqliteMutationRepository};
pub use sync::work_manager::SyncWorkManager;
