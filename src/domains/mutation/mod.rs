pub mod repository;
pub mod types;

// Re-exports
pub use repository::{MutationRepository, SqliteMutationRepository};
pub use types::{
    LocationOfInterestMutation, Mutation, MutationType, StatusCounts, SubmissionMutation,
    SyncStatus, TaskType, ValueDelta,
};
