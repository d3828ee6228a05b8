pub mod media_store;

// Re-export the trait and core types, not specific implementations usually
pub use media_store::{LocalMediaStore, MediaStore, MediaStoreError, MediaStoreResult};
