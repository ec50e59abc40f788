// Lifecycle core: level table, copy jobs, target resolution, and the backend seam.
pub mod error;
pub mod format;
pub mod fs_store;
pub mod handle;
pub mod job;
pub mod key;
pub mod manager;
pub mod memory;
pub mod store;
