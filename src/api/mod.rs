//! Purpose: Define the stable public Rust API boundary for levelhost.
//! Exports: Manager, handle, job, resolver and backend types needed by the binary and tests.
//! Role: Public, additive-only surface over `core`.
//! Invariants: Callers outside the crate go through this module, not `core` paths.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::{FormatRegistry, TargetWriter, WriterFactory};
pub use crate::core::fs_store::{DEFAULT_DIMENSION, DirLevel, DirStore, DirWriter};
pub use crate::core::handle::{LevelHandle, UseToken};
pub use crate::core::job::{CopyJob, JobId, JobInfo, JobSnapshot, JobStatus};
pub use crate::core::key::ResourceKey;
pub use crate::core::manager::{LevelLease, LevelManager, LevelSnapshot, LevelState, LoadState};
pub use crate::core::memory::{MEMORY_FORMAT, MemoryLevelSpec, MemoryStore, PathStats, TargetRecord};
pub use crate::core::store::{
    ChunkPos, Level, LevelStore, LevelWriter, Partition, Platform, Selection,
};

pub type ApiResult<T> = Result<T, Error>;
