//! Purpose: Library crate behind the `levelhost` server binary and tests.
//! Exports: `core` (level table, copy jobs, target resolution, backends) and `api`.
//! Role: Holds expensive-to-open levels in memory and runs conversions against them.
//! Invariants: No ambient global state; everything hangs off an explicit `LevelManager`.
//! Invariants: Backend I/O never runs on the async scheduler threads.
pub mod api;
pub mod core;
