//! Purpose: Capability traits for the level backend that does the actual world I/O.
//! Exports: `LevelStore`, `Level`, `LevelWriter`, `Selection`, `ChunkPos`, `Partition`, `Platform`.
//! Role: Narrow seam between the lifecycle core and any concrete world format.
//! Invariants: Trait methods are blocking; callers run them on the blocking pool.
//! Invariants: A `Level` is shared read-only between jobs; a `LevelWriter` is owned by one job.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::error::Error;

pub const CHUNK_SIZE: i32 = 16;

/// Opens levels by path.
pub trait LevelStore: Send + Sync + 'static {
    fn load(&self, path: &Path) -> Result<Arc<dyn Level>, Error>;
}

/// An opened level.
pub trait Level: Send + Sync {
    fn class_name(&self) -> &str;
    fn platform(&self) -> Platform;
    fn dimensions(&self) -> Vec<String>;
    fn bounds(&self, dimension: &str) -> Result<Selection, Error>;
    /// Partitions of `dimension` that intersect `selection`, in native enumeration order.
    fn partitions(&self, dimension: &str, selection: &Selection) -> Result<Vec<ChunkPos>, Error>;
    fn read_partition(&self, dimension: &str, pos: ChunkPos) -> Result<Partition, Error>;
    fn close(&self) -> Result<(), Error>;
}

/// Target side of a conversion.
pub trait LevelWriter: Send {
    fn class_name(&self) -> &str;
    fn path(&self) -> &Path;
    fn dimensions(&self) -> Vec<String>;
    /// Creates the output. Fails with `AlreadyExists` when `overwrite` is false and the path exists.
    fn create_and_open(
        &mut self,
        platform: &Platform,
        selection: &Selection,
        overwrite: bool,
    ) -> Result<(), Error>;
    fn commit_partition(&mut self, partition: &Partition, dimension: &str) -> Result<(), Error>;
    fn save(&mut self) -> Result<(), Error>;
    fn close(&mut self) -> Result<(), Error>;
    /// Deletes whatever this writer created.
    fn remove_output(&mut self) -> Result<(), Error>;
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub version: Vec<u32>,
}

impl Platform {
    pub fn new(name: impl Into<String>, version: impl Into<Vec<u32>>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parses a dotted version such as `1.20.1`.
    pub fn parse_version(text: &str) -> Option<Vec<u32>> {
        let parts = text
            .split('.')
            .map(|part| part.trim().parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() { None } else { Some(parts) }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self
            .version
            .iter()
            .map(|part| part.to_string())
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{} {version}", self.name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChunkPos {
    pub cx: i32,
    pub cz: i32,
}

impl ChunkPos {
    pub fn new(cx: i32, cz: i32) -> Self {
        Self { cx, cz }
    }
}

/// Block-space box, min inclusive and max exclusive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub min: [i32; 3],
    pub max: [i32; 3],
}

impl Selection {
    pub fn new(min: [i32; 3], max: [i32; 3]) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.max[axis] <= self.min[axis])
    }

    pub fn intersects_chunk(&self, pos: ChunkPos) -> bool {
        if self.is_empty() {
            return false;
        }
        // Chunk coordinates come from untrusted names; block space can exceed i32.
        let size = i64::from(CHUNK_SIZE);
        let (x0, z0) = (i64::from(pos.cx) * size, i64::from(pos.cz) * size);
        let (x1, z1) = (x0 + size, z0 + size);
        x0 < i64::from(self.max[0])
            && x1 > i64::from(self.min[0])
            && z0 < i64::from(self.max[2])
            && z1 > i64::from(self.min[2])
    }
}

/// One unit of copied data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Partition {
    pub pos: ChunkPos,
    pub data: Bytes,
}

impl Partition {
    pub fn new(pos: ChunkPos, data: impl Into<Bytes>) -> Self {
        Self {
            pos,
            data: data.into(),
        }
    }
}
