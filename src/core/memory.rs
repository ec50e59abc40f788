//! In-memory level backend for tests and demos.
//!
//! Levels live in a shared map keyed by absolute path. The store counts loads and
//! closes per path and tracks how many copies of each level are open at once, so
//! lifecycle tests can assert on deduplication and exactly-once close. Writers
//! record what they were asked to do instead of touching the filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::FormatRegistry;
use crate::core::store::{
    ChunkPos, Level, LevelStore, LevelWriter, Partition, Platform, Selection,
};

pub const MEMORY_FORMAT: &str = "memory";
const MEMORY_DIMENSION: &str = "overworld";

/// Blueprint for a level the store can load.
#[derive(Clone, Debug)]
pub struct MemoryLevelSpec {
    chunks: Vec<ChunkPos>,
    read_delay: Duration,
    fail_read_at: Option<usize>,
    panic_read_at: Option<usize>,
}

impl MemoryLevelSpec {
    /// A level with `count` chunks laid out along the x axis.
    pub fn with_chunks(count: usize) -> Self {
        Self {
            chunks: (0..count as i32).map(|cx| ChunkPos::new(cx, 0)).collect(),
            read_delay: Duration::ZERO,
            fail_read_at: None,
            panic_read_at: None,
        }
    }

    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Reading the chunk at `index` (0-based, enumeration order) fails.
    pub fn fail_read_at(mut self, index: usize) -> Self {
        self.fail_read_at = Some(index);
        self
    }

    /// Reading the chunk at `index` panics, standing in for a backend bug.
    pub fn panic_read_at(mut self, index: usize) -> Self {
        self.panic_read_at = Some(index);
        self
    }

    fn selection(&self) -> Selection {
        let width = (self.chunks.len().max(1) as i32) * 16;
        Selection::new([0, 0, 0], [width, 256, 16])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathStats {
    pub loads: usize,
    pub closes: usize,
    pub open_now: usize,
    pub max_open: usize,
}

/// What a memory writer was asked to do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetRecord {
    pub opened: bool,
    pub committed: Vec<ChunkPos>,
    pub saved: bool,
    pub closed: bool,
    pub removed: bool,
    pub platform: Option<Platform>,
}

#[derive(Default)]
struct State {
    levels: HashMap<PathBuf, MemoryLevelSpec>,
    stats: HashMap<PathBuf, PathStats>,
    targets: HashMap<PathBuf, TargetRecord>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    load_delay: Mutex<Duration>,
    fail_commit_after: Mutex<Option<usize>>,
    fail_close: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn insert(&self, path: impl AsRef<Path>, spec: MemoryLevelSpec) {
        self.lock().levels.insert(path.as_ref().to_path_buf(), spec);
    }

    /// Every load sleeps this long before returning.
    pub fn set_load_delay(&self, delay: Duration) {
        *self
            .inner
            .load_delay
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = delay;
    }

    /// Writers fail the commit after `count` successful commits.
    pub fn set_fail_commit_after(&self, count: Option<usize>) {
        *self
            .inner
            .fail_commit_after
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = count;
    }

    /// Level closes report an error after releasing their resources.
    pub fn set_fail_close(&self, fail: bool) {
        self.inner.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self, path: impl AsRef<Path>) -> PathStats {
        self.lock()
            .stats
            .get(path.as_ref())
            .cloned()
            .unwrap_or_default()
    }

    pub fn target(&self, path: impl AsRef<Path>) -> Option<TargetRecord> {
        self.lock().targets.get(path.as_ref()).cloned()
    }

    /// Registry containing the `memory` writer bound to this store.
    pub fn format_registry(&self) -> FormatRegistry {
        let mut registry = FormatRegistry::with_builtin();
        let store = self.clone();
        registry.register(MEMORY_FORMAT, move |path| {
            Box::new(MemoryWriter::new(store.clone(), path)) as Box<dyn LevelWriter>
        });
        registry
    }
}

impl LevelStore for MemoryStore {
    fn load(&self, path: &Path) -> Result<Arc<dyn Level>, Error> {
        let delay = *self
            .inner
            .load_delay
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self.lock();
        let stats = state.stats.entry(path.to_path_buf()).or_default();
        stats.loads += 1;
        let Some(spec) = state.levels.get(path).cloned() else {
            return Err(Error::new(ErrorKind::Load)
                .with_message("no level at path")
                .with_path(path));
        };
        let stats = state.stats.entry(path.to_path_buf()).or_default();
        stats.open_now += 1;
        stats.max_open = stats.max_open.max(stats.open_now);
        Ok(Arc::new(MemoryLevel {
            store: self.clone(),
            path: path.to_path_buf(),
            spec,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryLevel {
    store: MemoryStore,
    path: PathBuf,
    spec: MemoryLevelSpec,
    closed: AtomicBool,
}

impl Level for MemoryLevel {
    fn class_name(&self) -> &str {
        "MemoryLevel"
    }

    fn platform(&self) -> Platform {
        Platform::new("memory", vec![1])
    }

    fn dimensions(&self) -> Vec<String> {
        vec![MEMORY_DIMENSION.to_string()]
    }

    fn bounds(&self, _dimension: &str) -> Result<Selection, Error> {
        Ok(self.spec.selection())
    }

    fn partitions(&self, _dimension: &str, selection: &Selection) -> Result<Vec<ChunkPos>, Error> {
        Ok(self
            .spec
            .chunks
            .iter()
            .copied()
            .filter(|pos| selection.intersects_chunk(*pos))
            .collect())
    }

    fn read_partition(&self, _dimension: &str, pos: ChunkPos) -> Result<Partition, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("level is closed")
                .with_path(&self.path));
        }
        if !self.spec.read_delay.is_zero() {
            std::thread::sleep(self.spec.read_delay);
        }
        let index = self.spec.chunks.iter().position(|chunk| *chunk == pos);
        if index.is_some() && index == self.spec.panic_read_at {
            panic!("injected panic at chunk {},{}", pos.cx, pos.cz);
        }
        if index.is_some() && index == self.spec.fail_read_at {
            return Err(Error::new(ErrorKind::Io)
                .with_message(format!("injected read failure at chunk {},{}", pos.cx, pos.cz))
                .with_path(&self.path));
        }
        Ok(Partition::new(pos, format!("{},{}", pos.cx, pos.cz).into_bytes()))
    }

    fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("level closed twice")
                .with_path(&self.path));
        }
        let mut state = self.store.lock();
        let stats = state.stats.entry(self.path.clone()).or_default();
        stats.closes += 1;
        stats.open_now = stats.open_now.saturating_sub(1);
        drop(state);
        if self.store.inner.fail_close.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Io)
                .with_message("injected close failure")
                .with_path(&self.path));
        }
        Ok(())
    }
}

struct MemoryWriter {
    store: MemoryStore,
    path: PathBuf,
    commits: usize,
}

impl MemoryWriter {
    fn new(store: MemoryStore, path: &Path) -> Self {
        Self {
            store,
            path: path.to_path_buf(),
            commits: 0,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut TargetRecord)) {
        let mut state = self.store.lock();
        apply(state.targets.entry(self.path.clone()).or_default());
    }
}

impl LevelWriter for MemoryWriter {
    fn class_name(&self) -> &str {
        "MemoryWriter"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn dimensions(&self) -> Vec<String> {
        vec![MEMORY_DIMENSION.to_string()]
    }

    fn create_and_open(
        &mut self,
        platform: &Platform,
        _selection: &Selection,
        overwrite: bool,
    ) -> Result<(), Error> {
        let mut state = self.store.lock();
        let exists = state
            .targets
            .get(&self.path)
            .is_some_and(|record| record.opened && !record.removed);
        if exists && !overwrite {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("target already exists")
                .with_path(&self.path));
        }
        state.targets.insert(
            self.path.clone(),
            TargetRecord {
                opened: true,
                platform: Some(platform.clone()),
                ..TargetRecord::default()
            },
        );
        Ok(())
    }

    fn commit_partition(&mut self, partition: &Partition, _dimension: &str) -> Result<(), Error> {
        let limit = *self
            .store
            .inner
            .fail_commit_after
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if limit.is_some_and(|limit| self.commits >= limit) {
            return Err(Error::new(ErrorKind::Io)
                .with_message("injected commit failure")
                .with_path(&self.path));
        }
        self.commits += 1;
        let pos = partition.pos;
        self.update(|record| record.committed.push(pos));
        Ok(())
    }

    fn save(&mut self) -> Result<(), Error> {
        self.update(|record| record.saved = true);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.update(|record| record.closed = true);
        Ok(())
    }

    fn remove_output(&mut self) -> Result<(), Error> {
        self.update(|record| record.removed = true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryLevelSpec, MemoryStore};
    use crate::core::error::ErrorKind;
    use crate::core::store::{ChunkPos, Level, LevelStore};
    use std::path::Path;

    #[test]
    fn load_and_close_are_counted() {
        let store = MemoryStore::new();
        store.insert("/w1", MemoryLevelSpec::with_chunks(2));
        let level = store.load(Path::new("/w1")).expect("load");
        assert_eq!(store.stats("/w1").open_now, 1);
        level.close().expect("close");
        let stats = store.stats("/w1");
        assert_eq!((stats.loads, stats.closes, stats.open_now), (1, 1, 0));
        assert_eq!(level.close().expect_err("double close").kind(), ErrorKind::Internal);
    }

    #[test]
    fn missing_level_counts_the_attempt() {
        let store = MemoryStore::new();
        let err = store.load(Path::new("/nope")).err().expect("err");
        assert_eq!(err.kind(), ErrorKind::Load);
        assert_eq!(store.stats("/nope").loads, 1);
        assert_eq!(store.stats("/nope").open_now, 0);
    }

    #[test]
    fn injected_read_failure_hits_the_right_chunk() {
        let store = MemoryStore::new();
        store.insert("/w1", MemoryLevelSpec::with_chunks(5).fail_read_at(3));
        let level = store.load(Path::new("/w1")).expect("load");
        level.read_partition("overworld", ChunkPos::new(2, 0)).expect("read");
        let err = level
            .read_partition("overworld", ChunkPos::new(3, 0))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
