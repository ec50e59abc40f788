// Directory-backed level format: a JSON manifest plus one file per chunk.
//
// Layout:
//   <root>/level.json                       platform + per-dimension bounds
//   <root>/chunks/<dimension>/<cx>.<cz>.chunk  raw chunk payload
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, map_io_error_kind};
use crate::core::store::{
    ChunkPos, Level, LevelStore, LevelWriter, Partition, Platform, Selection,
};

const MANIFEST_FILE: &str = "level.json";
const CHUNKS_DIR: &str = "chunks";
const CHUNK_EXT: &str = "chunk";
pub const DEFAULT_DIMENSION: &str = "overworld";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
struct DimensionManifest {
    name: String,
    bounds: Selection,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
struct LevelManifest {
    platform: Platform,
    dimensions: Vec<DimensionManifest>,
}

fn io_error(err: io::Error, message: &str, path: &Path) -> Error {
    Error::new(map_io_error_kind(&err))
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

fn chunk_file_name(pos: ChunkPos) -> String {
    format!("{}.{}.{CHUNK_EXT}", pos.cx, pos.cz)
}

fn parse_chunk_file_name(name: &str) -> Option<ChunkPos> {
    let stem = name.strip_suffix(CHUNK_EXT)?.strip_suffix('.')?;
    let (cx, cz) = stem.split_once('.')?;
    Some(ChunkPos::new(cx.parse().ok()?, cz.parse().ok()?))
}

/// Opens `fs-dir` levels.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirStore;

impl LevelStore for DirStore {
    fn load(&self, path: &Path) -> Result<Arc<dyn Level>, Error> {
        Ok(Arc::new(DirLevel::open(path)?))
    }
}

#[derive(Debug)]
pub struct DirLevel {
    root: PathBuf,
    manifest: LevelManifest,
    closed: AtomicBool,
}

impl DirLevel {
    pub const CLASS_NAME: &'static str = "DirLevel";

    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::new(ErrorKind::Load)
                .with_message("not a level directory")
                .with_path(&root));
        }
        let manifest_path = root.join(MANIFEST_FILE);
        let bytes = fs::read(&manifest_path).map_err(|err| {
            Error::new(ErrorKind::Load)
                .with_message("failed to read level manifest")
                .with_path(&manifest_path)
                .with_source(err)
        })?;
        let manifest: LevelManifest = serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(ErrorKind::Load)
                .with_message("corrupt level manifest")
                .with_path(&manifest_path)
                .with_source(err)
        })?;
        Ok(Self {
            root,
            manifest,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("level is closed")
                .with_path(&self.root));
        }
        Ok(())
    }

    fn dimension_dir(&self, dimension: &str) -> PathBuf {
        self.root.join(CHUNKS_DIR).join(dimension)
    }
}

impl Level for DirLevel {
    fn class_name(&self) -> &str {
        Self::CLASS_NAME
    }

    fn platform(&self) -> Platform {
        self.manifest.platform.clone()
    }

    fn dimensions(&self) -> Vec<String> {
        self.manifest
            .dimensions
            .iter()
            .map(|dimension| dimension.name.clone())
            .collect()
    }

    fn bounds(&self, dimension: &str) -> Result<Selection, Error> {
        self.manifest
            .dimensions
            .iter()
            .find(|entry| entry.name == dimension)
            .map(|entry| entry.bounds)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("unknown dimension: {dimension}"))
                    .with_path(&self.root)
            })
    }

    fn partitions(&self, dimension: &str, selection: &Selection) -> Result<Vec<ChunkPos>, Error> {
        self.ensure_open()?;
        let dir = self.dimension_dir(dimension);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(err, "failed to list chunks", &dir)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(err, "failed to list chunks", &dir))?;
            let name = entry.file_name();
            let Some(pos) = name.to_str().and_then(parse_chunk_file_name) else {
                continue;
            };
            if selection.intersects_chunk(pos) {
                out.push(pos);
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_partition(&self, dimension: &str, pos: ChunkPos) -> Result<Partition, Error> {
        self.ensure_open()?;
        let path = self.dimension_dir(dimension).join(chunk_file_name(pos));
        let data = fs::read(&path).map_err(|err| io_error(err, "failed to read chunk", &path))?;
        Ok(Partition::new(pos, data))
    }

    fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Writes `fs-dir` levels.
#[derive(Debug)]
pub struct DirWriter {
    root: PathBuf,
    manifest: Option<LevelManifest>,
    open: bool,
    created: bool,
}

impl DirWriter {
    pub const FORMAT_NAME: &'static str = "fs-dir";
    pub const CLASS_NAME: &'static str = "DirWriter";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest: None,
            open: false,
            created: false,
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if !self.open {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("writer is not open")
                .with_path(&self.root));
        }
        Ok(())
    }
}

impl LevelWriter for DirWriter {
    fn class_name(&self) -> &str {
        Self::CLASS_NAME
    }

    fn path(&self) -> &Path {
        &self.root
    }

    fn dimensions(&self) -> Vec<String> {
        vec![DEFAULT_DIMENSION.to_string()]
    }

    fn create_and_open(
        &mut self,
        platform: &Platform,
        selection: &Selection,
        overwrite: bool,
    ) -> Result<(), Error> {
        if overwrite && self.root.exists() {
            fs::remove_dir_all(&self.root)
                .map_err(|err| io_error(err, "failed to clear target", &self.root))?;
        }
        if let Some(parent) = self.root.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| io_error(err, "failed to create target parent", parent))?;
        }
        // create_dir is the existence check: whoever loses a race gets AlreadyExists.
        fs::create_dir(&self.root)
            .map_err(|err| io_error(err, "failed to create target", &self.root))?;
        self.created = true;
        fs::create_dir(self.root.join(CHUNKS_DIR))
            .map_err(|err| io_error(err, "failed to create target", &self.root))?;
        self.manifest = Some(LevelManifest {
            platform: platform.clone(),
            dimensions: vec![DimensionManifest {
                name: DEFAULT_DIMENSION.to_string(),
                bounds: *selection,
            }],
        });
        self.open = true;
        Ok(())
    }

    fn commit_partition(&mut self, partition: &Partition, dimension: &str) -> Result<(), Error> {
        self.ensure_open()?;
        if let Some(manifest) = self.manifest.as_mut() {
            if !manifest.dimensions.iter().any(|entry| entry.name == dimension) {
                let bounds = manifest
                    .dimensions
                    .first()
                    .map(|entry| entry.bounds)
                    .unwrap_or(Selection::new([0; 3], [0; 3]));
                manifest.dimensions.push(DimensionManifest {
                    name: dimension.to_string(),
                    bounds,
                });
            }
        }
        let dir = self.root.join(CHUNKS_DIR).join(dimension);
        fs::create_dir_all(&dir).map_err(|err| io_error(err, "failed to create chunk dir", &dir))?;
        let path = dir.join(chunk_file_name(partition.pos));
        fs::write(&path, &partition.data).map_err(|err| io_error(err, "failed to write chunk", &path))
    }

    fn save(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        let Some(manifest) = self.manifest.as_ref() else {
            return Err(Error::new(ErrorKind::Internal).with_message("writer has no manifest"));
        };
        let bytes = serde_json::to_vec_pretty(manifest).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode level manifest")
                .with_source(err)
        })?;
        let path = self.root.join(MANIFEST_FILE);
        fs::write(&path, bytes).map_err(|err| io_error(err, "failed to write manifest", &path))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.open = false;
        Ok(())
    }

    fn remove_output(&mut self) -> Result<(), Error> {
        if !self.created {
            return Ok(());
        }
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(err, "failed to remove target", &self.root)),
        }
        self.created = false;
        Ok(())
    }
}
