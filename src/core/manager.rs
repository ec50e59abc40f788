//! Purpose: Own the table of opened levels and the set of live copy jobs.
//! Exports: `LevelManager`, `LevelLease`, `LoadState`, `LevelSnapshot`, `LevelState`.
//! Role: Lifecycle core behind the server: deduplicated opens, refcounted release, job tracking.
//! Invariants: One table lock guards every slot transition and every use-set mutation.
//! Invariants: At most one load and at most one live level object exist per key.
//! Invariants: Loads and closes run in spawned tasks, so a dropped caller never abandons them.
//! Invariants: Load failures are not cached; the slot is removed and the next open retries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{FormatRegistry, TargetWriter};
use crate::core::handle::{LevelHandle, UseToken};
use crate::core::job::{CopyJob, JobId, JobSnapshot};
use crate::core::key::{ResourceKey, absolute_path};
use crate::core::store::{Level, LevelStore};

/// Observable state of an in-flight load.
#[derive(Clone, Debug)]
pub enum LoadState {
    Pending,
    Ready(Arc<LevelHandle>),
    Failed(Error),
}

impl LoadState {
    pub fn is_pending(&self) -> bool {
        matches!(self, LoadState::Pending)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LoadState::Ready(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadState::Failed(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelState {
    Loading,
    Ready,
    Closing,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelSnapshot {
    pub key: ResourceKey,
    pub path: PathBuf,
    pub state: LevelState,
    pub uses: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

struct PendingLoad {
    path: PathBuf,
    state: watch::Receiver<LoadState>,
    release_requested: bool,
}

struct ReadyLevel {
    handle: Arc<LevelHandle>,
    uses: BTreeSet<UseToken>,
}

struct ClosingLevel {
    path: PathBuf,
    // Sender side is dropped once the close finished and the slot is gone.
    done: watch::Receiver<()>,
}

enum Slot {
    Loading(PendingLoad),
    Ready(ReadyLevel),
    Closing(ClosingLevel),
}

enum OpenStep {
    AwaitLoad(watch::Receiver<LoadState>),
    AwaitClose(watch::Receiver<()>),
}

pub(crate) struct Shared {
    store: Arc<dyn LevelStore>,
    formats: FormatRegistry,
    table: Mutex<HashMap<ResourceKey, Slot>>,
    jobs: Mutex<BTreeMap<JobId, Arc<CopyJob>>>,
    next_token: AtomicU64,
    next_job: AtomicU64,
}

impl Shared {
    fn lock_table(&self) -> MutexGuard<'_, HashMap<ResourceKey, Slot>> {
        self.table.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn lock_jobs(&self) -> MutexGuard<'_, BTreeMap<JobId, Arc<CopyJob>>> {
        self.jobs.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub(crate) fn next_token(&self) -> UseToken {
        UseToken::new(self.next_token.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn add_use(&self, handle: &Arc<LevelHandle>, token: UseToken) -> Result<(), Error> {
        let mut table = self.lock_table();
        match table.get_mut(handle.key()) {
            Some(Slot::Ready(ready)) if Arc::ptr_eq(&ready.handle, handle) => {
                ready.uses.insert(token);
                debug!(key = %handle.key(), %token, uses = ready.uses.len(), "added level use");
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::Closed)
                .with_message("level is no longer open")
                .with_path(handle.path())),
        }
    }

    pub(crate) async fn remove_use(self: &Arc<Self>, handle: &Arc<LevelHandle>, token: UseToken) {
        let idle = {
            let mut table = self.lock_table();
            match table.get_mut(handle.key()) {
                Some(Slot::Ready(ready)) if Arc::ptr_eq(&ready.handle, handle) => {
                    ready.uses.remove(&token);
                    debug!(key = %handle.key(), %token, uses = ready.uses.len(), "removed level use");
                    ready.uses.is_empty()
                }
                _ => false,
            }
        };
        if idle {
            self.release(handle.key()).await;
        }
    }

    pub(crate) fn use_count(&self, handle: &Arc<LevelHandle>) -> usize {
        match self.lock_table().get(handle.key()) {
            Some(Slot::Ready(ready)) if Arc::ptr_eq(&ready.handle, handle) => ready.uses.len(),
            _ => 0,
        }
    }

    fn spawn_load(self: &Arc<Self>, key: ResourceKey, path: PathBuf, tx: watch::Sender<LoadState>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            info!(path = %path.display(), "loading level");
            let store = Arc::clone(&shared.store);
            let load_path = path.clone();
            let result = match tokio::task::spawn_blocking(move || store.load(&load_path)).await {
                Ok(result) => result,
                Err(err) => Err(Error::new(ErrorKind::Internal)
                    .with_message("level load panicked")
                    .with_source(err)),
            };
            shared.finish_load(key, path, result, tx).await;
        });
    }

    async fn finish_load(
        self: &Arc<Self>,
        key: ResourceKey,
        path: PathBuf,
        result: Result<Arc<dyn Level>, Error>,
        tx: watch::Sender<LoadState>,
    ) {
        let (state, deferred_close) = match result {
            Ok(level) => {
                info!(path = %path.display(), class = level.class_name(), "loaded level");
                let handle = Arc::new(LevelHandle::new(
                    key.clone(),
                    path.clone(),
                    level,
                    Arc::downgrade(self),
                ));
                let mut table = self.lock_table();
                let release_requested = matches!(
                    table.get(&key),
                    Some(Slot::Loading(pending)) if pending.release_requested
                );
                if release_requested {
                    let (done_tx, done_rx) = watch::channel(());
                    table.insert(
                        key,
                        Slot::Closing(ClosingLevel {
                            path,
                            done: done_rx,
                        }),
                    );
                    (
                        LoadState::Ready(Arc::clone(&handle)),
                        Some((handle, done_tx)),
                    )
                } else {
                    table.insert(
                        key,
                        Slot::Ready(ReadyLevel {
                            handle: Arc::clone(&handle),
                            uses: BTreeSet::new(),
                        }),
                    );
                    (LoadState::Ready(handle), None)
                }
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed loading level");
                self.lock_table().remove(&key);
                let err = if err.kind() == ErrorKind::Load {
                    err
                } else {
                    err.wrap(ErrorKind::Load, "failed to load level")
                };
                (LoadState::Failed(err.with_path(&path)), None)
            }
        };
        tx.send_replace(state);
        if let Some((handle, done)) = deferred_close {
            debug!(key = %handle.key(), "applying release requested during load");
            self.close_level(handle, done).await;
        }
    }

    pub(crate) async fn release(self: &Arc<Self>, key: &ResourceKey) {
        let (handle, done) = {
            let mut table = self.lock_table();
            let path = match table.get_mut(key) {
                None | Some(Slot::Closing(_)) => return,
                Some(Slot::Loading(pending)) => {
                    pending.release_requested = true;
                    debug!(%key, "deferring release until load finishes");
                    return;
                }
                Some(Slot::Ready(ready)) if !ready.uses.is_empty() => {
                    debug!(%key, uses = ready.uses.len(), "level still in use; not unloading");
                    return;
                }
                Some(Slot::Ready(ready)) => ready.handle.path().to_path_buf(),
            };
            let (done_tx, done_rx) = watch::channel(());
            match table.insert(
                key.clone(),
                Slot::Closing(ClosingLevel {
                    path,
                    done: done_rx,
                }),
            ) {
                Some(Slot::Ready(ready)) => (ready.handle, done_tx),
                _ => return,
            }
        };
        self.close_level(handle, done).await;
    }

    async fn close_level(self: &Arc<Self>, handle: Arc<LevelHandle>, done: watch::Sender<()>) {
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            let level = Arc::clone(handle.level());
            match tokio::task::spawn_blocking(move || level.close()).await {
                Ok(Ok(())) => info!(path = %handle.path().display(), "unloaded level"),
                Ok(Err(err)) => {
                    warn!(path = %handle.path().display(), error = %err, "failed to close level")
                }
                Err(err) => {
                    warn!(path = %handle.path().display(), error = %err, "level close panicked")
                }
            }
            {
                let mut table = shared.lock_table();
                if matches!(table.get(handle.key()), Some(Slot::Closing(_))) {
                    table.remove(handle.key());
                }
            }
            drop(done);
        });
        let _ = task.await;
    }
}

/// Entry point for opening levels and running conversions against them.
#[derive(Clone)]
pub struct LevelManager {
    shared: Arc<Shared>,
}

impl LevelManager {
    pub fn new(store: Arc<dyn LevelStore>, formats: FormatRegistry) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                formats,
                table: Mutex::new(HashMap::new()),
                jobs: Mutex::new(BTreeMap::new()),
                next_token: AtomicU64::new(0),
                next_job: AtomicU64::new(0),
            }),
        }
    }

    pub fn formats(&self) -> &FormatRegistry {
        &self.shared.formats
    }

    /// Opens `path`, joining an in-flight load of the same level if there is one.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<Arc<LevelHandle>, Error> {
        let path = absolute_path(path.as_ref())?;
        let key = ResourceKey::for_path(&path)?;
        loop {
            let step = {
                let mut table = self.shared.lock_table();
                match table.get(&key) {
                    Some(Slot::Ready(ready)) => return Ok(Arc::clone(&ready.handle)),
                    Some(Slot::Loading(pending)) => {
                        debug!(%key, "joining pending level load");
                        OpenStep::AwaitLoad(pending.state.clone())
                    }
                    Some(Slot::Closing(closing)) => {
                        debug!(%key, "waiting for level close before reopening");
                        OpenStep::AwaitClose(closing.done.clone())
                    }
                    None => {
                        let (tx, rx) = watch::channel(LoadState::Pending);
                        table.insert(
                            key.clone(),
                            Slot::Loading(PendingLoad {
                                path: path.clone(),
                                state: rx.clone(),
                                release_requested: false,
                            }),
                        );
                        self.shared.spawn_load(key.clone(), path.clone(), tx);
                        OpenStep::AwaitLoad(rx)
                    }
                }
            };
            match step {
                OpenStep::AwaitLoad(rx) => return await_load(rx).await,
                OpenStep::AwaitClose(mut done) => {
                    let _ = done.changed().await;
                }
            }
        }
    }

    /// Opens `path` and registers an explicit use that keeps it loaded until released.
    pub async fn pin(&self, path: impl AsRef<Path>) -> Result<LevelLease, Error> {
        let path = path.as_ref();
        loop {
            let handle = self.open(path).await?;
            let token = self.shared.next_token();
            match handle.add_use(token) {
                Ok(()) => return Ok(LevelLease::new(handle, token)),
                Err(err) if err.kind() == ErrorKind::Closed => {
                    debug!(key = %handle.key(), "level unloaded before it was pinned; reopening");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Unloads the level under `key` unless something still uses it.
    pub async fn release(&self, key: &ResourceKey) {
        self.shared.release(key).await;
    }

    pub async fn release_path(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let key = ResourceKey::for_path(path)?;
        self.shared.release(&key).await;
        Ok(())
    }

    pub fn resolve_target_writer(
        &self,
        path: impl AsRef<Path>,
        format_name: &str,
    ) -> Result<TargetWriter, Error> {
        self.shared.formats.resolve(path.as_ref(), format_name)
    }

    /// Starts copying every partition of `source` into `target`.
    ///
    /// Must be called from within a tokio runtime. The job holds its own use of
    /// `source` and gives it back when it reaches a terminal state.
    pub fn start_copy_job(
        &self,
        source: &Arc<LevelHandle>,
        target: TargetWriter,
    ) -> Result<Arc<CopyJob>, Error> {
        let id = JobId::from_raw(self.shared.next_job.fetch_add(1, Ordering::Relaxed) + 1);
        let token = self.shared.next_token();
        let job = Arc::new(CopyJob::new(id, Arc::clone(source), token, target)?);

        // The use is registered before the job is visible, so a cancel from
        // `shutdown` always has a token to hand back.
        source.add_use(token)?;
        self.shared.lock_jobs().insert(id, Arc::clone(&job));
        job.start();

        let shared = Arc::clone(&self.shared);
        let watched = Arc::clone(&job);
        tokio::spawn(async move {
            let _ = watched.wait().await;
            shared.lock_jobs().remove(&watched.id());
            debug!(job = %watched.id(), "job left the live set");
        });
        Ok(job)
    }

    pub fn job(&self, id: JobId) -> Option<Arc<CopyJob>> {
        self.shared.lock_jobs().get(&id).cloned()
    }

    /// Current load state for `key`; `None` when nothing is loaded or the level is closing.
    pub fn load_state(&self, key: &ResourceKey) -> Option<LoadState> {
        match self.shared.lock_table().get(key)? {
            Slot::Loading(pending) => Some(pending.state.borrow().clone()),
            Slot::Ready(ready) => Some(LoadState::Ready(Arc::clone(&ready.handle))),
            Slot::Closing(_) => None,
        }
    }

    pub fn list_open_levels(&self) -> Vec<LevelSnapshot> {
        let table = self.shared.lock_table();
        let mut out = table
            .iter()
            .map(|(key, slot)| match slot {
                Slot::Loading(pending) => LevelSnapshot {
                    key: key.clone(),
                    path: pending.path.clone(),
                    state: LevelState::Loading,
                    uses: 0,
                    class: None,
                },
                Slot::Ready(ready) => LevelSnapshot {
                    key: key.clone(),
                    path: ready.handle.path().to_path_buf(),
                    state: LevelState::Ready,
                    uses: ready.uses.len(),
                    class: Some(ready.handle.level().class_name().to_string()),
                },
                Slot::Closing(closing) => LevelSnapshot {
                    key: key.clone(),
                    path: closing.path.clone(),
                    state: LevelState::Closing,
                    uses: 0,
                    class: None,
                },
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn list_live_jobs(&self) -> Vec<JobSnapshot> {
        let jobs = self
            .shared
            .lock_jobs()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        jobs.iter().map(|job| job.snapshot()).collect()
    }

    /// Cancels every live job, then unloads every idle level.
    pub async fn shutdown(&self) {
        let jobs = self
            .shared
            .lock_jobs()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for job in jobs {
            if let Err(err) = job.cancel().await {
                warn!(job = %job.id(), error = %err, "job failed while shutting down");
            }
        }
        let keys = self.shared.lock_table().keys().cloned().collect::<Vec<_>>();
        for key in keys {
            self.shared.release(&key).await;
        }
    }
}

async fn await_load(mut rx: watch::Receiver<LoadState>) -> Result<Arc<LevelHandle>, Error> {
    let state = rx
        .wait_for(|state| !state.is_pending())
        .await
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("level load was abandoned"))?
        .clone();
    match state {
        LoadState::Ready(handle) => Ok(handle),
        LoadState::Failed(err) => Err(err),
        LoadState::Pending => {
            Err(Error::new(ErrorKind::Internal).with_message("level load is still pending"))
        }
    }
}

/// Explicit use of a level obtained through `LevelManager::pin`.
#[derive(Debug)]
pub struct LevelLease {
    handle: Arc<LevelHandle>,
    token: UseToken,
    released: bool,
}

impl LevelLease {
    fn new(handle: Arc<LevelHandle>, token: UseToken) -> Self {
        Self {
            handle,
            token,
            released: false,
        }
    }

    pub fn handle(&self) -> &Arc<LevelHandle> {
        &self.handle
    }

    pub fn token(&self) -> UseToken {
        self.token
    }

    pub async fn release(mut self) {
        self.released = true;
        self.handle.remove_use(self.token).await;
    }
}

impl Drop for LevelLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Unreleased leases hand their use back on the runtime they came from.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = Arc::clone(&self.handle);
                let token = self.token;
                runtime.spawn(async move {
                    handle.remove_use(token).await;
                });
            }
            Err(_) => warn!(
                key = %self.handle.key(),
                token = %self.token,
                "level lease dropped outside a runtime; its use stays registered"
            ),
        }
    }
}
