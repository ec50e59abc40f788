//! Purpose: Exercise the level table: deduplicated opens, use tracking, and unload.
//! Exports: None (integration test module).
//! Role: Drive `LevelManager` against the in-memory backend and assert on load/close counts.
//! Invariants: Every wait is bounded; polling helpers fail after a deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use levelhost::api::{
    ErrorKind, LevelManager, LevelState, MemoryLevelSpec, MemoryStore, ResourceKey,
};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn manager_for(store: &MemoryStore) -> LevelManager {
    LevelManager::new(Arc::new(store.clone()), store.format_registry())
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_opens_share_one_load() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(4));
    store.set_load_delay(Duration::from_millis(150));
    let manager = manager_for(&store);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move { manager.open("/worlds/alpha").await }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await??);
    }

    assert_eq!(store.stats("/worlds/alpha").loads, 1);
    for handle in &handles[1..] {
        assert!(Arc::ptr_eq(&handles[0], handle));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn path_spelling_maps_to_one_key() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/Alpha", MemoryLevelSpec::with_chunks(1));
    let manager = manager_for(&store);

    let first = manager.open("/worlds/Alpha").await?;
    let second = manager.open("/WORLDS/alpha/./").await?;
    let third = manager.open("/worlds/beta/../Alpha").await?;

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(first.key().as_str(), "/worlds/alpha");
    assert_eq!(store.stats("/worlds/Alpha").loads, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_load_reaches_every_waiter_and_is_not_cached() -> TestResult<()> {
    let store = MemoryStore::new();
    store.set_load_delay(Duration::from_millis(100));
    let manager = manager_for(&store);

    let (a, b, c) = tokio::join!(
        manager.open("/worlds/missing"),
        manager.open("/worlds/missing"),
        manager.open("/worlds/missing"),
    );
    for result in [a, b, c] {
        let err = result.expect_err("load should fail");
        assert_eq!(err.kind(), ErrorKind::Load);
        assert!(err.path().is_some());
    }
    assert_eq!(store.stats("/worlds/missing").loads, 1);
    assert!(manager.list_open_levels().is_empty());

    store.insert("/worlds/missing", MemoryLevelSpec::with_chunks(1));
    manager.open("/worlds/missing").await?;
    assert_eq!(store.stats("/worlds/missing").loads, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn release_during_load_closes_once_loaded() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    store.set_load_delay(Duration::from_millis(200));
    let manager = manager_for(&store);
    let key = ResourceKey::for_path("/worlds/alpha")?;

    let opener = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.open("/worlds/alpha").await })
    };
    wait_until("load to start", || {
        manager.load_state(&key).is_some_and(|state| state.is_pending())
    })
    .await;
    manager.release(&key).await;
    assert_eq!(store.stats("/worlds/alpha").closes, 0);

    // The waiter still gets the level it asked for.
    let handle = opener.await??;
    assert_eq!(handle.key(), &key);

    wait_until("deferred close", || store.stats("/worlds/alpha").closes == 1).await;
    wait_until("slot removal", || manager.list_open_levels().is_empty()).await;
    assert_eq!(store.stats("/worlds/alpha").loads, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_opener_does_not_cancel_the_load() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    store.set_load_delay(Duration::from_millis(200));
    let manager = manager_for(&store);
    let key = ResourceKey::for_path("/worlds/alpha")?;

    let opener = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.open("/worlds/alpha").await })
    };
    wait_until("load to start", || {
        manager.load_state(&key).is_some_and(|state| state.is_pending())
    })
    .await;
    opener.abort();
    assert!(opener.await.is_err_and(|err| err.is_cancelled()));

    let handle = manager.open("/worlds/alpha").await?;
    assert_eq!(handle.key(), &key);
    assert_eq!(store.stats("/worlds/alpha").loads, 1);
    assert!(manager.load_state(&key).is_some_and(|state| state.is_ready()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn last_use_removal_unloads_exactly_once() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(2));
    let manager = manager_for(&store);

    let first = manager.pin("/worlds/alpha").await?;
    let second = manager.pin("/worlds/alpha").await?;
    assert!(Arc::ptr_eq(first.handle(), second.handle()));
    assert_ne!(first.token(), second.token());
    assert_eq!(first.handle().uses(), 2);

    let handle = Arc::clone(first.handle());
    let stale_token = first.token();
    first.release().await;
    assert!(handle.is_used());
    assert_eq!(store.stats("/worlds/alpha").closes, 0);

    second.release().await;
    assert_eq!(store.stats("/worlds/alpha").closes, 1);
    assert!(manager.list_open_levels().is_empty());

    // Using a handle that was unloaded is refused, not resurrected.
    let err = handle.add_use(stale_token).expect_err("closed handle");
    assert_eq!(err.kind(), ErrorKind::Closed);

    let reopened = manager.open("/worlds/alpha").await?;
    assert!(!Arc::ptr_eq(&handle, &reopened));
    let stats = store.stats("/worlds/alpha");
    assert_eq!((stats.loads, stats.max_open), (2, 1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn release_keeps_used_levels_loaded() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    let manager = manager_for(&store);

    let lease = manager.pin("/worlds/alpha").await?;
    manager.release_path("/worlds/alpha").await?;
    assert_eq!(store.stats("/worlds/alpha").closes, 0);
    let levels = manager.list_open_levels();
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0].state, LevelState::Ready);
    assert_eq!(levels[0].uses, 1);
    assert_eq!(levels[0].class.as_deref(), Some("MemoryLevel"));

    lease.release().await;
    assert_eq!(store.stats("/worlds/alpha").closes, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn close_failure_still_frees_the_slot() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    let manager = manager_for(&store);
    let key = ResourceKey::for_path("/worlds/alpha")?;

    store.set_fail_close(true);
    manager.open("/worlds/alpha").await?;
    manager.release(&key).await;
    assert!(manager.list_open_levels().is_empty());
    assert!(manager.load_state(&key).is_none());
    let stats = store.stats("/worlds/alpha");
    assert_eq!((stats.closes, stats.open_now), (1, 0));

    store.set_fail_close(false);
    manager.open("/worlds/alpha").await?;
    assert_eq!(store.stats("/worlds/alpha").loads, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn release_of_unknown_key_is_a_no_op() -> TestResult<()> {
    let store = MemoryStore::new();
    let manager = manager_for(&store);
    manager.release(&ResourceKey::for_path("/nowhere")?).await;
    assert!(manager.list_open_levels().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn load_state_tracks_the_slot() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    store.set_load_delay(Duration::from_millis(150));
    let manager = manager_for(&store);
    let key = ResourceKey::for_path("/worlds/alpha")?;
    assert!(manager.load_state(&key).is_none());

    let opener = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.open("/worlds/alpha").await })
    };
    wait_until("pending load", || manager.load_state(&key).is_some()).await;
    let handle = opener.await??;
    assert!(manager.load_state(&key).is_some_and(|state| state.is_ready()));

    drop(handle);
    manager.release(&key).await;
    assert!(manager.load_state(&key).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn churn_never_holds_two_live_copies() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    store.set_load_delay(Duration::from_millis(5));
    let manager = manager_for(&store);

    let mut tasks = Vec::new();
    for round in 0..24u64 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(round % 5)).await;
            let lease = manager.pin("/worlds/alpha").await?;
            tokio::time::sleep(Duration::from_millis(2)).await;
            lease.release().await;
            Ok::<_, levelhost::api::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    wait_until("final unload", || manager.list_open_levels().is_empty()).await;
    let stats = store.stats("/worlds/alpha");
    assert_eq!(stats.max_open, 1);
    assert_eq!(stats.loads, stats.closes);
    assert_eq!(stats.open_now, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_lease_hands_its_use_back() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    let manager = manager_for(&store);

    let lease = manager.pin("/worlds/alpha").await?;
    drop(lease);
    wait_until("drop release", || store.stats("/worlds/alpha").closes == 1).await;
    Ok(())
}

#[test]
fn lease_dropped_outside_a_runtime_keeps_its_use() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    let manager = manager_for(&store);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let lease = runtime.block_on(manager.pin("/worlds/alpha"))?;
    let handle = Arc::clone(lease.handle());
    let token = lease.token();
    // No runtime is entered here, so nothing can run the release.
    drop(lease);
    assert_eq!(handle.uses(), 1);
    assert_eq!(store.stats("/worlds/alpha").closes, 0);

    // The use is still registered and can be handed back explicitly.
    runtime.block_on(handle.remove_use(token));
    assert_eq!(store.stats("/worlds/alpha").closes, 1);
    assert!(manager.list_open_levels().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_unloads_everything() -> TestResult<()> {
    let store = MemoryStore::new();
    store.insert("/worlds/alpha", MemoryLevelSpec::with_chunks(1));
    store.insert("/worlds/beta", MemoryLevelSpec::with_chunks(1));
    let manager = manager_for(&store);

    manager.open("/worlds/alpha").await?;
    manager.open("/worlds/beta").await?;
    assert_eq!(manager.list_open_levels().len(), 2);

    manager.shutdown().await;
    assert!(manager.list_open_levels().is_empty());
    assert_eq!(store.stats("/worlds/alpha").closes, 1);
    assert_eq!(store.stats("/worlds/beta").closes, 1);
    Ok(())
}
