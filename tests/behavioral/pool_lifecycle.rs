// ABOUTME: Behavioral tests for ResourcePool lending, return and idle reaping
//
// Verifies exclusive ownership of lent resources, capacity bounds across
// threads, and that the reaper expires or probes idle resources.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clustercast::transport::{PoolConfig, PoolError, ResourcePool, Wait};

use crate::fixtures::{pool_config, CountingFactory};

/// Test 1: A released resource is handed to the next borrower instead of a new one
#[tokio::test]
async fn test_released_resource_is_reused() {
    let factory = CountingFactory::default();
    let pool = ResourcePool::new(factory.clone(), &pool_config(2));

    let first = pool.acquire(Wait::NoWait).await.unwrap();
    let first_id = first.id();
    first.release();

    let second = pool.acquire(Wait::NoWait).await.unwrap();
    assert_eq!(second.id(), first_id, "Idle resource should be reused");
    assert_eq!(factory.created(), 1);
}

/// Test 2: Concurrent borrowers never hold the same resource and never exceed max_size
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loans_are_exclusive_and_bounded() {
    let factory = CountingFactory::default();
    let pool = ResourcePool::new(factory.clone(), &pool_config(3));
    let holders: Arc<Mutex<HashSet<usize>>> = Arc::default();

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        let holders = Arc::clone(&holders);
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let guard = pool.acquire(Wait::Forever).await.unwrap();
                assert!(
                    holders.lock().unwrap().insert(guard.serial),
                    "Resource lent to two callers at once"
                );
                let status = pool.status();
                assert!(status.lent + status.idle + status.retiring <= status.max_size);
                tokio::task::yield_now().await;
                holders.lock().unwrap().remove(&guard.serial);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(factory.created() <= 3);
    assert_eq!(pool.status().lent, 0);
    assert_eq!(pool.metrics().snapshot().pool_acquired, 120);
}

/// Test 3: A full pool fails a bounded wait with an exhausted error
#[tokio::test]
async fn test_full_pool_times_out() {
    let pool = ResourcePool::new(CountingFactory::default(), &pool_config(1));
    let _held = pool.acquire(Wait::NoWait).await.unwrap();

    let err = pool
        .acquire(Wait::Bounded(Duration::from_millis(30)))
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::Exhausted { .. }));
    assert!(err.to_string().contains("30"));
    assert_eq!(pool.metrics().snapshot().pool_exhausted, 1);
}

/// Test 4: Unhealthy resources are destroyed on return, freeing their slot
#[tokio::test]
async fn test_unhealthy_resource_not_returned_to_idle() {
    let factory = CountingFactory::default();
    let pool = ResourcePool::new(factory.clone(), &pool_config(1));

    let guard = pool.acquire(Wait::NoWait).await.unwrap();
    guard.healthy.store(false, Ordering::SeqCst);
    drop(guard);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(factory.closed(), 1);
    let replacement = pool.acquire(Wait::NoWait).await.unwrap();
    assert_eq!(replacement.serial, 1, "A fresh resource should be created");
}

/// Test 5: Reaping closes idle resources past the keepalive interval
#[tokio::test]
async fn test_reap_idle_expires_old_resources() {
    let factory = CountingFactory::default();
    let config = PoolConfig {
        keepalive_interval: Duration::from_millis(20),
        ..pool_config(2)
    };
    let pool = ResourcePool::new(factory.clone(), &config);
    assert_eq!(pool.prewarm(2).await.unwrap(), 2);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let summary = pool.reap_idle().await;

    assert_eq!(summary.expired, 2);
    assert_eq!(factory.closed(), 2);
    assert_eq!(pool.status().idle, 0);
}

/// Test 6: The background reaper invalidates idle resources whose keepalive fails
#[tokio::test]
async fn test_background_reaper_removes_unresponsive_resource() {
    let factory = CountingFactory::default();
    let pool = ResourcePool::new(factory.clone(), &pool_config(1));

    let guard = pool.acquire(Wait::NoWait).await.unwrap();
    let answering = Arc::clone(&guard.answering);
    drop(guard);
    assert_eq!(pool.status().idle, 1);

    // Still valid and fresh, so only a failed keepalive can remove it
    answering.store(false, Ordering::SeqCst);
    pool.start_reaper(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(60)).await;
    pool.stop_reaper().await;

    assert!(!pool.is_reaper_running());
    assert_eq!(pool.status().idle, 0);
    assert_eq!(factory.closed(), 1);
    assert_eq!(factory.created(), 1);

    // Next borrower gets a fresh resource
    let replacement = pool.acquire(Wait::NoWait).await.unwrap();
    assert_eq!(replacement.serial, 1);
}

/// Test 7: Prewarming a resource that is broken from birth leaks no slot
#[tokio::test]
async fn test_prewarm_invalid_resource_keeps_capacity() {
    let factory = CountingFactory::default();
    let pool = ResourcePool::new(factory.clone(), &pool_config(1));

    factory.born_invalid.store(true, Ordering::SeqCst);
    assert_eq!(pool.prewarm(1).await.unwrap(), 0);
    let status = pool.status();
    assert_eq!(status.retiring, 0, "Retired slot must be released: {status:?}");
    assert_eq!(status.idle, 0);
    assert_eq!(factory.closed(), 1);

    // The single slot is still available
    factory.born_invalid.store(false, Ordering::SeqCst);
    let guard = pool.acquire(Wait::NoWait).await.unwrap();
    assert_eq!(guard.serial, 1);
}

/// Test 8: reaper_enabled and reaper_interval drive the background reaper
#[tokio::test]
async fn test_reaper_runs_only_when_configured() {
    let config = PoolConfig {
        keepalive_interval: Duration::from_millis(10),
        reaper_interval: Duration::from_millis(15),
        reaper_enabled: true,
        ..pool_config(1)
    };
    let reaped = ResourcePool::new(CountingFactory::default(), &config);
    let kept = ResourcePool::new(
        CountingFactory::default(),
        &PoolConfig {
            reaper_enabled: false,
            ..config.clone()
        },
    );
    reaped.prewarm(1).await.unwrap();
    kept.prewarm(1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(reaped.is_reaper_running());
    assert!(!kept.is_reaper_running());
    assert_eq!(reaped.status().idle, 0);
    assert_eq!(kept.status().idle, 1);
    reaped.close().await;
}

/// Test 9: Closing the pool destroys idle resources and refuses new loans
#[tokio::test]
async fn test_close_refuses_new_loans() {
    let factory = CountingFactory::default();
    let pool = ResourcePool::new(factory.clone(), &pool_config(2));
    pool.prewarm(1).await.unwrap();

    pool.close().await;

    assert!(pool.status().closed);
    assert_eq!(factory.closed(), 1);
    let err = pool.acquire(Wait::Forever).await.unwrap_err();
    assert!(err.is_exhausted());
}
