use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use presspool::config::{PoolSettings, ServiceConfig};
use presspool::{ConnectionPool, PoolRegistry, PooledConnection, Result};
use tokio::sync::mpsc;

async fn wait_for_queue<C>(pool: &ConnectionPool<C>, waiting: usize)
where
    C: Clone + Send + Sync + 'static,
{
    while pool.stats().waiting < waiting {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn capacity_two_with_five_callers() {
    let pool = ConnectionPool::from_fn("search", 2, |id| id).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, PooledConnection<usize>)>();

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(pool.stats().active, 2);

    for name in ["third", "fourth", "fifth"] {
        let task_pool = pool.clone();
        let tx = tx.clone();
        let queued_before = pool.stats().waiting;
        tokio::spawn(async move {
            let conn = task_pool.acquire().await.unwrap();
            tx.send((name, conn)).unwrap();
        });
        wait_for_queue(&pool, queued_before + 1).await;
    }

    let stats = pool.stats();
    assert_eq!((stats.capacity, stats.active, stats.waiting), (2, 2, 3));

    first.release();
    let (name, third) = rx.recv().await.unwrap();
    assert_eq!(name, "third");

    second.release();
    let (name, _fourth) = rx.recv().await.unwrap();
    assert_eq!(name, "fourth");

    third.release();
    let (name, _fifth) = rx.recv().await.unwrap();
    assert_eq!(name, "fifth");

    assert_eq!(pool.stats().waiting, 0);
    assert_eq!(pool.stats().active, 2);
}

#[tokio::test]
async fn newcomers_do_not_overtake_the_queue() {
    let pool = ConnectionPool::from_fn("text-generation", 1, |id| id).unwrap();
    let held = pool.acquire().await.unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for name in ["A", "B", "C"] {
        let task_pool = pool.clone();
        let order = order.clone();
        let queued_before = pool.stats().waiting;
        tasks.push(tokio::spawn(async move {
            let conn = task_pool.acquire().await.unwrap();
            order.lock().unwrap().push(name);
            tokio::time::sleep(Duration::from_millis(1)).await;
            drop(conn);
        }));
        wait_for_queue(&pool, queued_before + 1).await;
    }

    held.release();
    // A late caller should land behind C.
    let late = {
        let pool = pool.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let _conn = pool.acquire().await.unwrap();
            order.lock().unwrap().push("late");
        })
    };

    for task in tasks {
        task.await.unwrap();
    }
    late.await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C", "late"]);
}

#[tokio::test]
async fn timeout_around_acquire_does_not_leak() {
    let pool = ConnectionPool::from_fn("image-generation", 1, |id| id).unwrap();
    let held = pool.acquire().await.unwrap();

    for _ in 0..5 {
        let attempt = tokio::time::timeout(Duration::from_millis(5), pool.acquire()).await;
        assert!(attempt.is_err());
    }
    drop(held);

    let stats = pool.stats();
    assert_eq!((stats.active, stats.waiting), (0, 0));
    let conn = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
        .await
        .expect("connection should be free")
        .unwrap();
    assert_eq!(conn.id(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registry_enforces_capacity_under_load() {
    let settings = PoolSettings::new().with_service("text-generation", ServiceConfig::with_capacity(5));
    let registry = Arc::new(
        PoolRegistry::new(settings, |_: &str, _: &ServiceConfig, id: usize| -> Result<usize> {
            Ok(id)
        })
        .unwrap(),
    );
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let registry = registry.clone();
            let in_use = in_use.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let conn = registry.acquire("text-generation").await.unwrap();
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 5);
    let stats = registry.stats();
    assert_eq!((stats[0].active, stats[0].waiting), (0, 0));
    let served: u64 = registry
        .pool("text-generation")
        .unwrap()
        .connections()
        .iter()
        .map(|c| c.request_count)
        .sum();
    assert_eq!(served, 100);
}

#[tokio::test]
async fn close_wakes_every_waiter() {
    let pool = ConnectionPool::from_fn("search", 1, |id| id).unwrap();
    let _held = pool.acquire().await.unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        })
        .collect();
    wait_for_queue(&pool, 3).await;

    pool.close();
    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_pool_closed());
        assert_eq!(err.to_string(), "pool for service 'search' is closed");
    }
}
