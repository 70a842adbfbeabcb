//! Integration tests against a real store.
//!
//! Ignored by default -- run with `cargo test -- --ignored` against a
//! disposable Redis instance. Reads `REDIS_URL`, defaulting to
//! `redis://127.0.0.1:6379`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use redis_mutex::{setup, HandlerKind, Mutex, MutexError, MutexOptions, SetupOptions};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

static NS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Each test gets its own namespace so parallel runs (and repeat runs
/// against the same server) never collide on leftover keys.
fn fresh_ns() -> String {
    format!("redis_mutex_test:{}", NS_COUNTER.fetch_add(1, Ordering::Relaxed))
}

async fn setup_for_test(ns: &str, handler: HandlerKind) {
    setup(SetupOptions {
        url: Some(redis_url()),
        ns: Some(ns.to_string()),
        handler,
        expire: Duration::from_secs(10),
        ..Default::default()
    })
    .await
    .expect("setup against a live redis");
}

#[tokio::test]
#[ignore]
async fn s1_same_owner_deadlock() {
    let ns = fresh_ns();
    setup_for_test(&ns, HandlerKind::Auto).await;

    let a = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        ..Default::default()
    })
    .await
    .unwrap();

    assert!(a.lock(None).await.unwrap());

    let err = a.lock(None).await.unwrap_err();
    assert!(matches!(err, MutexError::Deadlock { .. }));

    let other_owner = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("someone-else".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(!other_owner.try_lock().await.unwrap());

    a.unlock().await.unwrap();
    assert!(other_owner.try_lock().await.unwrap());
    other_owner.unlock().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn s2_cross_task_wakeup() {
    let ns = fresh_ns();
    setup_for_test(&ns, HandlerKind::Auto).await;

    let a = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("owner-a".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(a.lock(None).await.unwrap());

    let b = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("owner-b".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(!b.try_lock().await.unwrap());

    let b_task = tokio::spawn(async move {
        let started = std::time::Instant::now();
        let acquired = b.lock(Some(Duration::from_secs(2))).await.unwrap();
        (acquired, started.elapsed())
    });

    tokio::time::sleep(Duration::from_millis(260)).await;
    a.unlock().await.unwrap();

    let (acquired, elapsed) = b_task.await.unwrap();
    assert!(acquired);
    assert!(elapsed < Duration::from_millis(500));
}

#[tokio::test]
#[ignore]
async fn s3_block_timeout() {
    let ns = fresh_ns();
    setup_for_test(&ns, HandlerKind::Auto).await;

    let a = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("owner-a".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(a.lock(None).await.unwrap());

    let b = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("owner-b".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();

    let started = std::time::Instant::now();
    let acquired = b.lock(Some(Duration::from_millis(250))).await.unwrap();
    let elapsed = started.elapsed();

    assert!(!acquired);
    assert!(elapsed >= Duration::from_millis(240));
    assert!(elapsed < Duration::from_millis(600));
    assert!(a.owned().await.unwrap());

    a.unlock().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn s4_lease_expiration_during_wait() {
    let ns = fresh_ns();
    setup_for_test(&ns, HandlerKind::Auto).await;

    let a = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("owner-a".to_string()),
        expire: Some(Duration::from_millis(250)),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(a.lock(None).await.unwrap());

    let b = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("owner-b".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();

    let acquired = b.lock(Some(Duration::from_millis(800))).await.unwrap();
    assert!(acquired, "b should acquire once a's lease expires");

    b.unlock().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn s5_refresh_prevents_takeover() {
    let ns = fresh_ns();
    setup_for_test(&ns, HandlerKind::Auto).await;

    let a = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("owner-a".to_string()),
        expire: Some(Duration::from_millis(110)),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(a.lock(None).await.unwrap());

    let b = Mutex::new(MutexOptions {
        name: vec!["r".to_string()],
        owner: Some("owner-b".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();

    let b_task = tokio::spawn({
        let b_names = b.names().to_vec();
        async move {
            let _ = b_names;
            b.lock(Some(Duration::from_millis(300))).await
        }
    });

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(a.refresh(None).await.unwrap());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(a.refresh(Some(Duration::from_millis(500))).await.unwrap());

    let b_result = b_task.await.unwrap().unwrap();
    assert!(!b_result, "b should time out while a keeps refreshing");
    assert!(a.owned().await.unwrap());

    a.unlock().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn sleep_wakeup_condition_variable_surface() {
    let ns = fresh_ns();
    setup_for_test(&ns, HandlerKind::Auto).await;

    let m = std::sync::Arc::new(
        Mutex::new(MutexOptions {
            name: vec!["cv".to_string()],
            owner: Some("cv-owner".to_string()),
            ..Default::default()
        })
        .await
        .unwrap(),
    );

    assert!(m.lock(None).await.unwrap());

    let sleeper = {
        let m = std::sync::Arc::clone(&m);
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            m.sleep(Some(Duration::from_secs(5))).await.unwrap();
            started.elapsed()
        })
    };

    // give the sleeper time to register, release, and park
    tokio::time::sleep(Duration::from_millis(50)).await;
    m.wakeup("cv-owner");

    let elapsed = sleeper.await.unwrap();
    assert!(elapsed < Duration::from_millis(500));
    assert!(m.owned().await.unwrap());
    m.unlock().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn s7_chaos_mutual_exclusion() {
    let ns = fresh_ns();
    setup_for_test(&ns, HandlerKind::Auto).await;

    let key = format!("{ns}:counter_check");
    let mut handles = Vec::new();

    for i in 0..10u32 {
        let ns = ns.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let guard = Mutex::new(MutexOptions {
                name: vec!["chaos".to_string()],
                ns: Some(ns),
                owner: Some(format!("chaos-{i}")),
                ..Default::default()
            })
            .await
            .unwrap();

            guard
                .synchronize(Some(Duration::from_secs(5)), || async {
                    let conn_url = redis_url();
                    let client = redis::Client::open(conn_url).unwrap();
                    let mut conn = client.get_multiplexed_tokio_connection().await.unwrap();
                    let _: () = redis::cmd("SET")
                        .arg(&key)
                        .arg(i)
                        .query_async(&mut conn)
                        .await
                        .unwrap();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let seen: u32 = redis::cmd("GET")
                        .arg(&key)
                        .query_async(&mut conn)
                        .await
                        .unwrap();
                    assert_eq!(seen, i, "another task wrote the key while we held the lock");
                    let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
                })
                .await
                .unwrap();
            i
        }));
    }

    let mut seen = Vec::new();
    for handle in handles {
        seen.push(handle.await.unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}
