use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use super::*;

#[tokio::test]
async fn test_jobs_run() {
    let pool = Dispatcher::new(3);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        assert!(
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
        );
    }

    pool.close().await;
    assert_eq!(counter.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_single_worker_preserves_order() {
    let pool = Dispatcher::new(1);
    let (tx, mut rx) = mpsc::unbounded_channel();

    for i in 0..20u32 {
        let tx = tx.clone();
        pool.submit(async move {
            let _ = tx.send(i);
        })
        .await;
    }
    pool.close().await;

    for expected in 0..20u32 {
        assert_eq!(rx.recv().await, Some(expected));
    }
}

#[tokio::test]
async fn test_close_waits_for_inflight_job() {
    let pool = Dispatcher::new(2);
    let done = Arc::new(AtomicUsize::new(0));

    let done2 = Arc::clone(&done);
    pool.submit(async move {
        sleep(Duration::from_millis(50)).await;
        done2.fetch_add(1, Ordering::SeqCst);
    })
    .await;

    timeout(Duration::from_secs(2), pool.close())
        .await
        .expect("close should not hang");
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_submit_after_close_refused() {
    let pool = Dispatcher::new(1);
    pool.close().await;
    assert!(pool.is_closed());
    assert!(!pool.submit(async {}).await);
}
