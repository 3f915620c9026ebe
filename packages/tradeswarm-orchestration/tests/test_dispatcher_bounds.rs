//! Concurrency and rate bounds of the task dispatcher

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tradeswarm_orchestration::{DispatcherConfig, TaskDispatcher, WorkerError};

fn dispatcher(
    max_concurrent: usize,
    rate_per_sec: f64,
    bucket_capacity: u32,
) -> Arc<TaskDispatcher> {
    Arc::new(TaskDispatcher::new(DispatcherConfig {
        max_concurrent,
        rate_per_sec,
        bucket_capacity,
        ..Default::default()
    }))
}

#[tokio::test(start_paused = true)]
async fn test_running_calls_never_exceed_slots() {
    let dispatcher = dispatcher(3, 1_000.0, 1_000);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let dispatcher = Arc::clone(&dispatcher);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            dispatcher
                .run("bounded", || {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, WorkerError>(i)
                    }
                })
                .await
        }));
    }

    for task in futures::future::join_all(tasks).await {
        assert!(task.unwrap().is_ok());
    }

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    let stats = dispatcher.stats();
    assert_eq!(stats.peak_in_flight, 3);
    assert_eq!(stats.started, 20);
    assert_eq!(stats.succeeded, 20);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(dispatcher.available_slots(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_starts_bounded_by_token_bucket() {
    const RATE: f64 = 5.0;
    const CAPACITY: u32 = 10;
    const CALLS: usize = 40;

    let dispatcher = dispatcher(50, RATE, CAPACITY);
    let origin = Instant::now();
    let starts: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for _ in 0..CALLS {
        let dispatcher = Arc::clone(&dispatcher);
        let starts = Arc::clone(&starts);
        tasks.push(tokio::spawn(async move {
            dispatcher
                .run("rated", || {
                    let starts = Arc::clone(&starts);
                    async move {
                        starts.lock().push(origin.elapsed());
                        Ok::<_, WorkerError>(())
                    }
                })
                .await
        }));
    }
    futures::future::join_all(tasks).await;

    let mut starts = starts.lock().clone();
    starts.sort();
    assert_eq!(starts.len(), CALLS);

    // The n-th start needs n tokens: the initial burst plus refill so far
    for (i, at) in starts.iter().enumerate() {
        let allowed = f64::from(CAPACITY) + RATE * at.as_secs_f64();
        assert!(
            (i + 1) as f64 <= allowed + 1e-6,
            "start #{} at {:?} exceeds the bucket ({} allowed)",
            i + 1,
            at,
            allowed
        );
    }

    // 10 immediately, 30 more at 5/s
    let last = *starts.last().unwrap();
    assert!(last >= Duration::from_secs(6), "finished too fast: {:?}", last);
    assert!(last < Duration::from_secs(7), "finished too slow: {:?}", last);
}

#[tokio::test(start_paused = true)]
async fn test_slot_released_while_backing_off() {
    let dispatcher = dispatcher(1, 1_000.0, 1_000);

    let flaky = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let attempts = AtomicUsize::new(0);
            dispatcher
                .run("flaky", || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(WorkerError::transient("busy"))
                        } else {
                            Ok(())
                        }
                    }
                })
                .await
        })
    };

    // Let the first attempt fail and enter its 200ms backoff
    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    dispatcher
        .run("other", || async { Ok::<_, WorkerError>(()) })
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100), "slot was held during backoff");

    assert!(flaky.await.unwrap().is_ok());
    assert_eq!(dispatcher.stats().retried, 1);
}
