//! Queue Integration Tests
//!
//! Admission under backpressure, worker bounds, and shutdown of the
//! pool together with the in-flight markers held by queued jobs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use dispatch_ingest::core::InFlightSet;
use dispatch_ingest::domain::JobSource;
use dispatch_ingest::ingest::{EnqueueError, Job, JobError, JobQueue};

const WINDOW: Duration = Duration::from_millis(50);
const INTERVAL: Duration = Duration::from_millis(5);

fn noop(id: &str) -> Job {
    Job::new(id, JobSource::Api, |_| async { Ok(()) })
}

/// Job that reports when it starts and then waits to be released
fn blocking_job(id: &str) -> (Job, oneshot::Receiver<()>, oneshot::Sender<()>) {
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let job = Job::new(id, JobSource::Api, move |_| async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        Ok(())
    });
    (job, started_rx, release_tx)
}

#[tokio::test]
async fn test_enqueue_into_full_buffer_fails_immediately() {
    let queue = JobQueue::new(1, Duration::from_secs(5));
    queue.start(1);

    let (running, started, release) = blocking_job("a.mp3");
    assert!(queue.enqueue(running));
    started.await.unwrap();
    assert!(queue.enqueue(noop("b.mp3")));
    assert_eq!(queue.stats().length, 1);

    let began = Instant::now();
    assert!(!queue.enqueue(noop("c.mp3")));
    match queue.try_enqueue(noop("d.mp3")) {
        Err(EnqueueError::Full(job)) => assert_eq!(job.id, "d.mp3"),
        other => panic!("expected a full buffer, got {:?}", other),
    }
    assert!(began.elapsed() < WINDOW);
    assert!(queue.healthy());

    release.send(()).unwrap();
}

#[tokio::test]
async fn test_full_buffer_drops_after_window_and_releases_marker() {
    let queue = JobQueue::new(1, Duration::from_secs(5));
    queue.start(1);
    let inflight = InFlightSet::new();

    let (running, started, release) = blocking_job("a.mp3");
    assert!(queue.enqueue(running));
    started.await.unwrap();
    assert!(queue.enqueue(noop("b.mp3")));

    let guard = inflight.try_acquire("c.mp3").unwrap();
    let job = Job::new("c.mp3", JobSource::Watcher, |_| async { Ok(()) })
        .on_finish(move |_| drop(guard));
    let outcome = queue.enqueue_with_retry(job, WINDOW, INTERVAL).await;
    assert!(!outcome.accepted);
    assert!(outcome.dropped);
    // the rejected job took its marker with it
    assert!(!inflight.contains("c.mp3"));

    release.send(()).unwrap();
    let (done_tx, done_rx) = oneshot::channel();
    let job = Job::new("d.mp3", JobSource::Api, |_| async { Ok(()) }).on_finish(move |r| {
        let _ = done_tx.send(r.is_ok());
    });
    let outcome = queue
        .enqueue_with_retry(job, Duration::from_secs(2), INTERVAL)
        .await;
    assert!(outcome.accepted);
    assert!(done_rx.await.unwrap());
}

#[tokio::test]
async fn test_jobs_buffered_before_start_run_once_workers_exist() {
    let queue = JobQueue::new(4, Duration::from_secs(5));
    let (tx, rx) = oneshot::channel();
    let job = Job::new("early.mp3", JobSource::Retry, |_| async { Ok(()) }).on_finish(
        move |r| {
            let _ = tx.send(r.is_ok());
        },
    );

    assert!(queue.enqueue(job));
    assert_eq!(queue.stats().length, 1);
    assert!(!queue.healthy());

    queue.start(1);
    assert!(rx.await.unwrap());
    assert_eq!(queue.stats().length, 0);
}

#[tokio::test]
async fn test_concurrency_is_bounded_by_workers() {
    let queue = JobQueue::new(8, Duration::from_secs(5));
    queue.start(2);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut finished = Vec::new();

    for i in 0..5 {
        let (tx, rx) = oneshot::channel();
        let running = running.clone();
        let peak = peak.clone();
        let job = Job::new(format!("call_{}.mp3", i), JobSource::Api, move |_| async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .on_finish(move |_| {
            let _ = tx.send(());
        });
        assert!(queue.enqueue(job));
        finished.push(rx);
    }

    for rx in finished {
        rx.await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(queue.stats().processed, 5);
}

#[tokio::test]
async fn test_stop_cancels_running_and_abandons_buffered() {
    let queue = JobQueue::new(4, Duration::from_secs(5));
    queue.start(1);

    let (started_tx, started_rx) = oneshot::channel();
    let (running_tx, running_rx) = oneshot::channel();
    let running = Job::new("running.mp3", JobSource::Api, move |token| async move {
        let _ = started_tx.send(());
        token.cancelled().await;
        anyhow::bail!("interrupted")
    })
    .on_finish(move |r| {
        let _ = running_tx.send(matches!(r, Err(JobError::Failed(_))));
    });
    assert!(queue.enqueue(running));
    started_rx.await.unwrap();

    let abandoned = Arc::new(Mutex::new(Vec::new()));
    for name in ["b.mp3", "c.mp3"] {
        let abandoned = abandoned.clone();
        let job = Job::new(name, JobSource::Watcher, |_| async { Ok(()) }).on_finish(
            move |r| {
                if matches!(r, Err(JobError::NotStarted)) {
                    abandoned.lock().unwrap().push(name);
                }
            },
        );
        assert!(queue.enqueue(job));
    }

    let report = queue.stop(Duration::from_secs(2)).await;
    assert!(report.drained);
    assert_eq!(report.abandoned, 2);
    assert!(running_rx.await.unwrap());
    assert_eq!(*abandoned.lock().unwrap(), vec!["b.mp3", "c.mp3"]);

    assert!(!queue.healthy());
    assert!(!queue.enqueue(Job::new("late.mp3", JobSource::Api, |_| async { Ok(()) })));
    let outcome = queue
        .enqueue_with_retry(
            Job::new("late.mp3", JobSource::Api, |_| async { Ok(()) }),
            WINDOW,
            INTERVAL,
        )
        .await;
    assert!(!outcome.accepted);
    assert!(!outcome.dropped);
}
