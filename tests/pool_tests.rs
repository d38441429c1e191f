mod test_harness;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use test_harness::{hp, small_pool, FakeTrainer, Step, DEFAULT_PAYLOAD};
use trainyard::pool::{TrainOutcome, WorkerPool};
use trainyard::DispatchError;

#[tokio::test]
async fn submit_and_await_reports_completion() {
    let pool = WorkerPool::new(
        &small_pool(1, 4, Duration::from_secs(5)),
        FakeTrainer::new(vec![]),
    );
    let token = CancellationToken::new();

    let handle = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();
    match pool.await_result(handle).await {
        TrainOutcome::Completed { payload } => assert_eq!(payload, DEFAULT_PAYLOAD),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn semantic_failure_is_reported_verbatim() {
    let pool = WorkerPool::new(
        &small_pool(1, 4, Duration::from_secs(5)),
        FakeTrainer::new(vec![Step::FailSemantic("loss diverged")]),
    );
    let token = CancellationToken::new();

    let handle = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 5.0)]), &token)
        .unwrap();
    match pool.await_result(handle).await {
        TrainOutcome::Failed { reason } => assert!(reason.contains("loss diverged")),
        other => panic!("expected semantic failure, got {other:?}"),
    }
}

#[tokio::test]
async fn worker_panic_surfaces_as_worker_lost() {
    let pool = WorkerPool::new(
        &small_pool(1, 4, Duration::from_secs(5)),
        FakeTrainer::new(vec![Step::Panic]),
    );
    let token = CancellationToken::new();

    let handle = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();
    assert!(matches!(
        pool.await_result(handle).await,
        TrainOutcome::WorkerLost
    ));
}

// ---------------------------------------------------------------------------
// Backpressure: beyond the queue depth, submit fails fast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overload_is_rejected_without_blocking() {
    let pool = WorkerPool::new(
        &small_pool(1, 1, Duration::from_secs(5)),
        FakeTrainer::new(vec![Step::Hang]),
    );
    let token = CancellationToken::new();

    // One job on the worker, one in the queue.
    let _running = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();
    let _queued = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();

    let start = Instant::now();
    let err = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, DispatchError::Overloaded));
    // Must complete nearly instantly — not wait for the queue to drain
    assert!(
        elapsed < Duration::from_millis(200),
        "submit must be non-blocking (took {elapsed:?})"
    );
}

#[tokio::test]
async fn timeout_abandons_attempt_and_frees_worker() {
    let pool = WorkerPool::new(
        &small_pool(1, 4, Duration::from_millis(100)),
        FakeTrainer::new(vec![Step::Hang]),
    );
    let token = CancellationToken::new();

    let hung = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();
    let start = Instant::now();
    assert!(matches!(
        pool.await_result(hung).await,
        TrainOutcome::TimedOut
    ));
    assert!(
        start.elapsed() >= Duration::from_millis(100),
        "should have waited out the attempt timeout"
    );

    // The worker must be usable again: the next attempt runs the default
    // success step.
    let next = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();
    match pool.await_result(next).await {
        TrainOutcome::Completed { payload } => assert_eq!(payload, DEFAULT_PAYLOAD),
        other => panic!("worker was not freed after timeout, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_running_attempt_aborts_it() {
    let pool = WorkerPool::new(
        &small_pool(1, 4, Duration::from_secs(5)),
        FakeTrainer::new(vec![Step::Hang]),
    );
    let token = CancellationToken::new();

    let handle = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    assert!(matches!(
        pool.await_result(handle).await,
        TrainOutcome::Aborted
    ));
}

#[tokio::test]
async fn cancelled_queued_assignment_never_runs() {
    let pool = WorkerPool::new(
        &small_pool(1, 2, Duration::from_millis(200)),
        FakeTrainer::new(vec![Step::Hang]),
    );
    let token_a = CancellationToken::new();
    let token_b = CancellationToken::new();

    let hung = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token_a)
        .unwrap();
    let queued = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token_b)
        .unwrap();
    token_b.cancel();

    // The first attempt times out, which frees the worker; the queued
    // assignment is then picked up and resolves without executing.
    assert!(matches!(
        pool.await_result(hung).await,
        TrainOutcome::TimedOut
    ));
    assert!(matches!(
        pool.await_result(queued).await,
        TrainOutcome::Aborted
    ));
}

// ---------------------------------------------------------------------------
// Worker selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn least_recently_used_idle_worker_gets_the_job() {
    let pool = WorkerPool::new(
        &small_pool(2, 4, Duration::from_secs(5)),
        FakeTrainer::new(vec![
            Step::Sleep(Duration::from_millis(50), b"first".to_vec()),
            Step::Hang,
        ]),
    );
    let token = CancellationToken::new();

    let first = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let first_worker = busy_worker(&pool);

    assert!(matches!(
        pool.await_result(first).await,
        TrainOutcome::Completed { .. }
    ));

    // Both workers are idle now; the one that never ran anything has been
    // idle longer and must be chosen.
    let _second = pool
        .submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second_worker = busy_worker(&pool);

    assert_ne!(
        first_worker, second_worker,
        "expected the longer-idle worker to be selected"
    );
}

#[tokio::test]
async fn snapshot_reports_busy_workers_and_queue() {
    let pool = WorkerPool::new(
        &small_pool(1, 3, Duration::from_secs(5)),
        FakeTrainer::new(vec![Step::Hang]),
    );
    let token = CancellationToken::new();

    for _ in 0..3 {
        pool.submit(Uuid::new_v4(), hp(&[("lr", 0.01)]), &token)
            .unwrap();
    }

    let status = pool.snapshot();
    assert_eq!(status.workers.len(), 1);
    assert!(status.workers[0].busy);
    assert!(status.workers[0].current_job.is_some());
    assert_eq!(status.queued, 2);
    assert_eq!(status.queue_depth, 3);
}

fn busy_worker(pool: &WorkerPool) -> u64 {
    let busy: Vec<u64> = pool
        .snapshot()
        .workers
        .iter()
        .filter(|w| w.busy)
        .map(|w| w.id)
        .collect();
    assert_eq!(busy.len(), 1, "expected exactly one busy worker");
    busy[0]
}
