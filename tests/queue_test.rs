//! Operation queue: deduplication, at-most-one worker per id, delayed requeue
//! without holding workers, and cooperative shutdown.

mod common;

use async_trait::async_trait;
use common::wait_until;
use kcp_engine::models::OperationId;
use kcp_engine::orchestration::{OperationProcessor, OperationQueue, ProcessingResult};
use kcp_engine::EngineError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Processor that sleeps for `work`, then requeues each id `requeues` times
struct RecordingProcessor {
    work: Duration,
    requeues: usize,
    requeue_delay: Duration,
    active: Mutex<HashMap<OperationId, usize>>,
    max_active_per_id: AtomicUsize,
    invocations: Mutex<Vec<(OperationId, Instant)>>,
}

impl RecordingProcessor {
    fn new(work: Duration, requeues: usize, requeue_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            requeues,
            requeue_delay,
            active: Mutex::new(HashMap::new()),
            max_active_per_id: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
        })
    }

    fn invocations_of(&self, id: &OperationId) -> Vec<Instant> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(seen, _)| seen == id)
            .map(|(_, at)| *at)
            .collect()
    }

    fn total_invocations(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl OperationProcessor for RecordingProcessor {
    async fn process(&self, operation_id: &OperationId) -> ProcessingResult {
        let previous = {
            let mut invocations = self.invocations.lock().unwrap();
            let previous = invocations.iter().filter(|(id, _)| id == operation_id).count();
            invocations.push((operation_id.clone(), Instant::now()));
            previous
        };
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(operation_id.clone()).or_insert(0);
            *count += 1;
            self.max_active_per_id.fetch_max(*count, Ordering::SeqCst);
        }

        tokio::time::sleep(self.work).await;

        *self
            .active
            .lock()
            .unwrap()
            .get_mut(operation_id)
            .unwrap() -= 1;

        if previous < self.requeues {
            ProcessingResult::requeue_after(self.requeue_delay)
        } else {
            ProcessingResult::done()
        }
    }
}

fn id(value: &str) -> OperationId {
    OperationId::from(value)
}

#[tokio::test]
async fn test_add_is_deduplicated_while_pending() {
    let processor = RecordingProcessor::new(Duration::ZERO, 0, Duration::ZERO);
    let queue = OperationQueue::new("provision", processor);

    queue.add(id("op-1"));
    queue.add(id("op-1"));
    queue.add(id("op-1"));
    queue.add(id("op-2"));

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.statistics().deduplicated, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_worker_per_operation() {
    let processor = RecordingProcessor::new(Duration::from_millis(5), 5, Duration::ZERO);
    let queue = Arc::new(OperationQueue::new("provision", processor.clone()));
    queue.run(8).unwrap();

    let mut adders = Vec::new();
    for _ in 0..4 {
        let queue = Arc::clone(&queue);
        adders.push(tokio::spawn(async move {
            for _ in 0..50 {
                queue.add(id("op-1"));
                tokio::task::yield_now().await;
            }
        }));
    }
    for adder in adders {
        adder.await.unwrap();
    }

    wait_until(Duration::from_secs(5), || {
        queue.is_empty() && queue.in_flight() == 0 && processor.total_invocations() >= 6
    })
    .await;

    assert_eq!(processor.max_active_per_id.load(Ordering::SeqCst), 1);
    queue.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delayed_requeue_releases_worker() {
    let processor = RecordingProcessor::new(Duration::ZERO, 1, Duration::from_millis(200));
    let queue = OperationQueue::new("provision", processor.clone());
    queue.run(1).unwrap();

    queue.add(id("slow"));
    wait_until(Duration::from_secs(1), || processor.invocations_of(&id("slow")).len() == 1).await;
    let first_slow = processor.invocations_of(&id("slow"))[0];

    queue.add(id("other"));
    wait_until(Duration::from_secs(1), || processor.invocations_of(&id("other")).len() == 1).await;
    let other = processor.invocations_of(&id("other"))[0];
    assert!(
        other.duration_since(first_slow) < Duration::from_millis(200),
        "the only worker must not sleep through the requeue delay"
    );

    wait_until(Duration::from_secs(2), || processor.invocations_of(&id("slow")).len() == 2).await;
    let slow = processor.invocations_of(&id("slow"));
    assert!(slow[1].duration_since(slow[0]) >= Duration::from_millis(200));

    queue.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_while_in_flight_keeps_a_single_requeue_chain() {
    let delay = Duration::from_millis(100);
    let processor = RecordingProcessor::new(Duration::from_millis(50), usize::MAX, delay);
    let queue = OperationQueue::new("provision", processor.clone());
    queue.run(2).unwrap();

    queue.add(id("op-1"));
    wait_until(Duration::from_secs(1), || queue.in_flight() == 1).await;
    queue.add(id("op-1"));

    tokio::time::sleep(Duration::from_millis(700)).await;
    queue.shutdown(Duration::from_secs(1)).await.unwrap();

    let runs = processor.invocations_of(&id("op-1"));
    assert!(runs.len() >= 3, "expected steady polling, got {} runs", runs.len());
    assert!(runs.len() <= 6, "requeue chain was duplicated: {} runs", runs.len());
    for pair in runs.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= delay, "re-invoked after {gap:?}, before the requested delay");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_speed_up_divides_requeue_delay() {
    let processor = RecordingProcessor::new(Duration::ZERO, 1, Duration::from_secs(30));
    let queue = OperationQueue::new("update", processor.clone());
    queue.speed_up(1000);
    queue.run(1).unwrap();

    queue.add(id("op-1"));
    wait_until(Duration::from_secs(2), || processor.invocations_of(&id("op-1")).len() == 2).await;

    queue.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_in_flight_work() {
    let processor = RecordingProcessor::new(Duration::from_millis(100), 0, Duration::ZERO);
    let queue = OperationQueue::new("deprovision", processor.clone());
    queue.run(2).unwrap();

    queue.add(id("op-1"));
    wait_until(Duration::from_secs(1), || queue.in_flight() == 1).await;

    queue.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(!queue.is_running());
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.statistics().finished, 1);

    // stopped queues accept ids but nothing processes them
    queue.add(id("op-2"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(processor.total_invocations(), 1);
    assert_eq!(queue.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_timeout_is_reported() {
    let processor = RecordingProcessor::new(Duration::from_secs(10), 0, Duration::ZERO);
    let queue = OperationQueue::new("upgrade", processor);
    queue.run(1).unwrap();

    queue.add(id("stuck"));
    wait_until(Duration::from_secs(1), || queue.in_flight() == 1).await;

    let result = queue.shutdown(Duration::from_millis(20)).await;
    assert!(matches!(result, Err(EngineError::Timeout(_))));
}

#[tokio::test]
async fn test_run_validation() {
    let processor = RecordingProcessor::new(Duration::ZERO, 0, Duration::ZERO);
    let queue = OperationQueue::new("provision", processor);

    assert!(matches!(queue.run(0), Err(EngineError::InvalidState(_))));
    queue.run(1).unwrap();
    assert!(matches!(queue.run(1), Err(EngineError::InvalidState(_))));

    queue.shutdown(Duration::from_secs(1)).await.unwrap();
    // a stopped queue can be started again
    queue.run(1).unwrap();
    queue.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_statistics_count_outcomes() {
    let processor = RecordingProcessor::new(Duration::ZERO, 2, Duration::ZERO);
    let queue = OperationQueue::new("provision", processor);
    queue.run(2).unwrap();

    queue.add(id("op-1"));
    wait_until(Duration::from_secs(1), || queue.statistics().finished == 1).await;

    let stats = queue.statistics();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.panicked, 0);
    queue.shutdown(Duration::from_secs(1)).await.unwrap();
}
