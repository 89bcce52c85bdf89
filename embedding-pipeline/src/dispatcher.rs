use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::error::AppError;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunker::ChunkingMode;
use crate::provider::{EmbeddedChunk, EmbeddingProvider, EmbeddingTask};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Queue waits above this get a warning line.
const SLOW_WAIT: Duration = Duration::from_secs(1);

/// Service priority; lower sorts first. Interactive search-time embeddings
/// run High, bulk indexing runs Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRequest {
    pub texts: Vec<String>,
    pub task: EmbeddingTask,
    pub chunk_size: usize,
    pub mode: ChunkingMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResponse {
    /// Per input text, the ordered chunk spans and vectors.
    pub chunks: Vec<Vec<EmbeddedChunk>>,
    pub model_name: String,
}

struct QueuedRequest {
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    request: EmbeddingRequest,
    responder: oneshot::Sender<Result<EmbeddingResponse, AppError>>,
    cancel: CancellationToken,
    /// Holds a slot of the bounded queue until this request is dequeued.
    permit: OwnedSemaphorePermit,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // BinaryHeap pops the maximum; invert so the smallest (priority, seq)
    // pair, i.e. highest priority and earliest enqueue, comes out first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct DispatcherInner {
    provider: Arc<dyn EmbeddingProvider>,
    queue: Mutex<BinaryHeap<QueuedRequest>>,
    notify: Notify,
    capacity: Arc<Semaphore>,
    seq: AtomicU64,
}

/// Multiplexes embedding requests onto one provider.
///
/// Strict priority with FIFO inside each class; exactly one consumer task
/// talks to the provider, so backpressure never reorders requests. The queue
/// is bounded: `submit` waits for a slot, `try_submit` fails fast with
/// `Overloaded`.
#[derive(Clone)]
pub struct EmbeddingDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EmbeddingDispatcher {
    /// Spawn the consumer task and hand back the dispatch handle. The task
    /// runs until `shutdown` fires, then completes everything still queued
    /// with `Cancelled`.
    pub fn start(
        provider: Arc<dyn EmbeddingProvider>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let inner = Arc::new(DispatcherInner {
            provider,
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            capacity: Arc::new(Semaphore::new(capacity)),
            seq: AtomicU64::new(0),
        });

        tokio::spawn(run_consumer(Arc::clone(&inner), shutdown));

        Self { inner }
    }

    /// Enqueue and wait for the result, blocking while the queue is full.
    pub async fn submit(
        &self,
        request: EmbeddingRequest,
        priority: Priority,
    ) -> Result<EmbeddingResponse, AppError> {
        self.submit_with_cancellation(request, priority, CancellationToken::new())
            .await
    }

    /// Enqueue without waiting for space; a full queue is `Overloaded`.
    pub async fn try_submit(
        &self,
        request: EmbeddingRequest,
        priority: Priority,
    ) -> Result<EmbeddingResponse, AppError> {
        let permit = Arc::clone(&self.inner.capacity)
            .try_acquire_owned()
            .map_err(|_| AppError::Overloaded)?;
        self.enqueue(request, priority, CancellationToken::new(), permit)
            .await
    }

    /// Enqueue with a caller-held cancellation token. A request cancelled
    /// while still queued completes with `Cancelled` and never reaches the
    /// provider.
    pub async fn submit_with_cancellation(
        &self,
        request: EmbeddingRequest,
        priority: Priority,
        cancel: CancellationToken,
    ) -> Result<EmbeddingResponse, AppError> {
        let permit = Arc::clone(&self.inner.capacity)
            .acquire_owned()
            .await
            .map_err(|_| AppError::Cancelled)?;
        self.enqueue(request, priority, cancel, permit).await
    }

    pub fn queue_len(&self) -> usize {
        lock_queue(&self.inner.queue).len()
    }

    async fn enqueue(
        &self,
        request: EmbeddingRequest,
        priority: Priority,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) -> Result<EmbeddingResponse, AppError> {
        let (responder, receiver) = oneshot::channel();
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);

        lock_queue(&self.inner.queue).push(QueuedRequest {
            priority,
            seq,
            enqueued_at: Instant::now(),
            request,
            responder,
            cancel,
            permit,
        });
        self.inner.notify.notify_one();

        match receiver.await {
            Ok(result) => result,
            // Consumer went away before fulfilling the handle
            Err(_) => Err(AppError::Cancelled),
        }
    }
}

fn lock_queue(queue: &Mutex<BinaryHeap<QueuedRequest>>) -> std::sync::MutexGuard<'_, BinaryHeap<QueuedRequest>> {
    match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_consumer(inner: Arc<DispatcherInner>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let next = lock_queue(&inner.queue).pop();
        let Some(item) = next else {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = inner.notify.notified() => continue,
            }
        };
        process_one(&inner, item).await;
    }

    // Flush whatever is still queued so no caller hangs on shutdown
    while let Some(item) = lock_queue(&inner.queue).pop() {
        let _ = item.responder.send(Err(AppError::Cancelled));
    }
}

async fn process_one(inner: &DispatcherInner, item: QueuedRequest) {
    let QueuedRequest {
        priority,
        seq,
        enqueued_at,
        request,
        responder,
        cancel,
        permit,
    } = item;
    // Free the queue slot as soon as the request is out of the queue
    drop(permit);

    let waited = enqueued_at.elapsed();
    if waited > SLOW_WAIT {
        warn!(?priority, seq, waited_ms = waited.as_millis() as u64, "embedding request waited long in queue");
    } else {
        debug!(?priority, seq, waited_ms = waited.as_millis() as u64, "dispatching embedding request");
    }

    if cancel.is_cancelled() {
        let _ = responder.send(Err(AppError::Cancelled));
        return;
    }

    let result = inner
        .provider
        .embed(&request.texts, request.task, request.chunk_size, request.mode)
        .await
        .map(|chunks| EmbeddingResponse {
            chunks,
            model_name: inner.provider.model_name().to_string(),
        });
    let _ = responder.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::StubProvider;
    use std::time::Instant;

    fn request(text: &str) -> EmbeddingRequest {
        EmbeddingRequest {
            texts: vec![text.to_string()],
            task: EmbeddingTask::Passage,
            chunk_size: 512,
            mode: ChunkingMode::None,
        }
    }

    fn dispatcher(provider: Arc<StubProvider>, capacity: usize) -> EmbeddingDispatcher {
        EmbeddingDispatcher::start(provider, capacity, CancellationToken::new())
    }

    #[tokio::test]
    async fn high_priority_preempts_queued_low_traffic() {
        let provider = Arc::new(StubProvider::with_latency(Duration::from_millis(50)));
        let dispatcher = dispatcher(Arc::clone(&provider), DEFAULT_QUEUE_CAPACITY);

        let mut low_handles = Vec::new();
        for i in 0..20 {
            let d = dispatcher.clone();
            low_handles.push(tokio::spawn(async move {
                let started = Instant::now();
                d.submit(request(&format!("low-{i}")), Priority::Low)
                    .await
                    .expect("low response");
                started.elapsed()
            }));
        }
        // Let the consumer pick up the first low request
        tokio::time::sleep(Duration::from_millis(20)).await;

        let high_started = Instant::now();
        dispatcher
            .submit(request("interactive query"), Priority::High)
            .await
            .expect("high response");
        let high_elapsed = high_started.elapsed();

        let mut slower_than_high = 0;
        for handle in low_handles {
            let low_elapsed = handle.await.expect("join");
            if low_elapsed > high_elapsed {
                slower_than_high += 1;
            }
        }
        assert!(
            slower_than_high >= 18,
            "high priority should finish before most queued low requests ({slower_than_high}/20)"
        );
    }

    #[tokio::test]
    async fn fifo_within_a_priority_class() {
        let provider = Arc::new(StubProvider::with_latency(Duration::from_millis(5)));
        let dispatcher = dispatcher(Arc::clone(&provider), DEFAULT_QUEUE_CAPACITY);

        let mut handles = Vec::new();
        for i in 0..10 {
            let d = dispatcher.clone();
            let text = format!("req-{i:02}");
            handles.push(tokio::spawn(async move {
                d.submit(request(&text), Priority::Normal).await.expect("response")
            }));
            // Enqueue strictly one at a time
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let seen = provider.seen_texts().await;
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted, "same-priority requests must run in order");
    }

    #[tokio::test]
    async fn try_submit_reports_overload() {
        // Block the consumer with a slow request, then fill the tiny queue
        let provider = Arc::new(StubProvider::with_latency(Duration::from_millis(500)));
        let dispatcher = dispatcher(Arc::clone(&provider), 2);

        let d1 = dispatcher.clone();
        let blocker = tokio::spawn(async move { d1.submit(request("blocker"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let d2 = dispatcher.clone();
        let queued =
            tokio::spawn(async move { d2.submit(request("queued-1"), Priority::Low).await });
        let d3 = dispatcher.clone();
        let queued2 =
            tokio::spawn(async move { d3.submit(request("queued-2"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = dispatcher
            .try_submit(request("one too many"), Priority::High)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Overloaded));

        for handle in [blocker, queued, queued2] {
            handle.await.expect("join").expect("response");
        }
    }

    #[tokio::test]
    async fn cancelled_requests_never_reach_the_provider() {
        let provider = Arc::new(StubProvider::with_latency(Duration::from_millis(100)));
        let dispatcher = dispatcher(Arc::clone(&provider), DEFAULT_QUEUE_CAPACITY);

        // Occupy the consumer
        let d1 = dispatcher.clone();
        let blocker = tokio::spawn(async move { d1.submit(request("blocker"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dispatcher
            .submit_with_cancellation(request("doomed"), Priority::High, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));

        blocker.await.expect("join").expect("blocker response");
        let seen = provider.seen_texts().await;
        assert!(!seen.contains(&"doomed".to_string()));
    }

    #[tokio::test]
    async fn identical_requests_get_independent_identical_responses() {
        let provider = Arc::new(StubProvider::with_latency(Duration::from_millis(1)));
        let dispatcher = dispatcher(Arc::clone(&provider), DEFAULT_QUEUE_CAPACITY);

        let first = dispatcher
            .submit(request("same text"), Priority::Normal)
            .await
            .expect("first");
        let second = dispatcher
            .submit(request("same text"), Priority::Normal)
            .await
            .expect("second");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_requests_as_cancelled() {
        let provider = Arc::new(StubProvider::with_latency(Duration::from_millis(200)));
        let shutdown = CancellationToken::new();
        let dispatcher =
            EmbeddingDispatcher::start(provider.clone(), 10, shutdown.clone());

        let d1 = dispatcher.clone();
        let blocker = tokio::spawn(async move { d1.submit(request("blocker"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let d2 = dispatcher.clone();
        let queued = tokio::spawn(async move { d2.submit(request("queued"), Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.cancel();

        blocker.await.expect("join").expect("in-flight request completes");
        let err = queued.await.expect("join").unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }
}
