//! Prioritised request queue for the shared link
//!
//! Requests are drained by a background ticker, at most one per tick and
//! never while a previous request is still being processed. Before each
//! dequeue the pending list is re-sorted by priority (highest first), then
//! enqueue time, then arrival sequence. Each request carries a completion
//! handle; callers that do not care simply drop it. A caller whose bounded
//! wait expires withdraws its request if it has not been dequeued yet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::link::executor::{Operation, RequestExecutor, Response};
use crate::state::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A queued link request
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub device: DeviceId,
    pub operation: Operation,
    pub priority: Priority,
    pub enqueued_at: Instant,
    /// Arrival order, breaks timestamp ties
    pub seq: u64,
}

/// Completion of one queued request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub id: Uuid,
    pub response: Option<Response>,
    pub attempts: u32,
}

/// How a bounded wait on a queued write ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    /// Every attempt failed, or the request was withdrawn unsent
    Failed,
    /// Still on the link when the wait expired; may yet take effect
    Unconfirmed,
}

/// End of a bounded wait
enum Waited {
    Done(Option<RequestOutcome>),
    Withdrawn,
    InFlight,
}

/// Receives the outcome of one queued request
#[derive(Debug)]
pub struct RequestHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl RequestHandle {
    /// Wait for the outcome; `None` if the request was dropped unprocessed.
    pub async fn outcome(self) -> Option<RequestOutcome> {
        self.rx.await.ok()
    }
}

struct Entry {
    request: Request,
    reply: oneshot::Sender<RequestOutcome>,
}

/// Clears the busy flag when processing ends, however it ends
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RequestQueue {
    executor: Arc<RequestExecutor>,
    pending: Mutex<Vec<Entry>>,
    processing: AtomicBool,
    next_seq: AtomicU64,
    tick: Duration,
    wait: Duration,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("pending", &self.len())
            .field("processing", &self.is_processing())
            .field("tick", &self.tick)
            .finish()
    }
}

impl RequestQueue {
    pub fn new(executor: Arc<RequestExecutor>, tick: Duration, wait: Duration) -> Self {
        Self {
            executor,
            pending: Mutex::new(Vec::new()),
            processing: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            tick,
            wait,
        }
    }

    pub fn from_config(executor: Arc<RequestExecutor>, config: &LinkConfig) -> Self {
        Self::new(executor, config.queue_tick(), config.queue_wait())
    }

    /// Queue a request; the returned handle resolves once it has been processed.
    pub fn enqueue(
        &self,
        device: DeviceId,
        operation: Operation,
        priority: Priority,
    ) -> RequestHandle {
        let (reply, rx) = oneshot::channel();
        let request = Request {
            id: Uuid::new_v4(),
            device,
            operation,
            priority,
            enqueued_at: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let id = request.id;
        trace!(device = %device, "Enqueued {:?} at {:?} priority ({})", operation, priority, id);
        self.pending.lock().push(Entry { request, reply });
        RequestHandle { id, rx }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Drop every pending request; their handles resolve to `None`.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut *self.pending.lock());
        if !dropped.is_empty() {
            debug!("Cleared {} pending link requests", dropped.len());
        }
        dropped.len()
    }

    /// Remove a request that has not been dequeued yet.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|entry| entry.request.id == id) {
            Some(index) => {
                pending.remove(index);
                true
            },
            None => false,
        }
    }

    /// Pending requests in processing order
    pub fn pending(&self) -> Vec<Request> {
        let mut pending = self.pending.lock();
        Self::sort(&mut pending);
        pending.iter().map(|entry| entry.request.clone()).collect()
    }

    fn sort(pending: &mut [Entry]) {
        pending.sort_by(|a, b| {
            b.request
                .priority
                .cmp(&a.request.priority)
                .then(a.request.enqueued_at.cmp(&b.request.enqueued_at))
                .then(a.request.seq.cmp(&b.request.seq))
        });
    }

    /// Claim the busy flag and take the next request, if any.
    fn begin(&self) -> Option<Entry> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let mut pending = self.pending.lock();
        if pending.is_empty() {
            self.processing.store(false, Ordering::Release);
            return None;
        }
        Self::sort(&mut pending);
        Some(pending.remove(0))
    }

    async fn process(&self, entry: Entry) {
        let _guard = ProcessingGuard(&self.processing);
        let Entry { request, reply } = entry;

        let execution = self
            .executor
            .execute_counted(request.device, request.operation, "queued request")
            .await;
        let outcome = RequestOutcome {
            id: request.id,
            response: execution.response,
            attempts: execution.attempts,
        };
        // Receiver gone means a fire-and-forget caller
        let _ = reply.send(outcome);
    }

    /// Process one request inline. Returns false when busy or empty.
    pub async fn process_next(&self) -> bool {
        match self.begin() {
            Some(entry) => {
                self.process(entry).await;
                true
            },
            None => false,
        }
    }

    /// Enqueue a read and wait (bounded) for its value.
    pub async fn read_with_priority(
        &self,
        device: DeviceId,
        address: u16,
        priority: Priority,
    ) -> Option<u16> {
        let handle = self.enqueue(device, Operation::read(address), priority);
        match self.await_outcome(handle).await {
            Waited::Done(outcome) => outcome
                .and_then(|outcome| outcome.response)
                .and_then(|response| response.first_register()),
            Waited::Withdrawn | Waited::InFlight => None,
        }
    }

    /// Enqueue a write and wait (bounded) for its completion.
    pub async fn write_with_priority(
        &self,
        device: DeviceId,
        address: u16,
        value: u16,
        priority: Priority,
    ) -> WriteStatus {
        let handle = self.enqueue(device, Operation::write(address, value), priority);
        match self.await_outcome(handle).await {
            Waited::Done(Some(RequestOutcome {
                response: Some(_), ..
            })) => WriteStatus::Written,
            Waited::Done(_) | Waited::Withdrawn => WriteStatus::Failed,
            Waited::InFlight => WriteStatus::Unconfirmed,
        }
    }

    async fn await_outcome(&self, handle: RequestHandle) -> Waited {
        let id = handle.id;
        match tokio::time::timeout(self.wait, handle.outcome()).await {
            Ok(outcome) => Waited::Done(outcome),
            Err(_) if self.cancel(id) => {
                debug!("Withdrew queued request {} after waiting {:?}", id, self.wait);
                Waited::Withdrawn
            },
            Err(_) => {
                warn!("Queued request {} still in flight after {:?}", id, self.wait);
                Waited::InFlight
            },
        }
    }

    /// Drain the queue on a fixed tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Request queue started (tick {:?})", self.tick);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(entry) = self.begin() {
                        let queue = Arc::clone(&self);
                        tokio::spawn(async move { queue.process(entry).await });
                    }
                }
            }
        }

        let dropped = self.clear();
        info!("Request queue stopped ({} pending dropped)", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::arbiter::LinkArbiter;
    use crate::link::client::RegisterLink;
    use crate::link::executor::RetryPolicy;
    use crate::stats::StatsCollector;
    use crate::test_utils::ScriptedLink;

    fn queue(link: &Arc<ScriptedLink>) -> Arc<RequestQueue> {
        let arbiter = Arc::new(LinkArbiter::new(
            Arc::clone(link) as Arc<dyn RegisterLink>,
            Duration::from_millis(200),
        ));
        let executor = Arc::new(RequestExecutor::new(
            arbiter,
            Arc::new(StatsCollector::new()),
            RetryPolicy::default(),
        ));
        Arc::new(RequestQueue::new(
            executor,
            Duration::from_millis(50),
            Duration::from_secs(10),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_arrival_order() {
        let link = Arc::new(ScriptedLink::new());
        let queue = queue(&link);

        queue.enqueue(DeviceId(1), Operation::write(10, 1), Priority::Low);
        queue.enqueue(DeviceId(1), Operation::write(10, 2), Priority::Normal);
        queue.enqueue(DeviceId(1), Operation::write(10, 3), Priority::High);
        queue.enqueue(DeviceId(1), Operation::write(10, 4), Priority::High);
        queue.enqueue(DeviceId(1), Operation::write(10, 5), Priority::Normal);

        let order: Vec<_> = queue
            .pending()
            .iter()
            .map(|r| match r.operation {
                Operation::Write { value, .. } => value,
                Operation::Read { .. } => 0,
            })
            .collect();
        assert_eq!(order, vec![3, 4, 2, 5, 1]);

        while queue.process_next().await {}
        let written: Vec<_> = link.writes().iter().map(|(_, _, v)| *v).collect();
        assert_eq!(written, vec![3, 4, 2, 5, 1]);
        assert!(queue.is_empty());
        assert!(!queue.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_receives_outcome() {
        let link = Arc::new(ScriptedLink::new());
        link.set_register(2, 7, 99);
        let queue = queue(&link);

        let handle = queue.enqueue(DeviceId(2), Operation::read(7), Priority::Normal);
        let id = handle.id;
        assert!(queue.process_next().await);

        let outcome = handle.outcome().await.unwrap();
        assert_eq!(outcome.id, id);
        assert_eq!(outcome.response, Some(Response::Registers(vec![99])));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_read_and_write_through_ticker() {
        let link = Arc::new(ScriptedLink::new());
        link.set_register(3, 1, 21);
        let queue = queue(&link);
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&queue).run(cancel.clone()));

        assert_eq!(
            queue.read_with_priority(DeviceId(3), 1, Priority::High).await,
            Some(21)
        );
        assert_eq!(
            queue.write_with_priority(DeviceId(3), 1, 24, Priority::High).await,
            WriteStatus::Written
        );
        assert_eq!(link.register(3, 1), Some(24));

        cancel.cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded_without_ticker() {
        let link = Arc::new(ScriptedLink::new());
        let queue = queue(&link);

        let start = Instant::now();
        assert_eq!(queue.read_with_priority(DeviceId(1), 0, Priority::High).await, None);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert!(queue.is_empty());
        assert!(!queue.process_next().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_write_is_withdrawn_before_sending() {
        let link = Arc::new(ScriptedLink::new());
        let queue = queue(&link);
        queue.enqueue(DeviceId(1), Operation::read(0), Priority::Low);

        assert_eq!(
            queue.write_with_priority(DeviceId(1), 1, 24, Priority::High).await,
            WriteStatus::Failed
        );
        assert_eq!(queue.len(), 1);

        // A ticker starting late must not deliver the abandoned write
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&queue).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.is_empty());
        assert_eq!(link.requests(), 1);
        assert!(link.writes().is_empty());
        assert_eq!(link.register(1, 1), None);

        cancel.cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_in_flight_at_expiry_is_unconfirmed() {
        let link = Arc::new(ScriptedLink::new());
        link.set_response_delay(Duration::from_secs(15));
        let queue = queue(&link);
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&queue).run(cancel.clone()));

        assert_eq!(
            queue.write_with_priority(DeviceId(1), 1, 24, Priority::High).await,
            WriteStatus::Unconfirmed
        );
        assert!(queue.is_processing());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(link.writes(), vec![(1, 1, 24)]);

        cancel.cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_touches_pending() {
        let link = Arc::new(ScriptedLink::new());
        let queue = queue(&link);

        let first = queue.enqueue(DeviceId(1), Operation::read(0), Priority::Normal);
        let second = queue.enqueue(DeviceId(1), Operation::read(1), Priority::Normal);
        assert!(queue.cancel(second.id));
        assert!(!queue.cancel(second.id));
        assert!(second.outcome().await.is_none());

        assert!(queue.process_next().await);
        assert!(!queue.cancel(first.id));
        assert!(first.outcome().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resolves_handles_to_none() {
        let link = Arc::new(ScriptedLink::new());
        let queue = queue(&link);

        let handle = queue.enqueue(DeviceId(1), Operation::read(0), Priority::Low);
        queue.enqueue(DeviceId(1), Operation::read(1), Priority::Low);
        assert_eq!(queue.clear(), 2);
        assert!(handle.outcome().await.is_none());
        assert!(!queue.process_next().await);
        assert_eq!(link.requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_flag_blocks_second_dequeue() {
        let link = Arc::new(ScriptedLink::new());
        link.set_response_delay(Duration::from_millis(500));
        let queue = queue(&link);
        queue.enqueue(DeviceId(1), Operation::read(0), Priority::Normal);
        queue.enqueue(DeviceId(1), Operation::read(1), Priority::Normal);

        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process_next().await }
        });
        tokio::task::yield_now().await;
        assert!(queue.is_processing());
        assert!(!queue.process_next().await);
        assert_eq!(queue.len(), 1);

        assert!(first.await.unwrap());
        assert!(!queue.is_processing());
    }
}
