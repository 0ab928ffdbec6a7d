//! Envelope dispatch onto a bounded worker pool
//!
//! Submissions go into a bounded channel drained by one dispatch task that
//! runs at most `worker_pool_size` sends at a time. Each send runs on the
//! blocking pool so a slow sender never stalls the runtime. Failed retryable
//! sends feed the disk cache; cached envelopes are removed once delivered.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::EnvelopeCache;
use crate::clock::Clock;
use crate::envelope::Envelope;
use crate::error::{EnvelopeError, PostboxError, PostboxResult};
use crate::hint::Hint;
use crate::rate_limit::{RateLimitHeaders, RateLimiter};
use crate::report::{ClientReport, DiscardReason, DiscardTracker};

/// A rejected submission keeps the transport unhealthy this long
const REJECTION_WINDOW: Duration = Duration::from_secs(2);

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    Failure { retryable: bool },
    RateLimited(RateLimitHeaders),
}

/// Delivers serialized envelopes. Called from the blocking pool.
pub trait EnvelopeSender: Send + Sync {
    fn send(&self, body: &[u8]) -> SendOutcome;
}

impl<F> EnvelopeSender for F
where
    F: Fn(&[u8]) -> SendOutcome + Send + Sync,
{
    fn send(&self, body: &[u8]) -> SendOutcome {
        self(body)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub worker_pool_size: usize,
    pub max_queue_size: usize,
    /// Log envelopes instead of sending them
    pub debug: bool,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            worker_pool_size: 2,
            max_queue_size: 100,
            debug: false,
        }
    }
}

/// Build the runtime hosting the workers and the health-check timer.
pub fn build_runtime(worker_pool_size: usize) -> PostboxResult<Runtime> {
    let threads = worker_pool_size.max(1);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .max_blocking_threads(threads)
        .thread_name("postbox-worker")
        .enable_time()
        .build()
        .map_err(PostboxError::Executor)
}

struct Job {
    id: u64,
    envelope: Envelope,
    hint: Hint,
}

struct Shared {
    queue: mpsc::Sender<Arc<Job>>,
    receiver: Mutex<mpsc::Receiver<Arc<Job>>>,
    active: Mutex<HashMap<u64, Arc<Job>>>,
    outstanding: Mutex<usize>,
    idle: Condvar,
    next_id: AtomicU64,
    last_rejection: Mutex<Option<Instant>>,
    sender: Arc<dyn EnvelopeSender>,
    cache: Arc<EnvelopeCache>,
    rate_limiter: Arc<RateLimiter>,
    discards: Arc<DiscardTracker>,
    clock: Arc<dyn Clock>,
    debug: bool,
}

impl Shared {
    /// Next job from the channel. It is marked active before the receiver
    /// lock is released, so a forced close finds it in one place or the other.
    fn poll_next_job(&self, cx: &mut Context<'_>) -> Poll<Option<Arc<Job>>> {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        let polled = receiver.poll_recv(cx);
        if let Poll::Ready(Some(job)) = &polled {
            self.active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(job.id, Arc::clone(job));
        }
        polled
    }

    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn process(&self, job: &Job) {
        let hint = &job.hint;
        let filtered = self.rate_limiter.filter(job.envelope.clone());
        for category in &filtered.dropped {
            self.discards.record(DiscardReason::RateLimitBackoff, *category, 1);
        }

        let Some(envelope) = filtered.envelope else {
            if hint.is_cached() {
                self.cache.discard(&job.envelope);
            }
            hint.mark_done(false);
            return;
        };

        let on_disk = hint.is_cached() || (hint.is_disk_flush() && self.cache.store(&envelope, hint));

        // Debug mode leaves cache entries on disk
        if self.debug {
            info!(
                event_id = %envelope.event_id(),
                items = envelope.items().len(),
                header = %serde_json::to_string(envelope.header()).unwrap_or_default(),
                "Debug mode, envelope not sent"
            );
            hint.mark_done(true);
            return;
        }

        let report = self.discards.take_report(self.clock.now());
        let outcome = match self.outgoing_body(&envelope, report.as_ref()) {
            Ok(body) => self.sender.send(&body),
            Err(e) => {
                error!(event_id = %envelope.event_id(), error = %e, "Envelope could not be serialized");
                if let Some(report) = &report {
                    self.discards.restore(report);
                }
                if on_disk {
                    self.cache.discard(&envelope);
                }
                hint.mark_done(false);
                return;
            }
        };

        if let Some(report) = &report {
            if outcome != SendOutcome::Success {
                self.discards.restore(report);
            }
        }

        match outcome {
            SendOutcome::Success => {
                debug!(event_id = %envelope.event_id(), "Envelope sent");
                if on_disk {
                    self.cache.discard(&envelope);
                }
                hint.mark_done(true);
            }
            SendOutcome::Failure { retryable: true } => {
                self.keep_for_retry(&envelope, hint, on_disk);
            }
            SendOutcome::Failure { retryable: false } => {
                warn!(event_id = %envelope.event_id(), "Envelope rejected, dropping it");
                if on_disk {
                    self.cache.discard(&envelope);
                }
                self.discards.record_envelope(DiscardReason::NetworkError, &envelope);
                hint.mark_done(false);
            }
            SendOutcome::RateLimited(headers) => {
                self.rate_limiter.update(&headers);
                self.keep_for_retry(&envelope, hint, on_disk);
            }
        }
    }

    /// Wire bytes of the copy that goes out: `sent_at` stamped and the
    /// pending client report appended. The cached copy has neither.
    fn outgoing_body(
        &self,
        envelope: &Envelope,
        report: Option<&ClientReport>,
    ) -> Result<Vec<u8>, EnvelopeError> {
        let mut outgoing = envelope.clone();
        outgoing.set_sent_at(Some(self.clock.now()));
        if let Some(report) = report {
            outgoing.add_item(report.to_item()?);
        }
        outgoing.to_bytes()
    }

    fn keep_for_retry(&self, envelope: &Envelope, hint: &Hint, on_disk: bool) {
        if on_disk {
            debug!(event_id = %envelope.event_id(), "Send failed, envelope stays in offline storage");
        } else if hint.is_retryable() {
            if self.cache.store(envelope, hint) {
                debug!(event_id = %envelope.event_id(), "Send failed, envelope saved for retry");
            }
        } else {
            warn!(event_id = %envelope.event_id(), "Send failed, envelope is not retryable");
            self.discards.record_envelope(DiscardReason::NetworkError, envelope);
        }
        hint.mark_done(false);
    }

    /// Persist a job that will not get a send attempt.
    fn persist_unsent(&self, job: &Job) {
        if job.hint.is_cached() {
            return;
        }
        if job.hint.is_retryable() || job.hint.is_disk_flush() {
            self.cache.store(&job.envelope, &job.hint);
        } else {
            debug!(event_id = %job.envelope.event_id(), "Dropping unsent non-retryable envelope");
        }
    }
}

/// Pull jobs off the channel, running at most `workers` sends at once.
async fn run_dispatch(shared: Arc<Shared>, workers: usize) {
    debug!(workers, "Envelope dispatch started");
    let permits = Arc::new(Semaphore::new(workers));

    loop {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let Some(job) = poll_fn(|cx| shared.poll_next_job(cx)).await else {
            break;
        };

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            run_job(task_shared, job).await;
            drop(permit);
        });
    }

    debug!("Envelope dispatch stopped");
}

async fn run_job(shared: Arc<Shared>, job: Arc<Job>) {
    let task_shared = Arc::clone(&shared);
    let task_job = Arc::clone(&job);
    let result = tokio::task::spawn_blocking(move || task_shared.process(&task_job)).await;

    if let Err(e) = result {
        error!(event_id = %job.envelope.event_id(), error = %e, "Envelope send task failed");
        shared.keep_for_retry(&job.envelope, &job.hint, job.hint.is_cached());
    }

    shared
        .active
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&job.id);
    shared.finish_one();
}

/// Bounded queue plus worker pool delivering envelopes through an
/// [`EnvelopeSender`].
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Spawn the workers on `handle` and start accepting submissions.
    pub fn start(
        options: DispatcherOptions,
        sender: Arc<dyn EnvelopeSender>,
        cache: Arc<EnvelopeCache>,
        rate_limiter: Arc<RateLimiter>,
        discards: Arc<DiscardTracker>,
        clock: Arc<dyn Clock>,
        handle: &Handle,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(options.max_queue_size.max(1));
        let shared = Arc::new(Shared {
            queue,
            receiver: Mutex::new(receiver),
            active: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            next_id: AtomicU64::new(0),
            last_rejection: Mutex::new(None),
            sender,
            cache,
            rate_limiter,
            discards,
            clock,
            debug: options.debug,
        });

        handle.spawn(run_dispatch(
            Arc::clone(&shared),
            options.worker_pool_size.max(1),
        ));

        Self { shared }
    }

    /// Queue an envelope without blocking.
    ///
    /// Returns false when the queue is full or closed. The envelope is then
    /// counted as lost; unless it came from the cache it is written to disk
    /// when it is retryable or a crash-time flush.
    pub fn submit(&self, envelope: Envelope, hint: Hint) -> bool {
        let job = Arc::new(Job {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            envelope,
            hint,
        });

        *self
            .shared
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;

        match self.shared.queue.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                self.reject(&job);
                false
            }
        }
    }

    fn reject(&self, job: &Job) {
        warn!(
            event_id = %job.envelope.event_id(),
            cached = job.hint.is_cached(),
            "Envelope rejected, submission queue is full or closed"
        );
        self.shared.persist_unsent(job);
        self.shared
            .discards
            .record_envelope(DiscardReason::QueueOverflow, &job.envelope);
        *self
            .shared
            .last_rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        job.hint.mark_done(false);
        self.shared.finish_one();
    }

    /// Resubmit everything in the disk cache. Returns how many were queued.
    pub fn replay_pending(&self) -> usize {
        let mut queued = 0;
        for cached in self.shared.cache.pending() {
            if self.submit(cached.envelope, cached.hint) {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(count = queued, "Resubmitted cached envelopes");
        }
        queued
    }

    /// False while a rate limit is active or shortly after a rejected submission.
    pub fn is_healthy(&self) -> bool {
        if self.shared.rate_limiter.is_any_active() {
            return false;
        }
        let last_rejection = *self
            .shared
            .last_rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last_rejection.map_or(true, |at| at.elapsed() >= REJECTION_WINDOW)
    }

    /// Block until every accepted submission is processed or `timeout`
    /// elapses. Returns whether the dispatcher went idle.
    ///
    /// Must not be called from a runtime worker thread.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self
            .shared
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            outstanding = self
                .shared
                .idle
                .wait_timeout(outstanding, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Stop accepting work and drain for up to `timeout`.
    ///
    /// Whatever is still queued or in flight afterwards is written to the
    /// disk cache so the next start can replay it. A send still running
    /// may complete later, so an envelope can be delivered twice.
    pub fn close(&self, timeout: Duration) {
        self.shared
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();

        if self.flush(timeout) {
            debug!("Dispatcher drained");
            return;
        }

        let (queued, in_flight) = {
            let mut receiver = self.shared.receiver.lock().unwrap_or_else(PoisonError::into_inner);
            let mut queued = Vec::new();
            while let Ok(job) = receiver.try_recv() {
                queued.push(job);
            }
            let in_flight: Vec<Arc<Job>> = self
                .shared
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            (queued, in_flight)
        };

        warn!(
            queued = queued.len(),
            in_flight = in_flight.len(),
            "Dispatcher did not drain in time, saving unsent envelopes"
        );

        for job in &queued {
            self.shared.persist_unsent(job);
            job.hint.mark_done(false);
            self.shared.finish_one();
        }
        for job in &in_flight {
            self.shared.persist_unsent(job);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }
}
