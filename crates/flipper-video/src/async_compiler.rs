//! Background compile pool.
//!
//! Workers run compile jobs off the GPU thread. A job produces a retrieval closure, and
//! retrieval closures are only run on the thread that owns the cache, through
//! [`AsyncShaderCompiler::take_completed`]. The cache maps therefore never need a lock.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Integrates one finished job into its owner.
pub type Retrieve<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Runs on a worker (or inline with zero workers) and hands back a [`Retrieve`].
pub type CompileJob<C> = Box<dyn FnOnce() -> Retrieve<C> + Send>;

/// Lower values are dequeued first. Advisory only: a worker may be busy with lower
/// priority work when an urgent item arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkPriority {
    OnDemand = 0,
    ShaderCache = 1,
    UberShader = 2,
}

struct QueuedJob<C> {
    priority: WorkPriority,
    seq: u64,
    job: CompileJob<C>,
}

impl<C> PartialEq for QueuedJob<C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<C> Eq for QueuedJob<C> {}

impl<C> PartialOrd for QueuedJob<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for QueuedJob<C> {
    // `BinaryHeap` is a max-heap; the most urgent, oldest job must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct QueueState<C> {
    pending: BinaryHeap<QueuedJob<C>>,
    next_seq: u64,
    in_progress: usize,
    completed: Vec<Retrieve<C>>,
    exit: bool,
}

struct Shared<C> {
    state: Mutex<QueueState<C>>,
    work_available: Condvar,
    work_done: Condvar,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, QueueState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct AsyncShaderCompiler<C: 'static> {
    shared: Arc<Shared<C>>,
    workers: Vec<JoinHandle<()>>,
}

impl<C: 'static> Default for AsyncShaderCompiler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> AsyncShaderCompiler<C> {
    /// Starts with no workers; jobs run inline until [`Self::resize_worker_threads`].
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: BinaryHeap::new(),
                    next_seq: 0,
                    in_progress: 0,
                    completed: Vec::new(),
                    exit: false,
                }),
                work_available: Condvar::new(),
                work_done: Condvar::new(),
            }),
            workers: Vec::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queue_work_item(&self, job: CompileJob<C>, priority: WorkPriority) {
        if self.workers.is_empty() {
            if let Some(retrieve) = run_job(job) {
                self.shared.lock().completed.push(retrieve);
            }
            return;
        }

        let mut state = self.shared.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(QueuedJob { priority, seq, job });
        drop(state);
        self.shared.work_available.notify_one();
    }

    /// Takes every finished job. Jobs queued while the returned closures run land in the next
    /// batch.
    pub fn take_completed(&self) -> Vec<Retrieve<C>> {
        std::mem::take(&mut self.shared.lock().completed)
    }

    pub fn retrieve_work_items(&self, owner: &mut C) {
        for retrieve in self.take_completed() {
            retrieve(owner);
        }
    }

    /// True while anything is queued or running. Finished-but-unretrieved jobs do not count.
    pub fn has_pending_work(&self) -> bool {
        let state = self.shared.lock();
        !state.pending.is_empty() || state.in_progress > 0
    }

    pub fn has_completed_work(&self) -> bool {
        !self.shared.lock().completed.is_empty()
    }

    /// Drops queued jobs that have not started. Running jobs still complete.
    pub fn clear_pending_work(&self) {
        self.shared.lock().pending.clear();
    }

    /// Blocks until nothing is queued or running. `progress(done, total)` is called
    /// periodically; `total` can grow if jobs are queued meanwhile.
    pub fn wait_until_completion(&self, mut progress: impl FnMut(usize, usize)) {
        if self.workers.is_empty() {
            self.run_pending_inline();
            return;
        }

        let mut state = self.shared.lock();
        let mut total = state.pending.len() + state.in_progress;
        let mut last_remaining = usize::MAX;
        loop {
            let remaining = state.pending.len() + state.in_progress;
            if remaining == 0 {
                break;
            }
            if remaining != last_remaining {
                total = total.max(remaining);
                progress(total - remaining, total);
                last_remaining = remaining;
            }
            state = self
                .shared
                .work_done
                .wait_timeout(state, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if total > 0 {
            progress(total, total);
        }
    }

    /// Runs anything left in the queue on this thread. Used when there are no workers to
    /// drain it.
    fn run_pending_inline(&self) {
        loop {
            let Some(item) = self.shared.lock().pending.pop() else {
                return;
            };
            if let Some(retrieve) = run_job(item.job) {
                self.shared.lock().completed.push(retrieve);
            }
        }
    }

    /// Joins every worker. Queued jobs stay queued.
    pub fn stop_worker_threads(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.lock().exit = true;
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("shader compiler worker panicked");
            }
        }
        self.shared.lock().exit = false;
    }

    pub fn resize_worker_threads(&mut self, count: usize) {
        if count == self.workers.len() {
            return;
        }
        tracing::debug!(from = self.workers.len(), to = count, "resizing shader compiler pool");
        self.stop_worker_threads();
        for index in 0..count {
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("shader-compiler-{index}"))
                .spawn(move || worker_loop(&shared));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to spawn shader compiler worker");
                    break;
                }
            }
        }
        if self.workers.is_empty() {
            self.run_pending_inline();
        }
    }
}

impl<C: 'static> Drop for AsyncShaderCompiler<C> {
    fn drop(&mut self) {
        self.stop_worker_threads();
    }
}

/// A panicking job is dropped so waiters still see it finish.
fn run_job<C>(job: CompileJob<C>) -> Option<Retrieve<C>> {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(retrieve) => Some(retrieve),
        Err(_) => {
            tracing::error!("shader compile job panicked, dropping it");
            None
        }
    }
}

fn worker_loop<C>(shared: &Shared<C>) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.exit {
                    return;
                }
                if let Some(item) = state.pending.pop() {
                    state.in_progress += 1;
                    break item.job;
                }
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let retrieve = run_job(job);

        let mut state = shared.lock();
        state.in_progress -= 1;
        state.completed.extend(retrieve);
        drop(state);
        shared.work_done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;

    #[derive(Default)]
    struct Sink {
        seen: Vec<u32>,
    }

    fn record(value: u32) -> CompileJob<Sink> {
        Box::new(move || -> Retrieve<Sink> {
            Box::new(move |sink: &mut Sink| sink.seen.push(value))
        })
    }

    #[test]
    fn zero_workers_compile_inline_but_defer_retrieval() {
        let compiler = AsyncShaderCompiler::<Sink>::new();
        compiler.queue_work_item(record(1), WorkPriority::OnDemand);
        assert!(!compiler.has_pending_work());
        assert!(compiler.has_completed_work());

        let mut sink = Sink::default();
        compiler.retrieve_work_items(&mut sink);
        assert_eq!(sink.seen, vec![1]);
        assert!(!compiler.has_completed_work());
    }

    #[test]
    fn panicking_jobs_still_count_as_finished() {
        let mut compiler = AsyncShaderCompiler::<Sink>::new();
        compiler.resize_worker_threads(1);
        compiler.queue_work_item(
            Box::new(|| -> Retrieve<Sink> { panic!("backend blew up") }),
            WorkPriority::OnDemand,
        );
        compiler.queue_work_item(record(7), WorkPriority::OnDemand);

        compiler.wait_until_completion(|_, _| {});
        assert!(!compiler.has_pending_work());
        let mut sink = Sink::default();
        compiler.retrieve_work_items(&mut sink);
        assert_eq!(sink.seen, vec![7]);
    }

    #[test]
    fn priority_then_fifo_ordering() {
        let mut compiler = AsyncShaderCompiler::<Sink>::new();
        compiler.resize_worker_threads(1);

        // Park the only worker so the rest of the queue builds up.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        compiler.queue_work_item(
            Box::new(move || -> Retrieve<Sink> {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Box::new(|sink: &mut Sink| sink.seen.push(0))
            }),
            WorkPriority::OnDemand,
        );
        started_rx.recv().unwrap();

        compiler.queue_work_item(record(30), WorkPriority::UberShader);
        compiler.queue_work_item(record(20), WorkPriority::ShaderCache);
        compiler.queue_work_item(record(10), WorkPriority::OnDemand);
        compiler.queue_work_item(record(11), WorkPriority::OnDemand);
        release_tx.send(()).unwrap();

        compiler.wait_until_completion(|_, _| {});
        let mut sink = Sink::default();
        compiler.retrieve_work_items(&mut sink);
        assert_eq!(sink.seen, vec![0, 10, 11, 20, 30]);
    }

    #[test]
    fn clearing_drops_only_unstarted_jobs() {
        let mut compiler = AsyncShaderCompiler::<Sink>::new();
        compiler.resize_worker_threads(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        compiler.queue_work_item(
            Box::new(move || -> Retrieve<Sink> {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Box::new(|sink: &mut Sink| sink.seen.push(1))
            }),
            WorkPriority::OnDemand,
        );
        started_rx.recv().unwrap();
        compiler.queue_work_item(record(2), WorkPriority::OnDemand);

        compiler.clear_pending_work();
        assert!(compiler.has_pending_work());
        release_tx.send(()).unwrap();
        compiler.wait_until_completion(|_, _| {});

        let mut sink = Sink::default();
        compiler.retrieve_work_items(&mut sink);
        assert_eq!(sink.seen, vec![1]);
    }

    #[test]
    fn progress_reaches_the_total() {
        let mut compiler = AsyncShaderCompiler::<Sink>::new();
        compiler.resize_worker_threads(2);
        for value in 0..16 {
            compiler.queue_work_item(record(value), WorkPriority::ShaderCache);
        }
        let mut last = (0, 0);
        compiler.wait_until_completion(|done, total| last = (done, total));
        assert!(!compiler.has_pending_work());
        if last != (0, 0) {
            assert_eq!(last.0, last.1);
        }

        let mut sink = Sink::default();
        compiler.retrieve_work_items(&mut sink);
        sink.seen.sort_unstable();
        assert_eq!(sink.seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn shrinking_to_zero_drains_the_queue() {
        let mut compiler = AsyncShaderCompiler::<Sink>::new();
        compiler.resize_worker_threads(3);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            compiler.queue_work_item(
                Box::new(move || -> Retrieve<Sink> {
                    ran.fetch_add(1, AtomicOrdering::SeqCst);
                    Box::new(|_: &mut Sink| {})
                }),
                WorkPriority::UberShader,
            );
        }
        compiler.resize_worker_threads(0);
        assert_eq!(compiler.worker_count(), 0);
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 8);
        assert!(!compiler.has_pending_work());
    }
}
