use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::{BackgroundWorker, PauseSignal};

/// How often a parked worker thread rechecks its pause flag without being woken.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(5);

static QUEUE_POISON_WARNED: AtomicBool = AtomicBool::new(false);

struct JobQueue<J> {
    jobs: Mutex<VecDeque<J>>,
    wake: Condvar,
    /// Queued plus in-flight jobs.
    pending: AtomicU32,
    shutdown: AtomicBool,
}

impl<J> JobQueue<J> {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            pending: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<J>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn_queue_poisoned();
                poisoned.into_inner()
            }
        }
    }

    fn push(&self, job: J) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.lock().push_back(job);
        self.wake.notify_one();
    }

    fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    fn finish_one(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

fn warn_queue_poisoned() {
    if !QUEUE_POISON_WARNED.swap(true, Ordering::Relaxed) {
        warn!("worker_queue_lock_poisoned_recovering");
    }
}

/// Cloneable producer side of a [`QueuedWorker`]. Safe to use from any thread.
///
/// Created first, so producers can be wired up before the worker that consumes it.
pub struct JobSubmitter<J> {
    queue: Arc<JobQueue<J>>,
}

impl<J> Default for JobSubmitter<J> {
    fn default() -> Self {
        Self {
            queue: Arc::new(JobQueue::new()),
        }
    }
}

impl<J> Clone for JobSubmitter<J> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<J> JobSubmitter<J> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, job: J) {
        self.queue.push(job);
    }

    pub fn pending(&self) -> u32 {
        self.queue.pending()
    }
}

enum Execution<J> {
    Threaded(Option<JoinHandle<()>>),
    Inline(Box<dyn FnMut(J) + Send>),
}

/// A job queue drained either by its own thread or by the pool's pump.
///
/// Threaded workers take one job at a time and look at their pause signal before each
/// one, so a pause takes effect at the next job boundary. Inline workers run jobs
/// directly inside `do_work`, at most `max_units` per call.
pub struct QueuedWorker<J> {
    name: &'static str,
    queue: Arc<JobQueue<J>>,
    execution: Execution<J>,
}

impl<J: Send + 'static> QueuedWorker<J> {
    pub fn threaded<F>(
        name: &'static str,
        jobs: &JobSubmitter<J>,
        signal: PauseSignal,
        process: F,
    ) -> io::Result<Self>
    where
        F: FnMut(J) + Send + 'static,
    {
        let queue = Arc::clone(&jobs.queue);
        let thread_queue = Arc::clone(&queue);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker_thread(&thread_queue, &signal, process))?;
        debug!(worker = name, "worker_thread_started");
        Ok(Self {
            name,
            queue,
            execution: Execution::Threaded(Some(thread)),
        })
    }

    pub fn inline<F>(name: &'static str, jobs: &JobSubmitter<J>, process: F) -> Self
    where
        F: FnMut(J) + Send + 'static,
    {
        Self {
            name,
            queue: Arc::clone(&jobs.queue),
            execution: Execution::Inline(Box::new(process)),
        }
    }
}

impl<J> QueuedWorker<J> {
    pub fn submitter(&self) -> JobSubmitter<J> {
        JobSubmitter {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending(&self) -> u32 {
        self.queue.pending()
    }
}

impl<J> BackgroundWorker for QueuedWorker<J> {
    fn do_work(&mut self, max_units: u32) -> u32 {
        match &mut self.execution {
            Execution::Threaded(_) => {
                if self.queue.pending() > 0 {
                    self.queue.wake.notify_one();
                }
            }
            Execution::Inline(process) => {
                for _ in 0..max_units {
                    let Some(job) = self.queue.lock().pop_front() else {
                        break;
                    };
                    process(job);
                    self.queue.finish_one();
                }
            }
        }
        self.queue.pending()
    }

    fn resume(&mut self) {
        self.queue.wake.notify_all();
    }
}

impl<J> Drop for QueuedWorker<J> {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);
        self.queue.wake.notify_all();
        if let Execution::Threaded(thread) = &mut self.execution {
            if let Some(thread) = thread.take() {
                if thread.join().is_err() {
                    warn!(worker = self.name, "worker_thread_panicked");
                }
            }
        }
    }
}

fn run_worker_thread<J, F>(queue: &JobQueue<J>, signal: &PauseSignal, mut process: F)
where
    F: FnMut(J),
{
    loop {
        let job = {
            let mut jobs = queue.lock();
            loop {
                if queue.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if !signal.is_paused() {
                    if let Some(job) = jobs.pop_front() {
                        break job;
                    }
                }
                jobs = match queue.wake.wait_timeout(jobs, PAUSE_POLL_INTERVAL) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => {
                        warn_queue_poisoned();
                        poisoned.into_inner().0
                    }
                };
            }
        };
        process(job);
        queue.finish_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::worker::PauseFlag;

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn inline_worker_runs_at_most_max_units_per_call() {
        let (sender, receiver) = mpsc::channel();
        let submitter = JobSubmitter::new();
        let mut worker = QueuedWorker::inline("decode", &submitter, move |job: u32| {
            let _ = sender.send(job);
        });
        for job in 0..5 {
            submitter.submit(job);
        }

        assert_eq!(worker.do_work(2), 3);
        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(worker.do_work(10), 0);
        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn threaded_worker_holds_jobs_while_paused() {
        let flag = PauseFlag::new();
        flag.set(true);
        let (sender, receiver) = mpsc::channel();
        let submitter = JobSubmitter::new();
        let mut worker =
            QueuedWorker::threaded("fetch", &submitter, flag.signal(), move |job: u32| {
                let _ = sender.send(job);
            })
            .expect("spawn worker");
        submitter.submit(1);
        submitter.submit(2);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(worker.do_work(1), 2);
        assert!(receiver.try_recv().is_err());

        flag.set(false);
        worker.resume();
        assert!(wait_until(Duration::from_secs(5), || submitter.pending() == 0));
        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn dropping_threaded_worker_joins_its_thread() {
        let submitter = JobSubmitter::new();
        let worker =
            QueuedWorker::threaded("cache", &submitter, PauseSignal::detached(), |_job: ()| {})
                .expect("spawn worker");
        submitter.submit(());
        assert!(wait_until(Duration::from_secs(5), || submitter.pending() == 0));

        drop(worker);
        assert_eq!(submitter.pending(), 0);
    }
}
