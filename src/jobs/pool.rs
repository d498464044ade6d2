//! Bounded worker pool for cancellable search and lookup jobs.
//!
//! Workers block on network I/O, so the pool is sized for I/O concurrency.
//! Cancellation is cooperative: a job body checks its token between blocking
//! steps, and its sink drops output once the token is set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};
use tokio::sync::broadcast::Sender;

use crate::error::CoreError;
use crate::jobs::{CancellationToken, JobContext, JobIdAllocator, JobKind, JobSink};
use crate::protocol::{JobId, Message};

type JobBody = Box<dyn FnOnce(&JobContext) -> Result<(), CoreError> + Send + 'static>;

struct QueuedJob {
    context: JobContext,
    source: String,
    body: JobBody,
}

type ActiveJobs = Arc<Mutex<HashMap<JobId, CancellationToken>>>;

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

/// Fixed-size pool of worker threads draining one shared queue.
pub struct JobPool {
    queue_producer: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active_jobs: ActiveJobs,
    job_ids: JobIdAllocator,
    bus_producer: Sender<Message>,
    shutdown: Arc<AtomicBool>,
}

impl JobPool {
    /// Starts `worker_count` workers (at least one).
    pub fn new(
        worker_count: usize,
        job_ids: JobIdAllocator,
        bus_producer: Sender<Message>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let (queue_producer, queue_consumer) = mpsc::channel::<QueuedJob>();
        let queue_consumer = Arc::new(Mutex::new(queue_consumer));
        let active_jobs: ActiveJobs = Arc::new(Mutex::new(HashMap::new()));
        let workers = (0..worker_count.max(1))
            .map(|worker_index| {
                let queue_consumer = Arc::clone(&queue_consumer);
                let active_jobs = Arc::clone(&active_jobs);
                thread::Builder::new()
                    .name(format!("job-worker-{worker_index}"))
                    .spawn(move || Self::worker_loop(queue_consumer, active_jobs))
                    .expect("failed to spawn job worker thread")
            })
            .collect();
        Self {
            queue_producer: Mutex::new(Some(queue_producer)),
            workers: Mutex::new(workers),
            active_jobs,
            job_ids,
            bus_producer,
            shutdown,
        }
    }

    fn worker_loop(queue_consumer: Arc<Mutex<mpsc::Receiver<QueuedJob>>>, active_jobs: ActiveJobs) {
        loop {
            let next_job = {
                let queue = queue_consumer.lock().expect("job queue lock poisoned");
                queue.recv()
            };
            match next_job {
                Ok(job) => Self::run_job(job, &active_jobs),
                Err(_) => break,
            }
        }
    }

    fn run_job(job: QueuedJob, active_jobs: &ActiveJobs) {
        let QueuedJob {
            context,
            source,
            body,
        } = job;
        if context.token.is_cancelled() {
            debug!("JobPool: job {} cancelled before start", context.id);
            Self::deregister(active_jobs, context.id);
            return;
        }

        let run_result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&context)));
        match run_result {
            Ok(Ok(())) => {}
            Ok(Err(CoreError::Cancelled)) => {
                debug!("JobPool: job {} observed cancellation", context.id);
            }
            Ok(Err(error)) => {
                warn!(
                    "JobPool: {:?} job {} failed for {}: {}",
                    context.kind, context.id, source, error
                );
                context.sink.failed(&source, error.to_string());
            }
            Err(payload) => {
                let detail = panic_payload_to_string(payload.as_ref());
                error!(
                    "JobPool: {:?} job {} panicked for {}: {}",
                    context.kind, context.id, source, detail
                );
                context
                    .sink
                    .failed(&source, format!("Unexpected error: {detail}"));
            }
        }
        Self::deregister(active_jobs, context.id);
    }

    fn deregister(active_jobs: &ActiveJobs, job_id: JobId) {
        active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .remove(&job_id);
    }

    /// Queues a job body. The job is tracked before it is queued so a
    /// concurrent `cancel_all` can never miss it.
    pub fn submit<F>(
        &self,
        kind: JobKind,
        source: impl Into<String>,
        body: F,
    ) -> Result<JobId, CoreError>
    where
        F: FnOnce(&JobContext) -> Result<(), CoreError> + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(CoreError::Shutdown);
        }
        let job_id = self.job_ids.next_id();
        let token = CancellationToken::new();
        let context = JobContext {
            id: job_id,
            kind,
            token: token.clone(),
            sink: JobSink::new(job_id, token.clone(), self.bus_producer.clone()),
        };
        self.active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .insert(job_id, token);

        let queued = QueuedJob {
            context,
            source: source.into(),
            body: Box::new(body),
        };
        let queue_producer = self.queue_producer.lock().expect("job queue lock poisoned");
        let send_result = match queue_producer.as_ref() {
            Some(queue_producer) => queue_producer.send(queued).map_err(|_| CoreError::Shutdown),
            None => Err(CoreError::Shutdown),
        };
        if let Err(error) = send_result {
            Self::deregister(&self.active_jobs, job_id);
            return Err(error);
        }
        debug!("JobPool: queued {:?} job {}", kind, job_id);
        Ok(job_id)
    }

    /// Flags one job. Returns false when the job is unknown or already done.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let token = self
            .active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .remove(&job_id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Flags every tracked job and clears the tracking set. Does not wait for
    /// in-flight bodies to notice.
    pub fn cancel_all(&self) -> usize {
        let mut active_jobs = self.active_jobs.lock().expect("active jobs lock poisoned");
        let cancelled = active_jobs.len();
        for token in active_jobs.values() {
            token.cancel();
        }
        active_jobs.clear();
        cancelled
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs
            .lock()
            .expect("active jobs lock poisoned")
            .len()
    }

    /// Rejects new work, cancels tracked jobs, and joins the workers.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel_all();
        self.queue_producer
            .lock()
            .expect("job queue lock poisoned")
            .take();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("job workers lock poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("JobPool: worker thread exited with a panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::JobPool;
    use crate::error::CoreError;
    use crate::jobs::{JobIdAllocator, JobKind};
    use crate::protocol::{Message, Severity};

    fn make_pool(workers: usize) -> (JobPool, broadcast::Receiver<Message>) {
        let (bus_producer, bus_consumer) = broadcast::channel(64);
        let pool = JobPool::new(
            workers,
            JobIdAllocator::new(),
            bus_producer,
            Arc::new(AtomicBool::new(false)),
        );
        (pool, bus_consumer)
    }

    #[test]
    fn test_submit_runs_job_and_emits_through_sink() {
        let (pool, mut bus_consumer) = make_pool(2);
        let (done_tx, done_rx) = mpsc::channel();
        let job_id = pool
            .submit(JobKind::Search, "term", move |context| {
                context.sink.status("hello", Severity::Info);
                done_tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
        assert_eq!(job_id, 1);
        assert!(matches!(
            bus_consumer.try_recv(),
            Ok(Message::Status { ref text, .. }) if text == "hello"
        ));
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_panicking_job_is_reported_and_pool_keeps_working() {
        let (pool, mut bus_consumer) = make_pool(1);
        let panicking = pool
            .submit(JobKind::Lookup, "bad", |_| panic!("boom"))
            .unwrap();
        let (done_tx, done_rx) = mpsc::channel();
        pool.submit(JobKind::Lookup, "good", move |_| {
            done_tx.send(()).unwrap();
            Ok(())
        })
        .unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
        match bus_consumer.try_recv() {
            Ok(Message::JobFailed {
                job_id,
                source_url,
                message,
            }) => {
                assert_eq!(job_id, panicking);
                assert_eq!(source_url, "bad");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_job_error_is_reported_as_failure() {
        let (pool, mut bus_consumer) = make_pool(1);
        pool.submit(JobKind::Search, "term", |_| {
            Err(CoreError::TransientNetwork("offline".to_string()))
        })
        .unwrap();
        let (done_tx, done_rx) = mpsc::channel();
        pool.submit(JobKind::Search, "after", move |_| {
            done_tx.send(()).unwrap();
            Ok(())
        })
        .unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
        assert!(matches!(
            bus_consumer.try_recv(),
            Ok(Message::JobFailed { ref message, .. }) if message.contains("offline")
        ));
    }

    #[test]
    fn test_cancelled_job_emits_nothing() {
        let (pool, mut bus_consumer) = make_pool(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let job_id = pool
            .submit(JobKind::Search, "term", move |context| {
                started_tx.send(()).unwrap();
                gate_rx.recv().unwrap();
                context.token.check()?;
                context.sink.status("late", Severity::Info);
                Ok(())
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.cancel(job_id));
        assert!(!pool.cancel(job_id));
        gate_tx.send(()).unwrap();
        pool.shutdown();
        assert!(bus_consumer.try_recv().is_err());
    }

    #[test]
    fn test_cancel_all_flags_queued_jobs_and_clears_tracking() {
        let (pool, mut bus_consumer) = make_pool(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));
        pool.submit(JobKind::Search, "blocker", move |_| {
            gate_rx.recv().unwrap();
            Ok(())
        })
        .unwrap();
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.submit(JobKind::Search, "queued", move |context| {
                ran.fetch_add(1, Ordering::SeqCst);
                context.sink.status("should not appear", Severity::Info);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(pool.cancel_all(), 4);
        assert_eq!(pool.active_count(), 0);
        gate_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(bus_consumer.try_recv().is_err());
    }

    #[test]
    fn test_pool_never_exceeds_worker_count() {
        let (pool, _bus_consumer) = make_pool(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done_tx = done_tx.clone();
            pool.submit(JobKind::Lookup, "x", move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                done_tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        }
        for _ in 0..8 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        pool.shutdown();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let (pool, _bus_consumer) = make_pool(1);
        pool.shutdown();
        let result = pool.submit(JobKind::Search, "x", |_| Ok(()));
        assert_eq!(result, Err(CoreError::Shutdown));
    }
}
