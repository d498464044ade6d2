//! Child-process fetch manager.
//!
//! Every spawned executable is tracked in a live-process registry keyed by a
//! manager-assigned sequence number and, when it belongs to an addressable job, in a fetch-job registry keyed
//! by job id. Both registries share one lock. Whoever removes a job from the
//! registry first owns its terminal notification: the exit path emits the
//! result, the cancel path emits the cancellation, never both.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast::Sender;

use crate::error::{CoreError, CANCELLED_MESSAGE};
use crate::fetch::{extract_result_payload, parse_progress_line, FetchCommand, FetchMode};
use crate::jobs::JobIdAllocator;
use crate::protocol::{JobId, Message, Severity};

pub const FETCH_FAILED_MESSAGE: &str = "Fetch failed. See the log for details.";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const UNTRACKED_JOB_ID: JobId = 0;

/// Terminal state of one fetch run.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Completed(Value),
    Failed(CoreError),
    Cancelled,
}

/// A started addressable fetch. Dropping `worker` detaches it.
#[derive(Debug)]
pub struct FetchJob {
    pub job_id: JobId,
    pub worker: JoinHandle<FetchOutcome>,
}

#[derive(Debug)]
struct ProcessHandle {
    key: u64,
    pid: u32,
    job_id: JobId,
    source_url: String,
    child: Arc<Mutex<Child>>,
}

impl ProcessHandle {
    fn terminate(&self) {
        let mut child = self.child.lock().expect("child lock poisoned");
        match child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(error) = child.kill() {
                    warn!("FetchManager: failed to kill pid {}: {}", self.pid, error);
                }
            }
            Err(error) => {
                warn!("FetchManager: failed to poll pid {}: {}", self.pid, error);
            }
        }
    }
}

#[derive(Default)]
struct Registries {
    fetch_jobs: HashMap<JobId, Arc<ProcessHandle>>,
    processes: HashMap<u64, Arc<ProcessHandle>>,
}

struct SpawnedProcess {
    handle: Arc<ProcessHandle>,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// Launches and supervises fetch executables.
pub struct ProcessFetchManager {
    command: FetchCommand,
    bus_producer: Sender<Message>,
    job_ids: JobIdAllocator,
    shutdown: Arc<AtomicBool>,
    next_process_key: AtomicU64,
    registries: Arc<Mutex<Registries>>,
}

fn read_lines_lossy<R: Read>(reader: R, mut on_line: impl FnMut(String)) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                on_line(line.trim_end_matches(['\r', '\n']).to_string());
            }
            Err(error) => {
                debug!("FetchManager: output stream closed: {}", error);
                break;
            }
        }
    }
}

/// Forwards a progress event while holding the registry lock, so a cancel
/// that already removed the job can never be followed by its progress.
fn emit_progress(
    registries: &Mutex<Registries>,
    bus_producer: &Sender<Message>,
    job_id: JobId,
    (current, total): (u64, u64),
) {
    if job_id <= UNTRACKED_JOB_ID {
        return;
    }
    let registries = registries.lock().expect("fetch registry lock poisoned");
    if !registries.fetch_jobs.contains_key(&job_id) {
        return;
    }
    let _ = bus_producer.send(Message::JobProgress {
        job_id,
        current,
        total,
    });
}

impl ProcessFetchManager {
    pub fn new(
        command: FetchCommand,
        bus_producer: Sender<Message>,
        job_ids: JobIdAllocator,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            command,
            bus_producer,
            job_ids,
            shutdown,
            next_process_key: AtomicU64::new(1),
            registries: Arc::new(Mutex::new(Registries::default())),
        }
    }

    /// Spawns a download for `url` and supervises it on its own thread.
    ///
    /// A launch failure is returned to the caller and nothing is emitted.
    pub fn start_fetch(self: &Arc<Self>, url: &str) -> Result<FetchJob, CoreError> {
        let job_id = self.job_ids.next_id();
        let spawned = self.spawn_tracked(job_id, url, FetchMode::Download)?;
        let manager = Arc::clone(self);
        let worker = thread::Builder::new()
            .name(format!("fetch-{job_id}"))
            .spawn(move || manager.supervise(spawned))
            .map_err(|error| CoreError::Launch(format!("fetch supervisor thread: {error}")))?;
        info!("FetchManager: job {} started for {}", job_id, url);
        Ok(FetchJob { job_id, worker })
    }

    /// Runs the executable in artist-resolution mode and blocks until it
    /// exits. Nothing is emitted except forwarded stderr lines.
    pub fn resolve_artist(&self, url: &str) -> Result<Value, CoreError> {
        match self.run_untracked(url, FetchMode::ResolveArtist)? {
            FetchOutcome::Completed(payload) => Ok(payload),
            FetchOutcome::Failed(error) => Err(error),
            FetchOutcome::Cancelled => Err(CoreError::Cancelled),
        }
    }

    /// Fire-and-forget run: registered only in the live-process registry so
    /// that a global cancel still terminates it.
    pub fn run_untracked(&self, url: &str, mode: FetchMode) -> Result<FetchOutcome, CoreError> {
        let spawned = self.spawn_tracked(UNTRACKED_JOB_ID, url, mode)?;
        Ok(self.supervise(spawned))
    }

    /// Cancels an addressable fetch. Returns `false` when the job is unknown
    /// or already finished.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let mut registries = self.registries.lock().expect("fetch registry lock poisoned");
        let Some(handle) = registries.fetch_jobs.remove(&job_id) else {
            debug!("FetchManager: cancel for unknown job {}", job_id);
            return false;
        };
        registries.processes.remove(&handle.key);
        handle.terminate();
        let _ = self.bus_producer.send(Message::JobFailed {
            job_id,
            source_url: handle.source_url.clone(),
            message: CANCELLED_MESSAGE.to_string(),
        });
        info!("FetchManager: job {} cancelled (pid {})", job_id, handle.pid);
        true
    }

    /// Terminates every live process, reports each addressable job as
    /// cancelled and announces that all jobs were cleared. Returns the number
    /// of processes terminated.
    pub fn cancel_all_fetches(&self) -> usize {
        let mut guard = self.registries.lock().expect("fetch registry lock poisoned");
        let registries = &mut *guard;
        for handle in registries.processes.values() {
            handle.terminate();
        }
        let terminated = registries.processes.len();
        for (job_id, handle) in registries.fetch_jobs.drain() {
            if !registries.processes.contains_key(&handle.key) {
                handle.terminate();
            }
            let _ = self.bus_producer.send(Message::JobFailed {
                job_id,
                source_url: handle.source_url.clone(),
                message: CANCELLED_MESSAGE.to_string(),
            });
        }
        registries.processes.clear();
        drop(guard);

        let _ = self.bus_producer.send(Message::JobsCleared);
        info!("FetchManager: cancelled all fetches ({} processes)", terminated);
        terminated
    }

    pub fn live_process_count(&self) -> usize {
        self.registries
            .lock()
            .expect("fetch registry lock poisoned")
            .processes
            .len()
    }

    pub fn is_tracked(&self, job_id: JobId) -> bool {
        self.registries
            .lock()
            .expect("fetch registry lock poisoned")
            .fetch_jobs
            .contains_key(&job_id)
    }

    fn spawn_tracked(
        &self,
        job_id: JobId,
        url: &str,
        mode: FetchMode,
    ) -> Result<SpawnedProcess, CoreError> {
        let mut registries = self.registries.lock().expect("fetch registry lock poisoned");
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(CoreError::Shutdown);
        }

        let mut child = Command::new(&self.command.program)
            .args(&self.command.leading_args)
            .args(mode.protocol_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| {
                CoreError::Launch(format!(
                    "failed to start '{}': {}",
                    self.command.program, error
                ))
            })?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CoreError::Launch("fetch output pipes unavailable".to_string()));
        };

        let handle = Arc::new(ProcessHandle {
            key: self.next_process_key.fetch_add(1, Ordering::SeqCst),
            pid: child.id(),
            job_id,
            source_url: url.to_string(),
            child: Arc::new(Mutex::new(child)),
        });
        registries.processes.insert(handle.key, Arc::clone(&handle));
        if job_id > UNTRACKED_JOB_ID {
            registries.fetch_jobs.insert(job_id, Arc::clone(&handle));
        }
        debug!(
            "FetchManager: spawned pid {} for job {} ({:?})",
            handle.pid, job_id, mode
        );
        Ok(SpawnedProcess {
            handle,
            stdout,
            stderr,
        })
    }

    fn supervise(&self, spawned: SpawnedProcess) -> FetchOutcome {
        let SpawnedProcess {
            handle,
            stdout,
            stderr,
        } = spawned;
        let job_id = handle.job_id;

        let stderr_bus = self.bus_producer.clone();
        let stderr_reader = thread::spawn(move || {
            read_lines_lossy(stderr, |line| {
                if !line.trim().is_empty() {
                    let _ = stderr_bus.send(Message::Status {
                        text: line,
                        severity: Severity::Info,
                    });
                }
            });
        });

        let stdout_registries = Arc::clone(&self.registries);
        let stdout_bus = self.bus_producer.clone();
        let stdout_reader = thread::spawn(move || {
            let mut lines = Vec::new();
            read_lines_lossy(stdout, |line| {
                if let Some(event) = parse_progress_line(&line) {
                    emit_progress(&stdout_registries, &stdout_bus, job_id, event.counts());
                }
                lines.push(line);
            });
            lines
        });

        let exit = self.wait_for_exit(&handle);
        // A cancelled job's pipes may stay open in surviving descendants, so
        // its readers are left detached instead of joined.
        if !self.take_ownership(&handle) {
            debug!("FetchManager: job {} ended after cancellation", job_id);
            return FetchOutcome::Cancelled;
        }
        let stdout_lines = stdout_reader.join();
        if stderr_reader.join().is_err() {
            warn!("FetchManager: stderr reader for job {} panicked", job_id);
        }

        let outcome = match (exit, stdout_lines) {
            (Err(error), _) => FetchOutcome::Failed(error),
            (Ok(_), Err(_)) => FetchOutcome::Failed(CoreError::Execution(
                "stdout reader panicked".to_string(),
            )),
            (Ok(status), Ok(_)) if !status.success() => FetchOutcome::Failed(
                CoreError::Execution(format!("fetch exited with {status}")),
            ),
            (Ok(_), Ok(lines)) => match extract_result_payload(&lines.join("\n")) {
                Ok(payload) => FetchOutcome::Completed(payload),
                Err(error) => FetchOutcome::Failed(error),
            },
        };
        self.report_outcome(&handle, &outcome);
        outcome
    }

    fn wait_for_exit(&self, handle: &ProcessHandle) -> Result<ExitStatus, CoreError> {
        loop {
            let polled = handle.child.lock().expect("child lock poisoned").try_wait();
            match polled {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                Err(error) => {
                    return Err(CoreError::Execution(format!(
                        "failed to wait for pid {}: {}",
                        handle.pid, error
                    )));
                }
            }
        }
    }

    /// Removes the process from the registries. `false` means a cancel got
    /// there first and already reported the job.
    fn take_ownership(&self, handle: &ProcessHandle) -> bool {
        let mut registries = self.registries.lock().expect("fetch registry lock poisoned");
        let live = registries.processes.remove(&handle.key).is_some();
        if handle.job_id > UNTRACKED_JOB_ID {
            registries.fetch_jobs.remove(&handle.job_id).is_some()
        } else {
            live
        }
    }

    fn report_outcome(&self, handle: &ProcessHandle, outcome: &FetchOutcome) {
        let job_id = handle.job_id;
        match outcome {
            FetchOutcome::Completed(_) => info!("FetchManager: job {} completed", job_id),
            FetchOutcome::Failed(error) => {
                warn!("FetchManager: job {} failed: {}", job_id, error)
            }
            FetchOutcome::Cancelled => {}
        }
        if job_id <= UNTRACKED_JOB_ID {
            return;
        }
        let message = match outcome {
            FetchOutcome::Completed(payload) => Message::JobCompleted {
                job_id,
                payload: payload.clone(),
                source_url: handle.source_url.clone(),
            },
            FetchOutcome::Failed(CoreError::Execution(_)) => Message::JobFailed {
                job_id,
                source_url: handle.source_url.clone(),
                message: FETCH_FAILED_MESSAGE.to_string(),
            },
            FetchOutcome::Failed(error) => Message::JobFailed {
                job_id,
                source_url: handle.source_url.clone(),
                message: error.to_string(),
            },
            FetchOutcome::Cancelled => return,
        };
        let _ = self.bus_producer.send(message);
    }
}
