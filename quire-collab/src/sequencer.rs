//! Per-document operation sequencing.
//!
//! Architecture:
//! ```text
//! submit(doc A) ──┐                       ┌── worker A ──┐
//! submit(doc A) ──┼──► mpsc queue (FIFO) ─┤  Idle ⇄ Processing
//! submit(doc B) ──┘                       └── worker B ──┘
//!                                                │
//!                                 transform against (base, current]
//!                                                │
//!                                   VersionLog::append(op, current)
//!                                                │
//!                                  AcceptListener::on_accepted(entry)
//! ```
//!
//! Each document gets one worker task that owns its queue, so a document
//! is only ever appended to by a single writer. Workers of different
//! documents run in parallel. A queued operation always completes, even if
//! the submitter stops waiting for the reply.
//!
//! Log appends may fsync, so each operation is sequenced on the blocking
//! pool while the worker task waits for it. A worker whose queue stays
//! empty for `worker_idle_ms` removes itself from the worker map and exits;
//! the next submission for that document starts a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quire_ot::Tie;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SequencerConfig;
use crate::error::CollabError;
use crate::model::{Acceptance, DocumentId, Operation, Submission, VersionEntry};
use crate::storage::{LogError, VersionLog};

/// Called by a worker after each append, before the next operation of the
/// same document is processed. Calls for one document arrive in version order.
pub trait AcceptListener: Send + Sync {
    fn on_accepted(&self, entry: &VersionEntry);
}

/// Whether a document's worker is currently sequencing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerState {
    /// Nothing queued; also reported for documents without a worker.
    Idle,
    /// At least one operation is queued or in flight.
    Processing,
}

/// Counters across every document since the sequencer was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencerStats {
    /// Operations appended to the log.
    pub accepted: u64,
    /// Accepted operations that were authored against a stale version.
    pub transformed: u64,
    /// Operations that failed after being queued.
    pub rejected: u64,
    /// Documents with a live worker task.
    pub active_documents: usize,
}

/// Lock-free counters so workers never contend on stats.
#[derive(Default)]
struct AtomicSequencerStats {
    accepted: AtomicU64,
    transformed: AtomicU64,
    rejected: AtomicU64,
}

/// A queued submission and the channel its outcome goes back on.
struct Job {
    submission: Submission,
    reply: oneshot::Sender<Result<Acceptance, CollabError>>,
}

/// Worker state readable without going through the queue.
#[derive(Default)]
struct WorkerShared {
    /// Jobs queued or in flight. Only incremented under the worker map lock.
    depth: AtomicUsize,
    processing: AtomicBool,
}

/// Handle to one document's worker task.
struct Worker {
    queue: mpsc::UnboundedSender<Job>,
    shared: Arc<WorkerShared>,
    task: JoinHandle<()>,
}

type WorkerMap = Mutex<HashMap<DocumentId, Worker>>;

/// State shared by every worker.
struct Core {
    log: Arc<dyn VersionLog>,
    config: SequencerConfig,
    listeners: Vec<Arc<dyn AcceptListener>>,
    stats: AtomicSequencerStats,
}

/// Orders submissions per document and appends them to the version log.
pub struct Sequencer {
    core: Arc<Core>,
    /// Live workers, keyed by document. Shared with the workers so an idle
    /// one can remove itself.
    workers: Arc<WorkerMap>,
    closed: AtomicBool,
}

impl Sequencer {
    /// Create a sequencer over `log`. `listeners` are called, in order,
    /// after every append.
    pub fn new(
        log: Arc<dyn VersionLog>,
        config: SequencerConfig,
        listeners: Vec<Arc<dyn AcceptListener>>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                log,
                config,
                listeners,
                stats: AtomicSequencerStats::default(),
            }),
            workers: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue `submission` behind earlier operations on the same document
    /// and wait for its outcome.
    ///
    /// Dropping the returned future does not withdraw the submission; it is
    /// still sequenced and logged.
    pub async fn submit(&self, submission: Submission) -> Result<Acceptance, CollabError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CollabError::Shutdown);
        }

        let (reply, outcome) = oneshot::channel();
        {
            let mut workers = self.workers.lock();
            let worker = workers
                .entry(submission.document)
                .or_insert_with(|| self.spawn_worker(submission.document));

            let depth = worker.shared.depth.fetch_add(1, Ordering::AcqRel) + 1;
            if depth >= self.core.config.queue_warn_depth {
                log::warn!("Document {} has {depth} queued operations", submission.document);
            }
            if let Err(mpsc::error::SendError(job)) = worker.queue.send(Job { submission, reply }) {
                worker.shared.depth.fetch_sub(1, Ordering::AcqRel);
                workers.remove(&job.submission.document);
                return Err(CollabError::Shutdown);
            }
        }

        outcome.await.map_err(|_| CollabError::Shutdown)?
    }

    fn spawn_worker(&self, document: DocumentId) -> Worker {
        let (queue, jobs) = mpsc::unbounded_channel();
        let shared = Arc::new(WorkerShared::default());
        let task = tokio::spawn(run_worker(
            self.core.clone(),
            self.workers.clone(),
            document,
            jobs,
            shared.clone(),
        ));
        log::debug!("Started sequencer worker for document {document}");
        Worker { queue, shared, task }
    }

    /// `Processing` while any operation of `document` is queued or in
    /// flight, `Idle` otherwise.
    pub fn state(&self, document: DocumentId) -> SequencerState {
        match self.workers.lock().get(&document) {
            Some(worker) if worker.shared.processing.load(Ordering::Acquire) => SequencerState::Processing,
            _ => SequencerState::Idle,
        }
    }

    /// Operations queued or in flight for `document`.
    pub fn queue_depth(&self, document: DocumentId) -> usize {
        self.workers
            .lock()
            .get(&document)
            .map_or(0, |w| w.shared.depth.load(Ordering::Acquire))
    }

    /// Snapshot of the counters and the number of live workers.
    pub fn stats(&self) -> SequencerStats {
        let stats = &self.core.stats;
        SequencerStats {
            accepted: stats.accepted.load(Ordering::Relaxed),
            transformed: stats.transformed.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            active_documents: self.workers.lock().len(),
        }
    }

    /// Refuse new submissions and wait for queued operations to complete.
    ///
    /// Every worker drains its queue before it stops, so all outstanding
    /// submissions receive their outcome.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock());
        log::info!("Sequencer shutting down ({} workers)", workers.len());

        for (document, worker) in workers {
            drop(worker.queue);
            if let Err(e) = worker.task.await {
                log::error!("Sequencer worker for document {document} failed: {e}");
            }
        }
    }
}

async fn run_worker(
    core: Arc<Core>,
    workers: Arc<WorkerMap>,
    document: DocumentId,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    shared: Arc<WorkerShared>,
) {
    let idle_timeout = core.config.worker_idle_timeout();
    loop {
        let received = match idle_timeout {
            Some(idle) => tokio::time::timeout(idle, jobs.recv()).await,
            None => Ok(jobs.recv().await),
        };
        let job = match received {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                // Submitters bump `depth` under this lock before sending,
                // so zero here means the queue is empty and stays empty.
                let mut map = workers.lock();
                if shared.depth.load(Ordering::Acquire) > 0 {
                    continue;
                }
                if map.get(&document).is_some_and(|w| Arc::ptr_eq(&w.shared, &shared)) {
                    map.remove(&document);
                }
                log::debug!("Retired idle sequencer worker for document {document}");
                return;
            }
        };

        shared.processing.store(true, Ordering::Release);

        let Job { submission, reply } = job;
        let sequencing = core.clone();
        let result = tokio::task::spawn_blocking(move || sequencing.sequence(&submission))
            .await
            .unwrap_or_else(|e| Err(CollabError::storage(format!("sequencing task failed: {e}"))));
        if let Err(e) = &result {
            core.stats.rejected.fetch_add(1, Ordering::Relaxed);
            match e {
                CollabError::StorageFailure(_) => log::error!("Document {document}: {e}"),
                _ => log::warn!("Rejected operation on document {document}: {e}"),
            }
        }

        if shared.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            shared.processing.store(false, Ordering::Release);
        }
        // The submitter may have gone away; the outcome stands regardless.
        let _ = reply.send(result);
    }
    log::debug!("Sequencer worker for document {document} stopped");
}

impl Core {
    /// Rebase onto the newest version and append, retrying while another
    /// writer moves the log. Runs on the blocking pool.
    fn sequence(&self, submission: &Submission) -> Result<Acceptance, CollabError> {
        let mut retries = 0;
        loop {
            let current = self.log.current_version(submission.document)?;
            if submission.base_version > current {
                return Err(CollabError::FutureVersion {
                    base: submission.base_version,
                    current,
                });
            }

            let components = self.rebase(submission, current)?;
            let transformed_over = current - submission.base_version;
            let operation = Operation::new(
                submission.document,
                submission.author,
                submission.base_version,
                components,
            );

            match self.log.append(operation, current) {
                Ok(entry) => {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    if transformed_over > 0 {
                        self.stats.transformed.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "Transformed operation on {} over {transformed_over} versions",
                            entry.document
                        );
                    }
                    log::debug!("Accepted version {} of document {}", entry.version, entry.document);

                    for listener in &self.listeners {
                        listener.on_accepted(&entry);
                    }
                    return Ok(Acceptance {
                        version: entry.version,
                        components: entry.operation.components,
                        operation_id: entry.operation.id,
                        transformed_over,
                    });
                }
                Err(LogError::VersionConflict { expected, current }) => {
                    if retries >= self.config.max_transform_retries {
                        return Err(CollabError::storage(format!(
                            "log kept moving after {retries} retries (expected {expected}, found {current})"
                        )));
                    }
                    retries += 1;
                    log::debug!("Version conflict on {}, retry {retries}", submission.document);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Transform the submission over every entry in `(base, current]`.
    fn rebase(&self, submission: &Submission, current: u64) -> Result<quire_ot::TextOperation, CollabError> {
        let mut components = submission.components.clone();
        if submission.base_version == current {
            return Ok(components);
        }

        let entries = self.log.entries_since(submission.document, submission.base_version)?;
        for entry in entries.iter().take_while(|e| e.version <= current) {
            let tie = Tie::between(&submission.author, &entry.operation.author);
            let (rebased, _) = quire_ot::transform(&components, &entry.operation.components, tie)
                .map_err(|e| {
                    CollabError::malformed(format!(
                        "operation does not fit version {}: {e}",
                        entry.version - 1
                    ))
                })?;
            components = rebased;
        }
        Ok(components)
    }
}
