use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use core_affinity::CoreId;

use crate::core::constants;
use crate::core::sync::{Locker, Sem};
use crate::db::{ConnectionSource, PooledConn};
use crate::error::{Result, ServerError};

use super::task::{Pending, Task};

/// Who performs socket I/O.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum ActorModel {
    /// The event loop reads and writes; workers only process.
    #[default]
    Proactor,
    /// Workers perform the pending read or write themselves, then process.
    Reactor,
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads, fixed for the pool's lifetime
    pub thread_number: usize,
    /// Maximum number of queued tasks before `append` refuses more
    pub max_requests: usize,
    pub actor_model: ActorModel,
    /// Pin worker `i` to core `i % cores`
    pub pin_workers: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_number: constants::DEFAULT_THREAD_NUMBER,
            max_requests: constants::DEFAULT_MAX_REQUESTS,
            actor_model: ActorModel::default(),
            pin_workers: false,
        }
    }
}

struct Shared<T, S> {
    queue: Locker<VecDeque<Arc<T>>>,
    // count equals queue length
    queue_stat: Sem,
    max_requests: usize,
    actor_model: ActorModel,
    conn_pool: Arc<S>,
}

/// Bounded task queue drained by detached worker threads.
///
/// Workers are never joined; they block on the queue semaphore for the
/// life of the process.
pub struct ThreadPool<T, S> {
    shared: Arc<Shared<T, S>>,
    thread_number: usize,
}

impl<T: Task, S: ConnectionSource> ThreadPool<T, S> {
    /// Validate the sizing, then spawn every worker.
    pub fn new(config: PoolConfig, conn_pool: Arc<S>) -> Result<Self> {
        if config.thread_number == 0 {
            return Err(ServerError::Config(
                "thread pool needs at least one worker".to_string(),
            ));
        }
        if config.max_requests == 0 {
            return Err(ServerError::Config(
                "request queue length must be positive".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            queue: Locker::new(VecDeque::new())?,
            queue_stat: Sem::new()?,
            max_requests: config.max_requests,
            actor_model: config.actor_model,
            conn_pool,
        });

        let cores: Vec<CoreId> = if config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        for index in 0..config.thread_number {
            let worker_shared = Arc::clone(&shared);
            let core = (!cores.is_empty()).then(|| cores[index % cores.len()]);
            thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                        tracing::debug!(worker = index, core = core.id, "pinned to core");
                    }
                    worker_shared.run(index);
                })
                .map_err(|source| ServerError::Spawn { index, source })?;
            // JoinHandle dropped: the worker is detached
        }

        tracing::info!(
            workers = config.thread_number,
            max_requests = config.max_requests,
            actor = ?config.actor_model,
            "thread pool started"
        );

        Ok(Self {
            shared,
            thread_number: config.thread_number,
        })
    }

    /// Reactor entry point: stamp the pending operation and enqueue.
    ///
    /// Returns false without touching the task when the queue is full.
    pub fn append(&self, task: &Arc<T>, op: Pending) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.max_requests {
            return false;
        }
        task.set_pending(op);
        queue.push_back(Arc::clone(task));
        drop(queue);
        self.notify();
        true
    }

    /// Proactor entry point: I/O already happened, enqueue for processing.
    pub fn append_p(&self, task: &Arc<T>) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.max_requests {
            return false;
        }
        queue.push_back(Arc::clone(task));
        drop(queue);
        self.notify();
        true
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn thread_number(&self) -> usize {
        self.thread_number
    }

    pub fn actor_model(&self) -> ActorModel {
        self.shared.actor_model
    }

    fn notify(&self) {
        if let Err(e) = self.shared.queue_stat.post() {
            tracing::error!(error = %e, "sem_post on task queue failed");
        }
    }
}

impl<T: Task, S: ConnectionSource> Shared<T, S> {
    fn run(&self, worker: usize) {
        loop {
            if let Err(e) = self.queue_stat.wait() {
                tracing::error!(worker, error = %e, "sem_wait on task queue failed");
                continue;
            }

            let task = {
                let mut queue = self.queue.lock();
                match queue.pop_front() {
                    Some(task) => task,
                    None => continue,
                }
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&task)));
            if outcome.is_err() {
                tracing::error!(worker, "task panicked; evicting its connection");
                task.mark_failed();
                task.mark_finished();
            }
        }
    }

    fn execute(&self, task: &T) {
        match self.actor_model {
            ActorModel::Reactor => match task.pending() {
                Pending::Read => {
                    if task.read_once() {
                        let mut db = PooledConn::acquire(&*self.conn_pool);
                        task.process(db.store());
                    } else {
                        task.mark_failed();
                    }
                }
                Pending::Write => {
                    if !task.write() {
                        task.mark_failed();
                    }
                }
            },
            ActorModel::Proactor => {
                let mut db = PooledConn::acquire(&*self.conn_pool);
                task.process(db.store());
            }
        }
        task.mark_finished();
    }
}
