//! Job coordinator: a fixed worker pool with per-key serialization.
//!
//! Every job is submitted under a key. Jobs sharing a key run one at a time
//! in submission order; jobs with different keys run concurrently, bounded
//! by the configured worker count. A job that fails with a retryable
//! [`TaskError`] is re-invoked up to `max_retries` times before the failure
//! is logged as fatal.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::{Notify, Semaphore};

use crate::task::{TaskError, TaskResult, TaskStatus};

/// Future produced by one invocation of a job.
pub type JobFuture = Pin<Box<dyn Future<Output = TaskResult<()>> + Send + 'static>>;

/// A re-invocable unit of work. Each retry calls the closure again.
pub type Job = Box<dyn FnMut() -> JobFuture + Send + 'static>;

/// Worker pool sizing and retry policy.
#[derive(Debug, Clone)]
pub struct JobCoordinatorConfig {
    pub worker_count: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for JobCoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

struct Queued {
    label: String,
    job: Job,
}

struct Inner<K> {
    config: JobCoordinatorConfig,
    queues: Mutex<HashMap<K, VecDeque<Queued>>>,
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    idle: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl<K> Inner<K> {
    fn queues(&self) -> MutexGuard<'_, HashMap<K, VecDeque<Queued>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Serializes jobs per key over a bounded pool of tokio tasks.
///
/// Cloning yields another handle onto the same pool.
pub struct JobCoordinator<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for JobCoordinator<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> JobCoordinator<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(config: JobCoordinatorConfig) -> Self {
        let workers = config.worker_count.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                queues: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(workers)),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &JobCoordinatorConfig {
        &self.inner.config
    }

    /// Enqueues a job under `key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, key: K, label: impl Into<String>, job: F)
    where
        F: FnMut() -> JobFuture + Send + 'static,
    {
        let queued = Queued {
            label: label.into(),
            job: Box::new(job),
        };
        self.inner.pending.fetch_add(1, Ordering::SeqCst);

        let start_runner = {
            let mut queues = self.inner.queues();
            match queues.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().push_back(queued);
                    false
                }
                Entry::Vacant(entry) => {
                    entry.insert(VecDeque::from([queued]));
                    true
                }
            }
        };

        if start_runner {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                run_key(inner, key).await;
            });
        }
    }

    /// Jobs submitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Jobs waiting behind the running one for `key`.
    pub fn queued_for(&self, key: &K) -> usize {
        self.inner.queues().get(key).map_or(0, VecDeque::len)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Resolves once every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_key<K>(inner: Arc<Inner<K>>, key: K)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    loop {
        let next = {
            let mut queues = inner.queues();
            match queues.get_mut(&key).and_then(VecDeque::pop_front) {
                Some(queued) => queued,
                None => {
                    queues.remove(&key);
                    return;
                }
            }
        };

        match Arc::clone(&inner.permits).acquire_owned().await {
            Ok(_permit) => execute(&inner, &key, next).await,
            Err(_) => warn!("JobCoordinator: pool closed, dropping job {}", next.label),
        }
        inner.finish_one();
    }
}

async fn execute<K: Debug>(inner: &Inner<K>, key: &K, mut queued: Queued) {
    let max_retries = inner.config.max_retries;
    let mut attempt: u32 = 0;

    loop {
        // Run on its own task so a panicking job cannot wedge the key.
        let result = match tokio::spawn((queued.job)()).await {
            Ok(result) => result,
            Err(join) => Err(TaskError::internal(format!("job panicked: {join}"))),
        };

        match result {
            Ok(()) => {
                debug!("JobCoordinator: {} for {:?} done", queued.label, key);
                inner.completed.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    "JobCoordinator: {} for {:?} failed ({}), retry {}/{}",
                    queued.label, key, err, attempt, max_retries
                );
                tokio::time::sleep(inner.config.retry_backoff).await;
            }
            Err(err) => {
                inner.failed.fetch_add(1, Ordering::SeqCst);
                match err.to_status() {
                    TaskStatus::Ignore => debug!("JobCoordinator: {} ignored: {}", queued.label, err),
                    TaskStatus::NeedRetry => error!(
                        "JobCoordinator: {} for {:?} gave up after {} retries: {}",
                        queued.label, key, max_retries, err
                    ),
                    _ => error!("JobCoordinator: {} for {:?} failed: {}", queued.label, key, err),
                }
                return;
            }
        }
    }
}
