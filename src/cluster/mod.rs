//! Job queue and scheduler
//!
//! The cluster owns the disk-spillable queue, the pending-dispatch counters,
//! the callback side-table, and the per-job skip-state partitions. Workers
//! pull jobs through [`Cluster::pop`] and report back through
//! [`Cluster::handle_job_result`] and [`Cluster::job_done`].

pub mod stats;
pub mod worker;

pub use stats::ClusterStatistics;
pub use worker::{BrowserRunner, JobRunner};

use crate::browser::Browser;
use crate::config::{BrowserConfig, ClusterConfig};
use crate::job::{Job, JobId, JobKind, JobOptions, JobResult, Resource};
use crate::queue::SpillQueue;
use crate::scope::Scope;
use crate::skipstate::SkipStateSet;
use crate::SpecterError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

/// Callback invoked with each job result; stored out-of-band so jobs stay
/// plain serializable data
pub type JobCallback = Arc<dyn Fn(&JobResult, &Value, &Cluster) + Send + Sync>;

type JobDoneObserver = Box<dyn Fn(&Job) + Send + Sync>;

/// Interval for re-checking wait/pop conditions; guards against a wakeup
/// racing a state change
const WAKEUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ClusterState {
    queue: SpillQueue,
    callbacks: HashMap<JobId, JobCallback>,
    pending: HashMap<JobId, u32>,
    done: HashSet<JobId>,
    skip_states: HashMap<JobId, Arc<Mutex<SkipStateSet>>>,
    global_pending: u64,
    stats: ClusterStatistics,
    shut_down: bool,
}

/// The browser cluster: a pool of workers fed from one shared queue
pub struct Cluster {
    config: ClusterConfig,
    state: Mutex<ClusterState>,
    notify: Notify,
    on_job_done: Mutex<Vec<JobDoneObserver>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Builds a cluster whose queue spills to the configured database path
    pub fn new(config: ClusterConfig) -> Result<Arc<Self>, SpecterError> {
        let queue = SpillQueue::open(
            Path::new(&config.spill_path),
            config.queue_buffer_size as usize,
        )?;
        Ok(Self::with_queue(config, queue))
    }

    /// Cluster with an in-memory spill backend (for testing)
    pub fn new_in_memory(config: ClusterConfig) -> Result<Arc<Self>, SpecterError> {
        let queue = SpillQueue::open_in_memory(config.queue_buffer_size as usize)?;
        Ok(Self::with_queue(config, queue))
    }

    fn with_queue(config: ClusterConfig, queue: SpillQueue) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ClusterState {
                queue,
                callbacks: HashMap::new(),
                pending: HashMap::new(),
                done: HashSet::new(),
                skip_states: HashMap::new(),
                global_pending: 0,
                stats: ClusterStatistics::default(),
                shut_down: false,
            }),
            notify: Notify::new(),
            on_job_done: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Launches up to `pool-size` browsers and spawns a worker for each.
    ///
    /// Spawn failures are logged and degrade capacity; they never abort the
    /// remaining slots. Returns the number of workers actually running.
    pub async fn launch_browser_pool(
        self: &Arc<Self>,
        browser_config: &BrowserConfig,
        scope: Arc<Scope>,
    ) -> usize {
        let mut launched = 0;
        for slot in 0..self.config.pool_size {
            match Browser::launch(
                browser_config.clone(),
                Arc::clone(&scope),
                self.config.job_timeout(),
                self.config.max_events_per_job,
            )
            .await
            {
                Ok(browser) => {
                    let runner: Arc<dyn JobRunner> = Arc::new(BrowserRunner::new(
                        browser,
                        self.config.max_events_per_job,
                    ));
                    self.spawn_workers([runner]);
                    launched += 1;
                }
                Err(error) => {
                    tracing::error!("Worker slot {} failed to launch: {}", slot, error);
                }
            }
        }
        tracing::info!(
            "Browser pool running with {}/{} worker(s)",
            launched,
            self.config.pool_size
        );
        launched
    }

    /// Spawns one worker task per runner
    pub fn spawn_workers(self: &Arc<Self>, runners: impl IntoIterator<Item = Arc<dyn JobRunner>>) {
        let mut workers = self.workers.lock().unwrap();
        for runner in runners {
            let slot = workers.len();
            workers.push(tokio::spawn(worker::worker_loop(
                Arc::clone(self),
                runner,
                slot,
            )));
        }
    }

    /// Submits a job with its callback.
    ///
    /// Fails with `AlreadyShutdown` after shutdown and `AlreadyDone` when the
    /// job id has already completed (never-ending ids are exempt).
    pub fn queue(&self, job: Job, callback: JobCallback) -> Result<(), SpecterError> {
        self.enqueue(job, Some(callback))
    }

    /// Re-dispatches a job id whose callback is already registered; fails
    /// with `CallbackRequired` when no callback is stored for it
    pub fn requeue(&self, job: Job) -> Result<(), SpecterError> {
        self.enqueue(job, None)
    }

    fn enqueue(&self, job: Job, callback: Option<JobCallback>) -> Result<(), SpecterError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.shut_down {
                return Err(SpecterError::AlreadyShutdown);
            }
            if state.done.contains(&job.id) && !job.never_ending {
                return Err(SpecterError::AlreadyDone {
                    id: job.id.clone(),
                });
            }
            match callback {
                Some(callback) => {
                    state.callbacks.insert(job.id.clone(), callback);
                }
                None => {
                    if !state.callbacks.contains_key(&job.id) {
                        return Err(SpecterError::CallbackRequired {
                            id: job.id.clone(),
                        });
                    }
                }
            }

            state.queue.push(&job)?;
            *state.pending.entry(job.id.clone()).or_insert(0) += 1;
            state.global_pending += 1;
            state.stats.queued_jobs += 1;
            tracing::debug!("Queued job {} ({:?})", job.id, job.kind);
        }

        self.notify.notify_waiters();
        Ok(())
    }

    /// Convenience: queue an explore job, returning its id
    pub fn explore(
        &self,
        resource: Resource,
        options: JobOptions,
        callback: JobCallback,
    ) -> Result<JobId, SpecterError> {
        let job = Job::new(JobKind::Explore, resource).with_options(options);
        let id = job.id.clone();
        self.queue(job, callback)?;
        Ok(id)
    }

    /// Convenience: queue a taint-trace job, returning its id
    pub fn trace_taint(
        &self,
        resource: Resource,
        options: JobOptions,
        callback: JobCallback,
    ) -> Result<JobId, SpecterError> {
        let job = Job::new(JobKind::TraceTaint, resource).with_options(options);
        let id = job.id.clone();
        self.queue(job, callback)?;
        Ok(id)
    }

    /// Convenience: hand a callback a browser slot with no page work
    pub fn with_browser(&self, args: Value, callback: JobCallback) -> Result<JobId, SpecterError> {
        let blank = Url::parse("about:blank")?;
        let job = Job::new(JobKind::RunCallback, Resource::Url(blank)).with_args(args);
        let id = job.id.clone();
        self.queue(job, callback)?;
        Ok(id)
    }

    /// Blocking dequeue; returns None once the cluster shuts down.
    ///
    /// Jobs whose id completed between enqueue and dequeue are discarded
    /// here rather than dispatched.
    pub async fn pop(&self) -> Option<Job> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.shut_down {
                    return None;
                }
                loop {
                    match state.queue.pop() {
                        Ok(Some(job)) => {
                            if state.done.contains(&job.id) && !job.never_ending {
                                tracing::debug!("Discarding obsolete job {}", job.id);
                                state.global_pending = state.global_pending.saturating_sub(1);
                                continue;
                            }
                            return Some(job);
                        }
                        Ok(None) => break,
                        Err(error) => {
                            tracing::error!("Queue pop failed: {}", error);
                            break;
                        }
                    }
                }
            }

            let _ = tokio::time::timeout(WAKEUP_POLL_INTERVAL, self.notify.notified()).await;
        }
    }

    /// Reports one dispatch of a job as finished.
    ///
    /// Runs during shutdown too: teardown clears bookkeeping last precisely
    /// so in-flight completions still find it. Completing an id that was
    /// never queued, or one already done, is API misuse.
    pub fn job_done(&self, job: &Job, elapsed: Duration) -> Result<(), SpecterError> {
        let became_idle = {
            let mut state = self.state.lock().unwrap();

            if !state.pending.contains_key(&job.id) {
                if state.shut_down {
                    return Ok(());
                }
                if state.done.contains(&job.id) {
                    return Err(SpecterError::AlreadyDone {
                        id: job.id.clone(),
                    });
                }
                return Err(SpecterError::JobNotFound {
                    id: job.id.clone(),
                });
            }

            if let Some(count) = state.pending.get_mut(&job.id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.pending.remove(&job.id);
                    if !job.never_ending {
                        state.done.insert(job.id.clone());
                        state.callbacks.remove(&job.id);
                        state.skip_states.remove(&job.id);
                    }
                }
            }

            state.global_pending = state.global_pending.saturating_sub(1);
            state.stats.completed_jobs += 1;
            state.stats.total_job_time += elapsed;
            state.global_pending == 0
        };

        tracing::debug!("Job {} dispatch done in {:?}", job.id, elapsed);
        for observer in self.on_job_done.lock().unwrap().iter() {
            observer(job);
        }

        if became_idle {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Invokes the stored callback for a result, isolating callback panics
    /// so one failing callback cannot break the dispatch loop
    pub fn handle_job_result(&self, result: JobResult) {
        let callback = {
            let state = self.state.lock().unwrap();
            if state.shut_down || state.done.contains(&result.job.id) {
                return;
            }
            state.callbacks.get(&result.job.id).cloned()
        };

        let callback = match callback {
            Some(callback) => callback,
            None => {
                tracing::warn!("No callback registered for job {}", result.job.id);
                return;
            }
        };

        let args = result.job.args.clone();
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| callback(&result, &args, self)));
        if let Err(panic) = outcome {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!("Callback for job {} panicked: {}", result.job.id, message);
        }
    }

    /// Blocks until no dispatches are pending
    pub async fn wait(&self) -> Result<(), SpecterError> {
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.shut_down {
                    return Err(SpecterError::AlreadyShutdown);
                }
                if state.global_pending == 0 {
                    return Ok(());
                }
            }
            let _ = tokio::time::timeout(WAKEUP_POLL_INTERVAL, self.notify.notified()).await;
        }
    }

    /// Shuts the cluster down: discard queued work, stop workers, then clear
    /// the bookkeeping tables. Idempotent.
    ///
    /// With `wait` set, running workers finish their current job first;
    /// otherwise their tasks are aborted outright.
    pub async fn shutdown(&self, wait: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            if let Err(error) = state.queue.clear() {
                tracing::error!("Failed clearing spill queue: {}", error);
            }
        }
        self.notify.notify_waiters();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if wait {
                if let Err(error) = handle.await {
                    tracing::debug!("Worker task ended abnormally: {}", error);
                }
            } else {
                handle.abort();
            }
        }

        // Bookkeeping goes last: completions racing the teardown above may
        // still need it.
        let mut state = self.state.lock().unwrap();
        state.callbacks.clear();
        state.pending.clear();
        state.skip_states.clear();
        state.global_pending = 0;
        tracing::info!("Cluster shut down");
    }

    /// The lazily created skip-state partition for a job id
    pub fn skip_states_for(&self, id: &JobId) -> Arc<Mutex<SkipStateSet>> {
        let mut state = self.state.lock().unwrap();
        Arc::clone(
            state
                .skip_states
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SkipStateSet::new()))),
        )
    }

    /// Whether a job id has completed
    pub fn is_done(&self, id: &JobId) -> bool {
        self.state.lock().unwrap().done.contains(id)
    }

    /// Dispatches currently pending for a job id
    pub fn pending_for(&self, id: &JobId) -> u32 {
        self.state
            .lock()
            .unwrap()
            .pending
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Registers an observer invoked after every completed dispatch
    pub fn on_job_done(&self, observer: impl Fn(&Job) + Send + Sync + 'static) {
        self.on_job_done.lock().unwrap().push(Box::new(observer));
    }

    /// Snapshot of the aggregate statistics
    pub fn statistics(&self) -> ClusterStatistics {
        self.state.lock().unwrap().stats.clone()
    }

    pub(crate) fn note_timeout(&self) {
        self.state.lock().unwrap().stats.timed_out_jobs += 1;
    }

    pub(crate) fn job_timeout(&self) -> Duration {
        self.config.job_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig {
            pool_size: 2,
            job_timeout_ms: 5_000,
            queue_buffer_size: 16,
            max_events_per_job: 100,
            spill_path: String::new(),
        }
    }

    fn noop_callback() -> JobCallback {
        Arc::new(|_, _, _| {})
    }

    fn explore_job(id: &str) -> Job {
        let url = Url::parse(&format!("https://example.com/{}", id)).unwrap();
        Job::new(JobKind::Explore, Resource::Url(url)).with_id(id)
    }

    #[tokio::test]
    async fn test_queue_after_shutdown_fails() {
        let cluster = Cluster::new_in_memory(config()).unwrap();
        cluster.shutdown(true).await;

        assert!(matches!(
            cluster.queue(explore_job("a"), noop_callback()),
            Err(SpecterError::AlreadyShutdown)
        ));
        assert!(matches!(cluster.wait().await, Err(SpecterError::AlreadyShutdown)));
    }

    #[tokio::test]
    async fn test_requeue_without_callback_fails() {
        let cluster = Cluster::new_in_memory(config()).unwrap();
        assert!(matches!(
            cluster.requeue(explore_job("a")),
            Err(SpecterError::CallbackRequired { .. })
        ));
    }

    #[tokio::test]
    async fn test_done_job_cannot_be_requeued() {
        let cluster = Cluster::new_in_memory(config()).unwrap();
        let job = explore_job("a");
        cluster.queue(job.clone(), noop_callback()).unwrap();

        let popped = cluster.pop().await.unwrap();
        cluster.job_done(&popped, Duration::from_millis(10)).unwrap();
        assert!(cluster.is_done(&job.id));

        assert!(matches!(
            cluster.queue(job, noop_callback()),
            Err(SpecterError::AlreadyDone { .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_counter_lifecycle() {
        let cluster = Cluster::new_in_memory(config()).unwrap();
        let job = explore_job("a");

        cluster.queue(job.clone(), noop_callback()).unwrap();
        cluster.requeue(job.clone()).unwrap();
        assert_eq!(cluster.pending_for(&job.id), 2);

        cluster.job_done(&job, Duration::ZERO).unwrap();
        assert_eq!(cluster.pending_for(&job.id), 1);
        assert!(!cluster.is_done(&job.id));

        cluster.job_done(&job, Duration::ZERO).unwrap();
        assert_eq!(cluster.pending_for(&job.id), 0);
        assert!(cluster.is_done(&job.id));

        // wait must now return immediately
        cluster.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_job_done_misuse_is_reported() {
        let cluster = Cluster::new_in_memory(config()).unwrap();
        let job = explore_job("ghost");

        assert!(matches!(
            cluster.job_done(&job, Duration::ZERO),
            Err(SpecterError::JobNotFound { .. })
        ));

        cluster.queue(job.clone(), noop_callback()).unwrap();
        cluster.job_done(&job, Duration::ZERO).unwrap();
        assert!(matches!(
            cluster.job_done(&job, Duration::ZERO),
            Err(SpecterError::AlreadyDone { .. })
        ));
    }

    #[tokio::test]
    async fn test_skip_state_partition_is_shared_and_released() {
        let cluster = Cluster::new_in_memory(config()).unwrap();
        let job = explore_job("a");
        cluster.queue(job.clone(), noop_callback()).unwrap();

        let partition = cluster.skip_states_for(&job.id);
        partition.lock().unwrap().insert("seen");
        assert!(cluster
            .skip_states_for(&job.id)
            .lock()
            .unwrap()
            .contains("seen"));

        cluster.job_done(&job, Duration::ZERO).unwrap();
        // Completed non-never-ending jobs start over with a fresh partition
        assert!(!cluster
            .skip_states_for(&job.id)
            .lock()
            .unwrap()
            .contains("seen"));
    }

    #[tokio::test]
    async fn test_callback_panic_is_isolated() {
        let cluster = Cluster::new_in_memory(config()).unwrap();
        let job = explore_job("a");
        cluster
            .queue(job.clone(), Arc::new(|_, _, _| panic!("callback bug")))
            .unwrap();

        // Must not propagate the panic
        cluster.handle_job_result(JobResult::new(job.clone()));
        cluster.job_done(&job, Duration::ZERO).unwrap();
        assert!(cluster.is_done(&job.id));
    }

    #[tokio::test]
    async fn test_statistics_track_queue_and_completion() {
        let cluster = Cluster::new_in_memory(config()).unwrap();
        let job = explore_job("a");
        cluster.queue(job.clone(), noop_callback()).unwrap();
        cluster.job_done(&job, Duration::from_secs(2)).unwrap();

        let stats = cluster.statistics();
        assert_eq!(stats.queued_jobs, 1);
        assert_eq!(stats.completed_jobs, 1);
        assert_eq!(stats.seconds_per_job(), 2.0);
    }
}
