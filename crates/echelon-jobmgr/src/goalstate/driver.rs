//! The reconciliation driver: queue, worker pool, and action execution.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use echelon_core::JobId;

use super::actions::{
    select_job_action, select_task_action, ActionOutcome, JobAction, TaskAction,
};
use super::queue::DeadlineQueue;
use crate::cached::{CachedJob, CachedTask, JobFactory};
use crate::config::GoalStateConfig;
use crate::job::{JobRuntime, JobState};
use crate::metrics::JobmgrMetrics;
use crate::store::Store;
use crate::task::{
    regenerate_run, RuntimeDiff, TaskRuntime, TaskState, TerminationReason, TerminationStatus,
};

/// Delay before re-evaluating an entity after a stale read or an
/// intermediate transition.
const REEVALUATE_DELAY: Duration = Duration::from_millis(100);

/// Delay granted to an in-flight kill before the next evaluation.
const KILL_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// One reconcilable entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    /// A job.
    Job(JobId),
    /// A task, addressed by job and slot.
    Task(JobId, u32),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job(job_id) => write!(f, "job {job_id}"),
            Self::Task(job_id, instance_id) => {
                write!(f, "task {}", job_id.instance_name(*instance_id))
            }
        }
    }
}

/// Per-entity reconciliation driver.
///
/// Cheap to clone; all clones share the queue and worker pool.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<Inner>,
}

struct Inner {
    queue: StdMutex<DeadlineQueue<EntityKey>>,
    wakeup: Notify,
    shutdown: watch::Sender<bool>,
    entity_locks: StdMutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>,
    /// Consecutive failure count per entity, for backoff.
    failures: StdMutex<HashMap<EntityKey, u32>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    factory: Arc<JobFactory>,
    store: Arc<dyn Store>,
    config: GoalStateConfig,
    metrics: JobmgrMetrics,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Creates a driver over the given cache and store.
    ///
    /// Workers do not run until [`Driver::start`] is called.
    #[must_use]
    pub fn new(factory: Arc<JobFactory>, store: Arc<dyn Store>, config: GoalStateConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queue: StdMutex::new(DeadlineQueue::new()),
                wakeup: Notify::new(),
                shutdown,
                entity_locks: StdMutex::new(HashMap::new()),
                failures: StdMutex::new(HashMap::new()),
                workers: StdMutex::new(Vec::new()),
                factory,
                store,
                config,
                metrics: JobmgrMetrics::new(),
            }),
        }
    }

    /// Spawns the reconciler worker pool. Idempotent.
    pub fn start(&self) {
        let mut workers = match self.inner.workers.lock() {
            Ok(workers) => workers,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !workers.is_empty() {
            return;
        }
        for _ in 0..self.inner.config.num_workers.max(1) {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.inner.shutdown.subscribe();
            workers.push(tokio::spawn(worker_loop(inner, shutdown_rx)));
        }
        tracing::info!(
            workers = self.inner.config.num_workers.max(1),
            "goal-state driver started"
        );
    }

    /// Drains the queue and stops dispatching.
    ///
    /// Outstanding actions observe the shutdown at their next suspension
    /// point; this call waits for the workers to exit.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.clear();
        }
        self.inner.wakeup.notify_waiters();

        let handles: Vec<JoinHandle<()>> = match self.inner.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("goal-state driver stopped");
    }

    /// Enqueues a job for evaluation no earlier than `not_before`.
    ///
    /// Deduplicated by job id; the earliest deadline wins.
    pub fn enqueue_job(&self, job_id: &JobId, not_before: Instant) {
        self.enqueue(EntityKey::Job(job_id.clone()), not_before);
    }

    /// Enqueues a job after the configured coalescing delay.
    ///
    /// Task mutations funnel through here so a burst against one job folds
    /// into a single evaluation.
    pub fn enqueue_job_with_default_delay(&self, job_id: &JobId) {
        self.enqueue_job(job_id, Instant::now() + self.inner.config.job_enqueue_delay());
    }

    /// Enqueues a task for evaluation no earlier than `not_before`.
    ///
    /// Deduplicated by `(job, instance)`; the earliest deadline wins.
    pub fn enqueue_task(&self, job_id: &JobId, instance_id: u32, not_before: Instant) {
        self.enqueue(EntityKey::Task(job_id.clone(), instance_id), not_before);
    }

    /// Number of entities currently queued.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn enqueue(&self, key: EntityKey, not_before: Instant) {
        if *self.inner.shutdown.borrow() {
            return;
        }
        let depth = {
            let Ok(mut queue) = self.inner.queue.lock() else {
                return;
            };
            queue.enqueue(key, not_before);
            queue.len()
        };
        self.inner.metrics.set_goalstate_queue_depth(depth);
        self.inner.wakeup.notify_one();
    }
}

async fn worker_loop(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let due = inner
            .queue
            .lock()
            .map(|mut queue| queue.pop_due(Instant::now()))
            .unwrap_or(None);

        if let Some(key) = due {
            inner.metrics.set_goalstate_queue_depth(
                inner.queue.lock().map(|q| q.len()).unwrap_or(0),
            );
            inner.process(&key).await;
            continue;
        }

        let next = inner
            .queue
            .lock()
            .map(|mut queue| queue.next_deadline())
            .unwrap_or(None);

        match next {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    () = inner.wakeup.notified() => {}
                    _ = shutdown_rx.changed() => {}
                    () = tokio::time::sleep(wait) => {}
                }
            }
            None => {
                tokio::select! {
                    () = inner.wakeup.notified() => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
}

impl Inner {
    /// Runs one action for `key`, serialized per entity, and handles the
    /// outcome (backoff bookkeeping and re-enqueue).
    async fn process(self: &Arc<Self>, key: &EntityKey) {
        let entity_lock = self.entity_lock(key);
        let _guard = entity_lock.lock().await;

        let (entity, action_label, outcome) = match key {
            EntityKey::Job(job_id) => {
                let (label, outcome) = self.run_job_action(job_id).await;
                ("job", label, outcome)
            }
            EntityKey::Task(job_id, instance_id) => {
                let (label, outcome) = self.run_task_action(job_id, *instance_id).await;
                ("task", label, outcome)
            }
        };

        self.metrics
            .record_goalstate_action(entity, action_label, outcome.label());

        match outcome {
            ActionOutcome::Done => {
                if let Ok(mut failures) = self.failures.lock() {
                    failures.remove(key);
                }
            }
            ActionOutcome::Retry(delay) => self.requeue(key.clone(), delay),
            ActionOutcome::Failed(err) => {
                let attempt = match self.failures.lock() {
                    Ok(mut failures) => {
                        let count = failures.entry(key.clone()).or_insert(0);
                        *count += 1;
                        *count
                    }
                    Err(_) => 1,
                };
                let delay = failure_backoff(&self.config, attempt);
                tracing::error!(
                    entity = %key,
                    error = %err,
                    attempt,
                    backoff_secs = delay.as_secs(),
                    "goal-state action failed"
                );
                self.requeue(key.clone(), delay);
            }
        }
    }

    fn requeue(self: &Arc<Self>, key: EntityKey, delay: Duration) {
        if *self.shutdown.borrow() {
            return;
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.enqueue(key, Instant::now() + delay);
        }
        self.wakeup.notify_one();
    }

    fn entity_lock(&self, key: &EntityKey) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.entity_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn driver_handle(self: &Arc<Self>) -> Driver {
        Driver {
            inner: Arc::clone(self),
        }
    }

    // --- Task actions ---

    async fn run_task_action(
        self: &Arc<Self>,
        job_id: &JobId,
        instance_id: u32,
    ) -> (&'static str, ActionOutcome) {
        let cached_job = self.factory.add_job(job_id);
        let cached_task = match cached_job.add_task(instance_id).await {
            Ok(task) => task,
            Err(err) => return (TaskAction::NoAction.label(), ActionOutcome::Failed(err)),
        };
        let runtime = match cached_task.get_runtime().await {
            Ok(runtime) => runtime,
            // Nothing in the store to reconcile against.
            Err(err) if err.is_not_found() => {
                return (TaskAction::NoAction.label(), ActionOutcome::Done)
            }
            Err(err) => return (TaskAction::NoAction.label(), ActionOutcome::Failed(err)),
        };

        let action = select_task_action(&runtime);
        let outcome = match action {
            TaskAction::NoAction => ActionOutcome::Done,
            TaskAction::Start => self.start_task(&cached_job, &cached_task, runtime).await,
            TaskAction::Stop => self.stop_task(&cached_job, &cached_task, runtime).await,
            TaskAction::Initialize => {
                self.initialize_task(&cached_job, &cached_task, runtime).await
            }
        };
        (action.label(), outcome)
    }

    /// Hands an initialized run to the delegated placement pipeline.
    async fn start_task(
        self: &Arc<Self>,
        cached_job: &Arc<CachedJob>,
        cached_task: &Arc<CachedTask>,
        mut runtime: TaskRuntime,
    ) -> ActionOutcome {
        let config = match cached_job.get_config().await {
            Ok(config) => config,
            Err(err) => return ActionOutcome::Failed(err),
        };

        runtime.state = TaskState::Pending;
        runtime.message = "Task sent for placement".to_string();

        match cached_task
            .compare_and_set_runtime(runtime, config.job_type)
            .await
        {
            Ok(_) => {
                self.driver_handle()
                    .enqueue_job_with_default_delay(cached_job.id());
                ActionOutcome::Done
            }
            Err(err) if err.is_unexpected_version() => {
                self.metrics.record_cas_conflict("task");
                ActionOutcome::Retry(REEVALUATE_DELAY)
            }
            Err(err) => ActionOutcome::Failed(err),
        }
    }

    /// Drives an active run down: active -> Killing -> Killed.
    async fn stop_task(
        self: &Arc<Self>,
        cached_job: &Arc<CachedJob>,
        cached_task: &Arc<CachedTask>,
        mut runtime: TaskRuntime,
    ) -> ActionOutcome {
        let config = match cached_job.get_config().await {
            Ok(config) => config,
            Err(err) => return ActionOutcome::Failed(err),
        };

        let outcome_delay = if runtime.state == TaskState::Killing {
            runtime.state = TaskState::Killed;
            runtime.message = "Task killed".to_string();
            if runtime.termination_status.is_none() {
                runtime.termination_status = Some(TerminationStatus {
                    reason: TerminationReason::KilledOnRequest,
                });
            }
            REEVALUATE_DELAY
        } else {
            runtime.state = TaskState::Killing;
            runtime.message = "Stopping the task".to_string();
            KILL_SETTLE_DELAY
        };

        match cached_task
            .compare_and_set_runtime(runtime, config.job_type)
            .await
        {
            Ok(_) => {
                self.driver_handle()
                    .enqueue_job_with_default_delay(cached_job.id());
                ActionOutcome::Retry(outcome_delay)
            }
            Err(err) if err.is_unexpected_version() => {
                self.metrics.record_cas_conflict("task");
                ActionOutcome::Retry(REEVALUATE_DELAY)
            }
            Err(err) => ActionOutcome::Failed(err),
        }
    }

    /// Regenerates a fresh run for a terminal task that must run again.
    async fn initialize_task(
        self: &Arc<Self>,
        cached_job: &Arc<CachedJob>,
        cached_task: &Arc<CachedTask>,
        mut runtime: TaskRuntime,
    ) -> ActionOutcome {
        let config = match cached_job.get_config().await {
            Ok(config) => config,
            Err(err) => return ActionOutcome::Failed(err),
        };

        let instance_id = cached_task.instance_id();
        regenerate_run(cached_job.id(), instance_id, &mut runtime, config.health_check);
        runtime.message = "Initialized for a new run".to_string();

        match cached_task
            .compare_and_set_runtime(runtime, config.job_type)
            .await
        {
            Ok(_) => {
                self.driver_handle()
                    .enqueue_job_with_default_delay(cached_job.id());
                // The fresh run starts on the next evaluation.
                ActionOutcome::Retry(REEVALUATE_DELAY)
            }
            Err(err) if err.is_unexpected_version() => {
                self.metrics.record_cas_conflict("task");
                ActionOutcome::Retry(REEVALUATE_DELAY)
            }
            Err(err) => ActionOutcome::Failed(err),
        }
    }

    // --- Job actions ---

    async fn run_job_action(self: &Arc<Self>, job_id: &JobId) -> (&'static str, ActionOutcome) {
        let cached_job = self.factory.add_job(job_id);
        let runtime = match cached_job.get_runtime().await {
            Ok(runtime) => runtime,
            Err(err) if err.is_not_found() => {
                return (JobAction::NoAction.label(), ActionOutcome::Done)
            }
            Err(err) => return (JobAction::NoAction.label(), ActionOutcome::Failed(err)),
        };

        let action = select_job_action(&runtime);
        let outcome = match action {
            JobAction::NoAction => ActionOutcome::Done,
            JobAction::Kill => self.kill_job(&cached_job).await,
            JobAction::UpdateRuntime => self.update_job_runtime(&cached_job, runtime).await,
        };
        (action.label(), outcome)
    }

    /// Fans a job kill out to every task whose goal is not yet Killed.
    async fn kill_job(self: &Arc<Self>, cached_job: &Arc<CachedJob>) -> ActionOutcome {
        let job_id = cached_job.id().clone();
        let config = match cached_job.get_config().await {
            Ok(config) => config,
            Err(err) => return ActionOutcome::Failed(err),
        };

        let runtimes = match self
            .store
            .get_task_runtimes_for_job_by_range(
                &job_id,
                crate::task::InstanceRange::new(0, config.instance_count),
            )
            .await
        {
            Ok(runtimes) => runtimes,
            Err(err) => return ActionOutcome::Failed(err),
        };

        let mut diffs: BTreeMap<u32, RuntimeDiff> = BTreeMap::new();
        for (&instance_id, runtime) in &runtimes {
            if runtime.goal_state == TaskState::Killed {
                continue;
            }
            diffs.insert(
                instance_id,
                RuntimeDiff {
                    goal_state: Some(TaskState::Killed),
                    message: Some("Task killed because its job is killed".to_string()),
                    termination_status: Some(Some(TerminationStatus {
                        reason: TerminationReason::KilledOnRequest,
                    })),
                    ..RuntimeDiff::default()
                },
            );
        }

        let affected: Vec<u32> = diffs.keys().copied().collect();
        if !diffs.is_empty() {
            match cached_job.patch_tasks(diffs).await {
                Ok(()) => {}
                Err(err) if err.is_unexpected_version() => {
                    self.metrics.record_cas_conflict("task");
                    return ActionOutcome::Retry(REEVALUATE_DELAY);
                }
                Err(err) => return ActionOutcome::Failed(err),
            }
        }
        let driver = self.driver_handle();
        for instance_id in affected {
            driver.enqueue_task(&job_id, instance_id, Instant::now());
        }

        let mut runtime = match cached_job.get_runtime().await {
            Ok(runtime) => runtime,
            Err(err) => return ActionOutcome::Failed(err),
        };
        if runtime.state != JobState::Killing && !runtime.state.is_terminal() {
            runtime.state = JobState::Killing;
            match cached_job.compare_and_set_runtime(runtime).await {
                Ok(_) => {}
                Err(err) if err.is_unexpected_version() => {
                    self.metrics.record_cas_conflict("job");
                    return ActionOutcome::Retry(REEVALUATE_DELAY);
                }
                Err(err) => return ActionOutcome::Failed(err),
            }
        }

        ActionOutcome::Retry(self.config.job_enqueue_delay())
    }

    /// Recomputes the job state from its task states.
    async fn update_job_runtime(
        self: &Arc<Self>,
        cached_job: &Arc<CachedJob>,
        mut runtime: JobRuntime,
    ) -> ActionOutcome {
        let job_id = cached_job.id().clone();
        let config = match cached_job.get_config().await {
            Ok(config) => config,
            Err(err) => return ActionOutcome::Failed(err),
        };

        let tasks = match self
            .store
            .get_task_runtimes_for_job_by_range(
                &job_id,
                crate::task::InstanceRange::new(0, config.instance_count),
            )
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => return ActionOutcome::Failed(err),
        };

        if tasks.is_empty() {
            return ActionOutcome::Done;
        }

        let new_state = derive_job_state(&runtime, tasks.values());
        if new_state == runtime.state {
            return ActionOutcome::Done;
        }

        runtime.state = new_state;
        match cached_job.compare_and_set_runtime(runtime).await {
            Ok(_) => ActionOutcome::Done,
            Err(err) if err.is_unexpected_version() => {
                self.metrics.record_cas_conflict("job");
                ActionOutcome::Retry(REEVALUATE_DELAY)
            }
            Err(err) => ActionOutcome::Failed(err),
        }
    }
}

/// Derives a job state from its tasks' states.
fn derive_job_state<'a>(
    runtime: &JobRuntime,
    tasks: impl Iterator<Item = &'a TaskRuntime>,
) -> JobState {
    let mut total = 0usize;
    let mut terminal = 0usize;
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut running = 0usize;
    for task in tasks {
        total += 1;
        if task.state.is_terminal() {
            terminal += 1;
        }
        match task.state {
            TaskState::Succeeded => succeeded += 1,
            TaskState::Failed | TaskState::Lost => failed += 1,
            TaskState::Starting | TaskState::Running => running += 1,
            _ => {}
        }
    }

    if terminal == total {
        if runtime.goal_state == JobState::Killed {
            JobState::Killed
        } else if failed > 0 {
            JobState::Failed
        } else if succeeded == total {
            JobState::Succeeded
        } else {
            JobState::Killed
        }
    } else if runtime.goal_state == JobState::Killed {
        // A kill in flight stays Killing until every task lands.
        JobState::Killing
    } else if running > 0 {
        JobState::Running
    } else {
        JobState::Pending
    }
}

/// Exponential backoff for consecutive action failures, capped.
fn failure_backoff(config: &GoalStateConfig, attempt: u32) -> Duration {
    let base = config.failure_backoff();
    let max = config.max_backoff();
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cached::NoopListener;
    use crate::job::{JobConfig, JobType};
    use crate::store::memory::InMemoryStore;

    fn job_id() -> JobId {
        JobId::new("j1")
    }

    fn harness(num_workers: usize) -> (Arc<InMemoryStore>, Arc<JobFactory>, Driver) {
        let store = Arc::new(InMemoryStore::new());
        let factory = Arc::new(JobFactory::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(NoopListener),
        ));
        let config = GoalStateConfig {
            num_workers,
            ..GoalStateConfig::default()
        };
        let driver = Driver::new(
            Arc::clone(&factory),
            Arc::clone(&store) as Arc<dyn Store>,
            config,
        );
        (store, factory, driver)
    }

    fn seed_job(store: &InMemoryStore, instance_count: u32) {
        store
            .create_job(
                &job_id(),
                JobConfig {
                    instance_count,
                    job_type: JobType::Service,
                    config_version: 1,
                    health_check: false,
                },
                JobRuntime::initialized(JobState::Running),
            )
            .unwrap();
    }

    async fn wait_for_task_state(store: &InMemoryStore, instance_id: u32, state: TaskState) {
        for _ in 0..500 {
            let observed = store
                .get_task_for_job(&job_id(), instance_id)
                .await
                .ok()
                .and_then(|mut tasks| tasks.remove(&instance_id))
                .map(|info| info.runtime.state);
            if observed == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {instance_id} did not reach {state} within deadline");
    }

    async fn wait_for_job_state(store: &InMemoryStore, state: JobState) {
        for _ in 0..500 {
            if store
                .get_job_runtime(&job_id())
                .await
                .is_ok_and(|runtime| runtime.state == state)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job did not reach {state} within deadline");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = GoalStateConfig::default();
        assert_eq!(failure_backoff(&config, 1), Duration::from_secs(10));
        assert_eq!(failure_backoff(&config, 2), Duration::from_secs(20));
        assert_eq!(failure_backoff(&config, 3), Duration::from_secs(40));
        assert_eq!(failure_backoff(&config, 10), Duration::from_secs(300));
        assert_eq!(failure_backoff(&config, 60), Duration::from_secs(300));
    }

    #[test]
    fn enqueue_deduplicates_entities() {
        let (_store, _factory, driver) = harness(1);
        let later = Instant::now() + Duration::from_secs(60);
        driver.enqueue_task(&job_id(), 0, later);
        driver.enqueue_task(&job_id(), 0, later);
        driver.enqueue_job(&job_id(), later);
        assert_eq!(driver.queue_depth(), 2);
    }

    #[tokio::test]
    async fn stop_drains_queue_and_refuses_enqueues() {
        let (_store, _factory, driver) = harness(1);
        driver.start();
        driver.enqueue_job(&job_id(), Instant::now() + Duration::from_secs(60));
        driver.stop().await;
        assert_eq!(driver.queue_depth(), 0);

        driver.enqueue_job(&job_id(), Instant::now());
        assert_eq!(driver.queue_depth(), 0);
    }

    #[tokio::test]
    async fn task_with_killed_goal_converges_to_killed() {
        let (store, _factory, driver) = harness(2);
        seed_job(&store, 1);
        let mut runtime = TaskRuntime::initialized(&job_id(), 0, TaskState::Killed);
        runtime.state = TaskState::Running;
        store.create_task(&job_id(), 0, runtime).unwrap();

        driver.start();
        driver.enqueue_task(&job_id(), 0, Instant::now());

        wait_for_task_state(&store, 0, TaskState::Killed).await;
        driver.stop().await;

        let info = store
            .get_task_for_job(&job_id(), 0)
            .await
            .unwrap()
            .remove(&0)
            .unwrap();
        assert_eq!(
            info.runtime.termination_status,
            Some(TerminationStatus {
                reason: TerminationReason::KilledOnRequest,
            })
        );

        // Killing and Killed transitions both left history.
        let events = store.get_pod_events(&job_id(), 0, None).await.unwrap();
        assert!(events.len() >= 2);
    }

    #[tokio::test]
    async fn initialized_task_is_sent_for_placement() {
        let (store, _factory, driver) = harness(2);
        seed_job(&store, 1);
        store
            .create_task(
                &job_id(),
                0,
                TaskRuntime::initialized(&job_id(), 0, TaskState::Running),
            )
            .unwrap();

        driver.start();
        driver.enqueue_task(&job_id(), 0, Instant::now());

        wait_for_task_state(&store, 0, TaskState::Pending).await;
        driver.stop().await;
    }

    #[tokio::test]
    async fn job_kill_fans_out_to_tasks() {
        let (store, _factory, driver) = harness(4);
        seed_job(&store, 2);
        for instance_id in 0..2 {
            let mut runtime =
                TaskRuntime::initialized(&job_id(), instance_id, TaskState::Running);
            runtime.state = TaskState::Running;
            store.create_task(&job_id(), instance_id, runtime).unwrap();
        }

        // Flip the job goal to Killed, as the Stop RPC's whole-job path does.
        let mut job_runtime = store.get_job_runtime(&job_id()).await.unwrap();
        job_runtime.goal_state = JobState::Killed;
        job_runtime.desired_state_version += 1;
        store.cas_job_runtime(&job_id(), job_runtime).await.unwrap();

        driver.start();
        driver.enqueue_job(&job_id(), Instant::now());

        wait_for_job_state(&store, JobState::Killed).await;
        driver.stop().await;

        for instance_id in 0..2 {
            let info = store
                .get_task_for_job(&job_id(), instance_id)
                .await
                .unwrap()
                .remove(&instance_id)
                .unwrap();
            assert_eq!(info.runtime.state, TaskState::Killed);
            assert_eq!(info.runtime.goal_state, TaskState::Killed);
        }
    }
}
