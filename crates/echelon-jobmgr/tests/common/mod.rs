//! Shared wiring for the TaskManager integration suites.

use std::sync::Arc;

use echelon_core::JobId;
use echelon_jobmgr::cached::{JobFactory, RuntimeListener};
use echelon_jobmgr::client::{
    HostManagerClient, InMemoryHostManager, InMemoryLogManager, InMemoryResManager, LogManager,
    ResManagerClient,
};
use echelon_jobmgr::config::JobmgrConfig;
use echelon_jobmgr::goalstate::Driver;
use echelon_jobmgr::handler::TaskService;
use echelon_jobmgr::job::{JobConfig, JobRuntime, JobState, JobType};
use echelon_jobmgr::leader::{Candidate, StaticCandidate};
use echelon_jobmgr::store::memory::InMemoryStore;
use echelon_jobmgr::store::Store;
use echelon_jobmgr::task::{TaskRuntime, TaskState};
use echelon_jobmgr::watch::WatchProcessor;

/// Everything a handler test needs, wired the way production wires it.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub factory: Arc<JobFactory>,
    pub watch: Arc<WatchProcessor>,
    pub driver: Driver,
    pub candidate: Arc<StaticCandidate>,
    pub resmgr: Arc<InMemoryResManager>,
    pub hostmgr: Arc<InMemoryHostManager>,
    pub service: TaskService,
}

/// Builds a leader harness over an empty in-memory store.
///
/// The goal-state driver is wired but not started, so tests can assert on
/// enqueue counts through `Driver::queue_depth`.
#[must_use]
pub fn harness() -> Harness {
    let config = JobmgrConfig::default();
    let store = Arc::new(InMemoryStore::new());
    let watch = Arc::new(WatchProcessor::new(config.watch));
    let factory = Arc::new(JobFactory::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&watch) as Arc<dyn RuntimeListener>,
    ));
    let driver = Driver::new(
        Arc::clone(&factory),
        Arc::clone(&store) as Arc<dyn Store>,
        config.goal_state,
    );
    let candidate = Arc::new(StaticCandidate::new(true));
    let resmgr = Arc::new(InMemoryResManager::new());
    let hostmgr = Arc::new(InMemoryHostManager::default());

    let service = TaskService::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&factory),
        driver.clone(),
        Arc::clone(&candidate) as Arc<dyn Candidate>,
        Arc::clone(&resmgr) as Arc<dyn ResManagerClient>,
        Arc::clone(&hostmgr) as Arc<dyn HostManagerClient>,
        Arc::new(InMemoryLogManager::new()) as Arc<dyn LogManager>,
        config,
    );

    Harness {
        store,
        factory,
        watch,
        driver,
        candidate,
        resmgr,
        hostmgr,
        service,
    }
}

/// Seeds a job and one task per slot, every task in `state` with `goal`.
pub fn seed_job(
    harness: &Harness,
    job_id: &JobId,
    job_type: JobType,
    instance_count: u32,
    state: TaskState,
    goal: TaskState,
) {
    harness
        .store
        .create_job(
            job_id,
            JobConfig {
                instance_count,
                job_type,
                config_version: 1,
                health_check: false,
            },
            JobRuntime::initialized(match job_type {
                JobType::Batch => JobState::Succeeded,
                JobType::Service => JobState::Running,
            }),
        )
        .expect("seed job");

    for instance_id in 0..instance_count {
        let mut runtime = TaskRuntime::initialized(job_id, instance_id, goal);
        runtime.state = state;
        harness
            .store
            .create_task(job_id, instance_id, runtime)
            .expect("seed task");
    }
}
