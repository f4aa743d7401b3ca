//! Concurrency properties of the cached entity factory: CAS linearizability,
//! patch/CAS equivalence, and the watch notifications that ride on cache
//! mutations.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use echelon_core::JobId;
use echelon_jobmgr::job::JobType;
use echelon_jobmgr::store::Store;
use echelon_jobmgr::task::{HealthState, RuntimeDiff, TaskState};
use echelon_jobmgr::watch::StopSignal;

use common::{harness, seed_job};

fn job_id() -> JobId {
    JobId::new("j1")
}

#[tokio::test]
async fn concurrent_cas_from_one_snapshot_admits_exactly_one_writer() {
    let h = harness();
    seed_job(&h, &job_id(), JobType::Service, 1, TaskState::Running, TaskState::Running);

    let snapshot = h
        .store
        .get_task_for_job(&job_id(), 0)
        .await
        .expect("task")
        .remove(&0)
        .expect("info")
        .runtime;

    let mut writers = Vec::new();
    for writer in 0..8u32 {
        let store = Arc::clone(&h.store);
        let mut runtime = snapshot.clone();
        writers.push(tokio::spawn(async move {
            runtime.message = format!("writer {writer}");
            store.cas_task_runtime(&JobId::new("j1"), 0, runtime).await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for writer in writers {
        match writer.await.expect("writer task") {
            Ok(_) => successes += 1,
            Err(err) if err.is_unexpected_version() => conflicts += 1,
            Err(err) => panic!("unexpected error kind: {err}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(conflicts, 7);

    let stored = h
        .store
        .get_task_for_job(&job_id(), 0)
        .await
        .expect("task")
        .remove(&0)
        .expect("info")
        .runtime;
    assert_eq!(stored.revision, 2);
}

#[tokio::test]
async fn patch_tasks_is_equivalent_to_per_task_cas() {
    // Two identical worlds: one patched through the factory, one written
    // through explicit read-merge-CAS cycles.
    let patched = harness();
    let reference = harness();
    for h in [&patched, &reference] {
        seed_job(h, &job_id(), JobType::Service, 3, TaskState::Running, TaskState::Running);
    }

    let diff_for = |instance_id: u32| RuntimeDiff {
        goal_state: Some(TaskState::Killed),
        message: Some(format!("diff for {instance_id}")),
        healthy: Some(HealthState::Disabled),
        ..RuntimeDiff::default()
    };

    // World one: a single patch_tasks call.
    let cached_job = patched.factory.add_job(&job_id());
    let mut diffs = BTreeMap::new();
    for instance_id in 0..3 {
        diffs.insert(instance_id, diff_for(instance_id));
    }
    cached_job.patch_tasks(diffs).await.expect("patch");

    // World two: sequenced CompareAndSetRuntime with current ∪ diff.
    let reference_job = reference.factory.add_job(&job_id());
    for instance_id in 0..3 {
        let task = reference_job.add_task(instance_id).await.expect("task");
        let mut runtime = task.get_runtime().await.expect("runtime");
        diff_for(instance_id).apply_to(&mut runtime);
        task.compare_and_set_runtime(runtime, JobType::Service)
            .await
            .expect("cas");
    }

    for instance_id in 0..3 {
        let a = patched
            .store
            .get_task_for_job(&job_id(), instance_id)
            .await
            .expect("task")
            .remove(&instance_id)
            .expect("info")
            .runtime;
        let b = reference
            .store
            .get_task_for_job(&job_id(), instance_id)
            .await
            .expect("task")
            .remove(&instance_id)
            .expect("info")
            .runtime;
        assert_eq!(a, b, "instance {instance_id} diverged");
    }
}

#[tokio::test]
async fn cache_mutations_notify_watchers() {
    let h = harness();
    seed_job(&h, &job_id(), JobType::Service, 1, TaskState::Running, TaskState::Running);

    let (_watch_id, mut client) = h.watch.new_task_client().expect("watch client");

    let cached_job = h.factory.add_job(&job_id());
    let cached_task = cached_job.add_task(0).await.expect("add task");
    cached_task
        .patch_runtime(
            &RuntimeDiff {
                goal_state: Some(TaskState::Killed),
                message: Some("stop requested".to_string()),
                ..RuntimeDiff::default()
            },
            JobType::Service,
        )
        .await
        .expect("patch");

    let summary = client.events.recv().await.expect("notification");
    assert_eq!(summary.job_id, job_id());
    assert_eq!(summary.instance_id, 0);
    assert_eq!(summary.goal_state, TaskState::Killed);
    assert_eq!(summary.message, "stop requested");
    assert_eq!(client.try_signal(), StopSignal::Unknown);
}

#[tokio::test]
async fn job_mutations_notify_job_watchers() {
    let h = harness();
    seed_job(&h, &job_id(), JobType::Service, 1, TaskState::Running, TaskState::Running);

    let (_watch_id, mut client) = h.watch.new_job_client().expect("watch client");

    let cached_job = h.factory.add_job(&job_id());
    let mut runtime = cached_job.get_runtime().await.expect("runtime");
    runtime.goal_state = echelon_jobmgr::job::JobState::Killed;
    cached_job
        .compare_and_set_runtime(runtime)
        .await
        .expect("cas");

    let summary = client.events.recv().await.expect("notification");
    assert_eq!(summary.job_id, job_id());
    assert_eq!(summary.goal_state, echelon_jobmgr::job::JobState::Killed);
}

#[tokio::test]
async fn mutation_history_lands_in_pod_events() {
    let h = harness();
    seed_job(&h, &job_id(), JobType::Service, 1, TaskState::Initialized, TaskState::Running);

    let cached_job = h.factory.add_job(&job_id());
    let cached_task = cached_job.add_task(0).await.expect("add task");

    // State change: history-worthy.
    let mut runtime = cached_task.get_runtime().await.expect("runtime");
    runtime.state = TaskState::Running;
    cached_task
        .compare_and_set_runtime(runtime, JobType::Service)
        .await
        .expect("cas");

    // Message-only change: not history-worthy.
    cached_task
        .patch_runtime(
            &RuntimeDiff {
                message: Some("heartbeat".to_string()),
                ..RuntimeDiff::default()
            },
            JobType::Service,
        )
        .await
        .expect("patch");

    let events = h
        .store
        .get_pod_events(&job_id(), 0, None)
        .await
        .expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actual_state, TaskState::Running);
}
