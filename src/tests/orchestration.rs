//! End-to-end scenarios: task tree on disk, fake engine and executor,
//! real store/registry/worktrees/scheduler/orchestrator.

use crate::agent::AgentManager;
use crate::container::ContainerEngine;
use crate::executor::{Executor, RunOptions};
use crate::models::TaskStatus;
use crate::orchestrator::Orchestrator;
use crate::registry::AgentRegistry;
use crate::scheduler::WorkstreamScheduler;
use crate::tasks::TaskStore;
use crate::tests::fakes::{scratch_repo, FakeEngine, FakeExecutor};
use crate::worktree::WorktreeProvisioner;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{watch, Mutex};

struct World {
    _repo: TempDir,
    store: Arc<TaskStore>,
    executor: Arc<FakeExecutor>,
    agents: Arc<AgentManager>,
    orchestrator: Arc<Orchestrator>,
}

fn task_file(id: &str, workstream: &str, priority: &str, deps: &[&str], signal: &str) -> String {
    let deps = deps.join(", ");
    format!(
        "---\n\
         id: {id}\n\
         title: {id}\n\
         role: backend\n\
         workstream: {workstream}\n\
         priority: {priority}\n\
         status: pending\n\
         depends_on: [{deps}]\n\
         completion:\n  signal: {signal}\n\
         ---\n\
         Work on {id}.\n"
    )
}

async fn world(files: &[(&str, String)], limits: &[(&str, usize)]) -> Option<World> {
    let repo = scratch_repo()?;
    let tasks_dir = repo.path().join("tasks");
    std::fs::create_dir_all(&tasks_dir).unwrap();
    for (rel, content) in files {
        std::fs::write(tasks_dir.join(rel), content).unwrap();
    }

    let store = Arc::new(TaskStore::new(&tasks_dir));
    let registry = Arc::new(
        AgentRegistry::open(repo.path().join(".tanuki/state/agents.json"))
            .await
            .unwrap(),
    );
    let worktrees = Arc::new(WorktreeProvisioner::new(repo.path(), "tanuki"));
    let engine = Arc::new(FakeEngine::new());
    let executor = Arc::new(FakeExecutor::new());
    executor.set_default_output("DONE").await;

    let agents = Arc::new(AgentManager::new(
        registry,
        worktrees,
        engine.clone() as Arc<dyn ContainerEngine>,
        executor.clone() as Arc<dyn Executor>,
    ));

    let mut role_limits = HashMap::new();
    for (role, limit) in limits {
        role_limits.insert(role.to_string(), *limit);
    }
    let scheduler = Arc::new(Mutex::new(WorkstreamScheduler::new(role_limits, 1)));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        scheduler,
        agents.clone(),
        RunOptions::default(),
        1,
    ));

    Some(World {
        _repo: repo,
        store,
        executor,
        agents,
        orchestrator,
    })
}

fn idle_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // keep the channel open for the duration of the run
    std::mem::forget(tx);
    rx
}

#[tokio::test]
async fn linear_dependency_drains_in_order() {
    // S1: p-002 depends on p-001 inside one workstream
    let Some(world) = world(
        &[
            ("p1.md", task_file("p-001", "main", "medium", &[], "DONE")),
            ("p2.md", task_file("p-002", "main", "medium", &["p-001"], "DONE")),
        ],
        &[],
    )
    .await
    else {
        return;
    };

    world
        .orchestrator
        .run_project(None, idle_shutdown())
        .await
        .unwrap();

    world.store.scan().await.unwrap();
    assert_eq!(
        world.store.get("p-001").await.unwrap().status,
        TaskStatus::Complete
    );
    assert_eq!(
        world.store.get("p-002").await.unwrap().status,
        TaskStatus::Complete
    );

    // one agent drained the whole workstream, in dependency order
    let calls = world.executor.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls[0].1.contains("p-001"));
    assert!(calls[1].1.contains("p-002"));
    assert!(world.agents.get("main").await.is_some());
}

#[tokio::test]
async fn cross_workstream_dependency_rebalances() {
    // S2: beta waits for alpha under a quota of one
    let Some(world) = world(
        &[
            ("x1.md", task_file("x-001", "alpha", "medium", &[], "DONE")),
            ("x2.md", task_file("x-002", "beta", "medium", &["x-001"], "DONE")),
        ],
        &[("backend", 1)],
    )
    .await
    else {
        return;
    };

    world
        .orchestrator
        .run_project(None, idle_shutdown())
        .await
        .unwrap();

    world.store.scan().await.unwrap();
    assert_eq!(
        world.store.get("x-001").await.unwrap().status,
        TaskStatus::Complete
    );
    assert_eq!(
        world.store.get("x-002").await.unwrap().status,
        TaskStatus::Complete
    );

    // both workstreams got their own agent, but never concurrently
    assert!(world.agents.get("alpha").await.is_some());
    assert!(world.agents.get("beta").await.is_some());
    assert_eq!(world.executor.max_concurrent(), 1);
}

#[tokio::test]
async fn role_quota_is_never_exceeded() {
    let files = [
        ("a.md", task_file("a-001", "alpha", "medium", &[], "DONE")),
        ("b.md", task_file("b-001", "beta", "medium", &[], "DONE")),
        ("c.md", task_file("c-001", "gamma", "medium", &[], "DONE")),
    ];

    // quota 1: strictly serial
    let Some(world_serial) = world(&files, &[("backend", 1)]).await else {
        return;
    };
    world_serial.executor.set_delay(Duration::from_millis(30)).await;
    world_serial
        .orchestrator
        .run_project(None, idle_shutdown())
        .await
        .unwrap();
    assert_eq!(world_serial.executor.max_concurrent(), 1);

    // quota 2: parallel, but capped
    let Some(world_pair) = world(&files, &[("backend", 2)]).await else {
        return;
    };
    world_pair.executor.set_delay(Duration::from_millis(200)).await;
    world_pair
        .orchestrator
        .run_project(None, idle_shutdown())
        .await
        .unwrap();
    assert!(world_pair.executor.max_concurrent() <= 2);
    assert_eq!(world_pair.executor.max_concurrent(), 2);

    world_pair.store.scan().await.unwrap();
    for id in ["a-001", "b-001", "c-001"] {
        assert_eq!(
            world_pair.store.get(id).await.unwrap().status,
            TaskStatus::Complete
        );
    }
}

#[tokio::test]
async fn failed_task_does_not_stop_the_workstream() {
    let Some(world) = world(
        &[
            ("a.md", task_file("a-001", "main", "medium", &[], "NEVER-EMITTED")),
            ("b.md", task_file("b-001", "main", "medium", &[], "DONE")),
        ],
        &[],
    )
    .await
    else {
        return;
    };

    world
        .orchestrator
        .run_project(None, idle_shutdown())
        .await
        .unwrap();

    world.store.scan().await.unwrap();
    assert_eq!(
        world.store.get("a-001").await.unwrap().status,
        TaskStatus::Failed
    );
    assert_eq!(
        world.store.get("b-001").await.unwrap().status,
        TaskStatus::Complete
    );
    // the failed task holds no assignment
    assert_eq!(world.store.get("a-001").await.unwrap().assigned_to, None);
}

#[tokio::test]
async fn priority_orders_the_drain_within_a_workstream() {
    // S4: four priorities in one workstream, dequeued critical-first
    let Some(world) = world(
        &[
            ("1.md", task_file("t-low", "main", "low", &[], "DONE")),
            ("2.md", task_file("t-critical", "main", "critical", &[], "DONE")),
            ("3.md", task_file("t-medium", "main", "medium", &[], "DONE")),
            ("4.md", task_file("t-high", "main", "high", &[], "DONE")),
        ],
        &[],
    )
    .await
    else {
        return;
    };

    world
        .orchestrator
        .run_project(None, idle_shutdown())
        .await
        .unwrap();

    let order: Vec<String> = world
        .executor
        .calls()
        .await
        .into_iter()
        .map(|(_, prompt)| prompt)
        .collect();
    assert_eq!(order.len(), 4);
    assert!(order[0].contains("t-critical"));
    assert!(order[1].contains("t-high"));
    assert!(order[2].contains("t-medium"));
    assert!(order[3].contains("t-low"));
}

#[tokio::test]
async fn cancellation_returns_the_in_flight_task_to_pending() {
    let Some(world) = world(
        &[("t.md", task_file("t-001", "main", "medium", &[], "DONE"))],
        &[],
    )
    .await
    else {
        return;
    };
    world.executor.set_delay(Duration::from_secs(10)).await;

    let (tx, rx) = watch::channel(false);
    let orchestrator = world.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.run_project(None, rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run_project should wind down promptly")
        .unwrap()
        .unwrap();

    world.store.scan().await.unwrap();
    let task = world.store.get("t-001").await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assigned_to, None);
}

#[tokio::test]
async fn project_filter_limits_the_run() {
    let repo = match world(&[], &[]).await {
        Some(w) => w,
        None => return,
    };
    // two projects side by side
    let tasks_dir = repo._repo.path().join("tasks");
    std::fs::create_dir_all(tasks_dir.join("webapp")).unwrap();
    std::fs::create_dir_all(tasks_dir.join("infra")).unwrap();
    std::fs::write(
        tasks_dir.join("webapp/t.md"),
        task_file("web-001", "main", "medium", &[], "DONE"),
    )
    .unwrap();
    std::fs::write(
        tasks_dir.join("infra/t.md"),
        task_file("inf-001", "main", "medium", &[], "DONE"),
    )
    .unwrap();

    repo.orchestrator
        .run_project(Some("webapp"), idle_shutdown())
        .await
        .unwrap();

    repo.store.scan().await.unwrap();
    assert_eq!(
        repo.store.get("web-001").await.unwrap().status,
        TaskStatus::Complete
    );
    assert_eq!(
        repo.store.get("inf-001").await.unwrap().status,
        TaskStatus::Pending
    );
}
