//! 调度集成测试: 真实驱动, 进程内工蜂通过回环地址接入

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use zerg_grid::drone::{DroneOptions, DroneRegistry};
use zerg_grid::job::ReturnReason;
use zerg_grid::{ExecutionPolicy, Job, JobListener, JobSla, LoadBalancingConfig, TaskOutcome};

mod test_utils;
use test_utils::{echo_runner, spawn_drone, start_driver, wait_for, wait_idle_nodes};

/// 记录每次分发的节点
struct Recorder(Arc<Mutex<Vec<String>>>);

impl JobListener for Recorder {
    fn job_dispatched(&self, _job: &Job, node_uuid: &str, _positions: &[u32]) {
        self.0.lock().push(node_uuid.to_string());
    }
}

#[test]
fn two_tasks_complete_on_one_node() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let _drone = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    assert!(wait_idle_nodes(&driver, 1));

    let job = Job::builder("basic").task("a").task("b").build();
    driver.submit(Arc::clone(&job));
    assert!(job.await_completion(Duration::from_secs(5)));

    let results = job.results();
    assert_eq!(results.get(&0), Some(&TaskOutcome::Success("a:0".into())));
    assert_eq!(results.get(&1), Some(&TaskOutcome::Success("b:1".into())));
    assert!(wait_idle_nodes(&driver, 1));
    assert_eq!(driver.stats().tasks_dispatched, 2);
}

#[test]
fn execution_policy_picks_the_tagged_node() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let _plain = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    let gpu = spawn_drone(
        &driver,
        &registry,
        echo_runner(),
        DroneOptions::default().with_property("tag", "gpu"),
    );
    assert!(wait_idle_nodes(&driver, 2));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let job = Job::builder("gpu-only")
        .policy(ExecutionPolicy::equal("tag", "gpu"))
        .listener(Arc::new(Recorder(Arc::clone(&seen))))
        .task("x")
        .task("y")
        .task("z")
        .build();
    driver.submit(Arc::clone(&job));
    assert!(job.await_completion(Duration::from_secs(5)));
    let nodes = seen.lock().clone();
    assert!(!nodes.is_empty());
    assert!(nodes.iter().all(|n| *n == gpu.uuid()));
}

#[test]
fn small_bundles_spread_over_nodes() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| {
        c.with_load_balancing(LoadBalancingConfig {
            size: 1,
            ..Default::default()
        })
    });
    let _a = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    let _b = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    assert!(wait_idle_nodes(&driver, 2));

    let job = (0..20)
        .fold(Job::builder("many"), |b, i| b.task(vec![b'a' + i as u8]))
        .build();
    driver.submit(Arc::clone(&job));
    assert!(job.await_completion(Duration::from_secs(10)));
    assert_eq!(job.results().len(), 20);
    assert!(job.results().values().all(TaskOutcome::is_success));
}

#[test]
fn broadcast_runs_once_per_node() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let _a = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    let _b = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    assert!(wait_idle_nodes(&driver, 2));

    let job = Job::builder("everywhere")
        .sla(JobSla {
            broadcast: true,
            ..Default::default()
        })
        .task("ping")
        .build();
    driver.submit(Arc::clone(&job));
    assert!(job.await_completion(Duration::from_secs(5)));
    assert!(job.results().values().all(TaskOutcome::is_success));
}

#[test]
fn local_node_gets_the_work_first() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c.with_local_node_bias(true));
    let _remote = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    let local = spawn_drone(
        &driver,
        &registry,
        echo_runner(),
        DroneOptions::default().local(true),
    );
    assert!(wait_idle_nodes(&driver, 2));

    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
        let job = Job::builder(format!("local-{}", i))
            .listener(Arc::new(Recorder(Arc::clone(&seen))))
            .task("t")
            .build();
        driver.submit(Arc::clone(&job));
        assert!(job.await_completion(Duration::from_secs(5)));
        assert!(wait_idle_nodes(&driver, 2));
    }
    let nodes = seen.lock().clone();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| *n == local.uuid()));
}

#[test]
fn cancelled_job_stops_dispatching() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let job = Job::builder("cancel-me").task("a").task("b").build();
    driver.submit(Arc::clone(&job));
    assert!(driver.cancel_job(job.uuid()));
    assert!(job.is_complete());
    assert!(job
        .results()
        .values()
        .all(|o| o.reason() == ReturnReason::Cancelled));
    assert!(wait_for(Duration::from_secs(1), || driver.context().queue().is_empty()));
}

#[test]
fn suspended_job_waits_for_resume() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let _drone = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    assert!(wait_idle_nodes(&driver, 1));

    let job = Job::builder("later")
        .sla(JobSla {
            suspended: true,
            ..Default::default()
        })
        .task("t")
        .build();
    driver.submit(Arc::clone(&job));
    assert!(!job.await_completion(Duration::from_millis(300)));
    assert!(driver.context().queue().resume_job(job.uuid()));
    assert!(job.await_completion(Duration::from_secs(5)));
}
