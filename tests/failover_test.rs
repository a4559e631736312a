//! 故障转移测试: 节点丢失, 分发超时和异常节点
//!
//! 手动驱动的节点直接收发线协议消息, 测试可以随时断开连接或任意应答

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use zerg_grid::drone::{DroneNetwork, DroneOptions, DroneRegistry};
use zerg_grid::proto::{BundleHeader, GridMessage};
use zerg_grid::{Driver, Job, JobListener, JobSla, ReturnReason, TaskOutcome};

mod test_utils;
use test_utils::{echo_runner, slow_runner, spawn_drone, start_driver, wait_for, wait_idle_nodes};

const WAIT: Duration = Duration::from_secs(5);

/// 由测试自己驱动的节点
struct ManualNode {
    uuid: String,
    net: DroneNetwork,
}

impl ManualNode {
    fn connect(driver: &Driver, uuid: &str) -> Self {
        let mut net = DroneNetwork::connect(driver.local_addr(), Duration::from_millis(20), 1 << 20)
            .expect("connect");
        let hello = Self::receive_on(&mut net).expect("driver handshake");
        assert!(hello.header.handshake);
        net.send(GridMessage::new(
            BundleHeader {
                handshake: true,
                node_uuid: uuid.to_string(),
                accepts_new_jobs: Some(true),
                ..Default::default()
            },
            Vec::new(),
        ))
        .expect("node handshake");
        Self {
            uuid: uuid.to_string(),
            net,
        }
    }

    fn receive_on(net: &mut DroneNetwork) -> Option<GridMessage> {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(msg) = net.receive().expect("receive") {
                return Some(msg);
            }
        }
        None
    }

    fn next_batch(&mut self) -> GridMessage {
        Self::receive_on(&mut self.net).expect("no batch received")
    }

    fn reply(&mut self, batch: &GridMessage, configure: impl FnOnce(&mut BundleHeader)) {
        let mut header = BundleHeader {
            job_uuid: batch.header.job_uuid.clone(),
            bundle_id: batch.header.bundle_id,
            node_uuid: self.uuid.clone(),
            accepts_new_jobs: Some(true),
            ..Default::default()
        };
        configure(&mut header);
        let blobs = header
            .task_positions
            .iter()
            .map(|p| Bytes::from(format!("manual:{}", p)))
            .collect();
        self.net
            .send(GridMessage::new(header, blobs))
            .expect("reply");
    }
}

struct Recorder(Arc<Mutex<Vec<String>>>);

impl JobListener for Recorder {
    fn job_dispatched(&self, _job: &Job, node_uuid: &str, _positions: &[u32]) {
        self.0.lock().push(node_uuid.to_string());
    }
}

#[test]
fn lost_node_gets_its_batch_resubmitted() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let mut flaky = ManualNode::connect(&driver, "flaky-node");
    assert!(wait_idle_nodes(&driver, 1));

    let job = Job::builder("survivor").task("a").task("b").build();
    driver.submit(Arc::clone(&job));
    let batch = flaky.next_batch();
    assert_eq!(batch.header.task_positions.len(), 2);
    drop(flaky);

    let _drone = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    assert!(job.await_completion(WAIT));
    assert_eq!(
        job.results().get(&1),
        Some(&TaskOutcome::Success("b:1".into()))
    );
    assert_eq!(driver.stats().tasks_resubmitted, 2);
}

#[test]
fn repeated_node_loss_hits_the_resubmit_ceiling() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let job = Job::builder("doomed")
        .sla(JobSla {
            max_task_resubmits: 1,
            apply_max_resubmits_upon_node_error: true,
            ..Default::default()
        })
        .task("t")
        .build();
    driver.submit(Arc::clone(&job));

    for attempt in 0..2 {
        let mut node = ManualNode::connect(&driver, &format!("crash-{}", attempt));
        node.next_batch();
    }
    assert!(job.await_completion(WAIT));
    assert_eq!(
        job.results().get(&0).map(TaskOutcome::reason),
        Some(ReturnReason::NodeChannelError)
    );
    assert!(wait_for(WAIT, || driver.stats().nodes == 0));
}

#[test]
fn expired_dispatch_fails_tasks_but_keeps_the_node() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let _drone = spawn_drone(
        &driver,
        &registry,
        slow_runner(Duration::from_millis(600)),
        DroneOptions::default(),
    );
    assert!(wait_idle_nodes(&driver, 1));

    let job = Job::builder("too-slow")
        .sla(JobSla {
            dispatch_expiration: Some(Duration::from_millis(100)),
            max_dispatch_expirations: 0,
            ..Default::default()
        })
        .task("t")
        .build();
    driver.submit(Arc::clone(&job));
    assert!(job.await_completion(WAIT));
    assert_eq!(
        job.results().get(&0).map(TaskOutcome::reason),
        Some(ReturnReason::DispatchTimeout)
    );
    assert_eq!(driver.stats().dispatch_expirations, 1);

    // 迟到的应答被丢弃, 节点重新可用
    assert!(wait_idle_nodes(&driver, 1));
    assert_eq!(driver.stats().nodes, 1);
    assert_eq!(
        job.results().get(&0).map(TaskOutcome::reason),
        Some(ReturnReason::DispatchTimeout)
    );
}

#[test]
fn node_exception_fails_the_whole_batch() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let mut node = ManualNode::connect(&driver, "broken-node");
    assert!(wait_idle_nodes(&driver, 1));

    let job = Job::builder("broken").task("a").task("b").build();
    driver.submit(Arc::clone(&job));
    let batch = node.next_batch();
    node.reply(&batch, |h| h.node_exception = Some("out of memory".into()));
    assert!(job.await_completion(WAIT));
    let results = job.results();
    assert_eq!(results.len(), 2);
    for outcome in results.values() {
        assert_eq!(
            outcome,
            &TaskOutcome::failed(ReturnReason::NodeProcessingError, "out of memory")
        );
    }
    assert!(wait_idle_nodes(&driver, 1));
}

#[test]
fn node_can_hand_a_batch_back() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let mut node = ManualNode::connect(&driver, "busy-node");
    assert!(wait_idle_nodes(&driver, 1));

    let job = Job::builder("handed-back").task("a").build();
    driver.submit(Arc::clone(&job));
    let first = node.next_batch();
    node.reply(&first, |h| h.requeue = true);
    let second = node.next_batch();
    assert_eq!(second.header.task_positions, vec![0]);
    node.reply(&second, |h| {
        h.task_positions = vec![0];
        h.task_count = 1;
    });
    assert!(job.await_completion(WAIT));
    assert_eq!(
        job.results().get(&0),
        Some(&TaskOutcome::Success("manual:0".into()))
    );
}

#[test]
fn job_is_never_sent_back_to_a_node_it_came_through() {
    let registry = Arc::new(DroneRegistry::new());
    let driver = start_driver(&registry, |c| c);
    let _origin = spawn_drone(
        &driver,
        &registry,
        echo_runner(),
        DroneOptions::default().uuid("origin-node"),
    );
    assert!(wait_idle_nodes(&driver, 1));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let job = Job::builder("forwarded")
        .uuid_path(vec!["origin-node".into()])
        .listener(Arc::new(Recorder(Arc::clone(&seen))))
        .task("t")
        .build();
    driver.submit(Arc::clone(&job));
    assert!(!job.await_completion(Duration::from_millis(300)));

    let other = spawn_drone(&driver, &registry, echo_runner(), DroneOptions::default());
    assert!(job.await_completion(WAIT));
    assert_eq!(seen.lock().clone(), vec![other.uuid()]);
}
