//! zerg_grid 基本用法示例: 一个驱动, 一个本地节点和一个远程节点

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use zerg_grid::drone::{Drone, DroneOptions, DroneRegistry, TaskRunner};
use zerg_grid::{Driver, DriverConfig, Job, TaskOutcome};

fn main() -> zerg_grid::Result<()> {
    env_logger::init();

    let registry = Arc::new(DroneRegistry::new());
    let config = DriverConfig::new(SocketAddr::from(([127, 0, 0, 1], 11198)))
        .with_queue_check_interval(Duration::from_millis(100));
    let driver = Driver::start(config, registry.clone())?;

    // 把输入转成大写
    let runner: Arc<dyn TaskRunner> =
        Arc::new(|_pos: u32, data: &[u8], _provider: &[u8]| -> Result<Bytes, String> {
            Ok(Bytes::from(data.to_ascii_uppercase()))
        });
    let _local = Drone::new(driver.local_addr(), runner.clone())
        .with_options(DroneOptions::default().local(true))
        .with_registry(registry.clone())
        .spawn()?;
    let _remote = Drone::new(driver.local_addr(), runner)
        .with_options(DroneOptions::default().with_property("tag", "remote"))
        .with_registry(registry)
        .spawn()?;

    let job = ["zerg", "rush", "kekeke"]
        .into_iter()
        .fold(Job::builder("shout"), |b, word| b.task(word))
        .build();
    driver.submit(job.clone());
    if !job.await_completion(Duration::from_secs(10)) {
        println!("job {} did not complete in time", job.uuid());
    }
    for (position, outcome) in job.results() {
        match outcome {
            TaskOutcome::Success(data) => {
                println!("task {}: {}", position, String::from_utf8_lossy(&data))
            }
            TaskOutcome::Failed { reason, message } => {
                println!("task {} failed ({:?}): {}", position, reason, message)
            }
        }
    }
    println!("{:?}", driver.stats());
    driver.shutdown();
    Ok(())
}
