#![allow(dead_code)]
//! 测试专用辅助函数

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use zerg_grid::drone::{Drone, DroneHandle, DroneOptions, DroneRegistry, TaskRunner};
use zerg_grid::{Driver, DriverConfig};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn free_addr() -> SocketAddr {
    let port = portpicker::pick_unused_port().expect("no free port");
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// 在空闲回环端口上启动驱动, 通过 `registry` 访问工蜂
pub fn start_driver(registry: &Arc<DroneRegistry>, configure: impl FnOnce(DriverConfig) -> DriverConfig) -> Driver {
    init_logger();
    let config = configure(
        DriverConfig::new(free_addr()).with_queue_check_interval(Duration::from_millis(20)),
    );
    let connector: Arc<DroneRegistry> = Arc::clone(registry);
    Driver::start(config, connector).expect("driver start")
}

/// 返回 `"<input>:<position>"`
pub fn echo_runner() -> Arc<dyn TaskRunner> {
    Arc::new(|pos: u32, data: &[u8], _provider: &[u8]| -> Result<Bytes, String> {
        let mut out = data.to_vec();
        out.extend_from_slice(format!(":{}", pos).as_bytes());
        Ok(Bytes::from(out))
    })
}

/// 休眠 `delay` 后回显
pub fn slow_runner(delay: Duration) -> Arc<dyn TaskRunner> {
    Arc::new(move |_pos: u32, data: &[u8], _provider: &[u8]| -> Result<Bytes, String> {
        thread::sleep(delay);
        Ok(Bytes::copy_from_slice(data))
    })
}

pub fn spawn_drone(
    driver: &Driver,
    registry: &Arc<DroneRegistry>,
    runner: Arc<dyn TaskRunner>,
    options: DroneOptions,
) -> DroneHandle {
    Drone::new(driver.local_addr(), runner)
        .with_options(DroneOptions { threads: 2, ..options })
        .with_registry(Arc::clone(registry))
        .spawn()
        .expect("drone start")
}

/// 轮询 `cond` 直到成立或超时
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// 等待驱动看到 `n` 个空闲节点
pub fn wait_idle_nodes(driver: &Driver, n: usize) -> bool {
    wait_for(Duration::from_secs(5), || driver.context().idle().len() >= n)
}
