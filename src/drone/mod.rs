//! 工蜂(Drone)节点实现模块
//!
//! 库内置的节点: 连接驱动, 应答握手, 用 [`TaskRunner`] 执行收到的任务并返回结果。
//! 用作同主机的本地节点以及测试。

pub mod management;
pub mod network;
pub mod task_queue;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub use management::{DroneControl, DroneRegistry, IN_PROCESS_HOST};
pub use network::DroneNetwork;
pub use task_queue::{TaskQueue, TaskResult, TaskRunner};

use crate::proto::{BundleHeader, GridMessage};
use crate::system_info::{keys, SystemInfo};
use crate::{GridError, Result};

const RECONNECT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DroneOptions {
    /// 未配置时自动生成
    pub uuid: Option<String>,
    /// 声明为驱动的本地节点
    pub local: bool,
    /// 声明为对等驱动
    pub peer: bool,
    /// 额外的系统信息, 覆盖主机上报的值
    pub properties: BTreeMap<String, String>,
    pub threads: usize,
    /// 等待期间运行循环检查停止和重启标志的间隔
    pub read_timeout: Duration,
    pub max_blob_size: usize,
}

impl Default for DroneOptions {
    fn default() -> Self {
        Self {
            uuid: None,
            local: false,
            peer: false,
            properties: BTreeMap::new(),
            threads: num_cpus::get(),
            read_timeout: Duration::from_millis(50),
            max_blob_size: 64 * 1024 * 1024,
        }
    }
}

impl DroneOptions {
    pub fn with_property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    pub fn local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn peer(mut self, peer: bool) -> Self {
        self.peer = peer;
        self
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }
}

pub struct Drone {
    driver: SocketAddr,
    options: DroneOptions,
    runner: Arc<dyn TaskRunner>,
    registry: Option<Arc<DroneRegistry>>,
}

enum SessionEnd {
    Stopped,
    Restart,
}

impl Drone {
    pub fn new(driver: SocketAddr, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            driver,
            options: DroneOptions::default(),
            runner,
            registry: None,
        }
    }

    pub fn with_options(mut self, options: DroneOptions) -> Self {
        self.options = options;
        self
    }

    /// 通过 `registry` 暴露管理端点
    pub fn with_registry(mut self, registry: Arc<DroneRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 在独立线程中启动工蜂
    pub fn spawn(self) -> Result<DroneHandle> {
        let uuid = self
            .options
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let control = Arc::new(DroneControl::new(uuid.clone(), self.options.properties.clone()));
        let port = self
            .registry
            .as_ref()
            .map(|r| r.register(Arc::clone(&control)));
        let queue = TaskQueue::new(self.options.threads, Arc::clone(&self.runner))?;
        let thread_control = Arc::clone(&control);
        let registry = self.registry.clone();
        let thread = thread::Builder::new()
            .name(format!("drone-{}", uuid.chars().take(8).collect::<String>()))
            .spawn(move || {
                self.run(&thread_control, &queue, port);
                if let (Some(registry), Some(port)) = (registry, port) {
                    registry.unregister(port);
                }
            })?;
        Ok(DroneHandle {
            control,
            thread: Some(thread),
        })
    }

    fn run(&self, control: &DroneControl, queue: &TaskQueue, port: Option<u16>) {
        log::info!("drone {} starting", control.uuid());
        while !control.is_stopped() {
            match self.session(control, queue, port) {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Restart) => {
                    let previous = control.uuid();
                    let uuid = control.restarted();
                    log::info!("drone {} restarting as {}", previous, uuid);
                }
                Err(e) => {
                    if control.is_stopped() {
                        break;
                    }
                    log::warn!("drone {} lost its driver: {}", control.uuid(), e);
                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }
        log::info!("drone {} stopped", control.uuid());
    }

    fn session(&self, control: &DroneControl, queue: &TaskQueue, port: Option<u16>) -> Result<SessionEnd> {
        let mut net = DroneNetwork::connect(
            self.driver,
            self.options.read_timeout,
            self.options.max_blob_size,
        )?;
        let hello = loop {
            if control.is_stopped() {
                return Ok(SessionEnd::Stopped);
            }
            if let Some(msg) = net.receive()? {
                break msg;
            }
        };
        if !hello.header.handshake {
            return Err(GridError::Protocol("driver did not open with a handshake".into()));
        }
        log::debug!(
            "drone {} attached to driver {}",
            control.uuid(),
            hello.header.driver_uuid
        );
        net.send(self.handshake(control, queue, port))?;

        loop {
            if control.is_stopped() {
                return Ok(SessionEnd::Stopped);
            }
            if control.take_restart() {
                return Ok(SessionEnd::Restart);
            }
            let Some(batch) = net.receive()? else {
                continue;
            };
            let reply = self.execute(control, queue, batch);
            net.send(reply)?;
        }
    }

    fn handshake(&self, control: &DroneControl, queue: &TaskQueue, port: Option<u16>) -> GridMessage {
        let mut info = SystemInfo::collect_local();
        info.set(keys::PROCESSING_THREADS, queue.threads());
        info.merge(&control.properties());
        let header = BundleHeader {
            handshake: true,
            node_uuid: control.uuid(),
            system_info: info.into_properties().into_iter().collect(),
            is_peer: self.options.peer,
            is_local: self.options.local,
            management_host: port.map_or_else(String::new, |_| IN_PROCESS_HOST.to_string()),
            management_port: port.map_or(0, u32::from),
            accepts_new_jobs: Some(true),
            ..Default::default()
        };
        GridMessage::new(header, Vec::new())
    }

    fn execute(&self, control: &DroneControl, queue: &TaskQueue, batch: GridMessage) -> GridMessage {
        let GridMessage { header, blobs } = batch;
        let job_uuid = header.job_uuid.clone();
        control.set_current_job(Some(job_uuid.clone()));
        let started = Instant::now();
        let mut blobs = blobs.into_iter();
        let provider = blobs.next().unwrap_or_default();
        let tasks: Vec<_> = header.task_positions.iter().copied().zip(blobs).collect();
        log::debug!(
            "drone {} running {} tasks of job {}",
            control.uuid(),
            tasks.len(),
            job_uuid
        );
        let results = queue.execute(&provider, &tasks);
        control.set_current_job(None);

        let mut reply = BundleHeader {
            job_uuid: job_uuid.clone(),
            bundle_id: header.bundle_id,
            node_uuid: control.uuid(),
            node_execution_nanos: started.elapsed().as_nanos() as u64,
            accepts_new_jobs: Some(true),
            ..Default::default()
        };
        if control.was_cancelled(&job_uuid) {
            reply.node_exception = Some("job cancelled on the node".into());
            return GridMessage::new(reply, Vec::new());
        }
        let mut task_errors = HashMap::new();
        let mut out = Vec::with_capacity(results.len());
        for result in results {
            match result.output {
                Ok(data) => {
                    reply.task_positions.push(result.position);
                    out.push(data);
                }
                Err(e) => {
                    task_errors.insert(result.position, e);
                }
            }
        }
        reply.task_count = reply.task_positions.len() as u32;
        reply.task_errors = task_errors;
        GridMessage::new(reply, out)
    }
}

/// 运行中的工蜂
pub struct DroneHandle {
    control: Arc<DroneControl>,
    thread: Option<JoinHandle<()>>,
}

impl DroneHandle {
    /// 当前 uuid, 每次重启都会变化
    pub fn uuid(&self) -> String {
        self.control.uuid()
    }

    pub fn control(&self) -> &Arc<DroneControl> {
        &self.control
    }

    pub fn restarts(&self) -> usize {
        self.control.restarts()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.control.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("drone {} thread panicked", self.control.uuid());
            }
        }
    }
}

impl Drop for DroneHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
