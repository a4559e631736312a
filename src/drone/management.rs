//! 进程内工蜂的管理端点
//!
//! 通过 [`DroneRegistry`] 启动的工蜂在握手中公布 `in-process:<port>`,
//! 驱动把同一个注册表当作 `ManagementConnector` 来访问它们。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::management::{ManagementConnection, ManagementConnector, ManagementInfo};
use crate::system_info::keys;
use crate::{GridError, Result};

pub const IN_PROCESS_HOST: &str = "in-process";

/// 工蜂运行循环与管理连接之间的共享状态
#[derive(Debug)]
pub struct DroneControl {
    uuid: Mutex<String>,
    properties: Mutex<BTreeMap<String, String>>,
    current_job: Mutex<Option<String>>,
    cancelled: Mutex<HashSet<String>>,
    restart: AtomicBool,
    stopped: AtomicBool,
    restarts: AtomicUsize,
}

impl DroneControl {
    pub fn new(uuid: String, properties: BTreeMap<String, String>) -> Self {
        Self {
            uuid: Mutex::new(uuid),
            properties: Mutex::new(properties),
            current_job: Mutex::new(None),
            cancelled: Mutex::new(HashSet::new()),
            restart: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn uuid(&self) -> String {
        self.uuid.lock().clone()
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.properties.lock().clone()
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub(crate) fn set_current_job(&self, job: Option<String>) {
        *self.current_job.lock() = job;
    }

    pub(crate) fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::AcqRel)
    }

    /// 以新节点身份重新接入: 新 uuid, 属性不变
    pub(crate) fn restarted(&self) -> String {
        let uuid = uuid::Uuid::new_v4().to_string();
        *self.uuid.lock() = uuid.clone();
        self.restarts.fetch_add(1, Ordering::AcqRel);
        uuid
    }

    pub(crate) fn was_cancelled(&self, job: &str) -> bool {
        self.cancelled.lock().remove(job)
    }
}

struct DroneConnection {
    control: Arc<DroneControl>,
}

impl ManagementConnection for DroneConnection {
    fn cancel_job(&self, job_uuid: &str, _requeue: bool) -> Result<bool> {
        let running = self.control.current_job.lock().as_deref() == Some(job_uuid);
        if running {
            self.control.cancelled.lock().insert(job_uuid.to_string());
        }
        log::debug!(
            "drone {} asked to cancel job {} (running: {})",
            self.control.uuid(),
            job_uuid,
            running
        );
        Ok(running)
    }

    fn update_configuration(&self, props: BTreeMap<String, String>, restart: bool) -> Result<()> {
        if self.control.is_stopped() {
            return Err(GridError::Management(format!(
                "drone {} is stopped",
                self.control.uuid()
            )));
        }
        self.control.properties.lock().extend(props);
        if restart {
            self.control.restart.store(true, Ordering::Release);
        }
        log::debug!(
            "drone {} configuration updated (restart: {})",
            self.control.uuid(),
            restart
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.control.is_stopped()
    }

    fn peer_node_count(&self) -> Result<Option<usize>> {
        Ok(self
            .control
            .properties
            .lock()
            .get(keys::PEER_TOTAL_NODES)
            .and_then(|v| v.parse().ok()))
    }
}

/// 进程内工蜂目录, 以公布的端口为键
#[derive(Debug)]
pub struct DroneRegistry {
    drones: RwLock<HashMap<u16, Arc<DroneControl>>>,
    next_port: AtomicU16,
}

impl Default for DroneRegistry {
    fn default() -> Self {
        Self {
            drones: RwLock::new(HashMap::new()),
            next_port: AtomicU16::new(1),
        }
    }
}

impl DroneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, control: Arc<DroneControl>) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        self.drones.write().insert(port, control);
        port
    }

    pub fn unregister(&self, port: u16) {
        self.drones.write().remove(&port);
    }

    pub fn len(&self) -> usize {
        self.drones.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ManagementConnector for DroneRegistry {
    fn connect(&self, info: &ManagementInfo) -> Result<Arc<dyn ManagementConnection>> {
        if info.host != IN_PROCESS_HOST {
            return Err(GridError::Management(format!(
                "{}:{} is not an in-process drone",
                info.host, info.port
            )));
        }
        let control = self
            .drones
            .read()
            .get(&info.port)
            .cloned()
            .ok_or_else(|| GridError::Management(format!("no drone on port {}", info.port)))?;
        Ok(Arc::new(DroneConnection { control }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(port: u16) -> ManagementInfo {
        ManagementInfo {
            host: IN_PROCESS_HOST.into(),
            port,
            node_uuid: "n".into(),
            ..Default::default()
        }
    }

    #[test]
    fn configuration_push_merges_and_flags_restart() {
        let registry = DroneRegistry::new();
        let control = Arc::new(DroneControl::new("n".into(), BTreeMap::new()));
        let port = registry.register(Arc::clone(&control));
        let conn = registry.connect(&info(port)).unwrap();
        let mut props = BTreeMap::new();
        props.insert("jvm".to_string(), "17".to_string());
        conn.update_configuration(props, true).unwrap();
        assert_eq!(control.properties().get("jvm").map(String::as_str), Some("17"));
        assert!(control.take_restart());
        assert!(!control.take_restart());
    }

    #[test]
    fn cancel_only_hits_the_running_job() {
        let registry = DroneRegistry::new();
        let control = Arc::new(DroneControl::new("n".into(), BTreeMap::new()));
        let port = registry.register(Arc::clone(&control));
        let conn = registry.connect(&info(port)).unwrap();
        control.set_current_job(Some("j1".into()));
        assert!(!conn.cancel_job("j2", false).unwrap());
        assert!(conn.cancel_job("j1", false).unwrap());
        assert!(control.was_cancelled("j1"));
        assert!(registry.connect(&info(port + 1)).is_err());
    }
}
