//! 节点与驱动的系统信息
//!
//! 扁平的字符串属性表, 附带类型化读取方法。握手时交换,
//! 由执行策略求值。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sysinfo::{System, SystemExt};

/// 常用属性名
pub mod keys {
    pub const UUID: &str = "node.uuid";
    pub const TAGS: &str = "node.tags";
    pub const PROCESSING_THREADS: &str = "processing.threads";
    pub const TOTAL_MEMORY: &str = "memory.total";
    pub const AVAILABLE_PROCESSORS: &str = "processors.available";
    pub const PEER: &str = "node.peer";
    pub const LOCAL: &str = "node.local";
    pub const IDLE: &str = "node.idle";
    pub const PEER_TOTAL_NODES: &str = "peer.total.nodes";
    pub const PROVISIONING_MASTER: &str = "provisioning.master";
    pub const PROVISIONING_SLAVE: &str = "provisioning.slave";
    pub const PROVISIONING_MASTER_UUID: &str = "provisioning.master.uuid";
    pub const RESERVED_JOB: &str = "node.reserved.job";
    pub const RESERVED_UUID: &str = "node.reserved.uuid";

    pub const GRID_TOTAL_NODES: &str = "grid.nodes.total";
    pub const GRID_IDLE_NODES: &str = "grid.nodes.idle";
    pub const GRID_QUEUED_JOBS: &str = "grid.jobs.queued";
    pub const DRIVER_UUID: &str = "driver.uuid";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    props: BTreeMap<String, String>,
}

impl SystemInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// 采集本机信息
    pub fn collect_local() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let mut info = Self::new();
        info.set(keys::AVAILABLE_PROCESSORS, num_cpus::get());
        info.set(keys::PROCESSING_THREADS, num_cpus::get());
        info.set(keys::TOTAL_MEMORY, sys.total_memory());
        info
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.props.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.props.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// [`keys::TAGS`] 下逗号分隔的标签列表
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.get(keys::TAGS)
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn merge(&mut self, other: &BTreeMap<String, String>) {
        for (k, v) in other {
            self.props.insert(k.clone(), v.clone());
        }
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.props
    }

    pub fn into_properties(self) -> BTreeMap<String, String> {
        self.props
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// 主节点或其从节点对应的主节点 uuid
    pub fn master_uuid(&self) -> Option<&str> {
        if self.get_bool(keys::PROVISIONING_MASTER) {
            self.get(keys::UUID)
        } else if self.get_bool(keys::PROVISIONING_SLAVE) {
            self.get(keys::PROVISIONING_MASTER_UUID)
        } else {
            None
        }
    }
}

impl From<BTreeMap<String, String>> for SystemInfo {
    fn from(props: BTreeMap<String, String>) -> Self {
        Self { props }
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for SystemInfo {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut info = SystemInfo::new();
        for (k, v) in iter {
            info.set(k, v);
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let info = SystemInfo::new()
            .with(keys::PROCESSING_THREADS, 8)
            .with(keys::PEER, true)
            .with(keys::TAGS, "gpu, fast ,,");
        assert_eq!(info.get_i64(keys::PROCESSING_THREADS), Some(8));
        assert!(info.get_bool(keys::PEER));
        assert!(!info.get_bool(keys::LOCAL));
        assert_eq!(info.tags().collect::<Vec<_>>(), vec!["gpu", "fast"]);
    }

    #[test]
    fn master_uuid_for_master_and_slave() {
        let master = SystemInfo::new()
            .with(keys::UUID, "m1")
            .with(keys::PROVISIONING_MASTER, true);
        let slave = SystemInfo::new()
            .with(keys::UUID, "s1")
            .with(keys::PROVISIONING_SLAVE, true)
            .with(keys::PROVISIONING_MASTER_UUID, "m1");
        assert_eq!(master.master_uuid(), Some("m1"));
        assert_eq!(slave.master_uuid(), Some("m1"));
        assert_eq!(SystemInfo::new().master_uuid(), None);
    }

    #[test]
    fn local_collection_reports_processors() {
        let info = SystemInfo::collect_local();
        assert!(info.get_i64(keys::AVAILABLE_PROCESSORS).unwrap_or(0) >= 1);
    }
}
