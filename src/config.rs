use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// 负载均衡配置, 交给 bundler 工厂使用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    /// `"manual"` 为固定大小, `"adaptive"` 为基于 EMA 的自适应 bundler
    pub algorithm: String,
    /// `"manual"` 的固定大小, 也是 `"adaptive"` 的初始大小
    pub size: usize,
    /// 自适应 bundler 每次分发的目标耗时
    pub target_ms: u64,
    /// EMA平滑系数(0-1)
    pub alpha: f64,
    pub min_size: usize,
    pub max_size: usize,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: "manual".to_string(),
            size: 5,
            target_ms: 1000,
            alpha: 0.5,
            min_size: 1,
            max_size: 10_000,
        }
    }
}

/// 驱动配置
///
/// 所有字段都有默认值, 只写部分字段的 JSON 也可以加载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub listen_addr: SocketAddr,
    /// 未配置时自动生成
    pub driver_uuid: Option<String>,
    /// 一轮调度没有分发任何任务时的休眠时间
    pub queue_check_interval_ms: u64,
    /// 真实节点数低于该值时才向对等驱动分发
    pub peer_load_balance_threshold: usize,
    pub dispatch_to_peers_without_node: bool,
    /// 本地节点空闲时优先分发给它
    pub local_node_bias: bool,
    /// 副作用线程池大小(管理调用, 定时器)
    pub executor_threads: usize,
    pub max_blob_size: usize,
    pub management_enabled: bool,
    pub peer_poll_interval_ms: u64,
    pub load_balancing: LoadBalancingConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 11111)),
            driver_uuid: None,
            queue_check_interval_ms: 1000,
            peer_load_balance_threshold: usize::MAX,
            dispatch_to_peers_without_node: false,
            local_node_bias: true,
            executor_threads: num_cpus::get().max(2),
            max_blob_size: 64 * 1024 * 1024,
            management_enabled: true,
            peer_poll_interval_ms: 5000,
            load_balancing: LoadBalancingConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_load_balancing(mut self, load_balancing: LoadBalancingConfig) -> Self {
        self.load_balancing = load_balancing;
        self
    }

    pub fn with_queue_check_interval(mut self, interval: Duration) -> Self {
        self.queue_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_local_node_bias(mut self, enabled: bool) -> Self {
        self.local_node_bias = enabled;
        self
    }

    pub fn with_driver_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.driver_uuid = Some(uuid.into());
        self
    }

    pub fn with_peer_load_balance_threshold(mut self, threshold: usize) -> Self {
        self.peer_load_balance_threshold = threshold;
        self
    }

    pub fn queue_check_interval(&self) -> Duration {
        Duration::from_millis(self.queue_check_interval_ms.max(1))
    }

    pub fn peer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.peer_poll_interval_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = DriverConfig::from_json_str(
            r#"{ "listen_addr": "0.0.0.0:12000", "local_node_bias": false,
                 "load_balancing": { "algorithm": "adaptive" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.listen_addr.port(), 12000);
        assert!(!cfg.local_node_bias);
        assert_eq!(cfg.load_balancing.algorithm, "adaptive");
        assert_eq!(cfg.load_balancing.size, 5);
        assert_eq!(cfg.queue_check_interval_ms, 1000);
        assert_eq!(cfg.peer_load_balance_threshold, usize::MAX);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = DriverConfig::from_json_str("{ listen_addr: ").unwrap_err();
        assert!(matches!(err, crate::GridError::Config(_)));
    }

    #[test]
    fn queue_check_interval_is_never_zero() {
        let cfg = DriverConfig::default().with_queue_check_interval(Duration::ZERO);
        assert_eq!(cfg.queue_check_interval(), Duration::from_millis(1));
    }
}
