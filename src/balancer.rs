//! 负载均衡模块
//!
//! [`Bundler`] 绑定到一个节点通道, 给出下一次分发应携带的任务数。
//! [`BundlerFactory`] 按当前的 [`LoadBalancingConfig`] 创建 bundler,
//! 并记录最后更新时间, 通道据此判断缓存的实例是否过期。

mod adaptive;
mod fixed;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

pub use adaptive::AdaptiveBundler;
pub use fixed::FixedBundler;

use crate::config::LoadBalancingConfig;
use crate::system_info::SystemInfo;
use crate::{GridError, Result};

pub const MANUAL: &str = "manual";
pub const ADAPTIVE: &str = "adaptive";

/// 通道当前服务的作业
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobContext {
    pub job_uuid: String,
    pub job_name: String,
    pub task_count: usize,
}

pub trait Bundler: Send {
    fn algorithm(&self) -> &'static str;

    /// 下一次分发的建议任务数
    fn bundle_size(&self) -> usize;

    /// 上一次分发的反馈
    fn feedback(&mut self, task_count: usize, elapsed: Duration);

    /// 创建时间, 与 [`BundlerFactory::last_update_time`] 比较
    fn timestamp(&self) -> Instant;

    fn setup(&mut self) {}

    fn dispose(&mut self) {}

    fn set_channel_configuration(&mut self, _info: &SystemInfo) {}

    fn set_job_context(&mut self, _job: &JobContext) {}

    /// 序列化的学习状态(算法有状态时)
    fn state(&self) -> Option<Vec<u8>> {
        None
    }

    fn restore(&mut self, _state: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct BundlerFactory {
    config: RwLock<LoadBalancingConfig>,
    last_update: RwLock<Instant>,
    /// 节点标识 -> (算法, 状态)
    saved: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl BundlerFactory {
    pub fn new(config: LoadBalancingConfig) -> Self {
        Self {
            config: RwLock::new(config),
            last_update: RwLock::new(Instant::now()),
            saved: Mutex::new(HashMap::new()),
        }
    }

    /// 加载配置的 bundler 失败时使用的单任务 bundler
    pub fn fallback_bundler(&self) -> Box<dyn Bundler> {
        Box::new(FixedBundler::new(1))
    }

    pub fn last_update_time(&self) -> Instant {
        *self.last_update.read()
    }

    pub fn configuration(&self) -> LoadBalancingConfig {
        self.config.read().clone()
    }

    /// 替换配置, 各通道在下一次分发时重建 bundler
    pub fn set_configuration(&self, config: LoadBalancingConfig) {
        log::info!("load-balancing configuration changed to {:?}", config);
        *self.config.write() = config;
        *self.last_update.write() = Instant::now();
    }

    /// 为标识为 `node_identifier` 的节点创建 bundler,
    /// 算法相同时恢复之前保存的状态
    pub fn load_bundler(&self, node_identifier: &str) -> Result<(String, Box<dyn Bundler>)> {
        let config = self.configuration();
        let mut bundler: Box<dyn Bundler> = match config.algorithm.as_str() {
            MANUAL => Box::new(FixedBundler::new(config.size)),
            ADAPTIVE => Box::new(AdaptiveBundler::new(&config)),
            other => {
                return Err(GridError::Bundler(format!(
                    "unknown load-balancing algorithm '{}'",
                    other
                )))
            }
        };
        let saved = self.saved.lock().get(node_identifier).cloned();
        if let Some((algorithm, state)) = saved {
            if algorithm == config.algorithm {
                if let Err(e) = bundler.restore(&state) {
                    log::warn!("discarding saved bundler state of {}: {}", node_identifier, e);
                }
            }
        }
        bundler.setup();
        Ok((config.algorithm, bundler))
    }

    pub fn store_bundler(&self, node_identifier: &str, bundler: &dyn Bundler) {
        if let Some(state) = bundler.state() {
            self.saved
                .lock()
                .insert(node_identifier.to_string(), (bundler.algorithm().to_string(), state));
        }
    }

    pub fn has_saved_state(&self, node_identifier: &str) -> bool {
        self.saved.lock().contains_key(node_identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_algorithm_is_an_error() {
        let factory = BundlerFactory::new(LoadBalancingConfig {
            algorithm: "quantum".into(),
            ..Default::default()
        });
        assert!(matches!(factory.load_bundler("n1"), Err(GridError::Bundler(_))));
        assert_eq!(factory.fallback_bundler().bundle_size(), 1);
    }

    #[test]
    fn configuration_change_bumps_timestamp() {
        let factory = BundlerFactory::new(LoadBalancingConfig::default());
        let (_, bundler) = factory.load_bundler("n1").unwrap();
        assert!(factory.last_update_time() <= bundler.timestamp());
        std::thread::sleep(Duration::from_millis(2));
        factory.set_configuration(LoadBalancingConfig {
            size: 42,
            ..Default::default()
        });
        assert!(factory.last_update_time() > bundler.timestamp());
        let (algo, fresh) = factory.load_bundler("n1").unwrap();
        assert_eq!(algo, MANUAL);
        assert_eq!(fresh.bundle_size(), 42);
    }

    #[test]
    fn state_is_restored_by_node_identifier() {
        let factory = BundlerFactory::new(LoadBalancingConfig {
            algorithm: ADAPTIVE.into(),
            size: 4,
            target_ms: 100,
            alpha: 1.0,
            ..Default::default()
        });
        let (_, mut bundler) = factory.load_bundler("host:1:node").unwrap();
        bundler.feedback(10, Duration::from_millis(10));
        let learned = bundler.bundle_size();
        assert_ne!(learned, 4);
        factory.store_bundler("host:1:node", bundler.as_ref());

        let (_, restored) = factory.load_bundler("host:1:node").unwrap();
        assert_eq!(restored.bundle_size(), learned);
        let (_, other) = factory.load_bundler("host:2:node").unwrap();
        assert_eq!(other.bundle_size(), 4);
    }
}
