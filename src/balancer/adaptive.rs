//! 基于 EMA 的自适应 bundler
//!
//! 跟踪节点上单个任务耗时的指数移动平均,
//! 使下一个 bundle 的耗时接近 `target_ms`。

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{Bundler, ADAPTIVE};
use crate::config::LoadBalancingConfig;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct AdaptiveState {
    /// 平滑后的单任务纳秒数
    ema_nanos: Option<f64>,
    size: usize,
}

#[derive(Debug, Clone)]
pub struct AdaptiveBundler {
    alpha: f64,
    target: Duration,
    min_size: usize,
    max_size: usize,
    state: AdaptiveState,
    created: Instant,
}

impl AdaptiveBundler {
    pub fn new(config: &LoadBalancingConfig) -> Self {
        let min_size = config.min_size.max(1);
        let max_size = config.max_size.max(min_size);
        Self {
            alpha: config.alpha.clamp(f64::EPSILON, 1.0),
            target: Duration::from_millis(config.target_ms.max(1)),
            min_size,
            max_size,
            state: AdaptiveState {
                ema_nanos: None,
                size: config.size.clamp(min_size, max_size),
            },
            created: Instant::now(),
        }
    }

    /// 平滑后的单任务耗时, 至少收到一次反馈后才有值
    pub fn mean_task_time(&self) -> Option<Duration> {
        self.state.ema_nanos.map(|n| Duration::from_nanos(n as u64))
    }
}

impl Bundler for AdaptiveBundler {
    fn algorithm(&self) -> &'static str {
        ADAPTIVE
    }

    fn bundle_size(&self) -> usize {
        self.state.size
    }

    fn feedback(&mut self, task_count: usize, elapsed: Duration) {
        if task_count == 0 {
            return;
        }
        let sample = elapsed.as_nanos() as f64 / task_count as f64;
        let ema = match self.state.ema_nanos {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.state.ema_nanos = Some(ema);
        let ideal = if ema <= 0.0 {
            self.max_size as f64
        } else {
            self.target.as_nanos() as f64 / ema
        };
        self.state.size = (ideal.round() as usize).clamp(self.min_size, self.max_size);
        log::trace!(
            "adaptive bundler: {} tasks in {:?}, ema={:.0}ns, next size={}",
            task_count,
            elapsed,
            ema,
            self.state.size
        );
    }

    fn timestamp(&self) -> Instant {
        self.created
    }

    fn state(&self) -> Option<Vec<u8>> {
        bincode::serialize(&self.state).ok()
    }

    fn restore(&mut self, state: &[u8]) -> Result<()> {
        let restored: AdaptiveState = bincode::deserialize(state)?;
        self.state = AdaptiveState {
            ema_nanos: restored.ema_nanos,
            size: restored.size.clamp(self.min_size, self.max_size),
        };
        Ok(())
    }
}
