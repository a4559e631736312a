use std::time::{Duration, Instant};

use super::{Bundler, MANUAL};

/// 始终给出相同的 bundle 大小
#[derive(Debug, Clone)]
pub struct FixedBundler {
    size: usize,
    created: Instant,
}

impl FixedBundler {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            created: Instant::now(),
        }
    }
}

impl Bundler for FixedBundler {
    fn algorithm(&self) -> &'static str {
        MANUAL
    }

    fn bundle_size(&self) -> usize {
        self.size
    }

    fn feedback(&mut self, _task_count: usize, _elapsed: Duration) {}

    fn timestamp(&self) -> Instant {
        self.created
    }
}
