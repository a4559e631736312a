//! 工蜂在 rayon 线程池上执行任务

use std::sync::Arc;

use bytes::Bytes;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::{GridError, Result};

/// 在工蜂上执行单个任务
pub trait TaskRunner: Send + Sync {
    /// `provider` 是作业的共享数据, 没有时为空
    fn run(&self, position: u32, data: &[u8], provider: &[u8]) -> std::result::Result<Bytes, String>;
}

impl<F> TaskRunner for F
where
    F: Fn(u32, &[u8], &[u8]) -> std::result::Result<Bytes, String> + Send + Sync,
{
    fn run(&self, position: u32, data: &[u8], provider: &[u8]) -> std::result::Result<Bytes, String> {
        self(position, data, provider)
    }
}

/// 单个任务在工蜂上的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub position: u32,
    pub output: std::result::Result<Bytes, String>,
}

pub struct TaskQueue {
    pool: ThreadPool,
    runner: Arc<dyn TaskRunner>,
}

impl TaskQueue {
    pub fn new(threads: usize, runner: Arc<dyn TaskRunner>) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("drone-task-{}", i))
            .build()
            .map_err(|e| GridError::Protocol(format!("drone thread pool: {}", e)))?;
        Ok(Self { pool, runner })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// 并行执行一批任务, 结果顺序与 `tasks` 一致
    pub fn execute(&self, provider: &[u8], tasks: &[(u32, Bytes)]) -> Vec<TaskResult> {
        let runner = &self.runner;
        self.pool.install(|| {
            tasks
                .par_iter()
                .map(|(position, data)| TaskResult {
                    position: *position,
                    output: runner.run(*position, data, provider),
                })
                .collect()
        })
    }
}
