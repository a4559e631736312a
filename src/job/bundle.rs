//! 分发单元: 一个作业的一部分任务, 发往一个节点

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Job, Task, TaskOutcome};

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

/// [`NodeBundle::finish`] 的胜出方拿到的内容
#[derive(Debug, Default)]
pub(crate) struct Finished {
    pub tasks: Vec<Task>,
    /// 未写入消息体的任务及其失败结果
    pub excluded: Vec<(Task, TaskOutcome)>,
}

impl Finished {
    pub fn excluded_outcomes(&mut self) -> Vec<(u32, TaskOutcome)> {
        self.excluded
            .drain(..)
            .map(|(task, outcome)| (task.position, outcome))
            .collect()
    }

    /// 全部任务, 包括被排除的
    pub fn all_tasks(self) -> Vec<Task> {
        let mut tasks = self.tasks;
        tasks.extend(self.excluded.into_iter().map(|(task, _)| task));
        tasks
    }
}

pub struct NodeBundle {
    id: u64,
    job: Arc<Job>,
    node_uuid: String,
    positions: Vec<u32>,
    tasks: Mutex<Vec<Task>>,
    excluded: Mutex<Vec<(Task, TaskOutcome)>>,
    created: Instant,
    /// 由结束分发的一方设置一次(结果返回, 通道错误, 超时, 取消)
    finished: AtomicBool,
    expired: AtomicBool,
    cancelled: AtomicBool,
}

impl NodeBundle {
    pub fn new(job: Arc<Job>, tasks: Vec<Task>, node_uuid: impl Into<String>) -> Self {
        let positions = tasks.iter().map(|t| t.position).collect();
        Self {
            id: NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed),
            job,
            node_uuid: node_uuid.into(),
            positions,
            tasks: Mutex::new(tasks),
            excluded: Mutex::new(Vec::new()),
            created: Instant::now(),
            finished: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    pub fn positions(&self) -> Vec<u32> {
        self.positions.clone()
    }

    pub fn task_count(&self) -> usize {
        self.positions.len()
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// 用于序列化的任务副本, 结束后为空
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().clone()
    }

    /// 分发超时动作的键
    pub fn key(&self) -> String {
        format!("{}:{}", self.job.uuid(), self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_expired(&self) {
        self.expired.store(true, Ordering::Release);
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// 从消息体中排除任务, 例如数据无法读取
    pub(crate) fn exclude(&self, position: u32, outcome: TaskOutcome) {
        let mut tasks = self.tasks.lock();
        if let Some(idx) = tasks.iter().position(|t| t.position == position) {
            let task = tasks.remove(idx);
            self.excluded.lock().push((task, outcome));
        }
    }

    /// 申请结束分发, 只有第一个调用者拿回任务
    pub(crate) fn finish(&self) -> Option<Finished> {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(Finished {
            tasks: std::mem::take(&mut *self.tasks.lock()),
            excluded: std::mem::take(&mut *self.excluded.lock()),
        })
    }
}

impl fmt::Debug for NodeBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBundle")
            .field("id", &self.id)
            .field("job", &self.job.uuid())
            .field("node", &self.node_uuid)
            .field("tasks", &self.positions.len())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_exactly_once() {
        let job = Job::builder("b").task(vec![1]).task(vec![2]).build();
        let bundle = Arc::new(NodeBundle::new(Arc::clone(&job), job.take_tasks(2), "n"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&bundle);
                std::thread::spawn(move || b.finish().map(|f| f.tasks.len()))
            })
            .collect();
        let winners: Vec<usize> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners, vec![2]);
        assert!(bundle.tasks().is_empty());
    }
}
