//! 作业优先级队列
//!
//! 加锁顺序: 先 `scan` 后 `inner`, 先 `inner` 后作业内部的锁。
//! 监听器在释放 `inner` 之后调用。

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::{Job, NodeBundle, ReturnReason, Task, TaskOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    JobQueued(String),
    JobRemoved(String),
    /// 队列中作业的任务重新可分发
    TasksReturned(String),
    JobUpdated(String),
}

type QueueListener = Box<dyn Fn(&QueueEvent) + Send + Sync>;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Arc<Job>>,
    /// (优先级降序, 提交顺序, uuid)
    order: BTreeSet<(Reverse<i32>, u64, String)>,
    broadcasts: Vec<Arc<Job>>,
}

impl QueueState {
    fn key(job: &Job) -> (Reverse<i32>, u64, String) {
        (Reverse(job.priority()), job.sequence(), job.uuid().to_string())
    }
}

#[derive(Default)]
pub struct JobQueue {
    scan: Mutex<()>,
    inner: Mutex<QueueState>,
    sequence: AtomicU64,
    listeners: RwLock<Vec<QueueListener>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调度线程在一整轮扫描期间持有
    pub fn scan_lock(&self) -> MutexGuard<'_, ()> {
        self.scan.lock()
    }

    pub fn add_listener<F>(&self, f: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(f));
    }

    fn fire(&self, event: QueueEvent) {
        for l in self.listeners.read().iter() {
            l(&event);
        }
    }

    pub fn add_job(&self, job: Arc<Job>) {
        job.set_sequence(self.sequence.fetch_add(1, Ordering::Relaxed));
        let uuid = job.uuid().to_string();
        {
            let mut inner = self.inner.lock();
            let is_broadcast_parent = job.sla().broadcast && job.broadcast_target().is_none();
            if is_broadcast_parent {
                inner.broadcasts.push(Arc::clone(&job));
            } else {
                inner.order.insert(QueueState::key(&job));
            }
            inner.jobs.insert(uuid.clone(), job);
        }
        log::debug!("job {} queued", uuid);
        self.fire(QueueEvent::JobQueued(uuid));
    }

    /// 取出可以展开为节点副本的广播作业, 等待启动时间或已挂起的作业留在队列中
    pub fn take_pending_broadcasts(&self) -> Vec<Arc<Job>> {
        let mut inner = self.inner.lock();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.broadcasts)
            .into_iter()
            .partition(|j| broadcast_ready(j));
        inner.broadcasts = waiting;
        ready
    }

    pub fn has_pending_broadcasts(&self) -> bool {
        self.inner.lock().broadcasts.iter().any(|j| broadcast_ready(j))
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.order.is_empty() && inner.broadcasts.is_empty()
    }

    /// 可分发的作业数
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn get_job(&self, uuid: &str) -> Option<Arc<Job>> {
        self.inner.lock().jobs.get(uuid).cloned()
    }

    /// 按分发顺序的快照: 先优先级, 再提交顺序
    pub fn jobs_by_priority(&self) -> Vec<Arc<Job>> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|(_, _, uuid)| inner.jobs.get(uuid).cloned())
            .collect()
    }

    /// 把 `job` 最多 `size` 个未分发任务切成发往 `node_uuid` 的 bundle
    pub fn next_bundle(&self, job: &Arc<Job>, size: usize, node_uuid: &str) -> Option<NodeBundle> {
        let tasks = job.take_tasks(size.max(1));
        if tasks.is_empty() {
            return None;
        }
        Some(NodeBundle::new(Arc::clone(job), tasks, node_uuid))
    }

    /// 撤销 [`next_bundle`](Self::next_bundle): 任务原样放回, 不计次数,
    /// 同时删除分发记录
    pub fn rollback_bundle(&self, bundle: &NodeBundle) {
        if let Some(finished) = bundle.finish() {
            self.bundle_returned(
                bundle,
                ReturnReason::NodeChannelError,
                Vec::new(),
                finished.all_tasks(),
            );
        }
    }

    /// 分发的最终结算, 作业完成时返回 true
    pub fn bundle_returned(
        &self,
        bundle: &NodeBundle,
        reason: ReturnReason,
        outcomes: Vec<(u32, TaskOutcome)>,
        requeue: Vec<Task>,
    ) -> bool {
        let job = Arc::clone(bundle.job());
        let requeued = !requeue.is_empty();
        let completed = job.dispatch_returned(bundle.id(), reason, outcomes, requeue);
        if completed {
            self.job_completed(&job);
        } else if requeued {
            self.fire(QueueEvent::TasksReturned(job.uuid().to_string()));
        }
        completed
    }

    pub(crate) fn job_completed(&self, job: &Arc<Job>) {
        self.remove_job(job.uuid());
        if let Some(parent) = job.parent() {
            if parent.child_completed(job) {
                self.remove_job(parent.uuid());
            }
        }
    }

    pub fn remove_job(&self, uuid: &str) -> Option<Arc<Job>> {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.jobs.remove(uuid);
            if let Some(job) = &removed {
                inner.order.remove(&QueueState::key(job));
                inner.broadcasts.retain(|j| j.uuid() != uuid);
            }
            removed
        };
        if removed.is_some() {
            self.fire(QueueEvent::JobRemoved(uuid.to_string()));
        }
        removed
    }

    /// 取消作业; 广播作业连同所有节点副本一起取消。
    /// 进行中的分发由调用方处理
    pub fn cancel_job(&self, uuid: &str, reason: ReturnReason) -> Option<Arc<Job>> {
        let _scan = self.scan_lock();
        let job = self.get_job(uuid)?;
        let children = children_of(&self.inner.lock(), uuid);
        for child in children {
            if child.cancel(reason) {
                self.job_completed(&child);
            }
        }
        if job.cancel(reason) {
            self.job_completed(&job);
        }
        log::info!("job {} cancelled ({:?})", uuid, reason);
        Some(job)
    }

    /// 修改作业及其广播副本的优先级
    pub fn update_priority(&self, uuid: &str, priority: i32) -> bool {
        {
            let mut inner = self.inner.lock();
            let Some(job) = inner.jobs.get(uuid).cloned() else {
                return false;
            };
            let mut family = children_of(&inner, uuid);
            family.push(job);
            for job in family {
                let was_ordered = inner.order.remove(&QueueState::key(&job));
                job.set_priority(priority);
                if was_ordered {
                    inner.order.insert(QueueState::key(&job));
                }
            }
        }
        self.fire(QueueEvent::JobUpdated(uuid.to_string()));
        true
    }

    pub fn suspend_job(&self, uuid: &str) -> bool {
        self.set_suspended(uuid, true)
    }

    pub fn resume_job(&self, uuid: &str) -> bool {
        self.set_suspended(uuid, false)
    }

    fn set_suspended(&self, uuid: &str, suspended: bool) -> bool {
        let (job, children) = {
            let inner = self.inner.lock();
            let Some(job) = inner.jobs.get(uuid).cloned() else {
                return false;
            };
            (job, children_of(&inner, uuid))
        };
        job.set_suspended(suspended);
        for child in children {
            child.set_suspended(suspended);
        }
        self.fire(QueueEvent::JobUpdated(uuid.to_string()));
        true
    }

    /// 状态不变但通知监听器, 例如延时作业到达启动时间
    pub fn touch(&self, uuid: &str) {
        self.fire(QueueEvent::JobUpdated(uuid.to_string()));
    }
}

fn broadcast_ready(job: &Job) -> bool {
    job.is_cancelled() || !(job.is_pending() || job.is_suspended())
}

/// 队列中 `uuid` 的广播副本
fn children_of(inner: &QueueState, uuid: &str) -> Vec<Arc<Job>> {
    inner
        .jobs
        .values()
        .filter(|j| j.parent().is_some_and(|p| p.uuid() == uuid))
        .cloned()
        .collect()
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("JobQueue")
            .field("jobs", &inner.jobs.len())
            .field("dispatchable", &inner.order.len())
            .field("broadcasts", &inner.broadcasts.len())
            .finish()
    }
}
