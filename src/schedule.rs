//! 延时动作(作业启动, 作业过期, 分发超时)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// 动作的触发时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
    /// 相对于登记时刻
    After(Duration),
    /// 绝对时间, 已过去的时间立即触发
    At(DateTime<Utc>),
}

impl Schedule {
    pub fn delay_from_now(&self) -> Duration {
        match self {
            Schedule::After(d) => *d,
            Schedule::At(at) => (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/// 基于 tokio 运行时的按键一次性定时器
///
/// 同一个键重复登记时替换之前的动作
#[derive(Clone)]
pub struct ScheduleHandler {
    name: &'static str,
    runtime: Handle,
    actions: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl ScheduleHandler {
    pub fn new(name: &'static str, runtime: Handle) -> Self {
        Self {
            name,
            runtime,
            actions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn schedule_action<F>(&self, key: impl Into<String>, schedule: &Schedule, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let key = key.into();
        let delay = schedule.delay_from_now();
        let actions = Arc::clone(&self.actions);
        let name = self.name;
        let task_key = key.clone();
        // spawn 期间持有锁, 保证任务不会在插入前删除自己的条目
        let mut guard = self.actions.lock();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if actions.lock().remove(&task_key).is_some() {
                log::debug!("{} action '{}' fired after {:?}", name, task_key, delay);
                action();
            }
        });
        if let Some(previous) = guard.insert(key, handle.abort_handle()) {
            previous.abort();
        }
    }

    /// 取消了尚未触发的动作时返回 true
    pub fn cancel_action(&self, key: &str) -> bool {
        match self.actions.lock().remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_action(&self, key: &str) -> bool {
        self.actions.lock().contains_key(key)
    }

    pub fn clear(&self) {
        for (_, handle) in self.actions.lock().drain() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ScheduleHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleHandler")
            .field("name", &self.name)
            .field("pending", &self.actions.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap()
    }

    #[test]
    fn action_fires_once() {
        let rt = runtime();
        let handler = ScheduleHandler::new("test", rt.handle().clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        handler.schedule_action("a", &Schedule::After(Duration::from_millis(10)), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!handler.has_action("a"));
    }

    #[test]
    fn cancelled_action_never_fires() {
        let rt = runtime();
        let handler = ScheduleHandler::new("test", rt.handle().clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        handler.schedule_action("a", &Schedule::After(Duration::from_millis(50)), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handler.cancel_action("a"));
        assert!(!handler.cancel_action("a"));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn past_date_has_zero_delay() {
        let past = Schedule::At(Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(past.delay_from_now(), Duration::ZERO);
    }
}
