//! 广播作业
//!
//! 广播作业在每个符合条件的节点上各执行一次全部任务。父作业本身从不分发,
//! 而是为每个节点展开一个副本, 副本只发往对应节点;
//! 所有副本完成后父作业完成。

use std::sync::Arc;

use super::{Job, JobQueue};
use crate::policy::PolicyContext;
use crate::system_info::SystemInfo;

/// 可以为其创建广播副本的节点
#[derive(Debug, Clone)]
pub struct BroadcastCandidate {
    pub node_uuid: String,
    pub info: SystemInfo,
}

/// 展开所有就绪的广播作业, 返回入队的副本数
pub fn expand_broadcasts(queue: &JobQueue, candidates: &[BroadcastCandidate]) -> usize {
    let mut queued = 0;
    for parent in queue.take_pending_broadcasts() {
        queued += expand_one(queue, &parent, candidates);
    }
    queued
}

fn expand_one(queue: &JobQueue, parent: &Arc<Job>, candidates: &[BroadcastCandidate]) -> usize {
    if parent.is_cancelled() {
        return 0;
    }
    let sla = parent.sla();
    let ctx = PolicyContext {
        job_uuid: parent.uuid().to_string(),
        job_name: parent.name().to_string(),
        job_channels: 0,
        task_count: parent.task_count(),
    };
    let mut targets: Vec<&BroadcastCandidate> = candidates
        .iter()
        .filter(|c| match &sla.execution_policy {
            None => true,
            Some(policy) => match policy.evaluate(&c.info, &ctx) {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!(
                        "broadcast policy of job {} failed on node {}: {}",
                        parent.uuid(),
                        c.node_uuid,
                        e
                    );
                    false
                }
            },
        })
        .collect();
    targets.dedup_by(|a, b| a.node_uuid == b.node_uuid);
    targets.truncate(sla.max_nodes);

    if targets.is_empty() {
        log::info!("broadcast job {} has no eligible node, ending it", parent.uuid());
        if parent.end_unexecuted("no eligible node for broadcast") {
            queue.remove_job(parent.uuid());
        }
        return 0;
    }
    parent.set_children(targets.len());
    for target in &targets {
        let copy = parent.broadcast_copy(&target.node_uuid);
        log::debug!(
            "broadcast job {} copy {} targets node {}",
            parent.uuid(),
            copy.uuid(),
            target.node_uuid
        );
        queue.add_job(copy);
    }
    targets.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSla, ReturnReason, TaskOutcome};
    use crate::policy::ExecutionPolicy;

    fn broadcast_job() -> Arc<Job> {
        Job::builder("bc")
            .sla(JobSla {
                broadcast: true,
                execution_policy: Some(ExecutionPolicy::equal("os", "linux")),
                ..Default::default()
            })
            .task(vec![1])
            .task(vec![2])
            .build()
    }

    fn node(uuid: &str, os: &str) -> BroadcastCandidate {
        BroadcastCandidate {
            node_uuid: uuid.into(),
            info: SystemInfo::new().with("os", os),
        }
    }

    #[test]
    fn one_copy_per_eligible_node() {
        let queue = JobQueue::new();
        let parent = broadcast_job();
        queue.add_job(Arc::clone(&parent));
        assert!(queue.jobs_by_priority().is_empty());
        let n = expand_broadcasts(
            &queue,
            &[node("a", "linux"), node("b", "windows"), node("c", "linux")],
        );
        assert_eq!(n, 2);
        let copies = queue.jobs_by_priority();
        let targets: Vec<_> = copies.iter().filter_map(|j| j.broadcast_target()).collect();
        assert_eq!(targets, vec!["a", "c"]);

        for copy in copies {
            let bundle = queue.next_bundle(&copy, 10, copy.broadcast_target().unwrap()).unwrap();
            copy.register_dispatch(&bundle, None);
            let outcomes = bundle
                .finish()
                .unwrap()
                .tasks
                .iter()
                .map(|t| (t.position, TaskOutcome::Success(bytes::Bytes::from_static(b"r"))))
                .collect();
            queue.bundle_returned(&bundle, ReturnReason::ResultsReceived, outcomes, Vec::new());
        }
        assert!(parent.is_complete());
        assert_eq!(parent.results().len(), 2);
        assert!(queue.get_job(parent.uuid()).is_none());
    }

    #[test]
    fn no_eligible_node_ends_parent() {
        let queue = JobQueue::new();
        let parent = broadcast_job();
        queue.add_job(Arc::clone(&parent));
        assert_eq!(expand_broadcasts(&queue, &[node("w", "windows")]), 0);
        assert!(parent.is_complete());
        assert!(parent.results().values().all(|o| !o.is_success()));
        assert!(queue.is_empty());
    }

    #[test]
    fn parent_waiting_for_its_start_is_kept() {
        let queue = JobQueue::new();
        let parent = broadcast_job();
        parent.set_pending(true);
        queue.add_job(Arc::clone(&parent));
        let nodes = [node("a", "linux")];

        assert!(!queue.has_pending_broadcasts());
        assert_eq!(expand_broadcasts(&queue, &nodes), 0);
        assert!(!parent.is_complete());
        assert!(!queue.is_empty());

        parent.set_pending(false);
        assert!(queue.has_pending_broadcasts());
        assert_eq!(expand_broadcasts(&queue, &nodes), 1);
    }

    #[test]
    fn suspended_parent_expands_on_resume_and_copies_follow_it() {
        let queue = JobQueue::new();
        let parent = Job::builder("bc")
            .sla(JobSla {
                broadcast: true,
                suspended: true,
                ..Default::default()
            })
            .task(vec![1])
            .build();
        queue.add_job(Arc::clone(&parent));
        let nodes = [node("a", "linux"), node("b", "linux")];
        assert_eq!(expand_broadcasts(&queue, &nodes), 0);

        assert!(queue.resume_job(parent.uuid()));
        assert_eq!(expand_broadcasts(&queue, &nodes), 2);
        let copies = queue.jobs_by_priority();
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().all(|c| !c.is_suspended()));

        assert!(queue.suspend_job(parent.uuid()));
        assert!(copies.iter().all(|c| c.is_suspended()));
        assert!(queue.update_priority(parent.uuid(), 7));
        assert!(queue.jobs_by_priority().iter().all(|c| c.priority() == 7));
    }
}
