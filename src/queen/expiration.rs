//! 分发超时
//!
//! 超过作业 `dispatch_expiration` 的分发由定时器结束: 请求节点取消,
//! 未超过过期上限的任务重新入队, 其余任务失败。
//! 通道保持打开, 收到节点迟到的应答后重新空闲。

use std::sync::Arc;

use super::channel::NodeChannel;
use crate::context::DriverContext;
use crate::job::{self, NodeBundle, ReturnReason};
use crate::schedule::Schedule;

/// 为刚发出的 bundle 登记超时定时器
pub(crate) fn schedule(ctx: &Arc<DriverContext>, channel: &Arc<NodeChannel>, bundle: &Arc<NodeBundle>) {
    let Some(timeout) = bundle.job().sla().dispatch_expiration else {
        return;
    };
    let weak_ctx = Arc::downgrade(ctx);
    let weak_channel = Arc::downgrade(channel);
    let expiring = Arc::clone(bundle);
    ctx.dispatch_expirations()
        .schedule_action(bundle.key(), &Schedule::After(timeout), move || {
            if let (Some(ctx), Some(channel)) = (weak_ctx.upgrade(), weak_channel.upgrade()) {
                dispatch_expired(&ctx, &channel, &expiring);
            }
        });
}

/// 本次调用结束了分发时返回 true
pub(crate) fn dispatch_expired(
    ctx: &Arc<DriverContext>,
    channel: &Arc<NodeChannel>,
    bundle: &Arc<NodeBundle>,
) -> bool {
    let Some(mut finished) = bundle.finish() else {
        return false;
    };
    bundle.mark_expired();
    ctx.stats().dispatch_expired();
    log::info!(
        "dispatch of {} tasks of job {} to node {} expired after {:?}",
        bundle.task_count(),
        bundle.job().uuid(),
        bundle.node_uuid(),
        bundle.elapsed()
    );
    if let Some(conn) = channel.management() {
        let job_uuid = bundle.job().uuid().to_string();
        ctx.runtime().spawn_blocking(move || {
            if let Err(e) = conn.cancel_job(&job_uuid, false) {
                log::warn!("remote cancel of expired job {} failed: {}", job_uuid, e);
            }
        });
    }
    let mut outcomes = finished.excluded_outcomes();
    let (requeue, failed) = job::expire_or_fail(&bundle.job().sla(), finished.tasks);
    outcomes.extend(failed);
    if !requeue.is_empty() {
        ctx.stats().tasks_resubmitted(requeue.len());
    }
    ctx.queue()
        .bundle_returned(bundle, ReturnReason::DispatchTimeout, outcomes, requeue);
    true
}
