//! 节点通道状态机
//!
//! [`transition`] 是纯函数表, 返回的动作由通道自行执行,
//! 因此无需 socket 即可测试。

use crate::{GridError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    SendInitialHandshake,
    WaitInitialHandshake,
    Idle,
    SendingBatch,
    WaitingResults,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEvent {
    HandshakeSent,
    HandshakeReceived,
    /// 只由调度线程触发
    DispatchRequested,
    /// 作业已经过该节点
    BatchRejected,
    BatchSent,
    ResultsReceived,
    IoError,
    Shutdown,
}

/// 状态转换要求的副作用, 按顺序执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeAction {
    WatchRead,
    WatchWrite,
    AddIdle,
    RemoveIdle,
    ScheduleExpiration,
    CancelExpiration,
    ProcessResults,
    ResubmitBundle,
    ReleaseResources,
    Deregister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: NodeState,
    pub actions: &'static [NodeAction],
}

use NodeAction::*;

const CLOSE: &[NodeAction] = &[
    CancelExpiration,
    RemoveIdle,
    ResubmitBundle,
    ReleaseResources,
    Deregister,
];

pub fn transition(state: NodeState, event: NodeEvent) -> Result<Transition> {
    use NodeEvent as E;
    use NodeState as S;
    let (next, actions): (NodeState, &'static [NodeAction]) = match (state, event) {
        (S::Closed, E::IoError | E::Shutdown) => (S::Closed, &[]),
        (_, E::IoError | E::Shutdown) => (S::Closed, CLOSE),
        (S::SendInitialHandshake, E::HandshakeSent) => (S::WaitInitialHandshake, &[WatchRead]),
        (S::WaitInitialHandshake, E::HandshakeReceived) => (S::Idle, &[WatchRead, AddIdle]),
        (S::Idle, E::DispatchRequested) => (S::SendingBatch, &[WatchWrite]),
        (S::SendingBatch, E::BatchRejected) => (S::Idle, &[WatchRead, ResubmitBundle, AddIdle]),
        (S::SendingBatch, E::BatchSent) => (S::WaitingResults, &[WatchRead, ScheduleExpiration]),
        (S::WaitingResults, E::ResultsReceived) => {
            (S::Idle, &[CancelExpiration, WatchRead, ProcessResults, AddIdle])
        }
        (state, event) => return Err(GridError::InvalidTransition { state, event }),
    };
    Ok(Transition { next, actions })
}

impl NodeState {
    /// 通道被分配了一批任务
    pub fn is_busy(self) -> bool {
        matches!(self, NodeState::SendingBatch | NodeState::WaitingResults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_cycle() {
        let mut state = NodeState::SendInitialHandshake;
        for event in [
            NodeEvent::HandshakeSent,
            NodeEvent::HandshakeReceived,
            NodeEvent::DispatchRequested,
            NodeEvent::BatchSent,
            NodeEvent::ResultsReceived,
        ] {
            state = transition(state, event).unwrap().next;
        }
        assert_eq!(state, NodeState::Idle);
    }

    #[test]
    fn dispatch_only_from_idle() {
        for state in [
            NodeState::SendInitialHandshake,
            NodeState::WaitInitialHandshake,
            NodeState::SendingBatch,
            NodeState::WaitingResults,
            NodeState::Closed,
        ] {
            assert!(matches!(
                transition(state, NodeEvent::DispatchRequested),
                Err(GridError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn close_is_idempotent() {
        let first = transition(NodeState::WaitingResults, NodeEvent::IoError).unwrap();
        assert_eq!(first.next, NodeState::Closed);
        assert!(first.actions.contains(&NodeAction::ResubmitBundle));
        let second = transition(first.next, NodeEvent::Shutdown).unwrap();
        assert!(second.actions.is_empty());
    }

    #[test]
    fn expiration_is_armed_once_the_batch_is_out() {
        let t = transition(NodeState::SendingBatch, NodeEvent::BatchSent).unwrap();
        assert!(t.actions.contains(&NodeAction::ScheduleExpiration));
        let t = transition(NodeState::WaitingResults, NodeEvent::ResultsReceived).unwrap();
        assert_eq!(t.actions[0], NodeAction::CancelExpiration);
    }
}
