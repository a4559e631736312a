//! 全局错误类型

use std::io;

use crate::policy::PolicyError;
use crate::queen::state::{NodeEvent, NodeState};

/// 调度引擎的错误
#[derive(thiserror::Error, Debug)]
pub enum GridError {
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    #[error("消息头解码失败: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("消息头编码失败: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("配置错误: {0}")]
    Config(#[from] serde_json::Error),

    #[error("bincode 序列化错误: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("执行策略错误: {0}")]
    Policy(#[from] PolicyError),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("数据块大小 {size} 字节超过上限 {limit} 字节")]
    BlobTooLarge { size: usize, limit: usize },

    #[error("无法序列化位置 {position} 的任务: {reason}")]
    TaskSerialization { position: u32, reason: String },

    #[error("状态 {state:?} 下不允许事件 {event:?}")]
    InvalidTransition { state: NodeState, event: NodeEvent },

    #[error("通道 {0} 已关闭")]
    ChannelClosed(String),

    #[error("通道 {0} 已有消息在传输中")]
    ChannelBusy(String),

    #[error("负载均衡器错误: {0}")]
    Bundler(String),

    #[error("管理连接错误: {0}")]
    Management(String),

    #[error("作业不存在: {0}")]
    JobNotFound(String),

    #[error("驱动正在关闭")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, GridError>;
