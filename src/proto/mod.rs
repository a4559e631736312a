//! 线协议: 驱动与节点之间的消息格式
//!
//! 每条消息由若干带长度前缀的数据块组成。第一个数据块是 prost 编码的 [`BundleHeader`];
//! 分发消息随后携带作业的 data provider(没有时为空块), 再跟每个任务一个数据块;
//! 结果消息为每个返回的任务携带一个数据块。

pub mod codec;

use bytes::Bytes;
use prost::Message as _;

pub use codec::{encode_frame, MessageReader, MessageWriter};

use crate::Result;

/// 与节点交换的每条消息的消息头
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BundleHeader {
    /// 不带任务的身份交换
    #[prost(bool, tag = "1")]
    pub handshake: bool,
    #[prost(string, tag = "2")]
    pub job_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub job_name: ::prost::alloc::string::String,
    #[prost(uint64, tag = "4")]
    pub bundle_id: u64,
    #[prost(uint32, tag = "5")]
    pub task_count: u32,
    /// 任务数据块对应的位置, 与数据块顺序一致
    #[prost(uint32, repeated, tag = "6")]
    pub task_positions: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, repeated, tag = "7")]
    pub resubmit_counts: ::prost::alloc::vec::Vec<u32>,
    /// 每个任务的重提交上限, 转发给对等驱动
    #[prost(uint32, repeated, tag = "8")]
    pub max_resubmits: ::prost::alloc::vec::Vec<u32>,
    #[prost(map = "string, string", tag = "9")]
    pub metadata: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// 驱动参数(握手)或 SLA 摘要(分发)
    #[prost(map = "string, string", tag = "10")]
    pub parameters: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// 节点系统信息, 节点在握手时发送
    #[prost(map = "string, string", tag = "11")]
    pub system_info: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// 作业已经过的驱动, 发送时包含本驱动
    #[prost(string, repeated, tag = "12")]
    pub uuid_path: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "13")]
    pub node_uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "14")]
    pub driver_uuid: ::prost::alloc::string::String,
    #[prost(bool, tag = "15")]
    pub is_peer: bool,
    #[prost(bool, tag = "16")]
    pub is_local: bool,
    #[prost(string, tag = "17")]
    pub management_host: ::prost::alloc::string::String,
    #[prost(uint32, tag = "18")]
    pub management_port: u32,
    /// 限流: `Some(false)` 表示节点暂不接收新作业
    #[prost(bool, optional, tag = "19")]
    pub accepts_new_jobs: ::core::option::Option<bool>,
    /// 节点上整批失败
    #[prost(string, optional, tag = "20")]
    pub node_exception: ::core::option::Option<::prost::alloc::string::String>,
    /// 节点要求重新执行的任务
    #[prost(uint32, repeated, tag = "21")]
    pub resubmit_positions: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint64, tag = "22")]
    pub node_execution_nanos: u64,
    /// 整批退回队列
    #[prost(bool, tag = "23")]
    pub requeue: bool,
    #[prost(uint32, tag = "24")]
    pub max_task_resubmits: u32,
    /// 节点报告的单个任务失败
    #[prost(map = "uint32, string", tag = "25")]
    pub task_errors: ::std::collections::HashMap<u32, ::prost::alloc::string::String>,
}

/// 解码后的消息: 消息头加其余数据块
#[derive(Debug, Clone, PartialEq)]
pub struct GridMessage {
    pub header: BundleHeader,
    pub blobs: Vec<Bytes>,
}

impl GridMessage {
    pub fn new(header: BundleHeader, blobs: Vec<Bytes>) -> Self {
        Self { header, blobs }
    }

    pub fn from_frames(mut frames: Vec<Bytes>) -> Result<Self> {
        if frames.is_empty() {
            return Err(crate::GridError::Protocol("message without header".into()));
        }
        let blobs = frames.split_off(1);
        let header = BundleHeader::decode(frames[0].clone())?;
        Ok(Self { header, blobs })
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(self.blobs.len() + 1);
        frames.push(Bytes::from(self.header.encode_to_vec()));
        frames.extend(self.blobs);
        frames
    }

    /// 已分帧的字节, 可直接交给 [`MessageWriter`]
    pub fn encode(self) -> Bytes {
        encode_frame(&self.into_frames())
    }
}
