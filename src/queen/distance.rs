//! 节点配置与作业期望配置之间的距离

use std::collections::BTreeMap;

use crate::system_info::SystemInfo;

/// 越小越接近, 0 表示已匹配
pub trait ConfigDistance: Send + Sync {
    fn distance(&self, desired: &BTreeMap<String, String>, actual: &SystemInfo) -> u32;
}

/// 统计节点上缺失或不同的期望属性个数
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertyDistance;

impl ConfigDistance for PropertyDistance {
    fn distance(&self, desired: &BTreeMap<String, String>, actual: &SystemInfo) -> u32 {
        desired
            .iter()
            .filter(|(key, value)| actual.get(key) != Some(value.as_str()))
            .count() as u32
    }
}
