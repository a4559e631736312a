//! 执行策略
//!
//! 策略是一棵小型谓词树, 针对节点的 [`SystemInfo`] 求值(执行策略),
//! 或针对驱动看到的网格状态求值(网格策略)。

use std::fmt;
use std::sync::Arc;

use crate::system_info::SystemInfo;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("property '{property}' has non numeric value '{value}'")]
    NotNumeric { property: String, value: String },
    #[error("{0}")]
    Custom(String),
}

/// 策略可引用的作业信息
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub job_uuid: String,
    pub job_name: String,
    /// 作业当前分发到的节点数
    pub job_channels: usize,
    pub task_count: usize,
}

/// 用户自定义谓词
pub trait CustomPolicy: Send + Sync + fmt::Debug {
    fn accepts(&self, info: &SystemInfo, ctx: &PolicyContext) -> Result<bool, PolicyError>;
}

#[derive(Debug, Clone)]
pub enum ExecutionPolicy {
    Equal {
        property: String,
        value: String,
        ignore_case: bool,
    },
    /// 标签列表或逗号分隔的属性包含该值
    Contains { property: String, value: String },
    AtLeast { property: String, value: f64 },
    AtMost { property: String, value: f64 },
    OneOf { property: String, values: Vec<String> },
    Defined(String),
    /// 作业所在节点数少于 `n`
    MaxJobChannels(usize),
    And(Vec<ExecutionPolicy>),
    Or(Vec<ExecutionPolicy>),
    Not(Box<ExecutionPolicy>),
    Custom(Arc<dyn CustomPolicy>),
}

impl ExecutionPolicy {
    pub fn equal(property: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equal {
            property: property.into(),
            value: value.into(),
            ignore_case: false,
        }
    }

    pub fn contains(property: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Contains {
            property: property.into(),
            value: value.into(),
        }
    }

    pub fn at_least(property: impl Into<String>, value: f64) -> Self {
        Self::AtLeast {
            property: property.into(),
            value,
        }
    }

    pub fn at_most(property: impl Into<String>, value: f64) -> Self {
        Self::AtMost {
            property: property.into(),
            value,
        }
    }

    pub fn and(self, other: ExecutionPolicy) -> Self {
        match self {
            Self::And(mut rules) => {
                rules.push(other);
                Self::And(rules)
            }
            rule => Self::And(vec![rule, other]),
        }
    }

    pub fn or(self, other: ExecutionPolicy) -> Self {
        match self {
            Self::Or(mut rules) => {
                rules.push(other);
                Self::Or(rules)
            }
            rule => Self::Or(vec![rule, other]),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn evaluate(&self, info: &SystemInfo, ctx: &PolicyContext) -> Result<bool, PolicyError> {
        match self {
            Self::Equal {
                property,
                value,
                ignore_case,
            } => Ok(info.get(property).is_some_and(|v| {
                if *ignore_case {
                    v.eq_ignore_ascii_case(value)
                } else {
                    v == value
                }
            })),
            Self::Contains { property, value } => Ok(info
                .get(property)
                .is_some_and(|v| v.split(',').map(str::trim).any(|item| item == value))),
            Self::AtLeast { property, value } => {
                Ok(numeric(info, property)?.is_some_and(|n| n >= *value))
            }
            Self::AtMost { property, value } => {
                Ok(numeric(info, property)?.is_some_and(|n| n <= *value))
            }
            Self::OneOf { property, values } => {
                Ok(info.get(property).is_some_and(|v| values.iter().any(|x| x == v)))
            }
            Self::Defined(property) => Ok(info.get(property).is_some()),
            Self::MaxJobChannels(n) => Ok(ctx.job_channels < *n),
            Self::And(rules) => {
                for rule in rules {
                    if !rule.evaluate(info, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or(rules) => {
                for rule in rules {
                    if rule.evaluate(info, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(rule) => Ok(!rule.evaluate(info, ctx)?),
            Self::Custom(custom) => custom.accepts(info, ctx),
        }
    }
}

fn numeric(info: &SystemInfo, property: &str) -> Result<Option<f64>, PolicyError> {
    match info.get(property) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| PolicyError::NotNumeric {
                property: property.to_string(),
                value: raw.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_info::keys;

    fn gpu_node() -> SystemInfo {
        SystemInfo::new()
            .with("tag", "gpu")
            .with(keys::TAGS, "gpu,linux")
            .with(keys::PROCESSING_THREADS, 16)
    }

    #[test]
    fn equal_and_contains() {
        let ctx = PolicyContext::default();
        assert!(ExecutionPolicy::equal("tag", "gpu").evaluate(&gpu_node(), &ctx).unwrap());
        assert!(!ExecutionPolicy::equal("tag", "gpu").evaluate(&SystemInfo::new(), &ctx).unwrap());
        assert!(ExecutionPolicy::contains(keys::TAGS, "linux")
            .evaluate(&gpu_node(), &ctx)
            .unwrap());
    }

    #[test]
    fn boolean_composition() {
        let ctx = PolicyContext::default();
        let rule = ExecutionPolicy::equal("tag", "gpu")
            .and(ExecutionPolicy::at_least(keys::PROCESSING_THREADS, 8.0))
            .and(ExecutionPolicy::Defined("missing".into()).negate());
        assert!(rule.evaluate(&gpu_node(), &ctx).unwrap());
        let rule = ExecutionPolicy::at_most(keys::PROCESSING_THREADS, 4.0)
            .or(ExecutionPolicy::equal("tag", "cpu"));
        assert!(!rule.evaluate(&gpu_node(), &ctx).unwrap());
    }

    #[test]
    fn non_numeric_property_is_an_error() {
        let info = SystemInfo::new().with(keys::PROCESSING_THREADS, "many");
        let err = ExecutionPolicy::at_least(keys::PROCESSING_THREADS, 1.0)
            .evaluate(&info, &PolicyContext::default())
            .unwrap_err();
        assert!(matches!(err, PolicyError::NotNumeric { .. }));
    }

    #[test]
    fn job_channel_ceiling_uses_context() {
        let ctx = PolicyContext {
            job_channels: 2,
            ..Default::default()
        };
        assert!(!ExecutionPolicy::MaxJobChannels(2).evaluate(&SystemInfo::new(), &ctx).unwrap());
        assert!(ExecutionPolicy::MaxJobChannels(3).evaluate(&SystemInfo::new(), &ctx).unwrap());
    }
}
