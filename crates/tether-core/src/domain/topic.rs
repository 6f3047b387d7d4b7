//! Topic - トピックフィルタとトピック命名
//!
//! # 学習ポイント
//! - `/` 区切りのセグメント単位でのマッチング
//! - `+`（1 セグメント）と `#`（残り全部）のワイルドカード
//! - 生成時に検証して、以降は不変（newtype パターン）

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::Reference;
use super::workflow::WorkflowInstance;

/// Segment delimiter.
pub const SEPARATOR: char = '/';

/// Matches exactly one segment.
pub const SINGLE_LEVEL: &str = "+";

/// Matches the remainder of the topic, including nothing at all.
pub const MULTI_LEVEL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic filter must not be empty")]
    EmptyFilter,

    #[error("wildcard must occupy a whole segment in filter '{0}'")]
    PartialWildcard(String),

    #[error("multi-level wildcard must be the last segment in filter '{0}'")]
    MultiLevelNotLast(String),

    #[error("topic name must not be empty")]
    EmptyTopic,

    #[error("topic name '{0}' must not contain wildcards")]
    WildcardInTopic(String),

    #[error("'{0}' cannot be a single topic segment")]
    InvalidSegment(String),
}

/// TopicFilter は購読パターン
///
/// 生成時に検証済みなので、`matches()` はエラーを返さない。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(filter: impl Into<String>) -> Result<Self, TopicError> {
        let filter = filter.into();
        if filter.is_empty() {
            return Err(TopicError::EmptyFilter);
        }

        let segments: Vec<&str> = filter.split(SEPARATOR).collect();
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            let has_wildcard = segment.contains(SINGLE_LEVEL) || segment.contains(MULTI_LEVEL);
            if has_wildcard && *segment != SINGLE_LEVEL && *segment != MULTI_LEVEL {
                return Err(TopicError::PartialWildcard(filter));
            }
            if *segment == MULTI_LEVEL && i != last {
                return Err(TopicError::MultiLevelNotLast(filter));
            }
        }

        Ok(Self(filter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_wildcards(&self) -> bool {
        self.0
            .split(SEPARATOR)
            .any(|s| s == SINGLE_LEVEL || s == MULTI_LEVEL)
    }

    /// Does the concrete `topic` fall under this filter?
    ///
    /// - literal segments must be equal
    /// - `+` consumes exactly one segment (it never spans a `/`)
    /// - a trailing `#` consumes whatever is left, including nothing,
    ///   so `a/#` matches `a` as well as `a/b/c`
    pub fn matches(&self, topic: &str) -> bool {
        let mut filter = self.0.split(SEPARATOR);
        let mut topic = topic.split(SEPARATOR);

        loop {
            match (filter.next(), topic.next()) {
                (Some(MULTI_LEVEL), _) => return true,
                (Some(SINGLE_LEVEL), Some(_)) => continue,
                (Some(expected), Some(actual)) if expected == actual => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TopicFilter {
    type Error = TopicError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TopicFilter> for String {
    fn from(filter: TopicFilter) -> Self {
        filter.0
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Checks that `topic` is a publishable topic name (non-empty, no wildcards).
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.contains(SINGLE_LEVEL) || topic.contains(MULTI_LEVEL) {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// Which retained slot of an instance a topic points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusSegment {
    /// Holds the latest snapshot while the workflow is not terminal.
    Active,
    /// Holds the last snapshot once the workflow completed or was terminated.
    Final,
}

impl StatusSegment {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusSegment::Active => "active",
            StatusSegment::Final => "final",
        }
    }
}

impl fmt::Display for StatusSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TopicScheme はインスタンスのトピック名を決定的に組み立てる
///
/// `<namespace>/<definitionId>:v<version>/<active|final>/<referencePrefix>/instance`
///
/// 内部 ID（WorkflowId）は使わない。Reference は生成後に変わらないため、
/// 内部 ID が変わってもトピックの同一性が保たれる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    namespace: String,
    reference_prefix_len: usize,
}

impl TopicScheme {
    pub const DEFAULT_NAMESPACE: &'static str = "workflows-core";
    pub const DEFAULT_PREFIX_LEN: usize = 8;
    const LEAF: &'static str = "instance";

    pub fn new(namespace: impl Into<String>, reference_prefix_len: usize) -> Self {
        Self {
            namespace: namespace.into(),
            reference_prefix_len,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Definition id and reference prefix must each stay one wildcard-free segment.
    pub fn topic_for(
        &self,
        definition_id: &str,
        version: u32,
        reference: &Reference,
        segment: StatusSegment,
    ) -> Result<String, TopicError> {
        let prefix = reference.prefix(self.reference_prefix_len);
        single_segment(definition_id)?;
        single_segment(prefix)?;
        Ok(format!(
            "{}/{}:v{}/{}/{}/{}",
            self.namespace,
            definition_id,
            version,
            segment,
            prefix,
            Self::LEAF,
        ))
    }

    pub fn instance_topic(&self, instance: &WorkflowInstance, segment: StatusSegment) -> Result<String, TopicError> {
        self.topic_for(
            &instance.workflow_definition_id,
            instance.version,
            &instance.reference,
            segment,
        )
    }

    /// Filter covering every instance of every definition in one status slot.
    pub fn family_filter(&self, segment: StatusSegment) -> TopicFilter {
        TopicFilter(format!(
            "{}/{}/{}/{}/{}",
            self.namespace,
            SINGLE_LEVEL,
            segment,
            SINGLE_LEVEL,
            Self::LEAF
        ))
    }
}

fn single_segment(part: &str) -> Result<(), TopicError> {
    if part.is_empty() || part.contains(SEPARATOR) || part.contains(SINGLE_LEVEL) || part.contains(MULTI_LEVEL) {
        return Err(TopicError::InvalidSegment(part.to_string()));
    }
    Ok(())
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAMESPACE, Self::DEFAULT_PREFIX_LEN)
    }
}
