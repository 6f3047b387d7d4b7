//! ConsumerRegistry - トピックフィルタと HandlerFactory の対応表
//!
//! # 学習ポイント
//! - BTreeMap での型消去された trait object の管理
//! - Arc による共有所有権（dispatch 中もロックを握らない）
//! - 二重登録は上書きせずに Err で知らせる（Fail-fast）

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::handler::HandlerFactory;
use crate::domain::topic::{TopicError, TopicFilter};

/// RegistryError は ConsumerRegistry の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a consumer for topic filter '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error(transparent)]
    InvalidFilter(#[from] TopicError),
}

/// One registered consumer, as handed to the dispatcher.
#[derive(Clone)]
pub struct Registration {
    pub filter: TopicFilter,
    pub factory: Arc<dyn HandlerFactory>,
}

/// ConsumerRegistry はフィルタごとに 1 つの factory を保持する
///
/// # 使用例
/// ```ignore
/// let registry = ConsumerRegistry::new();
/// registry.register("plant/+/temperature", || TemperatureHandler)?;
///
/// for r in registry.matching("plant/line-1/temperature") { ... }
/// ```
///
/// ブローカーについては何も知らない。購読は ConnectionManager の仕事。
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: RwLock<BTreeMap<TopicFilter, Arc<dyn HandlerFactory>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, filter: &str, factory: F) -> Result<TopicFilter, RegistryError>
    where
        F: HandlerFactory + 'static,
    {
        let filter = TopicFilter::new(filter)?;
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        if consumers.contains_key(&filter) {
            return Err(RegistryError::AlreadyRegistered(filter.to_string()));
        }
        consumers.insert(filter.clone(), Arc::new(factory));
        Ok(filter)
    }

    /// Every registration whose filter matches `topic`, in filter order.
    pub fn matching(&self, topic: &str) -> Vec<Registration> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(filter, _)| filter.matches(topic))
            .map(|(filter, factory)| Registration {
                filter: filter.clone(),
                factory: Arc::clone(factory),
            })
            .collect()
    }

    pub fn filters(&self) -> Vec<TopicFilter> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.consumers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::HandlerError;
    use crate::domain::message::InboundMessage;
    use crate::typed::handler::MessageHandler;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _message: Arc<InboundMessage>) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_match() {
        let registry = ConsumerRegistry::new();
        registry.register("a/+/c", || Noop).unwrap();

        let matches = registry.matching("a/b/c");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].filter.as_str(), "a/+/c");
        assert!(registry.matching("a/b/d").is_empty());
    }

    #[test]
    fn test_double_registration() {
        let registry = ConsumerRegistry::new();
        registry.register("a/#", || Noop).unwrap();

        let result = registry.register("a/#", || Noop);

        assert_eq!(result, Err(RegistryError::AlreadyRegistered("a/#".into())));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_overlapping_filters_all_match() {
        let registry = ConsumerRegistry::new();
        registry.register("plant/#", || Noop).unwrap();
        registry.register("plant/+/temp", || Noop).unwrap();
        registry.register("plant/line-1/temp", || Noop).unwrap();
        registry.register("office/#", || Noop).unwrap();

        let filters: Vec<String> = registry
            .matching("plant/line-1/temp")
            .into_iter()
            .map(|r| r.filter.to_string())
            .collect();

        assert_eq!(filters, vec!["plant/#", "plant/+/temp", "plant/line-1/temp"]);
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let registry = ConsumerRegistry::new();
        let result = registry.register("a/#/b", || Noop);
        assert!(matches!(result, Err(RegistryError::InvalidFilter(_))));
        assert!(registry.is_empty());
    }
}
