//! Dispatcher - 受信メッセージを一致する全 Handler へ配る
//!
//! # 学習ポイント
//! - 受信ループを止めない: 1 件の一致ごとに独立したタスクを spawn して即 return
//! - TaskTracker で実行中のタスクを数え、停止時に猶予つきで待つ
//! - catch_unwind で panic を 1 つの Handler の中に閉じ込める

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::domain::message::InboundMessage;
use crate::domain::topic::TopicFilter;
use crate::typed::{ConsumerRegistry, HandlerFactory, Registration};

pub struct Dispatcher {
    registry: Arc<ConsumerRegistry>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConsumerRegistry>) -> Self {
        Self {
            registry,
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Hand `message` to every matching consumer and return how many there were.
    ///
    /// Returns as soon as the invocations are spawned. There is no ordering
    /// between consumers of one message, nor between consecutive messages.
    pub fn dispatch(&self, message: InboundMessage) -> usize {
        let matches = self.registry.matching(message.topic());
        if matches.is_empty() {
            debug!(topic = message.topic(), "no consumer for topic");
            return 0;
        }
        debug!(topic = message.topic(), consumers = matches.len(), "dispatching");

        let count = matches.len();
        let message = Arc::new(message);
        for Registration { filter, factory } in matches {
            self.tracker.spawn(invoke(filter, factory, Arc::clone(&message)));
        }
        count
    }

    /// Handler invocations that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Accept invocations again after a [`Self::shutdown`].
    pub fn reopen(&self) {
        self.tracker.reopen();
    }

    /// Wait up to `grace` for in-flight handlers; true when all finished.
    ///
    /// Handlers still running afterwards are left alone, not aborted.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            warn!(in_flight = self.tracker.len(), "abandoning in-flight handlers");
        }
        drained
    }
}

async fn invoke(filter: TopicFilter, factory: Arc<dyn HandlerFactory>, message: Arc<InboundMessage>) {
    let topic = message.topic().to_string();
    let run = async move {
        let handler = factory.create();
        handler.handle(message).await
    };

    match AssertUnwindSafe(run).catch_unwind().await {
        Ok(Ok(())) => debug!(%filter, topic = %topic, "consumer finished"),
        Ok(Err(e)) => error!(%filter, topic = %topic, error = %e, "consumer failed"),
        Err(panic) => error!(%filter, topic = %topic, panic = panic_message(&*panic), "consumer panicked"),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::HandlerError;
    use crate::domain::message::QoS;
    use crate::typed::MessageHandler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct Probe {
        behaviour: Behaviour,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for Probe {
        async fn handle(&self, _message: Arc<InboundMessage>) -> Result<(), HandlerError> {
            match self.behaviour {
                Behaviour::Succeed => {
                    self.handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Behaviour::Fail => Err(HandlerError::Other("boom".into())),
                Behaviour::Panic => panic!("handler exploded"),
            }
        }
    }

    fn behaving(behaviour: Behaviour, handled: &Arc<AtomicUsize>) -> impl HandlerFactory + 'static {
        let handled = Arc::clone(handled);
        move || Probe {
            behaviour,
            handled: Arc::clone(&handled),
        }
    }

    fn message(topic: &str) -> InboundMessage {
        InboundMessage::new(topic, b"{}".to_vec(), false, QoS::AtLeastOnce)
    }

    #[tokio::test]
    async fn every_matching_consumer_is_invoked() {
        let handled = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ConsumerRegistry::new());
        registry.register("plant/#", behaving(Behaviour::Succeed, &handled)).unwrap();
        registry.register("plant/+/temp", behaving(Behaviour::Succeed, &handled)).unwrap();
        registry.register("office/#", behaving(Behaviour::Succeed, &handled)).unwrap();
        let dispatcher = Dispatcher::new(registry);

        assert_eq!(dispatcher.dispatch(message("plant/line-1/temp")), 2);
        assert!(dispatcher.shutdown(Duration::from_secs(1)).await);

        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_and_panicking_consumers_do_not_affect_others() {
        let handled = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ConsumerRegistry::new());
        registry.register("a/#", behaving(Behaviour::Panic, &handled)).unwrap();
        registry.register("a/+", behaving(Behaviour::Fail, &handled)).unwrap();
        registry.register("a/b", behaving(Behaviour::Succeed, &handled)).unwrap();
        let dispatcher = Dispatcher::new(registry);

        assert_eq!(dispatcher.dispatch(message("a/b")), 3);
        assert_eq!(dispatcher.dispatch(message("a/b")), 3);
        assert!(dispatcher.shutdown(Duration::from_secs(1)).await);

        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    struct Blocked {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl MessageHandler for Blocked {
        async fn handle(&self, _message: Arc<InboundMessage>) -> Result<(), HandlerError> {
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_returns_before_handlers_finish() {
        let release = Arc::new(Notify::new());
        let registry = Arc::new(ConsumerRegistry::new());
        let r = Arc::clone(&release);
        registry
            .register("slow/#", move || Blocked { release: Arc::clone(&r) })
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        dispatcher.dispatch(message("slow/1"));
        dispatcher.dispatch(message("slow/2"));
        assert_eq!(dispatcher.in_flight(), 2);

        // a short grace gives up without cancelling the handlers
        assert!(!dispatcher.shutdown(Duration::from_millis(20)).await);
        assert_eq!(dispatcher.in_flight(), 2);

        release.notify_waiters();
        dispatcher.reopen();
        assert!(dispatcher.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn each_invocation_gets_a_fresh_handler() {
        let created = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ConsumerRegistry::new());
        let (c, h) = (Arc::clone(&created), Arc::clone(&handled));
        registry
            .register("t", move || {
                c.fetch_add(1, Ordering::SeqCst);
                Probe {
                    behaviour: Behaviour::Succeed,
                    handled: Arc::clone(&h),
                }
            })
            .unwrap();
        let dispatcher = Dispatcher::new(registry);

        for _ in 0..3 {
            dispatcher.dispatch(message("t"));
        }
        assert!(dispatcher.shutdown(Duration::from_secs(1)).await);

        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(handled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unmatched_topics_spawn_nothing() {
        let dispatcher = Dispatcher::new(Arc::new(ConsumerRegistry::new()));
        assert_eq!(dispatcher.dispatch(message("nobody/listens")), 0);
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
