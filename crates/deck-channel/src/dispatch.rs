use deck_core::protocol::{Envelope, MessageKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type Callback = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    All,
    Kind(MessageKind),
    /// Cursor, highlight and glow commands for the presentation layer.
    Overlay,
}

impl Topic {
    fn matches(&self, kind: Option<MessageKind>) -> bool {
        match (self, kind) {
            (Topic::All, _) => true,
            (Topic::Kind(wanted), Some(kind)) => *wanted == kind,
            (Topic::Overlay, Some(kind)) => kind.is_overlay(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub envelopes: usize,
    pub deliveries: usize,
    pub failures: usize,
}

struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Fans decoded envelopes out to subscribers.
///
/// Delivery is sequential: envelopes in slice order, subscribers in
/// registration order. A failing or panicking subscriber is logged and
/// skipped; it never stops its siblings or later envelopes.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.subscriptions.push(Subscription {
            id,
            topic,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|subscription| subscription.id != id);
        registry.subscriptions.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Delivers a single event or a whole batch through the same path.
    pub fn dispatch(&self, envelopes: &[Envelope]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for envelope in envelopes {
            let kind = envelope.message_kind();
            if kind.is_some_and(|kind| kind.is_heartbeat()) {
                continue;
            }
            report.envelopes += 1;

            // Snapshot so callbacks may (un)subscribe without deadlocking.
            let targets: Vec<(SubscriptionId, Callback)> = self
                .lock()
                .subscriptions
                .iter()
                .filter(|subscription| subscription.topic.matches(kind))
                .map(|subscription| (subscription.id, subscription.callback.clone()))
                .collect();

            for (id, callback) in targets {
                report.deliveries += 1;
                match catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        report.failures += 1;
                        warn!(
                            event = "deck_subscriber_error",
                            subscription = id.0,
                            kind = %envelope.kind,
                            error = %format!("{err:#}")
                        );
                    }
                    Err(panic) => {
                        report.failures += 1;
                        warn!(
                            event = "deck_subscriber_panic",
                            subscription = id.0,
                            kind = %envelope.kind,
                            reason = panic_message(panic.as_ref())
                        );
                    }
                }
            }
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;

    fn envelope(kind: MessageKind) -> Envelope {
        Envelope::new(kind, json!({}))
    }

    fn recorder(dispatcher: &Dispatcher, topic: Topic) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.subscribe(topic, move |envelope| {
            sink.lock().unwrap().push(envelope.kind.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn batch_survives_failing_and_panicking_subscribers() {
        let dispatcher = Dispatcher::new();
        dispatcher.subscribe(Topic::All, |envelope| {
            if envelope.is(MessageKind::Progress) {
                bail!("progress handler broke");
            }
            Ok(())
        });
        dispatcher.subscribe(Topic::Kind(MessageKind::Confirm), |_| panic!("confirm handler broke"));
        let seen = recorder(&dispatcher, Topic::All);

        let batch = vec![
            envelope(MessageKind::Status),
            envelope(MessageKind::Progress),
            envelope(MessageKind::Confirm),
        ];
        let report = dispatcher.dispatch(&batch);

        assert_eq!(*seen.lock().unwrap(), vec!["status", "progress", "confirm"]);
        assert_eq!(report.envelopes, 3);
        assert_eq!(report.deliveries, 7);
        assert_eq!(report.failures, 2);
    }

    #[test]
    fn topics_filter_and_preserve_order() {
        let dispatcher = Dispatcher::new();
        let overlay = recorder(&dispatcher, Topic::Overlay);
        let toasts = recorder(&dispatcher, Topic::Kind(MessageKind::Toast));

        dispatcher.dispatch(&[
            envelope(MessageKind::CursorMove),
            envelope(MessageKind::Toast),
            envelope(MessageKind::Highlight),
            Envelope {
                kind: "mystery".to_string(),
                data: json!(null),
            },
            envelope(MessageKind::ScreenGlowStop),
        ]);

        assert_eq!(
            *overlay.lock().unwrap(),
            vec!["cursor_move", "highlight", "screen_glow_stop"]
        );
        assert_eq!(*toasts.lock().unwrap(), vec!["toast"]);
    }

    #[test]
    fn heartbeats_are_never_delivered() {
        let dispatcher = Dispatcher::new();
        let seen = recorder(&dispatcher, Topic::All);
        let report = dispatcher.dispatch(&[Envelope::ping(), Envelope::pong()]);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(report, DispatchReport::default());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let id = dispatcher.subscribe(Topic::All, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        dispatcher.dispatch(&[envelope(MessageKind::Tool)]);
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.dispatch(&[envelope(MessageKind::Tool)]);
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }
}
