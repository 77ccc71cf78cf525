use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, MessageHandler, SubscriptionId};
use crate::config::TopicsConfig;
use crate::error::Result;
use crate::events::{self, CanonicalEvent, Envelope, EventKind};

pub type ConnId = u64;

/// What a single websocket connection listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Event(EventKind),
    Raw(String),
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(kind) => write!(f, "events/{}", kind.as_str()),
            Self::Raw(filter) => write!(f, "mqtt/{filter}"),
        }
    }
}

#[derive(Debug, Clone)]
struct ConnectedClient {
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RawTopic {
    clients: HashMap<ConnId, ConnectedClient>,
    bus_subscription: Option<SubscriptionId>,
}

#[derive(Default)]
struct RouterState {
    events: HashMap<EventKind, HashMap<ConnId, ConnectedClient>>,
    raw: HashMap<String, RawTopic>,
}

type FilterGates = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds one raw filter's gate. The map entry is dropped with the last holder.
struct FilterGuard<'a> {
    gates: &'a FilterGates,
    filter: &'a str,
    _held: OwnedMutexGuard<()>,
}

impl Drop for FilterGuard<'_> {
    fn drop(&mut self) {
        let mut gates = lock(self.gates);
        // Every waiter clones the gate under this lock: map entry plus our guard means none.
        if gates
            .get(self.filter)
            .is_some_and(|gate| Arc::strong_count(gate) == 2)
        {
            gates.remove(self.filter);
        }
    }
}

pub struct TopicRouter {
    bus: Arc<dyn MessageBus>,
    state: Mutex<RouterState>,
    // Serializes subscribe/unsubscribe per raw filter so each has at most one bus subscription.
    raw_gates: FilterGates,
    event_subscriptions: Mutex<Vec<SubscriptionId>>,
    site_ids: Vec<String>,
}

impl TopicRouter {
    pub fn new(bus: Arc<dyn MessageBus>, site_ids: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state: Mutex::new(RouterState::default()),
            raw_gates: Mutex::new(HashMap::new()),
            event_subscriptions: Mutex::new(Vec::new()),
            site_ids,
        })
    }

    /// Subscribes the fixed event patterns. Called once before serving.
    pub async fn start(self: &Arc<Self>, topics: &TopicsConfig) -> Result<()> {
        for kind in EventKind::ALL {
            let pattern = topics.pattern(kind).to_owned();
            let router = Arc::downgrade(self);
            let handler_pattern = pattern.clone();
            let handler: MessageHandler = Arc::new(move |envelope: &Envelope| {
                if let Some(router) = router.upgrade() {
                    router.dispatch_event(kind, &handler_pattern, envelope);
                }
            });
            let id = self.bus.subscribe(&pattern, handler).await?;
            lock(&self.event_subscriptions).push(id);
            info!("routing {} from bus filter {pattern}", SubscriptionKey::Event(kind));
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let ids = std::mem::take(&mut *lock(&self.event_subscriptions));
        for id in ids {
            if let Err(err) = self.bus.unsubscribe(id).await {
                debug!("failed releasing event subscription: {err}");
            }
        }
    }

    pub async fn register(
        self: &Arc<Self>,
        conn_id: ConnId,
        key: &SubscriptionKey,
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let client = ConnectedClient { tx, cancel };
        let filter = match key {
            SubscriptionKey::Event(kind) => {
                lock(&self.state)
                    .events
                    .entry(*kind)
                    .or_default()
                    .insert(conn_id, client);
                return Ok(());
            }
            SubscriptionKey::Raw(filter) => filter,
        };

        let _gate = self.lock_raw_filter(filter).await;
        let needs_bus = {
            let mut state = lock(&self.state);
            let entry = state.raw.entry(filter.clone()).or_default();
            entry.clients.insert(conn_id, client);
            entry.bus_subscription.is_none()
        };
        if !needs_bus {
            return Ok(());
        }

        match self.bus.subscribe(filter, self.raw_handler(filter)).await {
            Ok(id) => {
                if let Some(entry) = lock(&self.state).raw.get_mut(filter) {
                    entry.bus_subscription = Some(id);
                }
                debug!("raw topic {filter} now subscribed on the bus");
                Ok(())
            }
            Err(err) => {
                let mut state = lock(&self.state);
                if let Some(entry) = state.raw.get_mut(filter) {
                    entry.clients.remove(&conn_id);
                    if entry.clients.is_empty() {
                        state.raw.remove(filter);
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn unregister(&self, conn_id: ConnId, key: &SubscriptionKey) {
        let filter = match key {
            SubscriptionKey::Event(kind) => {
                if let Some(clients) = lock(&self.state).events.get_mut(kind) {
                    clients.remove(&conn_id);
                }
                return;
            }
            SubscriptionKey::Raw(filter) => filter,
        };

        let _gate = self.lock_raw_filter(filter).await;
        let released = {
            let mut state = lock(&self.state);
            match state.raw.get_mut(filter) {
                Some(entry) => {
                    entry.clients.remove(&conn_id);
                    if entry.clients.is_empty() {
                        state.raw.remove(filter).and_then(|entry| entry.bus_subscription)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(id) = released {
            match self.bus.unsubscribe(id).await {
                Ok(()) => debug!("raw topic {filter} released on the bus"),
                Err(err) => warn!("failed releasing raw topic {filter}: {err}"),
            }
        }
    }

    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        let state = lock(&self.state);
        match key {
            SubscriptionKey::Event(kind) => state.events.get(kind).map_or(0, HashMap::len),
            SubscriptionKey::Raw(filter) => state.raw.get(filter).map_or(0, |t| t.clients.len()),
        }
    }

    pub fn raw_topic_count(&self) -> usize {
        lock(&self.state).raw.len()
    }

    async fn lock_raw_filter<'a>(&'a self, filter: &'a str) -> FilterGuard<'a> {
        let gate = lock(&self.raw_gates)
            .entry(filter.to_owned())
            .or_default()
            .clone();
        FilterGuard {
            gates: &self.raw_gates,
            filter,
            _held: gate.lock_owned().await,
        }
    }

    fn raw_handler(self: &Arc<Self>, filter: &str) -> MessageHandler {
        let router = Arc::downgrade(self);
        let filter = filter.to_owned();
        Arc::new(move |envelope: &Envelope| {
            if let Some(router) = router.upgrade() {
                router.dispatch_raw(&filter, envelope);
            }
        })
    }

    fn dispatch_event(&self, kind: EventKind, pattern: &str, envelope: &Envelope) {
        let has_clients = lock(&self.state)
            .events
            .get(&kind)
            .is_some_and(|clients| !clients.is_empty());
        if !has_clients {
            return;
        }

        let event = match events::normalize_event(kind, pattern, envelope) {
            Ok(event) => event,
            Err(err) => {
                warn!("dropping message: {err}");
                return;
            }
        };
        if !self.site_allowed(&event) {
            debug!("dropping {} event from unlisted site", kind.as_str());
            return;
        }
        let Some(frame) = encode(&event) else {
            return;
        };

        if let Some(clients) = lock(&self.state).events.get_mut(&kind) {
            fan_out(clients, &frame, kind.as_str());
        }
    }

    fn dispatch_raw(&self, filter: &str, envelope: &Envelope) {
        let Some(frame) = encode(&events::passthrough(envelope)) else {
            return;
        };
        if let Some(topic) = lock(&self.state).raw.get_mut(filter) {
            fan_out(&mut topic.clients, &frame, filter);
        }
    }

    fn site_allowed(&self, event: &CanonicalEvent) -> bool {
        if self.site_ids.is_empty() {
            return true;
        }
        event
            .site_id()
            .map_or(true, |site| self.site_ids.iter().any(|allowed| allowed == site))
    }
}

fn encode(event: &CanonicalEvent) -> Option<String> {
    match event.to_frame() {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!("failed encoding frame: {err}");
            None
        }
    }
}

/// Queues `frame` for every client; clients whose queue is full are cancelled
/// and dropped from the set.
fn fan_out(clients: &mut HashMap<ConnId, ConnectedClient>, frame: &str, label: &str) {
    clients.retain(|conn_id, client| {
        match client.tx.try_send(Message::Text(frame.to_owned())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("connection {conn_id} on {label} fell behind; closing it");
                client.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;

    use super::{SubscriptionKey, TopicRouter};
    use crate::bus::testing::MemoryBus;
    use crate::config::TopicsConfig;
    use crate::events::{Envelope, EventKind};

    async fn started_router(bus: &Arc<MemoryBus>, site_ids: Vec<String>) -> Arc<TopicRouter> {
        let router = TopicRouter::new(bus.clone(), site_ids);
        router.start(&TopicsConfig::default()).await.expect("start");
        router
    }

    fn next_frame(rx: &mut mpsc::Receiver<Message>) -> Option<Value> {
        match rx.try_recv().ok()? {
            Message::Text(text) => Some(serde_json::from_str(&text).expect("json frame")),
            other => panic!("unexpected message {other:?}"),
        }
    }

    fn text_captured(text: &str, site: &str) -> Envelope {
        Envelope::new(
            "hermes/asr/textCaptured",
            json!({ "text": text, "siteId": site, "wakewordId": "w1" }).to_string(),
        )
    }

    #[tokio::test]
    async fn start_subscribes_every_event_pattern() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        assert_eq!(
            bus.active_filters(),
            vec![
                "hermes/asr/textCaptured".to_owned(),
                "hermes/hotword/+/detected".to_owned(),
                "hermes/intent/#".to_owned(),
            ]
        );
        router.stop().await;
        assert!(bus.active_filters().is_empty());
    }

    #[tokio::test]
    async fn event_messages_fan_out_to_every_connection() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        let key = SubscriptionKey::Event(EventKind::Text);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        router.register(1, &key, tx1, CancellationToken::new()).await.unwrap();
        router.register(2, &key, tx2, CancellationToken::new()).await.unwrap();

        bus.inject(text_captured("this is a test", "default"));

        for rx in [&mut rx1, &mut rx2] {
            let frame = next_frame(rx).expect("frame");
            assert_eq!(frame["text"], "this is a test");
            assert_eq!(frame["wakewordId"], "w1");
        }
        assert!(next_frame(&mut rx1).is_none());
    }

    #[tokio::test]
    async fn messages_before_registration_are_not_replayed() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        bus.inject(text_captured("too early", "default"));

        let (tx, mut rx) = mpsc::channel(8);
        let key = SubscriptionKey::Event(EventKind::Text);
        router.register(1, &key, tx, CancellationToken::new()).await.unwrap();
        assert!(next_frame(&mut rx).is_none());

        bus.inject(text_captured("on time", "default"));
        assert_eq!(next_frame(&mut rx).expect("frame")["text"], "on time");
    }

    #[tokio::test]
    async fn raw_topics_are_reference_counted() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        let key = SubscriptionKey::Raw("rooms/+/lamp".to_owned());
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        router.register(1, &key, tx1, CancellationToken::new()).await.unwrap();
        router.register(2, &key, tx2, CancellationToken::new()).await.unwrap();
        assert_eq!(
            bus.subscribe_calls()
                .iter()
                .filter(|filter| filter.as_str() == "rooms/+/lamp")
                .count(),
            1
        );
        assert_eq!(router.subscriber_count(&key), 2);

        bus.inject(Envelope::new("rooms/kitchen/lamp", json!({ "on": true }).to_string()));
        assert_eq!(
            next_frame(&mut rx1).expect("frame"),
            json!({ "topic": "rooms/kitchen/lamp", "payload": { "on": true } })
        );

        router.unregister(2, &key).await;
        assert!(bus.unsubscribe_calls().is_empty());
        router.unregister(1, &key).await;
        assert_eq!(bus.unsubscribe_calls(), vec!["rooms/+/lamp".to_owned()]);
        assert_eq!(router.raw_topic_count(), 0);
        assert!(!bus.active_filters().contains(&"rooms/+/lamp".to_owned()));
    }

    #[tokio::test]
    async fn concurrent_first_registrations_share_one_bus_subscription() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        let key = SubscriptionKey::Raw("shared/#".to_owned());
        let release = bus.stall_subscribe("shared/#");
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        let (first, second, ()) = tokio::join!(
            router.register(1, &key, tx1, CancellationToken::new()),
            router.register(2, &key, tx2, CancellationToken::new()),
            async {
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                release.notify_one();
            }
        );
        first.unwrap();
        second.unwrap();

        let calls = bus.subscribe_calls();
        assert_eq!(calls.iter().filter(|filter| filter.as_str() == "shared/#").count(), 1);
        assert_eq!(router.subscriber_count(&key), 2);
    }

    #[tokio::test]
    async fn pending_raw_subscribe_does_not_block_other_filters() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        let stalled_key = SubscriptionKey::Raw("stalled/topic".to_owned());
        let other_key = SubscriptionKey::Raw("other/topic".to_owned());
        let release = bus.stall_subscribe("stalled/topic");

        let (tx1, _rx1) = mpsc::channel(8);
        let stalled = tokio::spawn({
            let router = router.clone();
            let key = stalled_key.clone();
            async move { router.register(1, &key, tx1, CancellationToken::new()).await }
        });
        for _ in 0..100 {
            if router.subscriber_count(&stalled_key) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(router.subscriber_count(&stalled_key), 1);

        let (tx2, _rx2) = mpsc::channel(8);
        tokio::time::timeout(
            Duration::from_secs(1),
            router.register(2, &other_key, tx2, CancellationToken::new()),
        )
        .await
        .expect("other filter registers while the first subscribe is pending")
        .unwrap();
        router.unregister(2, &other_key).await;
        assert!(!stalled.is_finished());

        release.notify_one();
        stalled.await.unwrap().unwrap();
        assert_eq!(router.subscriber_count(&stalled_key), 1);
        assert_eq!(bus.unsubscribe_calls(), vec!["other/topic".to_owned()]);
    }

    #[tokio::test]
    async fn overlapping_filters_deliver_once_per_connection() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        let text_key = SubscriptionKey::Event(EventKind::Text);
        let raw_key = SubscriptionKey::Raw("hermes/#".to_owned());
        let (text_tx, mut text_rx) = mpsc::channel(8);
        let (raw_tx, mut raw_rx) = mpsc::channel(8);
        router.register(1, &text_key, text_tx, CancellationToken::new()).await.unwrap();
        router.register(2, &raw_key, raw_tx, CancellationToken::new()).await.unwrap();

        bus.inject(text_captured("only once", "default"));

        assert_eq!(next_frame(&mut text_rx).expect("frame")["text"], "only once");
        assert!(next_frame(&mut text_rx).is_none());
        let raw = next_frame(&mut raw_rx).expect("frame");
        assert_eq!(raw["topic"], "hermes/asr/textCaptured");
        assert!(next_frame(&mut raw_rx).is_none());
    }

    #[tokio::test]
    async fn per_connection_order_follows_bus_order() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        let key = SubscriptionKey::Raw("seq".to_owned());
        let (tx, mut rx) = mpsc::channel(16);
        router.register(9, &key, tx, CancellationToken::new()).await.unwrap();
        for n in 0..5 {
            bus.inject(Envelope::new("seq", n.to_string()));
        }
        for n in 0..5 {
            assert_eq!(next_frame(&mut rx).expect("frame")["payload"], json!(n));
        }
    }

    #[tokio::test]
    async fn slow_consumers_are_cancelled_without_stalling_others() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        let key = SubscriptionKey::Event(EventKind::Text);
        let slow_cancel = CancellationToken::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        router.register(1, &key, slow_tx, slow_cancel.clone()).await.unwrap();
        router.register(2, &key, fast_tx, CancellationToken::new()).await.unwrap();

        bus.inject(text_captured("one", "default"));
        bus.inject(text_captured("two", "default"));

        assert!(slow_cancel.is_cancelled());
        assert_eq!(router.subscriber_count(&key), 1);
        assert_eq!(next_frame(&mut fast_rx).expect("frame")["text"], "one");
        assert_eq!(next_frame(&mut fast_rx).expect("frame")["text"], "two");
    }

    #[tokio::test]
    async fn malformed_events_are_dropped_and_dispatch_continues() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, Vec::new()).await;
        let key = SubscriptionKey::Event(EventKind::Intent);
        let (tx, mut rx) = mpsc::channel(8);
        router.register(1, &key, tx, CancellationToken::new()).await.unwrap();

        bus.inject(Envelope::new("hermes/intent/Broken", "{not json"));
        assert!(next_frame(&mut rx).is_none());

        bus.inject(Envelope::new(
            "hermes/intent/GetTime",
            json!({ "input": "what time is it", "intent": { "intentName": "GetTime" } })
                .to_string(),
        ));
        let frame = next_frame(&mut rx).expect("frame");
        assert_eq!(frame["intent"]["name"], "GetTime");
        assert_eq!(frame["siteId"], "default");
    }

    #[tokio::test]
    async fn site_filter_drops_unlisted_sites() {
        let bus = Arc::new(MemoryBus::default());
        let router = started_router(&bus, vec!["kitchen".to_owned()]).await;
        let key = SubscriptionKey::Event(EventKind::Text);
        let (tx, mut rx) = mpsc::channel(8);
        router.register(1, &key, tx, CancellationToken::new()).await.unwrap();

        bus.inject(text_captured("from the garage", "garage"));
        bus.inject(text_captured("from the kitchen", "kitchen"));
        assert_eq!(next_frame(&mut rx).expect("frame")["text"], "from the kitchen");
        assert!(next_frame(&mut rx).is_none());
    }

    #[test]
    fn keys_display_as_websocket_paths() {
        assert_eq!(SubscriptionKey::Event(EventKind::Wake).to_string(), "events/wake");
        assert_eq!(SubscriptionKey::Raw("a/b".to_owned()).to_string(), "mqtt/a/b");
    }
}
