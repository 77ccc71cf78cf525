use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{
    ConnAckProperties, ConnectReturnCode, Packet, Publish, SubscribeProperties,
    SubscribeReasonCode,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, StateError};
use rumqttc::Outgoing;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{compute_retry_backoff_delay, RetryBackoffPolicy};
use crate::config::MqttConfig;
use crate::error::{GatewayError, Result};
use crate::events::Envelope;
use crate::topic;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Largest value a subscription identifier may carry on the wire.
const MAX_BROKER_ID: usize = 268_435_455;

/// Invoked inline on the bus receive loop; must not block.
pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<SubscriptionId>;
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    fn is_ready(&self) -> bool;
}

struct BrokerFilter {
    handlers: usize,
    broker_id: usize,
}

/// Local handlers keyed by id, plus one broker subscription per distinct
/// filter. Each broker subscription carries its own subscription identifier
/// so a PUBLISH is routed to the filters the broker matched it against.
#[derive(Default)]
struct HandlerRegistry {
    next_id: u64,
    next_broker_id: usize,
    handlers: HashMap<SubscriptionId, (String, MessageHandler)>,
    filters: HashMap<String, BrokerFilter>,
}

struct RemovedHandler {
    filter: String,
    last_for_filter: bool,
}

impl HandlerRegistry {
    fn insert(&mut self, filter: &str, handler: MessageHandler) -> (SubscriptionId, bool) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers.insert(id, (filter.to_owned(), handler));
        if let Some(entry) = self.filters.get_mut(filter) {
            entry.handlers += 1;
            return (id, false);
        }
        self.next_broker_id = self.next_broker_id % MAX_BROKER_ID + 1;
        self.filters.insert(
            filter.to_owned(),
            BrokerFilter {
                handlers: 1,
                broker_id: self.next_broker_id,
            },
        );
        (id, true)
    }

    fn remove(&mut self, id: SubscriptionId) -> Option<RemovedHandler> {
        let (filter, _) = self.handlers.remove(&id)?;
        let last_for_filter = match self.filters.get_mut(&filter) {
            Some(entry) if entry.handlers > 1 => {
                entry.handlers -= 1;
                false
            }
            _ => {
                self.filters.remove(&filter);
                true
            }
        };
        Some(RemovedHandler {
            filter,
            last_for_filter,
        })
    }

    fn broker_id(&self, filter: &str) -> Option<usize> {
        self.filters.get(filter).map(|entry| entry.broker_id)
    }

    /// Handlers owed a copy of a message on `topic_name`. With identifiers
    /// only the filters they name qualify; without them every matching
    /// filter does.
    fn matching(&self, topic_name: &str, broker_ids: &[usize]) -> Vec<MessageHandler> {
        self.handlers
            .values()
            .filter(|(filter, _)| {
                if broker_ids.is_empty() {
                    return topic::matches(filter, topic_name);
                }
                self.filters
                    .get(filter)
                    .is_some_and(|entry| broker_ids.contains(&entry.broker_id))
            })
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    fn filters(&self) -> Vec<(String, usize)> {
        self.filters
            .iter()
            .map(|(filter, entry)| (filter.clone(), entry.broker_id))
            .collect()
    }
}

struct PendingAck {
    filter: String,
    waiter: oneshot::Sender<bool>,
}

/// Pairs SUBSCRIBE requests with their SUBACKs. Requests are queued in send
/// order; the event loop reports the packet id once a request goes out.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<PendingAck>,
    in_flight: HashMap<u16, PendingAck>,
}

impl AckTracker {
    fn on_outgoing_subscribe(&mut self, pkid: u16) {
        if let Some(pending) = self.queued.pop_front() {
            debug!("SUBSCRIBE {} sent as packet {pkid}", pending.filter);
            self.in_flight.insert(pkid, pending);
        }
    }

    fn on_suback(&mut self, pkid: u16, accepted: bool) {
        if let Some(pending) = self.in_flight.remove(&pkid) {
            let _ = pending.waiter.send(accepted);
        }
    }

    /// The client refuses a failing SUBACK before reporting its packet id, so
    /// every request still in flight is answered as rejected.
    fn reject_in_flight(&mut self) {
        for (_, pending) in self.in_flight.drain() {
            warn!("broker rejected subscription to {}", pending.filter);
            let _ = pending.waiter.send(false);
        }
    }

    /// In-flight requests died with the connection. Queued ones were never
    /// written and the client sends them first after reconnecting, so they
    /// keep their place.
    fn connection_lost(&mut self) {
        self.in_flight.clear();
    }

    fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

fn deliver(
    registry: &Mutex<HandlerRegistry>,
    envelope: &Envelope,
    broker_ids: &[usize],
    deliver_retained: bool,
) {
    // Retained messages replay history from before the subscriber existed.
    if envelope.retain && !deliver_retained {
        debug!("skipping retained message on {}", envelope.topic);
        return;
    }
    let handlers = lock(registry).matching(&envelope.topic, broker_ids);
    for handler in handlers {
        handler(envelope);
    }
}

fn inbound(publish: Publish) -> Option<(Envelope, Vec<usize>)> {
    let topic_name = match String::from_utf8(publish.topic.to_vec()) {
        Ok(topic_name) => topic_name,
        Err(err) => {
            warn!("dropping message with non UTF-8 topic: {err}");
            return None;
        }
    };
    let broker_ids = publish
        .properties
        .map(|props| props.subscription_identifiers)
        .unwrap_or_default();
    let mut envelope = Envelope::new(topic_name, publish.payload.to_vec());
    envelope.retain = publish.retain;
    Some((envelope, broker_ids))
}

fn supports_subscription_ids(props: Option<&ConnAckProperties>) -> bool {
    props
        .and_then(|props| props.subscription_identifiers_available)
        .map_or(true, |available| available != 0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BusShared {
    client: AsyncClient,
    registry: Mutex<HandlerRegistry>,
    acks: Mutex<AckTracker>,
    subscribe_gate: tokio::sync::Mutex<()>,
    ready: watch::Sender<bool>,
    generation: AtomicU64,
    subscription_ids: AtomicBool,
    deliver_retained: bool,
    ack_timeout: Duration,
    backoff: RetryBackoffPolicy,
}

impl BusShared {
    async fn request_subscribe(&self, filter: &str, broker_id: usize) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let _gate = self.subscribe_gate.lock().await;
            lock(&self.acks).queued.push_back(PendingAck {
                filter: filter.to_owned(),
                waiter: tx,
            });
            let sent = if self.subscription_ids.load(Ordering::SeqCst) {
                let props = SubscribeProperties {
                    id: Some(broker_id),
                    user_properties: Vec::new(),
                };
                self.client
                    .subscribe_with_properties(filter, QoS::AtMostOnce, props)
                    .await
            } else {
                self.client.subscribe(filter, QoS::AtMostOnce).await
            };
            if let Err(err) = sent {
                lock(&self.acks).queued.pop_back();
                return Err(err.into());
            }
        }

        match timeout(self.ack_timeout, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(GatewayError::SubscribeRejected(filter.to_owned())),
            Ok(Err(_)) => {
                debug!("connection dropped before SUBACK for {filter}; restored on reconnect");
                Ok(())
            }
            Err(_) => {
                warn!(
                    "no SUBACK for {filter} within {}ms; continuing",
                    self.ack_timeout.as_millis()
                );
                Ok(())
            }
        }
    }

    async fn resubscribe_all(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        let filters = lock(&self.registry).filters();
        for (filter, broker_id) in &filters {
            if let Err(err) = self.request_subscribe(filter, *broker_id).await {
                warn!("failed restoring bus subscription {filter}: {err}");
            }
        }
        if self.generation.load(Ordering::SeqCst) == generation {
            self.ready.send_replace(true);
            info!("bus ready; restored {} subscription(s)", filters.len());
        }
    }

    fn on_connack(&self, props: Option<&ConnAckProperties>) {
        let supported = supports_subscription_ids(props);
        if !supported && self.subscription_ids.swap(false, Ordering::SeqCst) {
            warn!("broker does not support subscription identifiers; overlapping filters may deliver duplicates");
        }
    }

    fn connection_lost(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.ready.send_replace(false);
        lock(&self.acks).connection_lost();
    }
}

/// Persistent MQTT connection with local handler fan-in and automatic
/// reconnection.
pub struct BusClient {
    shared: Arc<BusShared>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl BusClient {
    pub async fn connect(cfg: &MqttConfig) -> Result<Self> {
        let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        opts.set_clean_start(true);
        opts.set_max_packet_size(Some(cfg.max_packet_size));
        if let (Some(username), Some(password)) = (cfg.username.clone(), cfg.password.clone()) {
            opts.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(opts, cfg.request_channel_capacity);
        let connect_timeout = Duration::from_millis(cfg.connect_timeout_ms);
        let outcome = timeout(connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .unwrap_or_else(|_| Err(format!("no CONNACK within {}ms", cfg.connect_timeout_ms)));
        let subscription_ids = match outcome {
            Ok(subscription_ids) => subscription_ids,
            Err(reason) => {
                return Err(GatewayError::Connection {
                    host: cfg.host.clone(),
                    port: cfg.port,
                    reason,
                })
            }
        };
        info!("connected to MQTT broker at {}:{}", cfg.host, cfg.port);
        if !subscription_ids {
            warn!("broker does not support subscription identifiers; overlapping filters may deliver duplicates");
        }

        let (ready, _) = watch::channel(true);
        let shared = Arc::new(BusShared {
            client,
            registry: Mutex::new(HandlerRegistry::default()),
            acks: Mutex::new(AckTracker::default()),
            subscribe_gate: tokio::sync::Mutex::new(()),
            ready,
            generation: AtomicU64::new(0),
            subscription_ids: AtomicBool::new(subscription_ids),
            deliver_retained: cfg.deliver_retained,
            ack_timeout: Duration::from_millis(cfg.subscribe_ack_timeout_ms.max(1)),
            backoff: RetryBackoffPolicy::from(&cfg.reconnect),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(shared.clone(), eventloop, cancel.clone()));

        Ok(Self {
            shared,
            loop_task: Mutex::new(Some(task)),
            cancel,
        })
    }

    /// Sends DISCONNECT and waits briefly for the receive loop to finish.
    pub async fn shutdown(&self) {
        if let Err(err) = self.shared.client.disconnect().await {
            debug!("bus disconnect request failed: {err}");
        }
        let task = lock(&self.loop_task).take();
        if let Some(mut task) = task {
            if timeout(SHUTDOWN_JOIN_TIMEOUT, &mut task).await.is_err() {
                self.cancel.cancel();
                task.abort();
            }
        }
        info!("bus client stopped");
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl MessageBus for BusClient {
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        topic::validate_filter(filter)?;
        let (id, broker_id) = {
            let mut registry = lock(&self.shared.registry);
            let (id, first) = registry.insert(filter, handler);
            (id, registry.broker_id(filter).filter(|_| first))
        };
        if let Some(broker_id) = broker_id {
            if let Err(err) = self.shared.request_subscribe(filter, broker_id).await {
                lock(&self.shared.registry).remove(id);
                return Err(err);
            }
            debug!("bus subscribed to {filter} (subscription id {broker_id})");
        }
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let removed = lock(&self.shared.registry).remove(id);
        if let Some(removed) = removed.filter(|removed| removed.last_for_filter) {
            self.shared.client.unsubscribe(removed.filter.as_str()).await?;
            debug!("bus unsubscribed from {}", removed.filter);
        }
        Ok(())
    }

    async fn publish(&self, topic_name: &str, payload: Vec<u8>) -> Result<()> {
        topic::validate_publish_topic(topic_name)?;
        self.shared
            .client
            .publish(topic_name, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }
}

/// Resolves to whether the broker accepts subscription identifiers.
async fn wait_for_connack(eventloop: &mut EventLoop) -> std::result::Result<bool, String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(supports_subscription_ids(ack.properties.as_ref()))
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
            }
            Ok(_) => continue,
            Err(err) => return Err(err.to_string()),
        }
    }
}

async fn run_event_loop(shared: Arc<BusShared>, mut eventloop: EventLoop, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some((envelope, broker_ids)) = inbound(publish) {
                    deliver(&shared.registry, &envelope, &broker_ids, shared.deliver_retained);
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                lock(&shared.acks).on_outgoing_subscribe(pkid);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let accepted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                lock(&shared.acks).on_suback(ack.pkid, accepted);
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                shared.on_connack(ack.properties.as_ref());
                if attempt > 0 {
                    info!("reconnected to MQTT broker after {attempt} attempt(s)");
                    attempt = 0;
                    let shared = shared.clone();
                    tokio::spawn(async move { shared.resubscribe_all().await });
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("bus DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                if let ConnectionError::MqttState(StateError::SubFail { .. }) = &err {
                    lock(&shared.acks).reject_in_flight();
                }
                shared.connection_lost();
                attempt = attempt.saturating_add(1);
                let delay = compute_retry_backoff_delay(shared.backoff, attempt);
                warn!(
                    "MQTT connection error: {err}; retrying in {}ms (attempt {attempt})",
                    delay.as_millis()
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    shared.connection_lost();
    lock(&shared.acks).clear();
    debug!("bus receive loop stopped");
}
