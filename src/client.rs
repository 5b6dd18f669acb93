//! Thin adapter over `rumqttc` that gives every operation a waitable
//! completion and routes inbound PUBLISH packets to per-filter callbacks.
//!
//! Each client owns one task that polls the event loop. Callbacks run on
//! that task, so they may fire on any runtime worker thread. Dropping a
//! [`BrokerClient`] aborts the task, which closes the socket; call
//! [`BrokerClient::disconnect`] for a graceful DISCONNECT.

use crate::endpoint::{BrokerEndpoint, TransportKind};
use crate::error::{ConformanceError, Result};
use crate::topic;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const REQUEST_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const DEFAULT_MAX_PACKET: usize = 1024 * 1024;

/// One inbound PUBLISH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
}

pub type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// Per-filter SUBACK result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Granted(u8),
    Failure,
}

pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// A pending acknowledgment.
#[must_use]
pub struct Completion<T> {
    operation: String,
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    pub async fn wait(self, budget: Duration) -> Result<T> {
        let started = Instant::now();
        match tokio::time::timeout(budget, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ConformanceError::setup(
                self.operation,
                started,
                "connection closed before acknowledgment",
            )),
            Err(_) => Err(ConformanceError::timed_out(self.operation, budget)),
        }
    }
}

#[derive(Default)]
struct Pending {
    connack: Option<oneshot::Sender<std::result::Result<(), String>>>,
    subacks: VecDeque<oneshot::Sender<Vec<Grant>>>,
    unsubacks: VecDeque<oneshot::Sender<()>>,
    publishes: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

struct Shared {
    client_id: String,
    routes: RwLock<Vec<(String, Handler)>>,
    fallback: Option<Handler>,
    pending: Mutex<Pending>,
    connected: AtomicBool,
}

impl Shared {
    fn incoming(&self, packet: Packet) {
        match packet {
            Packet::ConnAck(ack) => {
                let result = if ack.code == ConnectReturnCode::Success {
                    self.connected.store(true, Ordering::Release);
                    Ok(())
                } else {
                    Err(format!("CONNACK {:?}", ack.code))
                };
                if let Some(tx) = self.pending.lock().connack.take() {
                    let _ = tx.send(result);
                }
            }
            Packet::Publish(publish) => self.dispatch(Delivery {
                topic: publish.topic,
                payload: publish.payload,
                qos: qos_level(publish.qos),
                retain: publish.retain,
            }),
            Packet::SubAck(suback) => {
                let grants = suback
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(granted) => Grant::Granted(qos_level(*granted)),
                        SubscribeReasonCode::Failure => Grant::Failure,
                    })
                    .collect();
                if let Some(tx) = self.pending.lock().subacks.pop_front() {
                    let _ = tx.send(grants);
                }
            }
            Packet::UnsubAck(_) => {
                if let Some(tx) = self.pending.lock().unsubacks.pop_front() {
                    let _ = tx.send(());
                }
            }
            Packet::PubAck(ack) => self.acknowledged(ack.pkid),
            Packet::PubComp(comp) => self.acknowledged(comp.pkid),
            _ => {}
        }
    }

    fn outgoing(&self, outgoing: Outgoing) {
        if let Outgoing::Publish(pkid) = outgoing {
            let mut pending = self.pending.lock();
            if let Some(tx) = pending.publishes.pop_front() {
                // QoS 0 carries packet id 0 and is done once written
                if pkid == 0 {
                    let _ = tx.send(());
                } else {
                    pending.inflight.insert(pkid, tx);
                }
            }
        }
    }

    fn acknowledged(&self, pkid: u16) {
        if let Some(tx) = self.pending.lock().inflight.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        let handler = self
            .routes
            .read()
            .iter()
            .find(|(filter, _)| topic::matches(filter, &delivery.topic))
            .map(|(_, handler)| Arc::clone(handler))
            .or_else(|| self.fallback.clone());

        match handler {
            Some(handler) => handler(&delivery),
            None => trace!(client_id = %self.client_id, topic = %delivery.topic, "unrouted delivery"),
        }
    }

    fn closed(&self, reason: String) {
        self.connected.store(false, Ordering::Release);
        let mut pending = self.pending.lock();
        if let Some(tx) = pending.connack.take() {
            let _ = tx.send(Err(reason));
        }
        // Dropping the senders fails every outstanding completion.
        *pending = Pending::default();
    }
}

async fn drive(mut eventloop: EventLoop, shared: Arc<Shared>) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(packet)) => shared.incoming(packet),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break "disconnected".to_string(),
            Ok(Event::Outgoing(outgoing)) => shared.outgoing(outgoing),
            Err(e) => break e.to_string(),
        }
    };
    debug!(client_id = %shared.client_id, %reason, "event loop finished");
    shared.closed(reason);
}

pub struct BrokerClientBuilder {
    endpoint: BrokerEndpoint,
    client_id: String,
    clean_session: bool,
    will: Option<LastWill>,
    fallback: Option<Handler>,
    max_packet_size: usize,
    credentials: Option<(String, String)>,
}

impl BrokerClientBuilder {
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn will(mut self, topic: &str, payload: &[u8], qos_level: u8) -> Self {
        self.will = Some(LastWill::new(topic, payload.to_vec(), qos(qos_level), false));
        self
    }

    /// Receives deliveries no subscription route claims, including those
    /// replayed by a persistent session right after CONNACK.
    pub fn on_unmatched(mut self, handler: impl Fn(&Delivery) + Send + Sync + 'static) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }

    pub fn credentials(mut self, username: Option<&str>, password: Option<&str>) -> Self {
        self.credentials = username.map(|u| (u.to_string(), password.unwrap_or("").to_string()));
        self
    }

    fn options(&self) -> MqttOptions {
        let mut opts = match self.endpoint.transport {
            TransportKind::Tcp => {
                MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port)
            }
            TransportKind::WebSocket => {
                let mut opts = MqttOptions::new(&self.client_id, &self.endpoint.url, self.endpoint.port);
                opts.set_transport(Transport::Ws);
                opts
            }
        };
        opts.set_keep_alive(KEEP_ALIVE);
        opts.set_clean_session(self.clean_session);
        opts.set_max_packet_size(self.max_packet_size, self.max_packet_size);
        if let Some(will) = &self.will {
            opts.set_last_will(will.clone());
        }
        if let Some((username, password)) = &self.credentials {
            opts.set_credentials(username, password);
        }
        opts
    }

    pub async fn connect(self, budget: Duration) -> Result<BrokerClient> {
        let started = Instant::now();
        let (client, eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        let (tx, rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            client_id: self.client_id.clone(),
            routes: RwLock::new(Vec::new()),
            fallback: self.fallback,
            pending: Mutex::new(Pending {
                connack: Some(tx),
                ..Pending::default()
            }),
            connected: AtomicBool::new(false),
        });
        let task = tokio::spawn(drive(eventloop, Arc::clone(&shared)));

        let operation = format!("connect {} via {}", self.client_id, self.endpoint.name);
        let outcome = match tokio::time::timeout(budget, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(ConformanceError::setup(operation, started, reason)),
            Ok(Err(_)) => Err(ConformanceError::setup(operation, started, "event loop ended")),
            Err(_) => Err(ConformanceError::timed_out(operation, budget)),
        };
        if let Err(e) = outcome {
            task.abort();
            return Err(e);
        }

        debug!(client_id = %self.client_id, endpoint = %self.endpoint.name, "connected");
        Ok(BrokerClient {
            client_id: self.client_id,
            client,
            shared,
            request_lock: tokio::sync::Mutex::new(()),
            task: Some(task),
        })
    }
}

pub struct BrokerClient {
    client_id: String,
    client: AsyncClient,
    shared: Arc<Shared>,
    // keeps "register waiter, then enqueue request" atomic per client
    request_lock: tokio::sync::Mutex<()>,
    task: Option<JoinHandle<()>>,
}

impl BrokerClient {
    pub fn builder(endpoint: &BrokerEndpoint, client_id: impl Into<String>) -> BrokerClientBuilder {
        BrokerClientBuilder {
            endpoint: endpoint.clone(),
            client_id: client_id.into(),
            clean_session: true,
            will: None,
            fallback: None,
            max_packet_size: DEFAULT_MAX_PACKET,
            credentials: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Routes matching deliveries to `handler` (first matching route wins)
    /// and sends SUBSCRIBE. Routes outlive UNSUBSCRIBE so late deliveries
    /// are still observed.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos_level: u8,
        handler: impl Fn(&Delivery) + Send + Sync + 'static,
    ) -> Result<Completion<Vec<Grant>>> {
        let _guard = self.request_lock.lock().await;
        self.shared.routes.write().push((filter.to_string(), Arc::new(handler)));

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().subacks.push_back(tx);
        if let Err(e) = self.client.subscribe(filter, qos(qos_level)).await {
            self.shared.pending.lock().subacks.pop_back();
            return Err(e.into());
        }
        Ok(Completion {
            operation: format!("subscribe {filter}"),
            rx,
        })
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<Completion<()>> {
        let _guard = self.request_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unsubacks.push_back(tx);
        if let Err(e) = self.client.unsubscribe(filter).await {
            self.shared.pending.lock().unsubacks.pop_back();
            return Err(e.into());
        }
        Ok(Completion {
            operation: format!("unsubscribe {filter}"),
            rx,
        })
    }

    /// Completes on PUBACK (QoS 1), PUBCOMP (QoS 2) or once written (QoS 0).
    pub async fn publish(
        &self,
        topic: &str,
        qos_level: u8,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Completion<()>> {
        let _guard = self.request_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().publishes.push_back(tx);
        if let Err(e) = self.client.publish(topic, qos(qos_level), retain, payload).await {
            self.shared.pending.lock().publishes.pop_back();
            return Err(e.into());
        }
        Ok(Completion {
            operation: format!("publish QoS{qos_level} {topic}"),
            rx,
        })
    }

    /// Sends DISCONNECT and gives the event loop `linger` to flush it.
    pub async fn disconnect(mut self, linger: Duration) {
        if self.client.disconnect().await.is_err() {
            return;
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(linger, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Expectation, Mailbox};

    fn shared(fallback: Option<Handler>) -> Shared {
        Shared {
            client_id: "test".to_string(),
            routes: RwLock::new(Vec::new()),
            fallback,
            pending: Mutex::new(Pending::default()),
            connected: AtomicBool::new(false),
        }
    }

    fn publish(topic: &str, qos: QoS) -> Packet {
        let mut p = rumqttc::Publish::new(topic, qos, b"x".to_vec());
        p.pkid = 1;
        Packet::Publish(p)
    }

    #[tokio::test]
    async fn test_first_matching_route_wins() {
        let shared = shared(None);
        let exact = Expectation::count(1);
        let wildcard = Expectation::count(1);
        let exact_sink = exact.sink();
        let wildcard_sink = wildcard.sink();
        shared.routes.write().push(("a/b".to_string(), Arc::new(move |_: &Delivery| {
            exact_sink.hit();
        })));
        shared.routes.write().push(("a/+".to_string(), Arc::new(move |_: &Delivery| {
            wildcard_sink.hit();
        })));

        shared.incoming(publish("a/b", QoS::AtLeastOnce));
        shared.incoming(publish("a/c", QoS::AtLeastOnce));

        assert_eq!(exact.observed(), 1);
        assert_eq!(wildcard.observed(), 1);
    }

    #[tokio::test]
    async fn test_unrouted_goes_to_fallback() {
        let mut mailbox = Mailbox::new();
        let tx = mailbox.sender();
        let shared = shared(Some(Arc::new(move |d: &Delivery| {
            let _ = tx.send(d.clone());
        })));

        shared.incoming(publish("$SYS/broker/uptime", QoS::ExactlyOnce));

        let delivery = mailbox.recv_within(Duration::from_millis(10)).await.unwrap();
        assert_eq!(delivery.topic, "$SYS/broker/uptime");
        assert_eq!(delivery.qos, 2);
    }

    #[tokio::test]
    async fn test_publish_completions_follow_packet_ids() {
        let shared = shared(None);
        let (tx0, rx0) = oneshot::channel();
        let (tx1, rx1) = oneshot::channel();
        shared.pending.lock().publishes.extend([tx0, tx1]);

        shared.outgoing(Outgoing::Publish(0));
        shared.outgoing(Outgoing::Publish(9));
        assert!(rx0.await.is_ok());

        shared.incoming(Packet::PubAck(rumqttc::PubAck::new(9)));
        assert!(rx1.await.is_ok());
    }

    #[tokio::test]
    async fn test_suback_grants() {
        let shared = shared(None);
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().subacks.push_back(tx);

        shared.incoming(Packet::SubAck(rumqttc::SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(QoS::AtLeastOnce), SubscribeReasonCode::Failure],
        )));

        assert_eq!(rx.await.unwrap(), vec![Grant::Granted(1), Grant::Failure]);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_completions() {
        let shared = shared(None);
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().unsubacks.push_back(tx);

        shared.closed("connection reset".to_string());

        let completion = Completion {
            operation: "unsubscribe t".to_string(),
            rx,
        };
        let err = completion.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("connection closed"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_setup_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = BrokerEndpoint::parse("tcp", &format!("tcp://127.0.0.1:{port}")).unwrap();
        let result = BrokerClient::builder(&endpoint, "refused")
            .connect(Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ConformanceError::Setup { .. })));
    }
}
