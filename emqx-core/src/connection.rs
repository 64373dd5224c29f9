// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One MQTT session per connector instance.
//!
//! [`ConnectionManager`] owns the client and a single driver task that polls
//! the event loop. Every protocol event (CONNACK, SUBACK, PUBACK, PUBREC,
//! PUBCOMP, PUBREL, incoming PUBLISH) is handled sequentially on that task,
//! so deliveries of one subscription never interleave. Everything else talks
//! to the session through the manager's methods.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use rumqttc::{
    ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, Publish, SubscribeReasonCode,
    Transport,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::{EmqxConfig, QoS};
use crate::error::{ConnectionError, PublishError};
use crate::topic;
use crate::tracker::{AckState, PacketTracker, ReceiveTracker};
use crate::transport::{MqttClient, MqttEventLoop, MqttTransport, RumqttcTransport};

/// How long the driver gets to observe a DISCONNECT before it is aborted.
const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_REQUEST_CAPACITY: usize = 10;

/// Lifecycle of the session as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
    Failed(ConnectionError),
}

/// One live subscribe relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub topic: String,
    pub qos: QoS,
    pub client_id: String,
}

/// An incoming publish together with what is needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct RawMessage {
    publish: Publish,
}

impl RawMessage {
    pub fn new(publish: Publish) -> Self {
        Self { publish }
    }

    pub fn topic(&self) -> &str {
        &self.publish.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.publish.payload
    }

    pub fn qos(&self) -> QoS {
        self.publish.qos.into()
    }

    /// Packet id of a QoS 1/2 message; QoS 0 messages have none.
    pub fn message_id(&self) -> Option<u16> {
        (self.qos().requires_ack() && self.publish.pkid != 0).then_some(self.publish.pkid)
    }

    pub fn is_duplicate(&self) -> bool {
        self.publish.dup
    }

    pub fn is_retained(&self) -> bool {
        self.publish.retain
    }
}

/// Lazy, non-restartable sequence of messages for one subscription.
///
/// Ends for good when it is closed or when the connection goes away.
pub struct Subscription {
    id: u64,
    handle: SubscriptionHandle,
    receiver: mpsc::Receiver<RawMessage>,
    shared: Arc<Shared>,
    closed: bool,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Wait for the next message. `None` means the sequence is over.
    pub async fn next(&mut self) -> Option<RawMessage> {
        if self.closed {
            return None;
        }
        let message = self.receiver.recv().await;
        if message.is_none() {
            self.close();
        }
        message
    }

    /// Stop the sequence. Buffered messages are discarded unacknowledged, so
    /// the broker redelivers them to a persistent session.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.receiver.close();
            self.shared.remove_subscription(self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct ActiveSubscription {
    id: u64,
    handle: SubscriptionHandle,
    sender: mpsc::Sender<RawMessage>,
}

type DeliveryOutcome = Result<(), PublishError>;
type SubscribeOutcome = Result<(), ConnectionError>;

/// State shared between the manager, its driver task and its subscriptions.
struct Shared {
    client_id: String,
    broker: String,
    state: watch::Sender<ConnectionState>,
    closing: AtomicBool,
    subscriptions: Mutex<Vec<ActiveSubscription>>,
    next_subscription_id: AtomicU64,
    deliveries: Mutex<PacketTracker<DeliveryOutcome>>,
    subacks: Mutex<PacketTracker<SubscribeOutcome>>,
    in_flight: watch::Sender<usize>,
    received: ReceiveTracker,
    /// Serializes registration + hand-over of publishes so the tracker
    /// order matches the client's request order.
    publish_lock: tokio::sync::Mutex<()>,
    subscribe_lock: tokio::sync::Mutex<()>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn is_usable(&self) -> bool {
        !self.is_closing()
            && !matches!(
                *self.state.borrow(),
                ConnectionState::Closed | ConnectionState::Failed(_)
            )
    }

    fn add_subscription(&self, handle: SubscriptionHandle, sender: mpsc::Sender<RawMessage>) -> u64 {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscriptions).push(ActiveSubscription { id, handle, sender });
        id
    }

    fn remove_subscription(&self, id: u64) {
        lock(&self.subscriptions).retain(|s| s.id != id);
    }

    fn active_handles(&self) -> Vec<SubscriptionHandle> {
        lock(&self.subscriptions)
            .iter()
            .map(|s| s.handle.clone())
            .collect()
    }

    fn refresh_in_flight(&self) {
        let pending = lock(&self.deliveries).pending();
        self.in_flight.send_replace(pending);
    }

    /// Hand an incoming publish to the first subscription whose filter
    /// matches. Waits while that subscription's buffer is full.
    async fn route(&self, client: &Arc<dyn MqttClient>, publish: Publish) {
        if !self.received.admit(&publish) {
            debug!(
                "[{}] Suppressed QoS 2 redelivery of packet {} on '{}'",
                self.client_id, publish.pkid, publish.topic
            );
            // Already accepted downstream: repeat the PUBREC the broker missed.
            if self.received.state(publish.pkid) == Some(AckState::Acked) {
                let client = client.clone();
                tokio::spawn(async move {
                    let _ = client.ack(&publish).await;
                });
            }
            return;
        }

        let target = lock(&self.subscriptions)
            .iter()
            .find(|s| topic::matches(&s.handle.topic, &publish.topic))
            .map(|s| (s.id, s.sender.clone()));

        let pkid = publish.pkid;
        match target {
            Some((id, sender)) => {
                let topic = publish.topic.clone();
                if sender.send(RawMessage::new(publish)).await.is_err() {
                    debug!(
                        "[{}] Subscription closed; dropping message on '{topic}'",
                        self.client_id
                    );
                    self.remove_subscription(id);
                    self.received.failed(pkid);
                }
            }
            None => {
                warn!(
                    "[{}] No active subscription for message on '{}'",
                    self.client_id, publish.topic
                );
                self.received.failed(pkid);
            }
        }
    }

    /// Tear down everything that depends on the session.
    fn finish(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Failed(_) | ConnectionState::Closed) {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        lock(&self.deliveries).fail_all(|_| Err(PublishError::Closed));
        lock(&self.subacks).fail_all(|_| Err(ConnectionError::Closed));
        lock(&self.subscriptions).clear();
        self.in_flight.send_replace(0);
    }
}

/// Owner of one MQTT session.
pub struct ConnectionManager {
    config: Arc<EmqxConfig>,
    client: Arc<dyn MqttClient>,
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Connect to the configured broker with the `rumqttc` transport.
    pub async fn connect(config: Arc<EmqxConfig>) -> Result<Self, ConnectionError> {
        Self::connect_with(config, Arc::new(RumqttcTransport)).await
    }

    /// Connect through `transport`, waiting for the first CONNACK up to the
    /// configured connect timeout.
    pub async fn connect_with(
        config: Arc<EmqxConfig>,
        transport: Arc<dyn MqttTransport>,
    ) -> Result<Self, ConnectionError> {
        info!(
            "[{}] Connecting to MQTT broker {} (clean_session={})",
            config.client_id, config.broker, config.clean_session
        );

        let options = mqtt_options(&config);
        let (client, eventloop) =
            transport.open(options, config.buffer_capacity.max(MIN_REQUEST_CAPACITY));

        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Connecting);
        let (in_flight_tx, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            client_id: config.client_id.clone(),
            broker: config.broker.to_string(),
            state: state_tx,
            closing: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            next_subscription_id: AtomicU64::new(0),
            deliveries: Mutex::new(PacketTracker::new()),
            subacks: Mutex::new(PacketTracker::new()),
            in_flight: in_flight_tx,
            received: ReceiveTracker::new(),
            publish_lock: tokio::sync::Mutex::new(()),
            subscribe_lock: tokio::sync::Mutex::new(()),
        });

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            shared.clone(),
            config.clone(),
        ));
        let manager = Self {
            config: config.clone(),
            client,
            shared,
            driver: Mutex::new(Some(driver)),
        };

        let outcome = tokio::time::timeout(config.connect_timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed(e) => return Err(e),
                    ConnectionState::Closed => return Err(ConnectionError::Closed),
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(ConnectionError::Closed);
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                info!("[{}] Connected to {}", config.client_id, config.broker);
                Ok(manager)
            }
            Ok(Err(e)) => {
                error!("[{}] Connection failed: {e}", config.client_id);
                manager.abort();
                Err(e)
            }
            Err(_) => {
                error!(
                    "[{}] No CONNACK from {} within {:?}",
                    config.client_id, config.broker, config.connect_timeout
                );
                manager.abort();
                Err(ConnectionError::Timeout {
                    operation: "CONNACK",
                    timeout: config.connect_timeout,
                })
            }
        }
    }

    pub fn config(&self) -> &EmqxConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscriptions that will be re-established after a reconnect.
    pub fn subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.shared.active_handles()
    }

    /// Publishes still waiting for PUBACK / PUBCOMP.
    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.borrow()
    }

    /// Incoming messages handed out but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.shared.received.unacked()
    }

    fn ensure_usable(&self) -> Result<(), ConnectionError> {
        if self.shared.is_usable() {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    /// Subscribe to `filter` and wait for the broker's SUBACK.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Subscription, ConnectionError> {
        self.ensure_usable()?;
        topic::validate_filter(filter).map_err(|reason| ConnectionError::InvalidTopic {
            topic: filter.to_string(),
            reason,
        })?;

        let handle = SubscriptionHandle {
            topic: filter.to_string(),
            qos,
            client_id: self.config.client_id.clone(),
        };
        let (sender, receiver) = mpsc::channel(self.config.buffer_capacity);
        let id = self.shared.add_subscription(handle.clone(), sender);
        let subscription = Subscription {
            id,
            handle,
            receiver,
            shared: self.shared.clone(),
            closed: false,
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _guard = self.shared.subscribe_lock.lock().await;
            let token = lock(&self.shared.subacks).register(filter, qos, Some(ack_tx));
            if let Err(e) = self.client.subscribe(filter, qos).await {
                lock(&self.shared.subacks).withdraw(token);
                return Err(e);
            }
        }

        match tokio::time::timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(
                    "[{}] Subscribed to '{filter}' at QoS {qos}",
                    self.config.client_id
                );
                Ok(subscription)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::Timeout {
                operation: "SUBACK",
                timeout: self.config.ack_timeout,
            }),
        }
    }

    /// Remove the broker-side subscription for `filter`.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), ConnectionError> {
        lock(&self.shared.subscriptions).retain(|s| s.handle.topic != filter);
        self.client.unsubscribe(filter).await
    }

    /// Acknowledge a message after the consumer accepted it. No-op for QoS 0.
    pub async fn ack(&self, message: &RawMessage) -> Result<(), ConnectionError> {
        let Some(pkid) = message.message_id() else {
            return Ok(());
        };
        self.client.ack(&message.publish).await?;
        self.shared.received.acked(pkid);
        Ok(())
    }

    /// Publish `payload` to `topic`.
    ///
    /// QoS 0 returns as soon as the request is queued. QoS 1 waits for
    /// PUBACK and QoS 2 for PUBCOMP, both bounded by the ack timeout.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: impl Into<Bytes>,
    ) -> Result<(), PublishError> {
        if !self.shared.is_usable() {
            return Err(PublishError::Closed);
        }
        let payload = payload.into();
        let rejected = |e: ConnectionError| PublishError::Rejected {
            topic: topic.to_string(),
            reason: e.to_string(),
        };

        if !qos.requires_ack() {
            return self
                .client
                .publish(topic, qos, false, payload)
                .await
                .map_err(rejected);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let token = {
            let _guard = self.shared.publish_lock.lock().await;
            let token = lock(&self.shared.deliveries).register(topic, qos, Some(ack_tx));
            self.shared.refresh_in_flight();
            if let Err(e) = self.client.publish(topic, qos, false, payload).await {
                lock(&self.shared.deliveries).withdraw(token);
                self.shared.refresh_in_flight();
                return Err(rejected(e));
            }
            token
        };

        match tokio::time::timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PublishError::Closed),
            Err(_) => {
                let pkid = lock(&self.shared.deliveries).abandon(token);
                self.shared.refresh_in_flight();
                warn!(
                    "[{}] Publish to '{topic}' not acknowledged within {:?}",
                    self.config.client_id, self.config.ack_timeout
                );
                Err(PublishError::AckTimeout {
                    topic: topic.to_string(),
                    pkid,
                    timeout: self.config.ack_timeout,
                })
            }
        }
    }

    /// Graceful shutdown: refuse new requests, wait up to `grace` for
    /// in-flight publishes to be acknowledged, then close the session.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] Shutting down MQTT connection", self.config.client_id);

        let mut in_flight = self.shared.in_flight.subscribe();
        if tokio::time::timeout(grace, in_flight.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            warn!(
                "[{}] {} publish(es) still unacknowledged after {grace:?}; closing anyway",
                self.config.client_id,
                self.in_flight()
            );
        }
        self.close(false).await;
    }

    /// Release the session immediately.
    ///
    /// With `purge_session`, every active filter is unsubscribed before
    /// DISCONNECT, so the broker queues nothing new for this client id. It
    /// does not discard a non-clean session itself: messages already queued
    /// and unfinished QoS 1/2 exchanges stay on the broker until a later
    /// connection with the same client id and `clean-session=true`.
    pub async fn disconnect(&self, purge_session: bool) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close(purge_session).await;
    }

    async fn close(&self, purge_session: bool) {
        if purge_session {
            for handle in self.shared.active_handles() {
                if let Err(e) = self.client.unsubscribe(&handle.topic).await {
                    warn!(
                        "[{}] Failed to unsubscribe '{}': {e}",
                        self.config.client_id, handle.topic
                    );
                }
            }
        }
        if let Err(e) = self.client.disconnect().await {
            debug!("[{}] Disconnect request failed: {e}", self.config.client_id);
        }

        let driver = lock(&self.driver).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DRIVER_STOP_TIMEOUT, &mut driver)
                .await
                .is_err()
            {
                driver.abort();
            }
        }
        self.shared.finish();
        info!("[{}] MQTT connection closed", self.config.client_id);
    }

    fn abort(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        self.shared.finish();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }
}

fn mqtt_options(config: &EmqxConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker.host.clone(),
        config.broker.port,
    );
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(config.clean_session);
    // Incoming messages are acknowledged only after the consumer took them.
    options.set_manual_acks(true);

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        options.set_credentials(username.clone(), password);
    }
    if config.broker.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Connection failures that retrying cannot fix.
fn fatal_error(e: &rumqttc::ConnectionError) -> Option<ConnectionError> {
    match e {
        rumqttc::ConnectionError::ConnectionRefused(code) => refusal(*code),
        rumqttc::ConnectionError::Tls(e) => Some(ConnectionError::Tls(e.to_string())),
        _ => None,
    }
}

fn refusal(code: ConnectReturnCode) -> Option<ConnectionError> {
    match code {
        ConnectReturnCode::Success | ConnectReturnCode::ServiceUnavailable => None,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            Some(ConnectionError::AuthRejected(format!("{code:?}")))
        }
        other => Some(ConnectionError::Refused(format!("{other:?}"))),
    }
}

fn resubscribe(client: Arc<dyn MqttClient>, shared: Arc<Shared>) {
    tokio::spawn(async move {
        let _guard = shared.subscribe_lock.lock().await;
        for handle in shared.active_handles() {
            let token = lock(&shared.subacks).register(handle.topic.as_str(), handle.qos, None);
            match client.subscribe(&handle.topic, handle.qos).await {
                Ok(()) => info!(
                    "[{}] Resubscribed to '{}' at QoS {}",
                    shared.client_id, handle.topic, handle.qos
                ),
                Err(e) => {
                    lock(&shared.subacks).withdraw(token);
                    error!(
                        "[{}] Failed to resubscribe to '{}': {e}",
                        shared.client_id, handle.topic
                    );
                }
            }
        }
    });
}

/// The single I/O context of a connection.
async fn drive(
    mut eventloop: Box<dyn MqttEventLoop>,
    client: Arc<dyn MqttClient>,
    shared: Arc<Shared>,
    config: Arc<EmqxConfig>,
) {
    let id = config.client_id.clone();
    let mut backoff = Backoff::from_policy(&config.reconnect);
    let mut sessions: u64 = 0;

    info!("[{id}] MQTT event loop started");
    loop {
        let event = eventloop.poll().await;

        if shared.is_closing()
            && matches!(event, Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_))
        {
            debug!("[{id}] Event loop stopped after disconnect");
            break;
        }

        match event {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                if let Some(e) = refusal(connack.code) {
                    error!("[{id}] Broker refused connection: {e}");
                    shared.set_state(ConnectionState::Failed(e));
                    break;
                }
                if connack.code != ConnectReturnCode::Success {
                    warn!("[{id}] Broker unavailable ({:?}); retrying", connack.code);
                    continue;
                }

                backoff.reset();
                sessions += 1;
                if !connack.session_present {
                    shared.received.clear();
                }
                shared.set_state(ConnectionState::Connected);

                if sessions > 1 {
                    info!(
                        "[{id}] Reconnected (session_present={})",
                        connack.session_present
                    );
                    resubscribe(client.clone(), shared.clone());
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => shared.route(&client, publish).await,
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                lock(&shared.deliveries).complete(ack.pkid, QoS::AtLeastOnce, Ok(()));
                shared.refresh_in_flight();
            }
            Ok(Event::Incoming(Packet::PubRec(rec))) => {
                debug!("[{id}] PUBREC for packet {}", rec.pkid);
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                lock(&shared.deliveries).complete(comp.pkid, QoS::ExactlyOnce, Ok(()));
                shared.refresh_in_flight();
            }
            Ok(Event::Incoming(Packet::PubRel(rel))) => shared.received.released(rel.pkid),
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let rejected = suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let topic = lock(&shared.subacks).resolve(suback.pkid, |topic| {
                    if rejected {
                        Err(ConnectionError::SubscribeRejected(topic.to_string()))
                    } else {
                        Ok(())
                    }
                });
                if rejected {
                    warn!(
                        "[{id}] Broker rejected subscription to '{}'",
                        topic.as_deref().unwrap_or("<unknown>")
                    );
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                lock(&shared.deliveries).assign(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                lock(&shared.subacks).assign(pkid);
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(fatal) = fatal_error(&e) {
                    error!("[{id}] Fatal MQTT connection error: {fatal}");
                    shared.set_state(ConnectionState::Failed(fatal));
                    break;
                }

                let attempt = backoff.failures() + 1;
                let max_attempts = config.reconnect.max_attempts;
                if max_attempts > 0 && attempt >= max_attempts {
                    let failure = ConnectionError::Unreachable {
                        broker: shared.broker.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    };
                    error!("[{id}] Giving up: {failure}");
                    shared.set_state(ConnectionState::Failed(failure));
                    break;
                }

                let delay = backoff.next_delay();
                warn!("[{id}] MQTT connection error (attempt {attempt}, retrying in {delay:?}): {e}");
                shared.set_state(ConnectionState::Reconnecting { attempt });
                tokio::time::sleep(delay).await;
            }
        }
    }

    shared.finish();
    info!("[{id}] MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::testing::{eventually, ConnectOutcome, MockBroker};

    fn config() -> EmqxConfig {
        EmqxConfig::builder("tcp://localhost:1883", "sensor/+")
            .client_id("test-client")
            .qos(QoS::AtLeastOnce)
            .ack_timeout(Duration::from_millis(200))
            .connect_timeout(Duration::from_secs(2))
            .reconnect(ReconnectPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            })
            .build()
            .unwrap()
    }

    async fn connect(broker: &MockBroker, config: EmqxConfig) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::connect_with(Arc::new(config), Arc::new(broker.clone()))
            .await
            .unwrap();
        Arc::new(manager)
    }

    #[tokio::test]
    async fn test_connect_applies_session_options() {
        let broker = MockBroker::new();
        let config = EmqxConfig::builder("tcp://localhost:1883", "sensor/+")
            .client_id("opts-client")
            .clean_session(false)
            .username("user")
            .password("secret")
            .build()
            .unwrap();
        let manager = connect(&broker, config).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        let options = broker.options().unwrap();
        assert_eq!(options.client_id(), "opts-client");
        assert!(!options.clean_session());
        assert!(options.manual_acks());
    }

    #[tokio::test]
    async fn test_qos0_publish_does_not_wait() {
        let broker = MockBroker::new();
        broker.set_auto_ack(false);
        let manager = connect(&broker, config()).await;

        manager
            .publish("out/1", QoS::AtMostOnce, &b"{}"[..])
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].pkid, 0);
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_qos1_publish_waits_for_puback() {
        let broker = MockBroker::new();
        broker.set_auto_ack(false);
        let manager = connect(&broker, config()).await;

        let publisher = manager.clone();
        let task = tokio::spawn(async move {
            publisher
                .publish("out/1", QoS::AtLeastOnce, &b"{\"id\":1}"[..])
                .await
        });

        assert!(eventually(|| manager.in_flight() == 1).await);
        assert!(!task.is_finished());

        let pkid = broker.published()[0].pkid;
        broker.complete_publish(pkid);
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_qos2_publish_completes_on_pubcomp() {
        let broker = MockBroker::new();
        let manager = connect(&broker, config()).await;

        manager
            .publish("out/2", QoS::ExactlyOnce, &b"{}"[..])
            .await
            .unwrap();
        assert_eq!(broker.published()[0].qos, QoS::ExactlyOnce);
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_ack_timeout() {
        let broker = MockBroker::new();
        broker.set_auto_ack(false);
        let manager = connect(&broker, config()).await;

        let err = manager
            .publish("out/1", QoS::AtLeastOnce, &b"{}"[..])
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        match err {
            PublishError::AckTimeout { topic, pkid, .. } => {
                assert_eq!(topic, "out/1");
                assert_eq!(pkid, Some(broker.published()[0].pkid));
            }
            other => panic!("expected ack timeout, got {other:?}"),
        }
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receive_and_ack() {
        let broker = MockBroker::new();
        let manager = connect(&broker, config()).await;

        let mut subscription = manager.subscribe("sensor/+", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(broker.subscriptions(), vec!["sensor/+".to_string()]);
        assert_eq!(manager.subscriptions().len(), 1);

        let pkid = broker.inject_publish("sensor/1", QoS::AtLeastOnce, b"{\"id\":1}".to_vec());
        let message = subscription.next().await.unwrap();
        assert_eq!(message.topic(), "sensor/1");
        assert_eq!(message.payload().as_ref(), b"{\"id\":1}");
        assert_eq!(message.message_id(), Some(pkid));
        assert_eq!(manager.unacked(), 1);

        manager.ack(&message).await.unwrap();
        assert_eq!(broker.acked(), vec![pkid]);
        assert_eq!(manager.unacked(), 0);
    }

    #[tokio::test]
    async fn test_qos2_redelivery_reaches_consumer_once() {
        let broker = MockBroker::new();
        let manager = connect(&broker, config()).await;
        let mut subscription = manager.subscribe("sensor/#", QoS::ExactlyOnce).await.unwrap();

        let mut publish = Publish::new("sensor/1", rumqttc::QoS::ExactlyOnce, b"{}".to_vec());
        publish.pkid = 42;
        let mut duplicate = publish.clone();
        duplicate.dup = true;
        broker.inject(publish);
        broker.inject(duplicate);
        broker.inject_publish("sensor/2", QoS::ExactlyOnce, b"{}".to_vec());

        let first = subscription.next().await.unwrap();
        assert_eq!(first.message_id(), Some(42));
        let second = subscription.next().await.unwrap();
        assert_eq!(second.topic(), "sensor/2");
    }

    #[tokio::test]
    async fn test_subscription_rejected() {
        let broker = MockBroker::new();
        broker.reject_subscriptions("forbidden/#");
        let manager = connect(&broker, config()).await;

        let err = manager
            .subscribe("forbidden/#", QoS::AtLeastOnce)
            .await
            .err()
            .unwrap();
        assert_eq!(err, ConnectionError::SubscribeRejected("forbidden/#".into()));
        assert!(manager.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter() {
        let broker = MockBroker::new();
        let manager = connect(&broker, config()).await;
        let err = manager.subscribe("a/#/b", QoS::AtLeastOnce).await.err().unwrap();
        assert!(matches!(err, ConnectionError::InvalidTopic { .. }));
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnect() {
        let broker = MockBroker::new();
        let manager = connect(&broker, config()).await;
        let mut subscription = manager.subscribe("sensor/+", QoS::AtLeastOnce).await.unwrap();

        broker.drop_connection();
        assert!(eventually(|| broker.subscribe_requests().len() == 2).await);
        assert!(eventually(|| manager.state() == ConnectionState::Connected).await);
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(
            broker.subscribe_requests()[1],
            ("sensor/+".to_string(), QoS::AtLeastOnce)
        );

        broker.inject_publish("sensor/7", QoS::AtLeastOnce, b"{}".to_vec());
        let message = subscription.next().await.unwrap();
        assert_eq!(message.topic(), "sensor/7");
    }

    #[tokio::test]
    async fn test_persistent_session_suppresses_redelivery_after_reconnect() {
        let broker = MockBroker::new();
        broker.set_session_present(true);
        broker.set_auto_release(false);
        let config = EmqxConfig::builder("tcp://localhost:1883", "sensor/#")
            .client_id("persistent")
            .clean_session(false)
            .build()
            .unwrap();
        let manager = connect(&broker, config).await;
        let mut subscription = manager.subscribe("sensor/#", QoS::ExactlyOnce).await.unwrap();

        let mut publish = Publish::new("sensor/1", rumqttc::QoS::ExactlyOnce, b"{}".to_vec());
        publish.pkid = 42;
        let mut duplicate = publish.clone();
        duplicate.dup = true;

        broker.inject(publish);
        let message = subscription.next().await.unwrap();
        manager.ack(&message).await.unwrap();
        assert_eq!(broker.acked(), vec![42]);

        broker.drop_connection();
        assert!(eventually(|| broker.subscribe_requests().len() == 2).await);
        assert!(eventually(|| manager.state() == ConnectionState::Connected).await);
        assert_eq!(
            broker.subscribe_requests()[1],
            ("sensor/#".to_string(), QoS::ExactlyOnce)
        );

        // The broker missed our PUBREC and sends the message again.
        broker.inject(duplicate);
        assert!(eventually(|| broker.acked() == vec![42, 42]).await);

        broker.inject_publish("sensor/2", QoS::ExactlyOnce, b"{}".to_vec());
        let next = subscription.next().await.unwrap();
        assert_eq!(next.topic(), "sensor/2");
        assert_eq!(manager.unacked(), 1);
    }

    #[tokio::test]
    async fn test_qos2_redelivery_after_failed_handoff() {
        let broker = MockBroker::new();
        let manager = connect(&broker, config()).await;
        let mut sensors = manager.subscribe("sensor/+", QoS::AtLeastOnce).await.unwrap();

        let mut publish = Publish::new("other/1", rumqttc::QoS::ExactlyOnce, b"{}".to_vec());
        publish.pkid = 7;
        let mut duplicate = publish.clone();
        duplicate.dup = true;

        // Nobody listens on other/1 yet; the sensor message marks it as routed.
        broker.inject(publish);
        broker.inject_publish("sensor/1", QoS::AtLeastOnce, b"{}".to_vec());
        sensors.next().await.unwrap();
        assert!(broker.acked().is_empty());

        let mut others = manager.subscribe("other/#", QoS::ExactlyOnce).await.unwrap();
        broker.inject(duplicate);
        let message = others.next().await.unwrap();
        assert_eq!(message.message_id(), Some(7));
        assert!(message.is_duplicate());

        manager.ack(&message).await.unwrap();
        assert_eq!(broker.acked(), vec![7]);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_fatal() {
        let broker = MockBroker::new();
        broker.script_connect([ConnectOutcome::Refuse(ConnectReturnCode::BadUserNamePassword)]);

        let err = ConnectionManager::connect_with(Arc::new(config()), Arc::new(broker.clone()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectionError::AuthRejected(_)));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_after_max_attempts() {
        let broker = MockBroker::new();
        broker.script_connect([ConnectOutcome::Unreachable; 5]);

        let err = ConnectionManager::connect_with(Arc::new(config()), Arc::new(broker.clone()))
            .await
            .err()
            .unwrap();
        match err {
            ConnectionError::Unreachable { attempts, broker: uri, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(uri, "localhost:1883");
            }
            other => panic!("expected unreachable, got {other:?}"),
        }
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_recovers_within_attempt_budget() {
        let broker = MockBroker::new();
        broker.script_connect([ConnectOutcome::Unreachable, ConnectOutcome::Unreachable]);
        let manager = connect(&broker, config()).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let broker = MockBroker::new();
        broker.set_auto_ack(false);
        let config = EmqxConfig::builder("tcp://localhost:1883", "out")
            .client_id("drain")
            .ack_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let manager = connect(&broker, config).await;

        let publisher = manager.clone();
        let publish = tokio::spawn(async move {
            publisher
                .publish("out", QoS::AtLeastOnce, &b"{}"[..])
                .await
        });
        assert!(eventually(|| manager.in_flight() == 1).await);

        let closer = manager.clone();
        let shutdown =
            tokio::spawn(async move { closer.shutdown(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());

        // New work is refused while draining.
        assert_eq!(
            manager.publish("out", QoS::AtMostOnce, &b"{}"[..]).await,
            Err(PublishError::Closed)
        );

        broker.complete_publish(broker.published()[0].pkid);
        assert_eq!(publish.await.unwrap(), Ok(()));
        shutdown.await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_purges_and_ends_subscriptions() {
        let broker = MockBroker::new();
        let manager = connect(&broker, config()).await;
        let mut subscription = manager.subscribe("sensor/+", QoS::AtLeastOnce).await.unwrap();

        manager.disconnect(true).await;

        assert!(broker.subscriptions().is_empty());
        assert!(subscription.next().await.is_none());
        assert!(subscription.is_closed());
        assert!(subscription.next().await.is_none());
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager
            .subscribe("sensor/+", QoS::AtLeastOnce)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_closed_subscription_is_forgotten() {
        let broker = MockBroker::new();
        let manager = connect(&broker, config()).await;
        let mut subscription = manager.subscribe("sensor/+", QoS::AtLeastOnce).await.unwrap();
        subscription.close();
        assert!(subscription.next().await.is_none());
        assert!(manager.subscriptions().is_empty());
    }

    #[test]
    fn test_refusal_classification() {
        assert!(refusal(ConnectReturnCode::Success).is_none());
        assert!(refusal(ConnectReturnCode::ServiceUnavailable).is_none());
        assert!(matches!(
            refusal(ConnectReturnCode::NotAuthorized),
            Some(ConnectionError::AuthRejected(_))
        ));
        assert!(matches!(
            refusal(ConnectReturnCode::BadClientId),
            Some(ConnectionError::Refused(_))
        ));
    }
}
