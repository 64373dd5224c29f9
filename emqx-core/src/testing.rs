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

//! In-memory broker used by the test suites of this workspace.
//!
//! [`MockBroker`] implements [`MqttTransport`]. Its client answers requests
//! the way a well-behaved broker would (SUBACK, PUBACK, PUBREC/PUBCOMP) and
//! its event loop replays them in order, so the real connection code runs
//! unchanged against it.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    ConnAck, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, PubAck, PubComp, PubRec,
    PubRel, Publish, SubAck, SubscribeReasonCode,
};
use tokio::sync::mpsc;

use crate::config::QoS;
use crate::connection::lock;
use crate::error::ConnectionError;
use crate::transport::{MqttClient, MqttEventLoop, MqttTransport};

/// What the broker answers to the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse(ConnectReturnCode),
    Unreachable,
}

/// A publish the client handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub pkid: u16,
    pub payload: Bytes,
}

enum MockEvent {
    Event(Event),
    Drop,
}

struct Inner {
    events: Mutex<mpsc::UnboundedSender<MockEvent>>,
    pending_loop: Mutex<Option<mpsc::UnboundedReceiver<MockEvent>>>,
    connected: AtomicBool,
    session_present: AtomicBool,
    connect_attempts: AtomicUsize,
    connect_script: Mutex<VecDeque<ConnectOutcome>>,
    next_pkid: AtomicU16,
    auto_ack: AtomicBool,
    auto_release: AtomicBool,
    rejected_filters: Mutex<HashSet<String>>,
    subscribe_requests: Mutex<Vec<(String, QoS)>>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    acked: Mutex<Vec<u16>>,
    options: Mutex<Option<MqttOptions>>,
}

impl Inner {
    fn push(&self, event: Event) {
        let _ = lock(&self.events).send(MockEvent::Event(event));
    }

    fn next_pkid(&self) -> u16 {
        let pkid = self.next_pkid.fetch_add(1, Ordering::SeqCst);
        if pkid == 0 {
            self.next_pkid.fetch_add(1, Ordering::SeqCst)
        } else {
            pkid
        }
    }

    fn complete(&self, pkid: u16, qos: QoS) {
        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => self.push(Event::Incoming(Packet::PubAck(PubAck::new(pkid)))),
            QoS::ExactlyOnce => {
                self.push(Event::Incoming(Packet::PubRec(PubRec::new(pkid))));
                self.push(Event::Incoming(Packet::PubComp(PubComp::new(pkid))));
            }
        }
    }
}

/// Scriptable in-memory broker. Clones share state.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(tx),
                pending_loop: Mutex::new(Some(rx)),
                connected: AtomicBool::new(false),
                session_present: AtomicBool::new(false),
                connect_attempts: AtomicUsize::new(0),
                connect_script: Mutex::new(VecDeque::new()),
                next_pkid: AtomicU16::new(1),
                auto_ack: AtomicBool::new(true),
                auto_release: AtomicBool::new(true),
                rejected_filters: Mutex::new(HashSet::new()),
                subscribe_requests: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                acked: Mutex::new(Vec::new()),
                options: Mutex::new(None),
            }),
        }
    }

    /// Queue answers for the next connection attempts. Once the script runs
    /// out every attempt is accepted.
    pub fn script_connect(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        lock(&self.inner.connect_script).extend(outcomes);
    }

    pub fn set_session_present(&self, present: bool) {
        self.inner.session_present.store(present, Ordering::SeqCst);
    }

    /// With auto-ack off, QoS 1/2 publishes stay unacknowledged until
    /// [`complete_publish`](Self::complete_publish) is called.
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.inner.auto_ack.store(auto_ack, Ordering::SeqCst);
    }

    /// With auto-release off, acknowledged QoS 2 deliveries get no PUBREL,
    /// leaving the exchange open as across a dropped connection.
    pub fn set_auto_release(&self, auto_release: bool) {
        self.inner.auto_release.store(auto_release, Ordering::SeqCst);
    }

    pub fn reject_subscriptions(&self, filter: &str) {
        lock(&self.inner.rejected_filters).insert(filter.to_string());
    }

    /// Deliver a publish to the client. Returns its packet id (0 for QoS 0).
    pub fn inject_publish(&self, topic: &str, qos: QoS, payload: impl Into<Vec<u8>>) -> u16 {
        let mut publish = Publish::new(topic, qos.into(), payload.into());
        if qos.requires_ack() {
            publish.pkid = self.inner.next_pkid();
        }
        let pkid = publish.pkid;
        self.inject(publish);
        pkid
    }

    /// Deliver a prepared publish as is, e.g. a redelivery with `dup` set.
    pub fn inject(&self, publish: Publish) {
        self.inner.push(Event::Incoming(Packet::Publish(publish)));
    }

    /// Break the network connection; the next poll reconnects.
    pub fn drop_connection(&self) {
        let _ = lock(&self.inner.events).send(MockEvent::Drop);
    }

    /// Acknowledge a publish that was held back by disabled auto-ack.
    pub fn complete_publish(&self, pkid: u16) {
        let qos = lock(&self.inner.published)
            .iter()
            .find(|p| p.pkid == pkid)
            .map(|p| p.qos);
        if let Some(qos) = qos {
            self.inner.complete(pkid, qos);
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every SUBSCRIBE received, including resubscriptions.
    pub fn subscribe_requests(&self) -> Vec<(String, QoS)> {
        lock(&self.inner.subscribe_requests).clone()
    }

    /// Filters currently subscribed.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner.subscriptions).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.inner.published).clone()
    }

    /// Packet ids of incoming publishes the client acknowledged.
    pub fn acked(&self) -> Vec<u16> {
        lock(&self.inner.acked).clone()
    }

    /// Options of the most recent session.
    pub fn options(&self) -> Option<MqttOptions> {
        lock(&self.inner.options).clone()
    }
}

impl MqttTransport for MockBroker {
    fn open(
        &self,
        options: MqttOptions,
        _capacity: usize,
    ) -> (Arc<dyn MqttClient>, Box<dyn MqttEventLoop>) {
        *lock(&self.inner.options) = Some(options);
        self.inner.connected.store(false, Ordering::SeqCst);

        let events = match lock(&self.inner.pending_loop).take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                *lock(&self.inner.events) = tx;
                rx
            }
        };
        (
            Arc::new(MockClient {
                inner: self.inner.clone(),
            }),
            Box::new(MockEventLoop {
                inner: self.inner.clone(),
                events,
            }),
        )
    }
}

struct MockClient {
    inner: Arc<Inner>,
}

#[async_trait]
impl MqttClient for MockClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ConnectionError> {
        let pkid = self.inner.next_pkid();
        lock(&self.inner.subscribe_requests).push((topic.to_string(), qos));

        let code = if lock(&self.inner.rejected_filters).contains(topic) {
            SubscribeReasonCode::Failure
        } else {
            let mut subscriptions = lock(&self.inner.subscriptions);
            if !subscriptions.iter().any(|s| s == topic) {
                subscriptions.push(topic.to_string());
            }
            SubscribeReasonCode::Success(qos.into())
        };

        self.inner.push(Event::Outgoing(Outgoing::Subscribe(pkid)));
        self.inner.push(Event::Incoming(Packet::SubAck(SubAck {
            pkid,
            return_codes: vec![code],
        })));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        let pkid = self.inner.next_pkid();
        lock(&self.inner.subscriptions).retain(|s| s != topic);
        self.inner.push(Event::Outgoing(Outgoing::Unsubscribe(pkid)));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        _retain: bool,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        let pkid = if qos.requires_ack() {
            self.inner.next_pkid()
        } else {
            0
        };
        lock(&self.inner.published).push(PublishedMessage {
            topic: topic.to_string(),
            qos,
            pkid,
            payload,
        });
        self.inner.push(Event::Outgoing(Outgoing::Publish(pkid)));
        if self.inner.auto_ack.load(Ordering::SeqCst) {
            self.inner.complete(pkid, qos);
        }
        Ok(())
    }

    async fn ack(&self, publish: &Publish) -> Result<(), ConnectionError> {
        lock(&self.inner.acked).push(publish.pkid);
        if publish.qos == rumqttc::QoS::ExactlyOnce && self.inner.auto_release.load(Ordering::SeqCst)
        {
            self.inner
                .push(Event::Incoming(Packet::PubRel(PubRel::new(publish.pkid))));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.inner.push(Event::Outgoing(Outgoing::Disconnect));
        Ok(())
    }
}

struct MockEventLoop {
    inner: Arc<Inner>,
    events: mpsc::UnboundedReceiver<MockEvent>,
}

#[async_trait]
impl MqttEventLoop for MockEventLoop {
    async fn poll(&mut self) -> Result<Event, rumqttc::ConnectionError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = lock(&self.inner.connect_script)
                .pop_front()
                .unwrap_or(ConnectOutcome::Accept);
            return match outcome {
                ConnectOutcome::Accept => {
                    self.inner.connected.store(true, Ordering::SeqCst);
                    Ok(Event::Incoming(Packet::ConnAck(ConnAck {
                        session_present: self.inner.session_present.load(Ordering::SeqCst),
                        code: ConnectReturnCode::Success,
                    })))
                }
                ConnectOutcome::Refuse(code) => Err(rumqttc::ConnectionError::ConnectionRefused(code)),
                ConnectOutcome::Unreachable => Err(rumqttc::ConnectionError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))),
            };
        }

        match self.events.recv().await {
            Some(MockEvent::Event(event)) => Ok(event),
            Some(MockEvent::Drop) => {
                self.inner.connected.store(false, Ordering::SeqCst);
                Err(rumqttc::ConnectionError::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection reset by broker",
                )))
            }
            None => Err(rumqttc::ConnectionError::RequestsDone),
        }
    }
}

/// Poll `check` until it holds, for at most two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
