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

//! Seam between the connection manager and the MQTT client library.
//!
//! The manager only talks to [`MqttClient`] and [`MqttEventLoop`]; the
//! production [`RumqttcTransport`] hands out `rumqttc` halves, tests hand out
//! an in-memory broker.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Publish};

use crate::config::QoS;
use crate::error::ConnectionError;

/// Request side of an MQTT session.
#[async_trait]
pub trait MqttClient: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ConnectionError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError>;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), ConnectionError>;

    /// Acknowledge an incoming publish (PUBACK for QoS 1, PUBREC for QoS 2).
    async fn ack(&self, publish: &Publish) -> Result<(), ConnectionError>;

    async fn disconnect(&self) -> Result<(), ConnectionError>;
}

/// Network side of an MQTT session. Each `poll` drives I/O and yields the
/// next protocol event; after an error the next `poll` reconnects.
#[async_trait]
pub trait MqttEventLoop: Send + 'static {
    async fn poll(&mut self) -> Result<Event, rumqttc::ConnectionError>;
}

/// Opens MQTT sessions.
pub trait MqttTransport: Send + Sync + 'static {
    fn open(
        &self,
        options: MqttOptions,
        capacity: usize,
    ) -> (Arc<dyn MqttClient>, Box<dyn MqttEventLoop>);
}

/// Transport backed by `rumqttc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttcTransport;

impl MqttTransport for RumqttcTransport {
    fn open(
        &self,
        options: MqttOptions,
        capacity: usize,
    ) -> (Arc<dyn MqttClient>, Box<dyn MqttEventLoop>) {
        let (client, eventloop) = AsyncClient::new(options, capacity);
        (Arc::new(client), Box::new(eventloop))
    }
}

fn client_error(e: rumqttc::ClientError) -> ConnectionError {
    ConnectionError::Client(e.to_string())
}

#[async_trait]
impl MqttClient for AsyncClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ConnectionError> {
        AsyncClient::subscribe(self, topic, qos.into())
            .await
            .map_err(client_error)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        AsyncClient::unsubscribe(self, topic)
            .await
            .map_err(client_error)
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        AsyncClient::publish_bytes(self, topic, qos.into(), retain, payload)
            .await
            .map_err(client_error)
    }

    async fn ack(&self, publish: &Publish) -> Result<(), ConnectionError> {
        AsyncClient::ack(self, publish).await.map_err(client_error)
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        AsyncClient::disconnect(self).await.map_err(client_error)
    }
}

#[async_trait]
impl MqttEventLoop for EventLoop {
    async fn poll(&mut self) -> Result<Event, rumqttc::ConnectionError> {
        EventLoop::poll(self).await
    }
}
