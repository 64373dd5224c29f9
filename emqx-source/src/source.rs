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

//! EMQX implementation of the [`Source`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};

use emqx_core::{
    Codec, ComponentBase, ComponentStatus, ConfigError, ConnectionManager, ConnectionState,
    DecodeErrorPolicy, EmqxConfig, MqttTransport, RawMessage, RowSender, RumqttcTransport, Source,
    Subscription, TableContext,
};

use crate::mapper::{self, Mapped};

/// EMQX source.
///
/// Subscribes to the configured topic filter, decodes each payload into a
/// row and hands it to the downstream channel. A QoS 1/2 message is
/// acknowledged only after that hand-off succeeded, so a crash in between
/// leads to redelivery rather than loss.
pub struct EmqxSource {
    base: ComponentBase,
    config: Arc<EmqxConfig>,
    codec: Arc<dyn Codec>,
    transport: Arc<dyn MqttTransport>,
    /// Connection handle (set on start, cleared on stop).
    connection: Arc<RwLock<Option<Arc<ConnectionManager>>>>,
}

impl EmqxSource {
    pub fn new(id: impl Into<String>, config: EmqxConfig, codec: Arc<dyn Codec>) -> Self {
        Self {
            base: ComponentBase::new(id),
            config: Arc::new(config),
            codec,
            transport: Arc::new(RumqttcTransport),
            connection: Arc::new(RwLock::new(None)),
        }
    }

    /// Build a source from table options, resolving the codec through the
    /// context's format registry.
    pub fn from_context(context: &TableContext) -> Result<Self, ConfigError> {
        let config = EmqxConfig::from_options(&context.options)?;
        let codec =
            context
                .formats
                .create(&config.format, &context.schema, &config.format_options)?;
        let mut source = Self::new(&context.name, config, codec);
        if let Some(transport) = &context.transport {
            source = source.with_transport(transport.clone());
        }
        Ok(source)
    }

    pub fn with_transport(mut self, transport: Arc<dyn MqttTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> &EmqxConfig {
        &self.config
    }

    /// The live connection, if the source is running.
    pub async fn connection(&self) -> Option<Arc<ConnectionManager>> {
        self.connection.read().await.clone()
    }
}

#[async_trait]
impl Source for EmqxSource {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn type_name(&self) -> &str {
        "emqx"
    }

    fn properties(&self) -> HashMap<String, Value> {
        let mut props = HashMap::new();
        props.insert("broker".into(), Value::String(self.config.broker.to_string()));
        props.insert("topic".into(), Value::String(self.config.topic.clone()));
        props.insert("qos".into(), Value::Number(self.config.qos.level().into()));
        props.insert("client_id".into(), Value::String(self.config.client_id.clone()));
        props.insert("clean_session".into(), Value::Bool(self.config.clean_session));
        props.insert("format".into(), Value::String(self.codec.format().to_string()));
        props
    }

    async fn start(&self, output: RowSender) -> Result<()> {
        if self.connection.read().await.is_some() {
            bail!("[{}] EMQX source is already running", self.base.id);
        }
        info!(
            "[{}] Starting EMQX source (broker={}, topic={}, qos={})",
            self.base.id, self.config.broker, self.config.topic, self.config.qos
        );
        self.base.set_status(ComponentStatus::Starting).await;

        let opened = async {
            let connection =
                ConnectionManager::connect_with(self.config.clone(), self.transport.clone())
                    .await
                    .with_context(|| format!("connecting to {}", self.config.broker))?;
            let subscription = connection
                .subscribe(&self.config.topic, self.config.qos)
                .await
                .with_context(|| format!("subscribing to '{}'", self.config.topic))?;
            anyhow::Ok((Arc::new(connection), subscription))
        }
        .await;

        let (connection, subscription) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!("[{}] Failed to start EMQX source: {e:#}", self.base.id);
                self.base
                    .set_status(ComponentStatus::Error(format!("{e:#}")))
                    .await;
                return Err(e);
            }
        };
        *self.connection.write().await = Some(connection.clone());

        let shutdown_rx = self.base.create_shutdown_channel().await;
        let forwarder = Forwarder {
            source_id: self.base.id.clone(),
            connection,
            codec: self.codec.clone(),
            policy: self.config.decode_error_policy,
            output,
            status: self.base.status_handle(),
        };
        let handle = tokio::spawn(forwarder.run(subscription, shutdown_rx));

        self.base.set_task_handle(handle).await;
        self.base.set_status(ComponentStatus::Running).await;
        info!("[{}] EMQX source started", self.base.id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.base.stop_common().await?;
        if let Some(connection) = self.connection.write().await.take() {
            connection.disconnect(false).await;
        }
        info!("[{}] EMQX source stopped", self.base.id);
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        self.base.get_status().await
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Background task moving messages from the subscription to the output.
struct Forwarder {
    source_id: String,
    connection: Arc<ConnectionManager>,
    codec: Arc<dyn Codec>,
    policy: DecodeErrorPolicy,
    output: RowSender,
    status: Arc<RwLock<ComponentStatus>>,
}

impl Forwarder {
    async fn run(self, mut subscription: Subscription, mut shutdown_rx: oneshot::Receiver<()>) {
        let id = self.source_id.clone();
        info!("[{id}] Forwarding loop started");

        loop {
            let message = tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("[{id}] Shutdown signal received");
                    break;
                }
                message = subscription.next() => message,
            };

            let Some(message) = message else {
                self.connection_ended().await;
                break;
            };

            match mapper::payload_to_row(self.codec.as_ref(), message.payload(), self.policy) {
                Mapped::Row(row) => {
                    // Backpressure: wait for room downstream, but stay stoppable.
                    let sent = tokio::select! {
                        _ = &mut shutdown_rx => {
                            info!("[{id}] Shutdown signal received during hand-off");
                            break;
                        }
                        sent = self.output.send(row) => sent,
                    };
                    if sent.is_err() {
                        warn!("[{id}] Downstream channel closed; stopping");
                        break;
                    }
                    self.ack(&message).await;
                }
                Mapped::Skipped(e) => {
                    warn!(
                        "[{id}] Skipping undecodable payload on topic '{}': {e}",
                        message.topic()
                    );
                    self.ack(&message).await;
                }
                Mapped::Fatal(e) => {
                    error!(
                        "[{id}] Undecodable payload on topic '{}': {e}",
                        message.topic()
                    );
                    *self.status.write().await =
                        ComponentStatus::Error(format!("decode failed on '{}': {e}", message.topic()));
                    break;
                }
            }
        }

        subscription.close();
        info!("[{id}] Forwarding loop stopped");
    }

    async fn ack(&self, message: &RawMessage) {
        match self.connection.ack(message).await {
            Ok(()) => {
                if let Some(pkid) = message.message_id() {
                    debug!("[{}] Acknowledged packet {pkid}", self.source_id);
                }
            }
            Err(e) => warn!(
                "[{}] Failed to acknowledge message on '{}': {e}",
                self.source_id,
                message.topic()
            ),
        }
    }

    async fn connection_ended(&self) {
        match self.connection.state() {
            ConnectionState::Failed(e) => {
                error!("[{}] MQTT connection failed: {e}", self.source_id);
                *self.status.write().await = ComponentStatus::Error(e.to_string());
            }
            _ => info!("[{}] Subscription ended", self.source_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use emqx_core::testing::{eventually, MockBroker};
    use emqx_core::{QoS, Row, Value};
    use tokio::sync::mpsc;

    use super::*;

    fn context(broker: &MockBroker, extra: &[(&str, &str)]) -> TableContext {
        let mut options: HashMap<String, String> = [
            ("connector", "emqx-x"),
            ("broker", "tcp://localhost:1883"),
            ("topic", "sensor/+"),
            ("qos", "1"),
            ("client-id", "source-test"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            options.insert(k.to_string(), v.to_string());
        }
        TableContext::new("readings", "id BIGINT NOT NULL".parse().unwrap(), options)
            .with_transport(Arc::new(broker.clone()))
    }

    async fn started(
        broker: &MockBroker,
        extra: &[(&str, &str)],
        capacity: usize,
    ) -> (EmqxSource, mpsc::Receiver<Row>) {
        let source = EmqxSource::from_context(&context(broker, extra)).unwrap();
        let (tx, rx) = mpsc::channel(capacity);
        source.start(tx).await.unwrap();
        (source, rx)
    }

    #[tokio::test]
    async fn test_row_handed_off_then_acked() {
        let broker = MockBroker::new();
        let (source, mut rx) = started(&broker, &[], 10).await;
        assert_eq!(source.status().await, ComponentStatus::Running);
        assert_eq!(broker.subscriptions(), vec!["sensor/+".to_string()]);

        let pkid = broker.inject_publish("sensor/1", QoS::AtLeastOnce, br#"{"id":1}"#.to_vec());

        let row = rx.recv().await.unwrap();
        assert_eq!(row, Row::new(vec![Value::BigInt(1)]));
        assert!(eventually(|| broker.acked() == vec![pkid]).await);

        source.stop().await.unwrap();
        assert_eq!(source.status().await, ComponentStatus::Stopped);
    }

    #[tokio::test]
    async fn test_qos2_duplicate_yields_one_row() {
        let broker = MockBroker::new();
        let (source, mut rx) = started(&broker, &[("qos", "2")], 10).await;

        let mut publish =
            rumqttc::Publish::new("sensor/1", rumqttc::QoS::ExactlyOnce, br#"{"id":7}"#.to_vec());
        publish.pkid = 42;
        let mut duplicate = publish.clone();
        duplicate.dup = true;
        broker.inject(publish);
        broker.inject(duplicate);

        assert_eq!(rx.recv().await.unwrap(), Row::new(vec![Value::BigInt(7)]));
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
        assert_eq!(broker.acked(), vec![42]);

        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_skip_policy_acks_bad_payload() {
        let broker = MockBroker::new();
        let (source, mut rx) = started(&broker, &[], 10).await;

        let bad = broker.inject_publish("sensor/1", QoS::AtLeastOnce, b"not json".to_vec());
        let good = broker.inject_publish("sensor/2", QoS::AtLeastOnce, br#"{"id":2}"#.to_vec());

        assert_eq!(rx.recv().await.unwrap(), Row::new(vec![Value::BigInt(2)]));
        assert!(eventually(|| broker.acked() == vec![bad, good]).await);
        assert_eq!(source.status().await, ComponentStatus::Running);

        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_policy_stops_without_ack() {
        let broker = MockBroker::new();
        let (source, _rx) = started(&broker, &[("decode-error-policy", "fail")], 10).await;

        broker.inject_publish("sensor/1", QoS::AtLeastOnce, br#"{"id":"x"}"#.to_vec());

        let mut failed = false;
        for _ in 0..200 {
            if matches!(source.status().await, ComponentStatus::Error(_)) {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(failed);
        assert!(broker.acked().is_empty());

        source.stop().await.unwrap();
        assert!(matches!(source.status().await, ComponentStatus::Error(_)));
    }

    #[tokio::test]
    async fn test_ack_withheld_while_downstream_full() {
        let broker = MockBroker::new();
        let (source, mut rx) = started(&broker, &[], 1).await;

        let first = broker.inject_publish("sensor/1", QoS::AtLeastOnce, br#"{"id":1}"#.to_vec());
        let second = broker.inject_publish("sensor/2", QoS::AtLeastOnce, br#"{"id":2}"#.to_vec());

        assert!(eventually(|| broker.acked() == vec![first]).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.acked(), vec![first]);

        assert_eq!(rx.recv().await.unwrap(), Row::new(vec![Value::BigInt(1)]));
        assert_eq!(rx.recv().await.unwrap(), Row::new(vec![Value::BigInt(2)]));
        assert!(eventually(|| broker.acked() == vec![first, second]).await);

        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_on_rejected_subscription() {
        let broker = MockBroker::new();
        broker.reject_subscriptions("sensor/+");
        let source = EmqxSource::from_context(&context(&broker, &[])).unwrap();
        let (tx, _rx) = mpsc::channel(1);

        assert!(source.start(tx).await.is_err());
        assert!(matches!(source.status().await, ComponentStatus::Error(_)));
        assert!(source.connection().await.is_none());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let broker = MockBroker::new();
        let err = EmqxSource::from_context(&context(&broker, &[("format", "avro")]))
            .err()
            .unwrap();
        assert_eq!(err, ConfigError::UnknownFormat("avro".into()));
    }

    #[test]
    fn test_properties() {
        let broker = MockBroker::new();
        let source = EmqxSource::from_context(&context(&broker, &[])).unwrap();
        let props = source.properties();
        assert_eq!(props["topic"], "sensor/+");
        assert_eq!(props["qos"], 1);
        assert_eq!(props["format"], "json");
        assert_eq!(source.type_name(), "emqx");
    }
}
