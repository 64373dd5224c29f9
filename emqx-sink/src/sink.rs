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

//! EMQX implementation of the [`Sink`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::Value;
use tokio::sync::RwLock;

use emqx_core::{
    Codec, ComponentBase, ComponentStatus, ConfigError, ConnectionManager, ConnectionState,
    EmqxConfig, MqttTransport, PublishError, Row, RowSchema, RumqttcTransport, Sink, TableContext,
};

use crate::publisher::{self, TopicRenderer};

/// EMQX sink.
///
/// Encodes each row with the configured format and publishes it to the
/// configured topic (or topic template). A write returns once the broker
/// acknowledged the message at the configured QoS.
pub struct EmqxSink {
    base: ComponentBase,
    config: Arc<EmqxConfig>,
    schema: RowSchema,
    codec: Arc<dyn Codec>,
    topics: TopicRenderer,
    transport: Arc<dyn MqttTransport>,
    /// Connection handle (set on start, cleared on stop).
    connection: Arc<RwLock<Option<Arc<ConnectionManager>>>>,
}

impl EmqxSink {
    pub fn new(
        id: impl Into<String>,
        config: EmqxConfig,
        schema: RowSchema,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, ConfigError> {
        let topics = TopicRenderer::new(&config.topic)?;
        Ok(Self {
            base: ComponentBase::new(id),
            config: Arc::new(config),
            schema,
            codec,
            topics,
            transport: Arc::new(RumqttcTransport),
            connection: Arc::new(RwLock::new(None)),
        })
    }

    /// Build a sink from table options, resolving the codec through the
    /// context's format registry.
    pub fn from_context(context: &TableContext) -> Result<Self, ConfigError> {
        let config = EmqxConfig::from_options(&context.options)?;
        let codec =
            context
                .formats
                .create(&config.format, &context.schema, &config.format_options)?;
        let mut sink = Self::new(&context.name, config, context.schema.clone(), codec)?;
        if let Some(transport) = &context.transport {
            sink = sink.with_transport(transport.clone());
        }
        Ok(sink)
    }

    pub fn with_transport(mut self, transport: Arc<dyn MqttTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> &EmqxConfig {
        &self.config
    }

    async fn live_connection(&self) -> Result<Arc<ConnectionManager>> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("[{}] EMQX sink is not running", self.base.id))
    }
}

#[async_trait]
impl Sink for EmqxSink {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn type_name(&self) -> &str {
        "emqx"
    }

    fn properties(&self) -> HashMap<String, Value> {
        let mut props = HashMap::new();
        props.insert("broker".into(), Value::String(self.config.broker.to_string()));
        props.insert("topic".into(), Value::String(self.topics.template().to_string()));
        props.insert("qos".into(), Value::Number(self.config.qos.level().into()));
        props.insert("client_id".into(), Value::String(self.config.client_id.clone()));
        props.insert("format".into(), Value::String(self.codec.format().to_string()));
        props.insert(
            "max_retries".into(),
            Value::Number(self.config.publish_max_retries.into()),
        );
        props
    }

    async fn start(&self) -> Result<()> {
        if self.connection.read().await.is_some() {
            bail!("[{}] EMQX sink is already running", self.base.id);
        }
        info!(
            "[{}] Starting EMQX sink (broker={}, topic={}, qos={})",
            self.base.id, self.config.broker, self.config.topic, self.config.qos
        );
        self.base.set_status(ComponentStatus::Starting).await;

        match ConnectionManager::connect_with(self.config.clone(), self.transport.clone()).await {
            Ok(connection) => {
                *self.connection.write().await = Some(Arc::new(connection));
                self.base.set_status(ComponentStatus::Running).await;
                info!("[{}] EMQX sink started", self.base.id);
                Ok(())
            }
            Err(e) => {
                error!("[{}] Failed to start EMQX sink: {e}", self.base.id);
                self.base
                    .set_status(ComponentStatus::Error(e.to_string()))
                    .await;
                Err(e).with_context(|| format!("connecting to {}", self.config.broker))
            }
        }
    }

    async fn write(&self, row: &Row) -> Result<()> {
        let connection = self.live_connection().await?;
        let topic = self.topics.render(&self.schema, row)?;
        let payload = self.codec.encode(row).map_err(PublishError::from)?;

        let published = publisher::publish_with_retry(
            &connection,
            &topic,
            self.config.qos,
            &payload,
            self.config.publish_max_retries,
            &self.config.reconnect,
        )
        .await;

        match published {
            Ok(()) => {
                debug!("[{}] Published {} byte(s) to '{topic}'", self.base.id, payload.len());
                Ok(())
            }
            Err(e) => {
                if let ConnectionState::Failed(reason) = connection.state() {
                    self.base
                        .set_status(ComponentStatus::Error(reason.to_string()))
                        .await;
                }
                error!("[{}] Failed to publish to '{topic}': {e}", self.base.id);
                Err(e.into())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let Some(connection) = self.connection.write().await.take() else {
            return Ok(());
        };
        let failed = matches!(self.base.get_status().await, ComponentStatus::Error(_));
        if !failed {
            self.base.set_status(ComponentStatus::Stopping).await;
        }

        connection.shutdown(self.config.shutdown_grace_period).await;

        if !failed {
            self.base.set_status(ComponentStatus::Stopped).await;
        }
        info!("[{}] EMQX sink stopped", self.base.id);
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        self.base.get_status().await
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
