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

//! Core of the EMQX connector.
//!
//! Resolves table options into an immutable [`EmqxConfig`], owns the MQTT
//! session through [`ConnectionManager`], tracks acknowledgments per QoS and
//! converts payloads to rows through a pluggable [`Codec`].
//!
//! # Example
//!
//! ```ignore
//! use emqx_core::{ConnectionManager, EmqxConfig, QoS};
//!
//! let config = EmqxConfig::builder("tcp://broker.local:1883", "sensor/+")
//!     .qos(QoS::AtLeastOnce)
//!     .build()?;
//!
//! let manager = ConnectionManager::connect(Arc::new(config)).await?;
//! let mut subscription = manager.subscribe("sensor/+", QoS::AtLeastOnce).await?;
//! while let Some(message) = subscription.next().await {
//!     // hand the message off, then:
//!     manager.ack(&message).await?;
//! }
//! ```

pub mod backoff;
pub mod codec;
pub mod component;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod topic;
pub mod tracker;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use codec::{Codec, DataType, Field, FormatRegistry, JsonCodec, Row, RowSchema, Value};
pub use component::{ComponentBase, ComponentStatus, RowSender, Sink, Source};
pub use config::{
    BrokerAddress, DecodeErrorPolicy, EmqxConfig, EmqxConfigBuilder, QoS, ReconnectPolicy,
};
pub use connection::{
    ConnectionManager, ConnectionState, RawMessage, Subscription, SubscriptionHandle,
};
pub use error::{ConfigError, ConnectionError, DecodeError, EncodeError, PublishError};
pub use registry::{ConnectorFactory, ConnectorRegistry, TableContext};
pub use transport::{MqttClient, MqttEventLoop, MqttTransport, RumqttcTransport};
