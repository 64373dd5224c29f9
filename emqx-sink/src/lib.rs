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

//! EMQX table sink.
//!
//! Encodes rows and publishes them to an MQTT topic, waiting for the broker's
//! acknowledgment at the configured QoS. The topic may be a Handlebars
//! template over the row's fields.
//!
//! # Example
//!
//! ```ignore
//! use emqx_core::{EmqxConfig, JsonCodec, QoS, Sink};
//! use emqx_sink::EmqxSink;
//!
//! let schema: RowSchema = "device_id STRING NOT NULL, temp DOUBLE".parse()?;
//! let config = EmqxConfig::builder("tcp://broker.local:1883", "devices/{{device_id}}/alerts")
//!     .qos(QoS::AtLeastOnce)
//!     .build()?;
//!
//! let sink = EmqxSink::new("alerts", config, schema.clone(), Arc::new(JsonCodec::new(schema)))?;
//! sink.start().await?;
//! sink.write(&row).await?;
//! ```

pub mod publisher;
pub mod sink;

pub use publisher::TopicRenderer;
pub use sink::EmqxSink;
