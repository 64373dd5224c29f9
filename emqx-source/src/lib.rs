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

//! EMQX table source.
//!
//! Subscribes to an MQTT topic filter, decodes payloads into rows and
//! forwards them downstream, acknowledging each message after the hand-off.
//!
//! # Example
//!
//! ```ignore
//! use emqx_core::{JsonCodec, EmqxConfig, QoS, Source};
//! use emqx_source::EmqxSource;
//!
//! let config = EmqxConfig::builder("tcp://broker.local:1883", "sensor/+")
//!     .qos(QoS::AtLeastOnce)
//!     .build()?;
//! let codec = Arc::new(JsonCodec::new("id BIGINT NOT NULL, temp DOUBLE".parse()?));
//!
//! let source = EmqxSource::new("readings", config, codec);
//! let (tx, mut rx) = tokio::sync::mpsc::channel(100);
//! source.start(tx).await?;
//! ```

pub mod mapper;
pub mod source;

pub use source::EmqxSource;
