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

//! EMQX connector registration.
//!
//! # Example
//!
//! ```ignore
//! use emqx_core::{ConnectorRegistry, TableContext};
//!
//! let mut registry = ConnectorRegistry::new();
//! emqx_connector::register(&mut registry);
//!
//! // options: connector=emqx-x, broker=tcp://broker.local:1883, topic=sensor/+
//! let source = registry.create_source(&TableContext::new("readings", schema, options))?;
//! ```

pub mod factory;

pub use factory::{factory, register, IDENTIFIER};
