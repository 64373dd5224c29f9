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

use std::sync::Arc;

use log::info;

use emqx_core::config::options;
use emqx_core::{ConfigError, ConnectorFactory, ConnectorRegistry, Sink, Source, TableContext};
use emqx_sink::EmqxSink;
use emqx_source::EmqxSource;

/// Value of the `connector` option that selects this connector.
pub const IDENTIFIER: &str = "emqx-x";

/// Source and sink capabilities of the EMQX connector.
pub fn factory() -> ConnectorFactory {
    ConnectorFactory::new(IDENTIFIER)
        .required(options::REQUIRED)
        .optional(options::OPTIONAL)
        .with_source(Arc::new(build_source))
        .with_sink(Arc::new(build_sink))
}

fn build_source(context: &TableContext) -> Result<Box<dyn Source>, ConfigError> {
    let source = EmqxSource::from_context(context)?;
    info!(
        "[{}] Created EMQX source for topic '{}'",
        context.name,
        source.config().topic
    );
    Ok(Box::new(source))
}

fn build_sink(context: &TableContext) -> Result<Box<dyn Sink>, ConfigError> {
    let sink = EmqxSink::from_context(context)?;
    info!(
        "[{}] Created EMQX sink for topic '{}'",
        context.name,
        sink.config().topic
    );
    Ok(Box::new(sink))
}

/// Register the EMQX connector under [`IDENTIFIER`].
pub fn register(registry: &mut ConnectorRegistry) {
    registry.register(factory());
}
