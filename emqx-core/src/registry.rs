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

//! Option-map driven construction of sources and sinks.
//!
//! A host looks up the `connector` option in a [`ConnectorRegistry`] and gets
//! back the [`ConnectorFactory`] registered under that identifier. The
//! factory declares which options it understands and how to build a source
//! and/or a sink from a [`TableContext`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::codec::{FormatRegistry, RowSchema};
use crate::component::{Sink, Source};
use crate::config::options;
use crate::error::ConfigError;
use crate::transport::MqttTransport;

/// Everything a factory needs to build one table's connector.
#[derive(Clone)]
pub struct TableContext {
    pub name: String,
    pub schema: RowSchema,
    pub options: HashMap<String, String>,
    pub formats: Arc<FormatRegistry>,
    /// Overrides the default MQTT transport (tests, embedding).
    pub transport: Option<Arc<dyn MqttTransport>>,
}

impl TableContext {
    pub fn new(
        name: impl Into<String>,
        schema: RowSchema,
        options: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            options,
            formats: Arc::new(FormatRegistry::default()),
            transport: None,
        }
    }

    pub fn with_formats(mut self, formats: Arc<FormatRegistry>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn MqttTransport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl fmt::Debug for TableContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableContext")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("formats", &self.formats)
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

pub type SourceConstructor =
    Arc<dyn Fn(&TableContext) -> Result<Box<dyn Source>, ConfigError> + Send + Sync>;
pub type SinkConstructor =
    Arc<dyn Fn(&TableContext) -> Result<Box<dyn Sink>, ConfigError> + Send + Sync>;

/// Capabilities of one connector kind.
#[derive(Clone)]
pub struct ConnectorFactory {
    pub identifier: String,
    pub required_options: Vec<String>,
    pub optional_options: Vec<String>,
    pub source: Option<SourceConstructor>,
    pub sink: Option<SinkConstructor>,
}

impl ConnectorFactory {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            required_options: Vec::new(),
            optional_options: Vec::new(),
            source: None,
            sink: None,
        }
    }

    pub fn required(mut self, keys: &[&str]) -> Self {
        self.required_options
            .extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn optional(mut self, keys: &[&str]) -> Self {
        self.optional_options
            .extend(keys.iter().map(|k| k.to_string()));
        self
    }

    pub fn with_source(mut self, constructor: SourceConstructor) -> Self {
        self.source = Some(constructor);
        self
    }

    pub fn with_sink(mut self, constructor: SinkConstructor) -> Self {
        self.sink = Some(constructor);
        self
    }

    fn check_required(&self, context: &TableContext) -> Result<(), ConfigError> {
        match self
            .required_options
            .iter()
            .find(|key| !context.options.contains_key(key.as_str()))
        {
            Some(key) => Err(ConfigError::MissingOption(key.clone())),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ConnectorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorFactory")
            .field("identifier", &self.identifier)
            .field("required_options", &self.required_options)
            .field("optional_options", &self.optional_options)
            .field("source", &self.source.is_some())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Connector factories keyed by identifier.
#[derive(Debug, Default, Clone)]
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory`, replacing any factory with the same identifier.
    pub fn register(&mut self, factory: ConnectorFactory) {
        debug!("Registering connector '{}'", factory.identifier);
        self.factories.insert(factory.identifier.clone(), factory);
    }

    pub fn get(&self, identifier: &str) -> Option<&ConnectorFactory> {
        self.factories.get(identifier)
    }

    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    fn resolve(&self, context: &TableContext) -> Result<&ConnectorFactory, ConfigError> {
        let identifier = context
            .options
            .get(options::CONNECTOR)
            .ok_or_else(|| ConfigError::MissingOption(options::CONNECTOR.to_string()))?;
        let factory = self
            .factories
            .get(identifier)
            .ok_or_else(|| ConfigError::UnknownConnector(identifier.clone()))?;
        factory.check_required(context)?;
        Ok(factory)
    }

    /// Build the source for the table described by `context`.
    pub fn create_source(&self, context: &TableContext) -> Result<Box<dyn Source>, ConfigError> {
        let factory = self.resolve(context)?;
        let constructor = factory
            .source
            .as_ref()
            .ok_or_else(|| ConfigError::MissingCapability {
                connector: factory.identifier.clone(),
                capability: "source",
            })?;
        constructor(context)
    }

    /// Build the sink for the table described by `context`.
    pub fn create_sink(&self, context: &TableContext) -> Result<Box<dyn Sink>, ConfigError> {
        let factory = self.resolve(context)?;
        let constructor = factory
            .sink
            .as_ref()
            .ok_or_else(|| ConfigError::MissingCapability {
                connector: factory.identifier.clone(),
                capability: "sink",
            })?;
        constructor(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(options: &[(&str, &str)]) -> TableContext {
        let options = options
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TableContext::new("readings", RowSchema::new(Vec::new()), options)
    }

    fn sink_only() -> ConnectorFactory {
        ConnectorFactory::new("sink-only").required(&["topic"])
    }

    #[test]
    fn test_unknown_connector() {
        let registry = ConnectorRegistry::new();
        let err = registry
            .create_source(&context(&[("connector", "nope")]))
            .err()
            .unwrap();
        assert_eq!(err, ConfigError::UnknownConnector("nope".into()));
    }

    #[test]
    fn test_connector_option_required() {
        let registry = ConnectorRegistry::new();
        let err = registry.create_sink(&context(&[])).err().unwrap();
        assert_eq!(err, ConfigError::MissingOption("connector".into()));
    }

    #[test]
    fn test_required_options_checked_first() {
        let mut registry = ConnectorRegistry::new();
        registry.register(sink_only());
        let err = registry
            .create_source(&context(&[("connector", "sink-only")]))
            .err()
            .unwrap();
        assert_eq!(err, ConfigError::MissingOption("topic".into()));
    }

    #[test]
    fn test_missing_capability() {
        let mut registry = ConnectorRegistry::new();
        registry.register(sink_only());
        let err = registry
            .create_source(&context(&[("connector", "sink-only"), ("topic", "t")]))
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConfigError::MissingCapability {
                connector: "sink-only".into(),
                capability: "source",
            }
        );
    }

    #[test]
    fn test_identifiers_sorted() {
        let mut registry = ConnectorRegistry::new();
        registry.register(ConnectorFactory::new("b"));
        registry.register(ConnectorFactory::new("a"));
        assert_eq!(registry.identifiers(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
    }
}
