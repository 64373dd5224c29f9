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

//! Topic rendering and acknowledged publishing for the sink.

use handlebars::Handlebars;
use log::warn;

use emqx_core::backoff::Backoff;
use emqx_core::codec::row_to_json;
use emqx_core::topic;
use emqx_core::{ConfigError, ConnectionManager, PublishError, QoS, ReconnectPolicy, Row, RowSchema};

const TEMPLATE_NAME: &str = "topic";

/// Resolves the publish topic of a row.
///
/// A topic containing `{{field}}` placeholders is a Handlebars template
/// rendered against the row as a JSON object; any other topic is used as is.
pub struct TopicRenderer {
    template: String,
    registry: Option<Handlebars<'static>>,
}

impl TopicRenderer {
    pub fn new(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTopic {
            topic: template.to_string(),
            reason,
        };

        if !template.contains("{{") {
            topic::validate_name(template).map_err(invalid)?;
            return Ok(Self {
                template: template.to_string(),
                registry: None,
            });
        }

        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);
        registry
            .register_template_string(TEMPLATE_NAME, template)
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            template: template.to_string(),
            registry: Some(registry),
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Topic for `row`. Fails when a placeholder names an unknown field or
    /// the result is not a valid topic name.
    pub fn render(&self, schema: &RowSchema, row: &Row) -> Result<String, PublishError> {
        let Some(registry) = &self.registry else {
            return Ok(self.template.clone());
        };
        let context = row_to_json(schema, row)?;
        let topic = registry
            .render(TEMPLATE_NAME, &context)
            .map_err(|e| PublishError::Topic(e.to_string()))?;
        topic::validate_name(&topic).map_err(|reason| PublishError::Topic(format!("'{topic}': {reason}")))?;
        Ok(topic)
    }
}

/// A QoS 2 packet that reached the client is retransmitted by the session
/// itself; publishing the row again would create a second message.
fn left_to_session(error: &PublishError, qos: QoS) -> bool {
    qos == QoS::ExactlyOnce && matches!(error, PublishError::AckTimeout { pkid: Some(_), .. })
}

/// Publish and, for retryable failures, try again up to `max_retries` times
/// with exponential backoff. Returns the last error.
///
/// QoS 2 publishes are only retried while no packet id was assigned.
pub async fn publish_with_retry(
    connection: &ConnectionManager,
    topic: &str,
    qos: QoS,
    payload: &[u8],
    max_retries: u32,
    backoff: &ReconnectPolicy,
) -> Result<(), PublishError> {
    let mut backoff = Backoff::from_policy(backoff);
    loop {
        match connection.publish(topic, qos, payload.to_vec()).await {
            Ok(()) => return Ok(()),
            Err(e)
                if e.is_retryable()
                    && !left_to_session(&e, qos)
                    && backoff.failures() < max_retries =>
            {
                let delay = backoff.next_delay();
                warn!(
                    "[{}] Publish to '{topic}' failed (retry {}/{max_retries} in {delay:?}): {e}",
                    connection.client_id(),
                    backoff.failures()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
