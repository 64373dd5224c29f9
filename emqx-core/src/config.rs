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

//! Configuration types for the EMQX connector.
//!
//! [`EmqxConfig::from_options`] resolves the declarative table options into an
//! immutable config; [`EmqxConfig::builder`] does the same for programmatic use.
//! Both run the same validation, so a config that exists is a valid one.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::topic;

/// Option keys understood by the connector.
pub mod options {
    pub const CONNECTOR: &str = "connector";
    pub const BROKER: &str = "broker";
    pub const TOPIC: &str = "topic";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const QOS: &str = "qos";
    pub const CLEAN_SESSION: &str = "clean-session";
    /// Legacy spelling of [`CLEAN_SESSION`].
    pub const IS_CLEAN_SESSION: &str = "isCleanSession";
    pub const FORMAT: &str = "format";
    pub const CLIENT_ID: &str = "client-id";
    pub const KEEP_ALIVE_SECS: &str = "keep-alive-secs";
    pub const CONNECT_TIMEOUT_MS: &str = "connect-timeout-ms";
    pub const ACK_TIMEOUT_MS: &str = "ack-timeout-ms";
    pub const RECONNECT_MAX_ATTEMPTS: &str = "reconnect.max-attempts";
    pub const RECONNECT_INITIAL_BACKOFF_MS: &str = "reconnect.initial-backoff-ms";
    pub const RECONNECT_MAX_BACKOFF_MS: &str = "reconnect.max-backoff-ms";
    pub const BUFFER_CAPACITY: &str = "buffer-capacity";
    pub const DECODE_ERROR_POLICY: &str = "decode-error-policy";
    pub const PUBLISH_MAX_RETRIES: &str = "publish.max-retries";
    pub const SHUTDOWN_GRACE_PERIOD_MS: &str = "shutdown.grace-period-ms";

    pub const REQUIRED: &[&str] = &[BROKER, TOPIC];

    pub const OPTIONAL: &[&str] = &[
        USERNAME,
        PASSWORD,
        QOS,
        CLEAN_SESSION,
        IS_CLEAN_SESSION,
        FORMAT,
        CLIENT_ID,
        KEEP_ALIVE_SECS,
        CONNECT_TIMEOUT_MS,
        ACK_TIMEOUT_MS,
        RECONNECT_MAX_ATTEMPTS,
        RECONNECT_INITIAL_BACKOFF_MS,
        RECONNECT_MAX_BACKOFF_MS,
        BUFFER_CAPACITY,
        DECODE_ERROR_POLICY,
        PUBLISH_MAX_RETRIES,
        SHUTDOWN_GRACE_PERIOD_MS,
    ];
}

pub const DEFAULT_FORMAT: &str = "json";
pub const DEFAULT_QOS: QoS = QoS::ExactlyOnce;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    /// QoS 1 and 2 messages stay in flight until the peer acknowledges them.
    pub fn requires_ack(self) -> bool {
        self != QoS::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2 (got {other})")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.level()
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// What the source does with a payload the codec rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrorPolicy {
    /// Log the failure, acknowledge the message and continue.
    #[default]
    Skip,
    /// Stop the source and leave the message unacknowledged.
    Fail,
}

impl FromStr for DecodeErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(DecodeErrorPolicy::Skip),
            "fail" => Ok(DecodeErrorPolicy::Fail),
            other => Err(format!("expected 'skip' or 'fail', got '{other}'")),
        }
    }
}

/// Parsed broker URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerAddress {
    pub uri: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Accepts `tcp://`, `mqtt://`, `ssl://`, `mqtts://` and `tls://`.
    /// A bare `host[:port]` is treated as `tcp://`.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBroker {
            uri: uri.to_string(),
            reason,
        };

        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(invalid("address is empty".into()));
        }
        let normalized = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("tcp://{trimmed}")
        };

        let parsed = Url::parse(&normalized).map_err(|e| invalid(e.to_string()))?;
        let tls = match parsed.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" | "tls" => true,
            other => return Err(invalid(format!("unsupported scheme '{other}'"))),
        };
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".into()))?
            .to_string();
        let port = parsed.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            uri: trimmed.to_string(),
            host,
            port,
            tls,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reconnect schedule: exponential backoff capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the connection is declared dead.
    /// `0` retries forever.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Resolved configuration of one connector instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmqxConfig {
    pub broker: BrokerAddress,
    /// Topic filter for sources, topic (or topic template) for sinks.
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: QoS,
    pub clean_session: bool,
    /// Name of the payload format, resolved through a `FormatRegistry`.
    pub format: String,
    /// Options addressed to the format, with the `<format>.` prefix removed.
    pub format_options: HashMap<String, String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Capacity of the hand-off buffer between the network task and the consumer.
    pub buffer_capacity: usize,
    pub decode_error_policy: DecodeErrorPolicy,
    pub publish_max_retries: u32,
    pub shutdown_grace_period: Duration,
}

impl EmqxConfig {
    /// Start building a config with the required fields.
    pub fn builder(broker: impl Into<String>, topic: impl Into<String>) -> EmqxConfigBuilder {
        EmqxConfigBuilder {
            broker: broker.into(),
            topic: topic.into(),
            client_id: None,
            username: None,
            password: None,
            qos: DEFAULT_QOS,
            clean_session: true,
            format: DEFAULT_FORMAT.to_string(),
            format_options: HashMap::new(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            buffer_capacity: 100,
            decode_error_policy: DecodeErrorPolicy::default(),
            publish_max_retries: 3,
            shutdown_grace_period: Duration::from_secs(5),
        }
    }

    /// Resolve declarative table options.
    ///
    /// Fails on a missing `broker` or `topic`, on any key that is neither a
    /// known option nor addressed to the selected format, and on values that
    /// do not parse.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        use options::*;

        let format = options
            .get(FORMAT)
            .map(|f| f.trim().to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
        let format_prefix = format!("{format}.");

        let mut format_options = HashMap::new();
        for (key, value) in options {
            if let Some(stripped) = key.strip_prefix(&format_prefix) {
                format_options.insert(stripped.to_string(), value.clone());
            } else if key != CONNECTOR
                && !REQUIRED.contains(&key.as_str())
                && !OPTIONAL.contains(&key.as_str())
            {
                return Err(ConfigError::UnsupportedOption(key.clone()));
            }
        }

        let required = |key: &str| -> Result<String, ConfigError> {
            options
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ConfigError::MissingOption(key.to_string()))
        };

        let mut builder = Self::builder(required(BROKER)?, required(TOPIC)?)
            .format(format)
            .format_options(format_options);

        if let Some(username) = options.get(USERNAME) {
            builder = builder.username(username);
        }
        if let Some(password) = options.get(PASSWORD) {
            builder = builder.password(password);
        }
        if let Some(client_id) = options.get(CLIENT_ID) {
            builder = builder.client_id(client_id);
        }
        if let Some(value) = options.get(QOS) {
            let level: u8 = parse(QOS, value)?;
            let qos = QoS::try_from(level).map_err(|e| ConfigError::invalid(QOS, value, e))?;
            builder = builder.qos(qos);
        }
        let clean_session = options
            .get(CLEAN_SESSION)
            .map(|v| (CLEAN_SESSION, v))
            .or_else(|| options.get(IS_CLEAN_SESSION).map(|v| (IS_CLEAN_SESSION, v)));
        if let Some((key, value)) = clean_session {
            builder = builder.clean_session(parse_bool(key, value)?);
        }
        if let Some(value) = options.get(KEEP_ALIVE_SECS) {
            builder = builder.keep_alive(Duration::from_secs(parse(KEEP_ALIVE_SECS, value)?));
        }
        if let Some(value) = options.get(CONNECT_TIMEOUT_MS) {
            builder = builder.connect_timeout(parse_millis(CONNECT_TIMEOUT_MS, value)?);
        }
        if let Some(value) = options.get(ACK_TIMEOUT_MS) {
            builder = builder.ack_timeout(parse_millis(ACK_TIMEOUT_MS, value)?);
        }

        let mut reconnect = ReconnectPolicy::default();
        if let Some(value) = options.get(RECONNECT_MAX_ATTEMPTS) {
            reconnect.max_attempts = parse(RECONNECT_MAX_ATTEMPTS, value)?;
        }
        if let Some(value) = options.get(RECONNECT_INITIAL_BACKOFF_MS) {
            reconnect.initial_backoff = parse_millis(RECONNECT_INITIAL_BACKOFF_MS, value)?;
        }
        if let Some(value) = options.get(RECONNECT_MAX_BACKOFF_MS) {
            reconnect.max_backoff = parse_millis(RECONNECT_MAX_BACKOFF_MS, value)?;
        }
        builder = builder.reconnect(reconnect);

        if let Some(value) = options.get(BUFFER_CAPACITY) {
            builder = builder.buffer_capacity(parse(BUFFER_CAPACITY, value)?);
        }
        if let Some(value) = options.get(DECODE_ERROR_POLICY) {
            builder = builder.decode_error_policy(parse(DECODE_ERROR_POLICY, value)?);
        }
        if let Some(value) = options.get(PUBLISH_MAX_RETRIES) {
            builder = builder.publish_max_retries(parse(PUBLISH_MAX_RETRIES, value)?);
        }
        if let Some(value) = options.get(SHUTDOWN_GRACE_PERIOD_MS) {
            builder = builder.shutdown_grace_period(parse_millis(SHUTDOWN_GRACE_PERIOD_MS, value)?);
        }

        builder.build()
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, value, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse(key, &value.trim().to_ascii_lowercase())
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

/// Builder for [`EmqxConfig`].
pub struct EmqxConfigBuilder {
    broker: String,
    topic: String,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    qos: QoS,
    clean_session: bool,
    format: String,
    format_options: HashMap<String, String>,
    keep_alive: Duration,
    connect_timeout: Duration,
    ack_timeout: Duration,
    reconnect: ReconnectPolicy,
    buffer_capacity: usize,
    decode_error_policy: DecodeErrorPolicy,
    publish_max_retries: u32,
    shutdown_grace_period: Duration,
}

impl EmqxConfigBuilder {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn format_options(mut self, options: HashMap<String, String>) -> Self {
        self.format_options = options;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.decode_error_policy = policy;
        self
    }

    pub fn publish_max_retries(mut self, retries: u32) -> Self {
        self.publish_max_retries = retries;
        self
    }

    pub fn shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    /// Validate and build the config.
    pub fn build(self) -> Result<EmqxConfig, ConfigError> {
        use options::*;

        let broker = BrokerAddress::parse(&self.broker)?;

        let topic = self.topic.trim().to_string();
        if topic.is_empty() {
            return Err(ConfigError::MissingOption(TOPIC.to_string()));
        }
        topic::validate_filter(&topic).map_err(|reason| ConfigError::InvalidTopic {
            topic: topic.clone(),
            reason,
        })?;

        let client_id = match self.client_id {
            Some(id) if id.trim().is_empty() || id.starts_with(' ') => {
                return Err(ConfigError::invalid(CLIENT_ID, &id, "must not be blank"));
            }
            Some(id) => id,
            None => format!("emqx-connector-{}", uuid::Uuid::new_v4().simple()),
        };

        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::MissingOption(USERNAME.to_string()));
        }
        if self.keep_alive < MIN_KEEP_ALIVE {
            return Err(ConfigError::invalid(
                KEEP_ALIVE_SECS,
                &self.keep_alive.as_secs().to_string(),
                "must be at least 5 seconds",
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::invalid(BUFFER_CAPACITY, "0", "must be at least 1"));
        }
        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            return Err(ConfigError::invalid(
                RECONNECT_INITIAL_BACKOFF_MS,
                &self.reconnect.initial_backoff.as_millis().to_string(),
                "must not exceed reconnect.max-backoff-ms",
            ));
        }
        for (key, timeout) in [
            (CONNECT_TIMEOUT_MS, self.connect_timeout),
            (ACK_TIMEOUT_MS, self.ack_timeout),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::invalid(key, "0", "must be positive"));
            }
        }

        let format = self.format.trim().to_ascii_lowercase();
        if format.is_empty() {
            return Err(ConfigError::invalid(FORMAT, &self.format, "must not be blank"));
        }

        Ok(EmqxConfig {
            broker,
            topic,
            client_id,
            username: self.username,
            password: self.password,
            qos: self.qos,
            clean_session: self.clean_session,
            format,
            format_options: self.format_options,
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
            reconnect: self.reconnect,
            buffer_capacity: self.buffer_capacity,
            decode_error_policy: self.decode_error_policy,
            publish_max_retries: self.publish_max_retries,
            shutdown_grace_period: self.shutdown_grace_period,
        })
    }
}
