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

//! Error taxonomy shared by the source and sink.
//!
//! Configuration errors are fatal at table-definition time. Connection errors
//! are retried by the connection manager and only surface once they become
//! fatal. Decode, encode and publish errors are scoped to a single message.

use std::time::Duration;

use thiserror::Error;

/// A missing or invalid option.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required option '{0}'")]
    MissingOption(String),

    #[error("unsupported option '{0}'")]
    UnsupportedOption(String),

    #[error("invalid value '{value}' for option '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid broker address '{uri}': {reason}")]
    InvalidBroker { uri: String, reason: String },

    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("unknown format '{0}'")]
    UnknownFormat(String),

    #[error("no connector registered under '{0}'")]
    UnknownConnector(String),

    #[error("connector '{connector}' does not provide a {capability}")]
    MissingCapability {
        connector: String,
        capability: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl ToString) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failure to establish or keep the broker session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("broker {broker} unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        broker: String,
        attempts: u32,
        reason: String,
    },

    #[error("broker refused credentials: {0}")]
    AuthRejected(String),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("subscription to '{0}' rejected by broker")]
    SubscribeRejected(String),

    #[error("invalid topic filter '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("MQTT client error: {0}")]
    Client(String),

    #[error("connection closed")]
    Closed,
}

/// A payload that cannot be turned into a row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("field '{0}' is not nullable but the payload holds null")]
    NullValue(String),

    #[error("field '{field}' expects {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },
}

/// A row that cannot be turned into a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("row has {actual} value(s) but the schema declares {expected} field(s)")]
    Arity { expected: usize, actual: usize },

    #[error("field '{field}' expects {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("field '{0}' is not nullable")]
    NullValue(String),

    #[error("field '{0}' holds a non-finite number")]
    NonFinite(String),

    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// A publish that was not confirmed by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("publish to '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("no acknowledgment for {} on '{topic}' within {timeout:?}", packet_label(.pkid))]
    AckTimeout {
        topic: String,
        pkid: Option<u16>,
        timeout: Duration,
    },

    #[error("cannot publish: connection closed")]
    Closed,

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("cannot render topic: {0}")]
    Topic(String),
}

impl PublishError {
    /// Whether a retry of the same publish may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::AckTimeout { .. })
    }
}

fn packet_label(pkid: &Option<u16>) -> String {
    match pkid {
        Some(pkid) => format!("packet {pkid}"),
        None => "unsent packet".to_string(),
    }
}
