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

//! Turns MQTT payloads into rows, applying the decode-error policy.

use emqx_core::{Codec, DecodeError, DecodeErrorPolicy, Row};

/// What to do with one incoming payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    /// Hand the row downstream, then acknowledge.
    Row(Row),
    /// Undecodable but tolerated: acknowledge without emitting anything.
    Skipped(DecodeError),
    /// Undecodable and not tolerated: stop without acknowledging.
    Fatal(DecodeError),
}

/// Decode `payload` with `codec`.
pub fn payload_to_row(codec: &dyn Codec, payload: &[u8], policy: DecodeErrorPolicy) -> Mapped {
    match codec.decode(payload) {
        Ok(row) => Mapped::Row(row),
        Err(e) => match policy {
            DecodeErrorPolicy::Skip => Mapped::Skipped(e),
            DecodeErrorPolicy::Fail => Mapped::Fatal(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emqx_core::{JsonCodec, Value};

    fn codec() -> JsonCodec {
        JsonCodec::new("id BIGINT NOT NULL, temp DOUBLE".parse().unwrap())
    }

    #[test]
    fn test_valid_payload() {
        let mapped = payload_to_row(
            &codec(),
            br#"{"id": 1, "temp": 21.5}"#,
            DecodeErrorPolicy::Fail,
        );
        assert_eq!(
            mapped,
            Mapped::Row(Row::new(vec![Value::BigInt(1), Value::Double(21.5)]))
        );
    }

    #[test]
    fn test_skip_policy() {
        let mapped = payload_to_row(&codec(), b"not json", DecodeErrorPolicy::Skip);
        assert!(matches!(mapped, Mapped::Skipped(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_fail_policy() {
        let mapped = payload_to_row(&codec(), br#"{"temp": 3.0}"#, DecodeErrorPolicy::Fail);
        assert_eq!(mapped, Mapped::Fatal(DecodeError::MissingField("id".into())));
    }
}
