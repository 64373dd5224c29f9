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

//! Rows, schemas and the pluggable payload codecs that convert between them
//! and MQTT payload bytes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};

use crate::error::{ConfigError, DecodeError, EncodeError};

/// Logical type of a row field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Boolean,
    Int,
    BigInt,
    Float,
    Double,
    String,
    /// Any JSON value, kept as is.
    Json,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int => "INT",
            DataType::BigInt => "BIGINT",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::String => "STRING",
            DataType::Json => "JSON",
        };
        f.write_str(name)
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BOOLEAN" | "BOOL" => Ok(DataType::Boolean),
            "INT" | "INTEGER" => Ok(DataType::Int),
            "BIGINT" => Ok(DataType::BigInt),
            "FLOAT" => Ok(DataType::Float),
            "DOUBLE" => Ok(DataType::Double),
            "STRING" | "VARCHAR" => Ok(DataType::String),
            "JSON" => Ok(DataType::Json),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    /// A nullable field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Declared physical schema of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSchema {
    fields: Vec<Field>,
}

impl RowSchema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Parses `name TYPE [NOT NULL], ...`, e.g. `id BIGINT NOT NULL, temp DOUBLE`.
impl FromStr for RowSchema {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = Vec::new();
        for column in s.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let parts: Vec<&str> = column.split_whitespace().collect();
            let field = match parts.as_slice() {
                [name, data_type] => Field::new(*name, data_type.parse()?),
                [name, data_type, not, null]
                    if not.eq_ignore_ascii_case("not") && null.eq_ignore_ascii_case("null") =>
                {
                    Field::new(*name, data_type.parse()?).not_null()
                }
                _ => return Err(format!("cannot parse column '{column}'")),
            };
            if fields.iter().any(|f: &Field| f.name == field.name) {
                return Err(format!("duplicate column '{}'", field.name));
            }
            fields.push(field);
        }
        if fields.is_empty() {
            return Err("schema declares no columns".into());
        }
        Ok(Self::new(fields))
    }
}

/// A single typed value of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    String(String),
    Json(JsonValue),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Int(_) => "INT",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "FLOAT",
            Value::Double(_) => "DOUBLE",
            Value::String(_) => "STRING",
            Value::Json(_) => "JSON",
        }
    }
}

/// One record, positionally aligned with its [`RowSchema`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// Converts between payload bytes and rows.
///
/// Implementations must report a failure instead of producing a partial row.
pub trait Codec: Send + Sync {
    /// Name of the format this codec implements.
    fn format(&self) -> &str;

    fn decode(&self, payload: &[u8]) -> Result<Row, DecodeError>;

    fn encode(&self, row: &Row) -> Result<Vec<u8>, EncodeError>;
}

/// Builds a codec for a schema from the format's own options.
pub type CodecFactory =
    Arc<dyn Fn(&RowSchema, &HashMap<String, String>) -> Result<Arc<dyn Codec>, ConfigError> + Send + Sync>;

/// Formats available to connectors, keyed by the `format` option value.
#[derive(Clone)]
pub struct FormatRegistry {
    factories: HashMap<String, CodecFactory>,
}

impl FormatRegistry {
    /// A registry without any format.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, format: impl Into<String>, factory: CodecFactory) {
        self.factories.insert(format.into().to_ascii_lowercase(), factory);
    }

    pub fn formats(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(
        &self,
        format: &str,
        schema: &RowSchema,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Codec>, ConfigError> {
        let factory = self
            .factories
            .get(&format.to_ascii_lowercase())
            .ok_or_else(|| ConfigError::UnknownFormat(format.to_string()))?;
        factory(schema, options)
    }
}

impl Default for FormatRegistry {
    /// Registers the `json` format.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(JsonCodec::FORMAT, Arc::new(JsonCodec::from_options));
        registry
    }
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}

/// JSON object payloads, one key per schema field.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    schema: RowSchema,
    fail_on_missing_field: bool,
}

impl JsonCodec {
    pub const FORMAT: &'static str = "json";
    pub const FAIL_ON_MISSING_FIELD: &'static str = "fail-on-missing-field";

    pub fn new(schema: RowSchema) -> Self {
        Self {
            schema,
            fail_on_missing_field: false,
        }
    }

    /// Treat an absent key as an error even for nullable fields.
    pub fn fail_on_missing_field(mut self, fail: bool) -> Self {
        self.fail_on_missing_field = fail;
        self
    }

    fn from_options(
        schema: &RowSchema,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Codec>, ConfigError> {
        let mut codec = JsonCodec::new(schema.clone());
        for (key, value) in options {
            match key.as_str() {
                Self::FAIL_ON_MISSING_FIELD => {
                    let fail = value.trim().to_ascii_lowercase().parse().map_err(|e| {
                        ConfigError::invalid(&format!("json.{key}"), value, e)
                    })?;
                    codec = codec.fail_on_missing_field(fail);
                }
                _ => return Err(ConfigError::UnsupportedOption(format!("json.{key}"))),
            }
        }
        Ok(Arc::new(codec))
    }
}

impl Codec for JsonCodec {
    fn format(&self) -> &str {
        Self::FORMAT
    }

    fn decode(&self, payload: &[u8]) -> Result<Row, DecodeError> {
        let json: JsonValue =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let JsonValue::Object(object) = json else {
            return Err(DecodeError::NotAnObject);
        };

        let mut values = Vec::with_capacity(self.schema.len());
        for field in self.schema.fields() {
            let value = match object.get(&field.name) {
                Some(json) => decode_value(field, json)?,
                None if self.fail_on_missing_field || !field.nullable => {
                    return Err(DecodeError::MissingField(field.name.clone()));
                }
                None => Value::Null,
            };
            values.push(value);
        }
        Ok(Row::new(values))
    }

    fn encode(&self, row: &Row) -> Result<Vec<u8>, EncodeError> {
        let object = row_to_json(&self.schema, row)?;
        serde_json::to_vec(&object).map_err(|e| EncodeError::Serialize(e.to_string()))
    }
}

/// Render a row as a JSON object keyed by field name.
pub fn row_to_json(schema: &RowSchema, row: &Row) -> Result<JsonValue, EncodeError> {
    if row.len() != schema.len() {
        return Err(EncodeError::Arity {
            expected: schema.len(),
            actual: row.len(),
        });
    }

    let mut object = Map::with_capacity(schema.len());
    for (field, value) in schema.fields().iter().zip(row.values()) {
        object.insert(field.name.clone(), encode_value(field, value)?);
    }
    Ok(JsonValue::Object(object))
}

fn decode_value(field: &Field, json: &JsonValue) -> Result<Value, DecodeError> {
    let mismatch = || DecodeError::TypeMismatch {
        field: field.name.clone(),
        expected: field.data_type.to_string(),
        found: json_type_name(json).to_string(),
    };

    if json.is_null() {
        return if field.nullable {
            Ok(Value::Null)
        } else {
            Err(DecodeError::NullValue(field.name.clone()))
        };
    }

    let value = match field.data_type {
        DataType::Boolean => match json {
            JsonValue::Bool(b) => Value::Boolean(*b),
            JsonValue::String(s) => Value::Boolean(s.parse().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        },
        DataType::Int => {
            let n = integer(json).ok_or_else(mismatch)?;
            Value::Int(i32::try_from(n).map_err(|_| mismatch())?)
        }
        DataType::BigInt => Value::BigInt(integer(json).ok_or_else(mismatch)?),
        DataType::Float => {
            let x = float(json).ok_or_else(mismatch)? as f32;
            if !x.is_finite() {
                return Err(mismatch());
            }
            Value::Float(x)
        }
        DataType::Double => Value::Double(float(json).ok_or_else(mismatch)?),
        DataType::String => match json {
            JsonValue::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
        DataType::Json => Value::Json(json.clone()),
    };
    Ok(value)
}

fn integer(json: &JsonValue) -> Option<i64> {
    match json {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float(json: &JsonValue) -> Option<f64> {
    let x = match json {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    x.is_finite().then_some(x)
}

fn encode_value(field: &Field, value: &Value) -> Result<JsonValue, EncodeError> {
    let json = match (field.data_type, value) {
        (_, Value::Null) if field.nullable => JsonValue::Null,
        (_, Value::Null) => return Err(EncodeError::NullValue(field.name.clone())),
        (DataType::Boolean, Value::Boolean(b)) => JsonValue::Bool(*b),
        (DataType::Int, Value::Int(n)) => JsonValue::from(*n),
        (DataType::BigInt, Value::BigInt(n)) => JsonValue::from(*n),
        (DataType::Float, Value::Float(x)) => finite(field, f64::from(*x))?,
        (DataType::Double, Value::Double(x)) => finite(field, *x)?,
        (DataType::String, Value::String(s)) => JsonValue::String(s.clone()),
        // Decodes as NULL; a row holding it would not survive the trip.
        (DataType::Json, Value::Json(JsonValue::Null)) => {
            return Err(EncodeError::TypeMismatch {
                field: field.name.clone(),
                expected: "JSON".to_string(),
                found: "JSON null".to_string(),
            })
        }
        (DataType::Json, Value::Json(j)) => j.clone(),
        (expected, other) => {
            return Err(EncodeError::TypeMismatch {
                field: field.name.clone(),
                expected: expected.to_string(),
                found: other.type_name().to_string(),
            })
        }
    };
    Ok(json)
}

fn finite(field: &Field, x: f64) -> Result<JsonValue, EncodeError> {
    Number::from_f64(x)
        .map(JsonValue::Number)
        .ok_or_else(|| EncodeError::NonFinite(field.name.clone()))
}

fn json_type_name(json: &JsonValue) -> &'static str {
    match json {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sensor_schema() -> RowSchema {
        RowSchema::new(vec![
            Field::new("id", DataType::BigInt).not_null(),
            Field::new("name", DataType::String),
            Field::new("temp", DataType::Double),
            Field::new("ratio", DataType::Float),
            Field::new("count", DataType::Int),
            Field::new("active", DataType::Boolean),
            Field::new("tags", DataType::Json),
        ])
    }

    #[test]
    fn test_decode_full_row() {
        let codec = JsonCodec::new(sensor_schema());
        let row = codec
            .decode(br#"{"id": 1, "name": "s-1", "temp": 21.5, "ratio": 0.25,
                         "count": 3, "active": true, "tags": ["a", "b"], "extra": 9}"#)
            .unwrap();

        assert_eq!(
            row.values(),
            &[
                Value::BigInt(1),
                Value::String("s-1".into()),
                Value::Double(21.5),
                Value::Float(0.25),
                Value::Int(3),
                Value::Boolean(true),
                Value::Json(json!(["a", "b"])),
            ]
        );
    }

    #[test]
    fn test_missing_nullable_fields_become_null() {
        let codec = JsonCodec::new(sensor_schema());
        let row = codec.decode(br#"{"id": 7}"#).unwrap();
        assert_eq!(row.get(0), Some(&Value::BigInt(7)));
        assert!(row.values()[1..].iter().all(|v| *v == Value::Null));
    }

    #[test]
    fn test_fail_on_missing_field() {
        let codec = JsonCodec::new(sensor_schema()).fail_on_missing_field(true);
        assert_eq!(
            codec.decode(br#"{"id": 7}"#).unwrap_err(),
            DecodeError::MissingField("name".into())
        );
    }

    #[test]
    fn test_missing_not_null_field() {
        let codec = JsonCodec::new(sensor_schema());
        assert_eq!(
            codec.decode(br#"{"name": "x"}"#).unwrap_err(),
            DecodeError::MissingField("id".into())
        );
        assert_eq!(
            codec.decode(br#"{"id": null}"#).unwrap_err(),
            DecodeError::NullValue("id".into())
        );
    }

    #[test]
    fn test_malformed_payloads() {
        let codec = JsonCodec::new(sensor_schema());
        assert!(matches!(codec.decode(b"not json"), Err(DecodeError::Malformed(_))));
        assert_eq!(codec.decode(b"[1, 2]").unwrap_err(), DecodeError::NotAnObject);
    }

    #[test]
    fn test_type_mismatch() {
        let codec = JsonCodec::new(sensor_schema());
        let err = codec.decode(br#"{"id": "abc"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { ref field, .. } if field == "id"));

        let err = codec.decode(br#"{"id": 1, "count": 4294967296}"#).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { ref field, .. } if field == "count"));

        let err = codec.decode(br#"{"id": 1, "ratio": 1e300}"#).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { ref field, .. } if field == "ratio"));

        let err = codec.decode(br#"{"id": 1, "temp": "NaN"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { ref field, .. } if field == "temp"));
    }

    #[test]
    fn test_numeric_strings_accepted() {
        let codec = JsonCodec::new(sensor_schema());
        let row = codec.decode(br#"{"id": "42", "temp": "1.5"}"#).unwrap();
        assert_eq!(row.get(0), Some(&Value::BigInt(42)));
        assert_eq!(row.get(2), Some(&Value::Double(1.5)));
    }

    #[test]
    fn test_round_trip() {
        let codec = JsonCodec::new(sensor_schema());
        let rows = [
            Row::new(vec![
                Value::BigInt(i64::MAX),
                Value::String("quote \" and unicode ✓".into()),
                Value::Double(-0.1),
                Value::Float(0.1),
                Value::Int(i32::MIN),
                Value::Boolean(false),
                Value::Json(json!({"nested": {"a": [1, 2, 3]}})),
            ]),
            Row::new(vec![
                Value::BigInt(0),
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Null,
            ]),
            Row::new(vec![
                Value::BigInt(-1),
                Value::String(String::new()),
                Value::Double(1e300),
                Value::Float(f32::MAX),
                Value::Int(0),
                Value::Boolean(true),
                Value::Json(json!([null, {"a": null}])),
            ]),
        ];

        for row in rows {
            let bytes = codec.encode(&row).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), row);
        }
    }

    #[test]
    fn test_encode_errors() {
        let codec = JsonCodec::new(sensor_schema());
        assert_eq!(
            codec.encode(&Row::new(vec![Value::BigInt(1)])).unwrap_err(),
            EncodeError::Arity { expected: 7, actual: 1 }
        );

        let mut values = vec![Value::Null; 7];
        assert_eq!(
            codec.encode(&Row::new(values.clone())).unwrap_err(),
            EncodeError::NullValue("id".into())
        );

        values[0] = Value::Int(1);
        assert!(matches!(
            codec.encode(&Row::new(values.clone())).unwrap_err(),
            EncodeError::TypeMismatch { .. }
        ));

        values[0] = Value::BigInt(1);
        values[2] = Value::Double(f64::NAN);
        assert_eq!(
            codec.encode(&Row::new(values.clone())).unwrap_err(),
            EncodeError::NonFinite("temp".into())
        );

        values[2] = Value::Null;
        values[6] = Value::Json(JsonValue::Null);
        assert!(matches!(
            codec.encode(&Row::new(values)).unwrap_err(),
            EncodeError::TypeMismatch { ref field, .. } if field == "tags"
        ));
    }

    #[test]
    fn test_registry_resolves_json() {
        let registry = FormatRegistry::default();
        let options = HashMap::from([("fail-on-missing-field".to_string(), "true".to_string())]);
        let codec = registry.create("JSON", &sensor_schema(), &options).unwrap();
        assert_eq!(codec.format(), "json");
        assert!(codec.decode(br#"{"id": 1}"#).is_err());
    }

    #[test]
    fn test_registry_errors() {
        let registry = FormatRegistry::default();
        assert_eq!(
            registry
                .create("avro", &sensor_schema(), &HashMap::new())
                .err(),
            Some(ConfigError::UnknownFormat("avro".into()))
        );

        let options = HashMap::from([("ignore-parse-errors".to_string(), "true".to_string())]);
        assert_eq!(
            registry.create("json", &sensor_schema(), &options).err(),
            Some(ConfigError::UnsupportedOption("json.ignore-parse-errors".into()))
        );
    }

    #[test]
    fn test_parse_schema() {
        let schema: RowSchema = "id BIGINT NOT NULL, temp double, raw JSON".parse().unwrap();
        assert_eq!(
            schema.fields(),
            &[
                Field::new("id", DataType::BigInt).not_null(),
                Field::new("temp", DataType::Double),
                Field::new("raw", DataType::Json),
            ]
        );
        assert!("id BIGINT, id INT".parse::<RowSchema>().is_err());
        assert!("id".parse::<RowSchema>().is_err());
        assert!("".parse::<RowSchema>().is_err());
    }
}
