/// Row and schema model
///
/// A row is an ordered, fixed-arity tuple of typed values. The schema describing it
/// (ordered field names and types) is attached once per row set, never per row.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::sync::Arc;

/// Type of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    Binary,
}

/// A single typed value inside a row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert a JSON literal into a value of the requested type.
    /// JSON `null` always yields `Value::Null`.
    pub fn from_json(raw: &Json, value_type: ValueType) -> Result<Self> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let value = match value_type {
            ValueType::String => match raw {
                Json::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            },
            ValueType::Integer => match raw {
                Json::Number(n) => Value::Integer(
                    n.as_i64()
                        .ok_or_else(|| anyhow!("'{}' is not an integer", n))?,
                ),
                Json::String(s) => Value::Integer(s.trim().parse()?),
                other => return Err(anyhow!("cannot convert {} to integer", other)),
            },
            ValueType::Number => match raw {
                Json::Number(n) => Value::Number(
                    n.as_f64()
                        .ok_or_else(|| anyhow!("'{}' is not a number", n))?,
                ),
                Json::String(s) => Value::Number(s.trim().parse()?),
                other => return Err(anyhow!("cannot convert {} to number", other)),
            },
            ValueType::Boolean => match raw {
                Json::Bool(b) => Value::Boolean(*b),
                Json::String(s) => Value::Boolean(matches!(
                    s.trim().to_ascii_lowercase().as_str(),
                    "y" | "yes" | "true" | "1"
                )),
                other => return Err(anyhow!("cannot convert {} to boolean", other)),
            },
            ValueType::Date => match raw {
                Json::String(s) => Value::Date(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)),
                other => return Err(anyhow!("cannot convert {} to date", other)),
            },
            ValueType::Binary => match raw {
                Json::String(s) => Value::Binary(s.as_bytes().to_vec()),
                other => return Err(anyhow!("cannot convert {} to binary", other)),
            },
        };
        Ok(value)
    }

    /// JSON representation used by the API and result row export
    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

/// Field descriptor: name plus type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
}

impl Field {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// Ordered list of fields shared by every row on a row set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSchema {
    fields: Vec<Field>,
}

impl RowSchema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Position of a field by name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// A copy of this schema with extra fields appended
    pub fn extended(&self, extra: impl IntoIterator<Item = Field>) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self { fields }
    }
}

/// One row of data. Arity must match the schema of the row set it travels on.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Row(Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn push(&mut self, value: Value) {
        self.0.push(value);
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// A row together with its schema, as carried by a job result
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub schema: Arc<RowSchema>,
    pub row: Row,
}

impl ResultRow {
    pub fn new(schema: Arc<RowSchema>, row: Row) -> Self {
        Self { schema, row }
    }

    /// Look a value up by field name
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).and_then(|i| self.row.get(i))
    }

    /// Render as a `{ field: value }` JSON object
    pub fn to_json(&self) -> Json {
        let object = self
            .schema
            .fields()
            .iter()
            .zip(self.row.values())
            .map(|(field, value)| (field.name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        Json::Object(object)
    }
}
