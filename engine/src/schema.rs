//! Schema mapping: normalizing Kafka wire payloads into a canonical JSON
//! shape on ingest, building sink rows in column order, and merging the two
//! sides of a join into one output object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("required field {0} is missing")]
    MissingField(String),
    #[error("field {field}: cannot represent {value} as {wanted}")]
    Cast {
        field: String,
        value: String,
        wanted: String,
    },
}

/// Canonical field types used in source schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// Per-source ingest schema. Declared fields are coerced into their
/// canonical JSON type; undeclared fields pass through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSchema {
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl SourceSchema {
    pub fn normalize(&self, payload: &[u8]) -> Result<Value, SchemaError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        if self.fields.is_empty() {
            return Ok(value);
        }
        let Value::Object(mut object) = value else {
            return Err(SchemaError::NotAnObject);
        };

        for field in &self.fields {
            match object.get(&field.name) {
                Some(found) => {
                    let coerced = coerce(found, field.field_type)
                        .map_err(|wanted| SchemaError::Cast {
                            field: field.name.clone(),
                            value: found.to_string(),
                            wanted,
                        })?;
                    object.insert(field.name.clone(), coerced);
                }
                None if field.required => {
                    return Err(SchemaError::MissingField(field.name.clone()))
                }
                None => {}
            }
        }
        Ok(Value::Object(object))
    }
}

pub(crate) fn coerce(value: &Value, wanted: FieldType) -> Result<Value, String> {
    match (wanted, value) {
        (FieldType::Json, v) => Ok(v.clone()),
        (FieldType::String, Value::String(_)) => Ok(value.clone()),
        (FieldType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
        (FieldType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        (FieldType::Int, Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| Value::from(f as i64))
            .ok_or_else(|| "int".to_string()),
        (FieldType::Int, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| "int".to_string()),
        (FieldType::Float, Value::Number(_)) => Ok(value.clone()),
        (FieldType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| "float".to_string()),
        (FieldType::Bool, Value::Bool(_)) => Ok(value.clone()),
        (FieldType::Bool, Value::String(s)) => match s.as_str() {
            "true" | "TRUE" | "1" => Ok(Value::Bool(true)),
            "false" | "FALSE" | "0" => Ok(Value::Bool(false)),
            _ => Err("bool".to_string()),
        },
        (wanted, _) => Err(format!("{wanted:?}").to_lowercase()),
    }
}

/// One sink column: its ClickHouse type and the payload path feeding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub column: String,
    #[serde(rename = "type")]
    pub column_type: String,
    /// Dotted path into the payload; defaults to the column name.
    #[serde(default)]
    pub field: Option<String>,
}

impl ColumnMapping {
    fn path(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.column)
    }

    fn nullable(&self) -> bool {
        self.column_type.starts_with("Nullable(")
    }
}

/// Ordered column list for the sink's INSERT plus per-payload row building.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkMapping {
    pub columns: Vec<ColumnMapping>,
}

impl SinkMapping {
    /// Column names in declared order, as used in the INSERT statement.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.column.clone()).collect()
    }

    /// Build one JSONEachRow object from a payload, casting each value to
    /// fit its ClickHouse column type.
    pub fn prepare_row(&self, payload: &[u8]) -> Result<Map<String, Value>, SchemaError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        let mut row = Map::with_capacity(self.columns.len());

        for mapping in &self.columns {
            let found = lookup(&value, mapping.path());
            match found {
                Some(v) => {
                    let cast = cast_for_column(v, &mapping.column_type).map_err(|_| {
                        SchemaError::Cast {
                            field: mapping.path().to_string(),
                            value: v.to_string(),
                            wanted: mapping.column_type.clone(),
                        }
                    })?;
                    row.insert(mapping.column.clone(), cast);
                }
                None if mapping.nullable() => {
                    row.insert(mapping.column.clone(), Value::Null);
                }
                None => return Err(SchemaError::MissingField(mapping.path().to_string())),
            }
        }
        Ok(row)
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn base_type(column_type: &str) -> &str {
    let inner = column_type
        .strip_prefix("Nullable(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(column_type);
    inner
        .strip_prefix("LowCardinality(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(inner)
}

fn cast_for_column(value: &Value, column_type: &str) -> Result<Value, ()> {
    let base = base_type(column_type);
    match base {
        t if t.starts_with("Int") || t.starts_with("UInt") => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| Value::from(f as i64))
                .ok_or(()),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| ()),
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            _ => Err(()),
        },
        t if t.starts_with("Float") => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s.trim().parse::<f64>().map(Value::from).map_err(|_| ()),
            _ => Err(()),
        },
        "Bool" => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::Bool(n.as_i64() != Some(0))),
            _ => Err(()),
        },
        t if t.starts_with("DateTime") || t == "Date" => match value {
            Value::String(_) | Value::Number(_) => Ok(value.clone()),
            _ => Err(()),
        },
        t if t.starts_with("String") || t.starts_with("FixedString") || t == "UUID" => {
            match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                // nested objects land in String columns as their JSON text
                other => Ok(Value::String(other.to_string())),
            }
        }
        _ => Ok(value.clone()),
    }
}

/// Join output rules: the merged object keeps every left field, then every
/// right field not already present; an optional output list restricts the
/// result to the declared fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinMapping {
    #[serde(default)]
    pub output_fields: Option<Vec<String>>,
}

impl JoinMapping {
    pub fn merge(&self, left: &[u8], right: &[u8]) -> Result<Value, SchemaError> {
        let left: Value = serde_json::from_slice(left)
            .map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        let right: Value = serde_json::from_slice(right)
            .map_err(|e| SchemaError::InvalidJson(e.to_string()))?;

        let Value::Object(mut merged) = left else {
            return Err(SchemaError::NotAnObject);
        };
        let Value::Object(right) = right else {
            return Err(SchemaError::NotAnObject);
        };
        for (key, value) in right {
            merged.entry(key).or_insert(value);
        }

        if let Some(fields) = &self.output_fields {
            merged.retain(|key, _| fields.iter().any(|f| f == key));
        }
        Ok(Value::Object(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(fields: &[(&str, FieldType, bool)]) -> SourceSchema {
        SourceSchema {
            fields: fields
                .iter()
                .map(|(name, field_type, required)| FieldDef {
                    name: name.to_string(),
                    field_type: *field_type,
                    required: *required,
                })
                .collect(),
        }
    }

    #[test]
    fn normalize_coerces_wire_types() {
        let schema = schema(&[
            ("id", FieldType::Int, true),
            ("score", FieldType::Float, false),
            ("active", FieldType::Bool, false),
        ]);
        let value = schema
            .normalize(br#"{"id": "42", "score": "1.5", "active": "true", "extra": 1}"#)
            .unwrap();
        assert_eq!(
            value,
            json!({"id": 42, "score": 1.5, "active": true, "extra": 1})
        );
    }

    #[test]
    fn normalize_rejects_missing_required_fields() {
        let schema = schema(&[("id", FieldType::Int, true)]);
        assert_eq!(
            schema.normalize(br#"{"other": 1}"#),
            Err(SchemaError::MissingField("id".to_string()))
        );
    }

    #[test]
    fn normalize_rejects_uncastable_values() {
        let schema = schema(&[("id", FieldType::Int, true)]);
        assert!(matches!(
            schema.normalize(br#"{"id": "abc"}"#),
            Err(SchemaError::Cast { .. })
        ));
    }

    #[test]
    fn empty_schema_passes_payloads_through() {
        let schema = SourceSchema::default();
        let value = schema.normalize(br#"{"anything": [1, 2]}"#).unwrap();
        assert_eq!(value, json!({"anything": [1, 2]}));
    }

    fn mapping() -> SinkMapping {
        SinkMapping {
            columns: vec![
                ColumnMapping {
                    column: "id".into(),
                    column_type: "UInt64".into(),
                    field: None,
                },
                ColumnMapping {
                    column: "city".into(),
                    column_type: "String".into(),
                    field: Some("address.city".into()),
                },
                ColumnMapping {
                    column: "note".into(),
                    column_type: "Nullable(String)".into(),
                    field: None,
                },
            ],
        }
    }

    #[test]
    fn prepare_row_follows_column_order_and_paths() {
        let mapping = mapping();
        assert_eq!(mapping.column_names(), vec!["id", "city", "note"]);

        let row = mapping
            .prepare_row(br#"{"id": 7, "address": {"city": "utrecht"}}"#)
            .unwrap();
        assert_eq!(row.get("id"), Some(&json!(7)));
        assert_eq!(row.get("city"), Some(&json!("utrecht")));
        assert_eq!(row.get("note"), Some(&Value::Null));
    }

    #[test]
    fn prepare_row_rejects_missing_non_nullable() {
        let mapping = mapping();
        assert_eq!(
            mapping.prepare_row(br#"{"address": {"city": "x"}}"#),
            Err(SchemaError::MissingField("id".to_string()))
        );
    }

    #[test]
    fn prepare_row_casts_for_column_types() {
        let mapping = SinkMapping {
            columns: vec![
                ColumnMapping {
                    column: "n".into(),
                    column_type: "Int32".into(),
                    field: None,
                },
                ColumnMapping {
                    column: "s".into(),
                    column_type: "LowCardinality(String)".into(),
                    field: None,
                },
            ],
        };
        let row = mapping.prepare_row(br#"{"n": "12", "s": 4}"#).unwrap();
        assert_eq!(row.get("n"), Some(&json!(12)));
        assert_eq!(row.get("s"), Some(&json!("4")));
    }

    #[test]
    fn join_merge_prefers_left_and_unions_right() {
        let mapping = JoinMapping::default();
        let merged = mapping
            .merge(
                br#"{"userId": "u", "v": 1}"#,
                br#"{"userId": "u", "w": 2}"#,
            )
            .unwrap();
        assert_eq!(merged, json!({"userId": "u", "v": 1, "w": 2}));
    }

    #[test]
    fn join_merge_respects_output_fields() {
        let mapping = JoinMapping {
            output_fields: Some(vec!["userId".into(), "w".into()]),
        };
        let merged = mapping
            .merge(br#"{"userId": "u", "v": 1}"#, br#"{"w": 2}"#)
            .unwrap();
        assert_eq!(merged, json!({"userId": "u", "w": 2}));
    }
}
