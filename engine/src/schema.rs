//! Schema gate: synchronous validation of inserted and updated records.
//!
//! Any validator implementing [`StandardSchema`] can guard a collection.
//! [`FieldSchema`] is the built-in one, a flat list of typed fields.

use crate::{error::Result, Error, OperationType};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One problem found while validating a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub message: String,
    /// Field path from the record root
    pub path: Vec<String>,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            message: message.into(),
            path,
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path.join("."), self.message)
        }
    }
}

/// Outcome of a validation call.
pub enum SchemaResult {
    /// The validated (possibly normalized) value, or every issue found.
    Ready(std::result::Result<Value, Vec<ValidationIssue>>),
    /// The validator wants to finish asynchronously. Collections reject this.
    Pending(BoxFuture<'static, std::result::Result<Value, Vec<ValidationIssue>>>),
}

/// Structural validation contract.
pub trait StandardSchema: Send + Sync {
    fn validate(&self, value: &Value) -> SchemaResult;
}

impl<F> StandardSchema for F
where
    F: Fn(&Value) -> SchemaResult + Send + Sync,
{
    fn validate(&self, value: &Value) -> SchemaResult {
        self(value)
    }
}

/// Run `schema` and insist on a synchronous answer.
pub(crate) fn validate_now(
    schema: &dyn StandardSchema,
    value: &Value,
    operation: OperationType,
) -> Result<Value> {
    match schema.validate(value) {
        SchemaResult::Ready(Ok(value)) => Ok(value),
        SchemaResult::Ready(Err(issues)) => Err(Error::Validation { operation, issues }),
        SchemaResult::Pending(_) => Err(Error::AsyncValidation),
    }
}

/// Field types supported by [`FieldSchema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Check a field value, returning the issue if it does not conform.
    pub fn check(&self, value: Option<&Value>) -> Option<ValidationIssue> {
        match value {
            None | Some(Value::Null) if self.required => Some(self.issue("missing required field")),
            None | Some(Value::Null) => None,
            Some(v) if self.type_matches(v) => None,
            Some(v) => Some(self.issue(format!(
                "expected {}, got {}",
                self.field_type,
                json_type_name(v)
            ))),
        }
    }

    fn type_matches(&self, value: &Value) -> bool {
        match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        }
    }

    fn issue(&self, message: impl Into<String>) -> ValidationIssue {
        ValidationIssue::new(message, vec![self.name.clone()])
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// A flat record schema: a list of typed fields.
///
/// Reports every non-conforming field, not only the first one. Fields the
/// schema does not mention are allowed unless [`FieldSchema::strict`] is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub strict: bool,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self {
            fields,
            strict: false,
        }
    }

    /// Builder-style method to reject unknown fields.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Collect every issue for `value`.
    pub fn issues(&self, value: &Value) -> Vec<ValidationIssue> {
        let Some(obj) = value.as_object() else {
            return vec![ValidationIssue::new("record must be an object", Vec::new())];
        };

        let mut issues: Vec<ValidationIssue> = self
            .fields
            .iter()
            .filter_map(|field| field.check(obj.get(&field.name)))
            .collect();

        if self.strict {
            for name in obj.keys() {
                if !self.fields.iter().any(|f| &f.name == name) {
                    issues.push(ValidationIssue::new("unknown field", vec![name.clone()]));
                }
            }
        }

        issues
    }
}

impl StandardSchema for FieldSchema {
    fn validate(&self, value: &Value) -> SchemaResult {
        let issues = self.issues(value);
        if issues.is_empty() {
            SchemaResult::Ready(Ok(value.clone()))
        } else {
            SchemaResult::Ready(Err(issues))
        }
    }
}
