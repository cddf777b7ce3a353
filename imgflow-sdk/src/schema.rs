//! Declared parameter schemas for step actions and sources
//!
//! Every action (and every source provider) publishes the parameters it accepts.
//! Workflows are checked against these schemas once, before an execution starts,
//! instead of each caller probing for "required" parameters on its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter mapping carried by steps and source configurations.
pub type Parameters = serde_json::Map<String, Value>;

/// Parameter type enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamType {
    Text,
    Integer {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Float {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Boolean,
    Path,
    List,
    Select {
        options: Vec<String>,
    },
    Object,
}

/// Parameter schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    pub name: String,
    pub label: String,
    pub description: String,
    pub param_type: ParamType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Whether a step runs once per image or once per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepScope {
    #[default]
    PerImage,
    Batch,
}

/// Action metadata (id, name, description, category)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
}

/// Complete action description with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSchema {
    #[serde(flatten)]
    pub metadata: ActionMetadata,
    pub scope: StepScope,
    pub params: Vec<ParamSchema>,
}

impl ActionSchema {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Check a parameter mapping against this schema, collecting every problem found.
    pub fn validate(&self, values: &Parameters) -> Vec<String> {
        validate_parameters(&self.params, values)
    }
}

/// Trait that typed parameter structs implement (auto-implemented by the derive macro)
pub trait ActionDefinition {
    fn schema() -> ActionSchema;
}

/// Validate `values` against `schema`.
///
/// Reports missing or empty required parameters, unknown names, type mismatches,
/// out-of-range numbers and values outside a select list. An explicit `null` on an
/// optional parameter counts as absent.
pub fn validate_parameters(schema: &[ParamSchema], values: &Parameters) -> Vec<String> {
    let mut problems = Vec::new();

    for param in schema {
        match values.get(&param.name) {
            None | Some(Value::Null) => {
                if param.required {
                    problems.push(format!("missing required parameter '{}'", param.name));
                }
            }
            Some(value) => {
                if param.required && is_empty_value(value) {
                    problems.push(format!("required parameter '{}' is empty", param.name));
                    continue;
                }
                if let Err(reason) = check_type(&param.param_type, value) {
                    problems.push(format!("parameter '{}' {}", param.name, reason));
                }
            }
        }
    }

    for name in values.keys() {
        if !schema.iter().any(|p| &p.name == name) {
            problems.push(format!("unknown parameter '{}'", name));
        }
    }

    problems
}

/// Null, blank strings, empty arrays and empty objects are all "empty".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn check_type(param_type: &ParamType, value: &Value) -> Result<(), String> {
    match param_type {
        ParamType::Text | ParamType::Path => {
            if value.is_string() {
                Ok(())
            } else {
                Err("must be a string".to_string())
            }
        }
        ParamType::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err("must be true or false".to_string())
            }
        }
        ParamType::Integer { min, max } => {
            let n = value
                .as_i64()
                .ok_or_else(|| "must be an integer".to_string())?;
            if let Some(min) = min {
                if n < *min {
                    return Err(format!("must be at least {}", min));
                }
            }
            if let Some(max) = max {
                if n > *max {
                    return Err(format!("must be at most {}", max));
                }
            }
            Ok(())
        }
        ParamType::Float { min, max } => {
            let n = value.as_f64().ok_or_else(|| "must be a number".to_string())?;
            if let Some(min) = min {
                if n < *min {
                    return Err(format!("must be at least {}", min));
                }
            }
            if let Some(max) = max {
                if n > *max {
                    return Err(format!("must be at most {}", max));
                }
            }
            Ok(())
        }
        ParamType::List => {
            if value.is_array() {
                Ok(())
            } else {
                Err("must be a list".to_string())
            }
        }
        ParamType::Object => {
            if value.is_object() {
                Ok(())
            } else {
                Err("must be an object".to_string())
            }
        }
        ParamType::Select { options } => match value.as_str() {
            Some(s) if options.iter().any(|o| o == s) => Ok(()),
            _ => Err(format!("must be one of: {}", options.join(", "))),
        },
    }
}
