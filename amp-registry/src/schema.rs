//! Compiled input/output schemas.

use std::fmt;

use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One failing field reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Dotted path of the failing value, rooted at `parameters` or `result`.
    pub path: String,
    /// Validator message.
    pub reason: String,
}

impl FieldViolation {
    /// Creates a violation.
    #[must_use]
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Compiled JSON schema. A null schema accepts every value.
pub struct CompiledSchema {
    validator: Option<Validator>,
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("enforced", &self.validator.is_some())
            .finish()
    }
}

impl CompiledSchema {
    /// Compiles `schema`.
    ///
    /// # Errors
    ///
    /// Returns the compiler message when the schema is not valid JSON Schema.
    pub fn compile(schema: &Value) -> Result<Self, String> {
        if schema.is_null() {
            return Ok(Self { validator: None });
        }
        let validator = jsonschema::validator_for(schema).map_err(|err| err.to_string())?;
        Ok(Self {
            validator: Some(validator),
        })
    }

    /// Validates `instance`, reporting violations under `root`.
    #[must_use]
    pub fn violations(&self, root: &str, instance: &Value) -> Vec<FieldViolation> {
        let Some(validator) = &self.validator else {
            return Vec::new();
        };
        validator
            .iter_errors(instance)
            .map(|err| {
                let pointer = err.instance_path.to_string();
                FieldViolation::new(dotted(root, &pointer), err.to_string())
            })
            .collect()
    }
}

/// `/items/0/name` under `parameters` becomes `parameters.items.0.name`.
fn dotted(root: &str, pointer: &str) -> String {
    let mut path = root.to_owned();
    for segment in pointer.split('/').filter(|segment| !segment.is_empty()) {
        path.push('.');
        path.push_str(&segment.replace("~1", "/").replace("~0", "~"));
    }
    path
}
