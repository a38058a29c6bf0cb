//! Field-level change records produced by snapshot mutations.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// Which part of a task definition a diff entry touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffField {
    Image,
    Command,
    Environment,
    Secrets,
    RoleArn,
}

impl DiffField {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffField::Image => "image",
            DiffField::Command => "command",
            DiffField::Environment => "environment",
            DiffField::Secrets => "secrets",
            DiffField::RoleArn => "role_arn",
        }
    }
}

impl fmt::Display for DiffField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value on either side of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffValue {
    /// Scalar field; `None` when the field was unset.
    Text(Option<String>),
    /// Name/value collection (environment or secrets).
    Map(BTreeMap<String, String>),
}

impl DiffValue {
    pub fn text(value: impl Into<String>) -> Self {
        DiffValue::Text(Some(value.into()))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DiffValue::Text(value) => value.as_deref(),
            DiffValue::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            DiffValue::Map(map) => Some(map),
            DiffValue::Text(_) => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            DiffValue::Text(Some(text)) => Value::String(text.clone()),
            DiffValue::Text(None) => Value::Null,
            DiffValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        }
    }
}

/// One recorded change. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinitionDiff {
    container: Option<String>,
    field: DiffField,
    value: DiffValue,
    old_value: DiffValue,
}

impl TaskDefinitionDiff {
    pub fn new(
        container: Option<String>,
        field: DiffField,
        value: DiffValue,
        old_value: DiffValue,
    ) -> Self {
        Self {
            container,
            field,
            value,
            old_value,
        }
    }

    /// Container the change applies to; `None` for task-level fields.
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn field(&self) -> DiffField {
        self.field
    }

    pub fn value(&self) -> &DiffValue {
        &self.value
    }

    pub fn old_value(&self) -> &DiffValue {
        &self.old_value
    }

    /// True when old and new values are identical.
    pub fn is_noop(&self) -> bool {
        self.value == self.old_value
    }
}

impl fmt::Display for TaskDefinitionDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(container) => write!(
                f,
                "Changed {} of container '{}' to: {} (was: {})",
                self.field,
                container,
                self.value.to_json(),
                self.old_value.to_json()
            ),
            None => write!(
                f,
                "Changed {} to: {} (was: {})",
                self.field,
                self.value.to_json(),
                self.old_value.to_json()
            ),
        }
    }
}
