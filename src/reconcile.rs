//! Reconciliation of computed metadata against what a document currently stores.
//!
//! Only fields whose normalized stored value differs from the computed value make it into a
//! [WriteOperation]; a document whose fields all match produces nothing. Normalization makes
//! representation-only differences (a singleton list vs. a scalar, list order, duplicates, null
//! vs. absent) compare equal.
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    document::{coerce_scalar, ReferenceSet},
    error::SweepersError,
};

/// The value a computed field should hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredValue {
    /// A single value; `None` means the field must be absent or null.
    Scalar(Option<Value>),
    /// An unordered set of identifiers; stored as a sorted list.
    Set(BTreeSet<String>),
}

impl DesiredValue {
    pub fn string(value: impl Into<String>) -> Self {
        DesiredValue::Scalar(Some(Value::String(value.into())))
    }

    pub fn cleared() -> Self {
        DesiredValue::Scalar(None)
    }

    pub fn to_value(&self) -> Value {
        match self {
            DesiredValue::Scalar(value) => value.clone().unwrap_or(Value::Null),
            DesiredValue::Set(set) => json!(set),
        }
    }

    /// Whether `stored` already represents this value.
    pub fn matches(&self, stored: Option<&Value>) -> bool {
        match self {
            DesiredValue::Scalar(desired) => {
                let stored = match stored.map(coerce_scalar).transpose() {
                    Ok(stored) => stored.flatten(),
                    // a multi-valued field never matches a scalar
                    Err(_) => return false,
                };
                match (desired, stored) {
                    (None, None) => true,
                    (Some(desired), Some(stored)) => scalar_text(desired) == scalar_text(stored),
                    _ => false,
                }
            }
            DesiredValue::Set(desired) => match stored {
                None | Some(Value::Null) => desired.is_empty(),
                Some(value) => match ReferenceSet::from_value(value) {
                    Ok(ReferenceSet(stored)) => &stored == desired,
                    Err(_) => false,
                },
            },
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Metadata the sweepers have computed for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedMetadata {
    pub id: String,
    pub fields: BTreeMap<String, DesiredValue>,
}

impl ComputedMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        ComputedMetadata {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: DesiredValue) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

/// Identifier + partial metadata patch, consumed exactly once by the bulk writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOperation {
    pub id: String,
    pub patch: Map<String, Value>,
}

impl WriteOperation {
    pub fn new(id: impl Into<String>, patch: Map<String, Value>) -> Self {
        WriteOperation {
            id: id.into(),
            patch,
        }
    }

    /// NDJSON action + document lines for a `_bulk` request.
    pub fn to_bulk_lines(&self) -> Result<String, SweepersError> {
        let action = serde_json::to_string(&json!({"update": {"_id": self.id}}))?;
        let doc = serde_json::to_string(&json!({"doc": self.patch}))?;
        Ok(format!("{action}\n{doc}\n"))
    }

    /// Approximate request size, used for batch byte thresholds.
    pub fn encoded_len(&self) -> usize {
        self.to_bulk_lines()
            .map(|lines| lines.len())
            .unwrap_or_else(|_| self.id.len() + 64)
    }
}

/// Emits a [WriteOperation] carrying only the fields of `computed` that `stored` does not already
/// hold, or `None` when nothing differs.
pub fn diff(computed: &ComputedMetadata, stored: &Map<String, Value>) -> Option<WriteOperation> {
    let patch: Map<String, Value> = computed
        .fields
        .iter()
        .filter(|(key, desired)| !desired.matches(stored.get(key.as_str())))
        .map(|(key, desired)| (key.clone(), desired.to_value()))
        .collect();

    if patch.is_empty() {
        None
    } else {
        tracing::debug!("{}: {} field(s) differ", computed.id, patch.len());
        Some(WriteOperation::new(computed.id.clone(), patch))
    }
}
