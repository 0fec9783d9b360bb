//! Transient in-memory projection of a registry document, and the scalar/list normalization every
//! reference field passes through before anything downstream sees it.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
};

use crate::{error::SweepersError, identifiers::LidVid};

pub const FIELD_LID: &str = "lid";
pub const FIELD_VID: &str = "vid";
pub const FIELD_LIDVID: &str = "lidvid";
pub const FIELD_PRODUCT_CLASS: &str = "product_class";
pub const FIELD_ARCHIVE_STATUS: &str = "ops:Tracking_Meta/ops:archive_status";
/// Bundle → collection references.
pub const FIELD_REF_LID_COLLECTION: &str = "ref_lid_collection";
/// Collection LID aliases.
pub const FIELD_ALTERNATE_IDS: &str = "alternate_ids";
/// Collection membership documents (refs index).
pub const FIELD_COLLECTION_LIDVID: &str = "collection_lidvid";
pub const FIELD_PRODUCT_LIDVID: &str = "product_lidvid";

pub const PRODUCT_CLASS_BUNDLE: &str = "Product_Bundle";
pub const PRODUCT_CLASS_COLLECTION: &str = "Product_Collection";

/// Archive statuses considered published.
pub const PUBLISHED_ARCHIVE_STATUSES: [&str; 2] = ["archived", "certified"];

/// A set of identifiers read from a field that may hold a single string or a list of strings.
/// Both encodings normalize to the same value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceSet(pub BTreeSet<String>);

impl ReferenceSet {
    pub fn from_value(value: &Value) -> Result<Self, SweepersError> {
        let mut set = BTreeSet::new();
        match value {
            Value::String(s) => {
                set.insert(non_empty(s)?);
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(s) => {
                            set.insert(non_empty(s)?);
                        }
                        other => {
                            return Err(SweepersError::DataShape(format!(
                                "expected identifier string in list, got {other}"
                            )))
                        }
                    }
                }
            }
            other => {
                return Err(SweepersError::DataShape(format!(
                    "expected identifier string or list, got {other}"
                )))
            }
        }
        Ok(ReferenceSet(set))
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

fn non_empty(s: &str) -> Result<String, SweepersError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        Err(SweepersError::DataShape("empty identifier".to_string()))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Unwraps a legacy singleton list into its only element. An empty list is `None`.
pub fn coerce_scalar(value: &Value) -> Result<Option<&Value>, SweepersError> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) => match items.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only)),
            _ => Err(SweepersError::DataShape(format!(
                "expected a single value, got {} values",
                items.len()
            ))),
        },
        other => Ok(Some(other)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub index: Option<String>,
    pub source: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, source: Map<String, Value>) -> Self {
        Document {
            id: id.into(),
            index: None,
            source,
        }
    }

    /// Builds a document from a search hit (`{"_id", "_index", "_source"}`).
    pub fn from_hit(hit: Value) -> Result<Self, SweepersError> {
        let Value::Object(mut hit) = hit else {
            return Err(SweepersError::MalformedResponse(
                "search hit is not an object".to_string(),
            ));
        };
        let id = match hit.remove("_id") {
            Some(Value::String(id)) => id,
            _ => {
                return Err(SweepersError::MalformedResponse(
                    "search hit has no string _id".to_string(),
                ))
            }
        };
        let index = match hit.remove("_index") {
            Some(Value::String(index)) => Some(index),
            _ => None,
        };
        let source = match hit.remove("_source") {
            Some(Value::Object(source)) => source,
            None => Map::new(),
            Some(other) => {
                return Err(SweepersError::MalformedResponse(format!(
                    "_source of {id} is not an object: {other}"
                )))
            }
        };
        Ok(Document { id, index, source })
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.source.get(key)
    }

    /// The document's LIDVID, from its `lidvid` field or, failing that, its id.
    pub fn lidvid(&self) -> Result<LidVid, SweepersError> {
        match self.field(FIELD_LIDVID).map(coerce_scalar).transpose()?.flatten() {
            Some(Value::String(s)) => s.parse(),
            Some(other) => Err(SweepersError::DataShape(format!(
                "{FIELD_LIDVID} of {} is not a string: {other}",
                self.id
            ))),
            None => self.id.parse(),
        }
    }

    /// Reads `key` as a reference set. An absent field is a data-shape error; callers decide
    /// whether that is a warning or expected.
    pub fn references(&self, key: &str) -> Result<ReferenceSet, SweepersError> {
        let value = self.field(key).ok_or_else(|| {
            SweepersError::DataShape(format!("{} has no '{key}' field", self.id))
        })?;
        ReferenceSet::from_value(value)
            .map_err(|err| SweepersError::DataShape(format!("{}.{key}: {err}", self.id)))
    }
}

impl Display for Document {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.index {
            Some(index) => write!(f, "{index}/{}", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    #[test]
    fn test_scalar_and_list_normalize_identically() {
        let scalar = ReferenceSet::from_value(&json!("urn:nasa:pds:b:c::1.0")).unwrap();
        let list = ReferenceSet::from_value(&json!(["urn:nasa:pds:b:c::1.0"])).unwrap();
        assert_eq!(scalar, list);
        assert_eq!(scalar.len(), 1);

        let dupes = ReferenceSet::from_value(&json!(["a", "b", "a"])).unwrap();
        assert_eq!(dupes.len(), 2);
    }

    #[test]
    fn test_malformed_references() {
        assert!(ReferenceSet::from_value(&json!(42)).is_err());
        assert!(ReferenceSet::from_value(&json!(["ok", 7])).is_err());
        assert!(ReferenceSet::from_value(&json!("")).is_err());
        assert!(ReferenceSet::from_value(&json!(null)).is_err());
        assert!(ReferenceSet::from_value(&json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_coerce_scalar() {
        assert_eq!(coerce_scalar(&json!(["v"])).unwrap(), Some(&json!("v")));
        assert_eq!(coerce_scalar(&json!("v")).unwrap(), Some(&json!("v")));
        assert_eq!(coerce_scalar(&json!([])).unwrap(), None);
        assert!(coerce_scalar(&json!(["some", "values"])).is_err());
    }

    #[test]
    fn test_from_hit() {
        let doc = Document::from_hit(json!({
            "_index": "registry",
            "_id": "urn:nasa:pds:b::1.0",
            "_source": {"lidvid": ["urn:nasa:pds:b::1.0"], "product_class": "Product_Bundle"}
        }))
        .unwrap();
        assert_eq!(doc.to_string(), "registry/urn:nasa:pds:b::1.0");
        assert_eq!(doc.field(FIELD_PRODUCT_CLASS), Some(&json!(PRODUCT_CLASS_BUNDLE)));
        assert_eq!(doc.lidvid().unwrap().to_string(), "urn:nasa:pds:b::1.0");
        assert!(doc.references(FIELD_REF_LID_COLLECTION).is_err());

        assert!(Document::from_hit(json!({"_source": {}})).is_err());
        assert!(Document::from_hit(json!("nope")).is_err());
    }
}
