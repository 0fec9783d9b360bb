use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeSet, fmt};

use super::{
    METADATA_ANCESTRY_VERSION_KEY, METADATA_PARENT_BUNDLE_KEY, METADATA_PARENT_COLLECTION_KEY,
    SWEEPERS_ANCESTRY_VERSION,
};
use crate::{
    identifiers::LidVid,
    reconcile::{ComputedMetadata, DesiredValue},
};

/// The aggregate products that reference one product, directly or through one intermediate tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestryRecord {
    pub lidvid: LidVid,
    pub parent_collections: BTreeSet<LidVid>,
    pub parent_bundles: BTreeSet<LidVid>,
}

impl AncestryRecord {
    pub fn new(lidvid: LidVid) -> Self {
        AncestryRecord {
            lidvid,
            parent_collections: BTreeSet::new(),
            parent_bundles: BTreeSet::new(),
        }
    }

    /// Metadata to hold on the document `id` that carries this product.
    pub fn to_computed(&self, id: impl Into<String>) -> ComputedMetadata {
        let as_strings =
            |set: &BTreeSet<LidVid>| set.iter().map(LidVid::to_string).collect::<BTreeSet<_>>();
        ComputedMetadata::new(id)
            .with(
                METADATA_PARENT_BUNDLE_KEY,
                DesiredValue::Set(as_strings(&self.parent_bundles)),
            )
            .with(
                METADATA_PARENT_COLLECTION_KEY,
                DesiredValue::Set(as_strings(&self.parent_collections)),
            )
            .with(
                METADATA_ANCESTRY_VERSION_KEY,
                DesiredValue::Scalar(Some(json!(SWEEPERS_ANCESTRY_VERSION))),
            )
    }
}

impl fmt::Display for AncestryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<LidVid>| {
            set.iter()
                .map(LidVid::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "AncestryRecord({}, collections=[{}], bundles=[{}])",
            self.lidvid,
            join(&self.parent_collections),
            join(&self.parent_bundles)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn lidvid(s: &str) -> LidVid {
        s.parse().unwrap()
    }

    #[test]
    fn test_to_computed_sets() {
        let mut record = AncestryRecord::new(lidvid("urn:nasa:pds:b:c::1.0"));
        record.parent_bundles.insert(lidvid("urn:nasa:pds:b::1.10"));
        record.parent_bundles.insert(lidvid("urn:nasa:pds:b::1.9"));
        let computed = record.to_computed("urn:nasa:pds:b:c::1.0");
        assert_eq!(
            computed.fields[METADATA_PARENT_BUNDLE_KEY],
            DesiredValue::Set(
                ["urn:nasa:pds:b::1.10", "urn:nasa:pds:b::1.9"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            )
        );
        assert_eq!(
            computed.fields[METADATA_PARENT_COLLECTION_KEY],
            DesiredValue::Set(BTreeSet::new())
        );
    }
}
