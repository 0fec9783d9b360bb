//! Version succession.
//!
//! Published documents are read in one query sorted by LID, so every version of a product arrives
//! as a contiguous run. [VersionGrouper] cuts the stream into [VersionGroup]s, orders each group
//! numerically (the store sorts versions as text), and [resolve_successors] links each version to
//! the next one. Only one LID's versions are held in memory at a time.
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::{
    context::{PassReport, RunContext},
    document::{Document, FIELD_LID, FIELD_LIDVID, FIELD_VID},
    error::SweepersError,
    identifiers::{Lid, LidVid},
    reconcile::{diff, ComputedMetadata, DesiredValue, WriteOperation},
    store::{DocumentReader, DocumentStore, Query, StoreClient},
};

pub const METADATA_SUCCESSOR_KEY: &str = "ops:Provenance/ops:superseded_by";
pub const METADATA_PROVENANCE_VERSION_KEY: &str =
    "ops:Provenance/ops:registry_sweepers_provenance_version";
/// Bumped whenever the successor algorithm changes, forcing every document to be rewritten once.
pub const SWEEPERS_PROVENANCE_VERSION: i64 = 1;

/// One version of a product, with the stored fields the diff needs.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub id: String,
    pub lidvid: LidVid,
    pub source: Map<String, Value>,
}

impl TryFrom<Document> for VersionedDocument {
    type Error = SweepersError;

    fn try_from(doc: Document) -> Result<Self, Self::Error> {
        let lidvid = doc.lidvid()?;
        Ok(VersionedDocument {
            id: doc.id,
            lidvid,
            source: doc.source,
        })
    }
}

/// Every usable version of one LID, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionGroup {
    pub lid: Lid,
    pub members: Vec<VersionedDocument>,
}

impl VersionGroup {
    pub fn latest(&self) -> Option<&VersionedDocument> {
        self.members.last()
    }

    /// Sorts members by numeric version. Fails if two members share a version, since the chain
    /// (and the latest member) is then ambiguous.
    fn seal(mut self) -> Result<Self, SweepersError> {
        self.members.sort_by(|a, b| a.lidvid.vid.cmp(&b.lidvid.vid));
        if let Some(pair) = self
            .members
            .windows(2)
            .find(|pair| pair[0].lidvid.vid == pair[1].lidvid.vid)
        {
            return Err(SweepersError::InvariantViolation(format!(
                "version {} is held by both {} and {}",
                pair[0].lidvid.vid, pair[0].id, pair[1].id
            )));
        }
        Ok(self)
    }
}

/// Cuts a LID-sorted document stream into version groups.
pub struct VersionGrouper<S: DocumentStore> {
    reader: DocumentReader<S>,
    current: Option<VersionGroup>,
    lookahead: Option<VersionedDocument>,
    /// Highest LID a group was started for. A LID at or below it has already been grouped.
    last_lid: Option<Lid>,
    skipping: Option<Lid>,
}

impl<S: DocumentStore> VersionGrouper<S> {
    pub fn new(reader: DocumentReader<S>) -> Self {
        VersionGrouper {
            reader,
            current: None,
            lookahead: None,
            last_lid: None,
            skipping: None,
        }
    }

    pub fn documents_read(&self) -> u64 {
        self.reader.served()
    }

    /// Next complete group. Documents with unparseable identifiers are excluded with a warning;
    /// groups that violate an invariant are skipped and recorded in `report`.
    pub async fn next_group(
        &mut self,
        report: &mut PassReport,
    ) -> Result<Option<VersionGroup>, SweepersError> {
        loop {
            let next = match self.lookahead.take() {
                Some(doc) => Some(doc),
                None => self.read_versioned(report).await?,
            };
            let Some(doc) = next else {
                if self.current.is_none() {
                    return Ok(None);
                }
                if let Some(group) = self.seal_current(report) {
                    return Ok(Some(group));
                }
                continue;
            };

            if self.skipping.as_ref() == Some(&doc.lidvid.lid) {
                continue;
            }
            self.skipping = None;

            if let Some(group) = self
                .current
                .as_mut()
                .filter(|group| group.lid == doc.lidvid.lid)
            {
                group.members.push(doc);
                continue;
            }

            if self.current.is_some() {
                self.lookahead = Some(doc);
                if let Some(group) = self.seal_current(report) {
                    return Ok(Some(group));
                }
                continue;
            }

            let lid = doc.lidvid.lid.clone();
            if self.last_lid.as_ref().is_none_or(|last| lid > *last) {
                self.last_lid = Some(lid.clone());
                self.current = Some(VersionGroup {
                    lid,
                    members: vec![doc],
                });
            } else {
                report.skip(
                    format!("LID {lid}"),
                    "versions were not returned contiguously; successors cannot be trusted",
                );
                self.skipping = Some(lid);
            }
        }
    }

    fn seal_current(&mut self, report: &mut PassReport) -> Option<VersionGroup> {
        let group = self.current.take()?;
        let lid = group.lid.clone();
        match group.seal() {
            Ok(group) => Some(group),
            Err(err) => {
                report.skip(format!("LID {lid}"), err.to_string());
                None
            }
        }
    }

    /// Releases the underlying read. Call on every exit from a grouping loop.
    pub async fn close(&mut self) {
        self.reader.close().await;
    }

    async fn read_versioned(
        &mut self,
        report: &mut PassReport,
    ) -> Result<Option<VersionedDocument>, SweepersError> {
        while let Some(doc) = self.reader.next().await? {
            let id = doc.id.clone();
            match VersionedDocument::try_from(doc) {
                Ok(versioned) => return Ok(Some(versioned)),
                Err(err) => report.data_warning(&id, format!("excluded from version ordering: {err}")),
            }
        }
        Ok(None)
    }
}

/// Successor metadata for every member of `group`: each non-latest version points at the next
/// version, and the latest version carries no successor.
pub fn resolve_successors(group: &VersionGroup) -> Vec<ComputedMetadata> {
    group
        .members
        .iter()
        .enumerate()
        .map(|(idx, member)| {
            let successor = match group.members.get(idx + 1) {
                Some(next) => DesiredValue::string(next.lidvid.to_string()),
                None => DesiredValue::cleared(),
            };
            ComputedMetadata::new(member.id.clone())
                .with(METADATA_SUCCESSOR_KEY, successor)
                .with(
                    METADATA_PROVENANCE_VERSION_KEY,
                    DesiredValue::Scalar(Some(json!(SWEEPERS_PROVENANCE_VERSION))),
                )
        })
        .collect()
}

pub fn provenance_query() -> Query {
    Query::published_by_lid().including([
        FIELD_LID,
        FIELD_VID,
        FIELD_LIDVID,
        METADATA_SUCCESSOR_KEY,
        METADATA_PROVENANCE_VERSION_KEY,
    ])
}

/// Compute stage of the provenance pass: emits one [WriteOperation] per document whose stored
/// successor or version marker differs from the computed value.
#[tracing::instrument(skip_all)]
pub async fn compute_provenance<S: DocumentStore>(
    client: &StoreClient<S>,
    ctx: &RunContext,
    sink: &mpsc::Sender<WriteOperation>,
    report: &mut PassReport,
) -> Result<(), SweepersError> {
    tracing::info!("Generating updated provenance...");
    let mut grouper = VersionGrouper::new(client.read(provenance_query()));
    let mut groups = 0u64;

    let result = async {
        while let Some(group) = grouper.next_group(report).await? {
            ctx.cancel.check()?;
            groups += 1;
            for computed in resolve_successors(&group) {
                let stored = group
                    .members
                    .iter()
                    .find(|member| member.id == computed.id)
                    .map(|member| &member.source);
                let Some(op) = stored.and_then(|stored| diff(&computed, stored)) else {
                    continue;
                };
                report.operations_computed += 1;
                sink.send(op)
                    .await
                    .map_err(|_| SweepersError::InvariantViolation("write stage stopped".into()))?;
            }
        }
        Ok::<(), SweepersError>(())
    }
    .await;
    grouper.close().await;

    report.documents_read += grouper.documents_read();
    tracing::info!(
        "Provenance computed for {groups} LIDs ({} documents, {} updates)",
        grouper.documents_read(),
        report.operations_computed
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        retry::RetryPolicy,
        store::{IndexKind, InMemoryStore},
    };
    use std::sync::Arc;

    fn doc(id: &str) -> VersionedDocument {
        VersionedDocument {
            id: id.to_string(),
            lidvid: id.parse().unwrap(),
            source: Map::new(),
        }
    }

    fn published(store: &InMemoryStore, lidvid: &str, extra: Value) {
        let (lid, vid) = lidvid.split_once("::").unwrap();
        let mut source = json!({
            "lid": lid,
            "vid": vid,
            "lidvid": lidvid,
            "ops:Tracking_Meta/ops:archive_status": "archived",
        });
        if let (Some(source), Value::Object(extra)) = (source.as_object_mut(), extra) {
            source.extend(extra);
        }
        store.insert(IndexKind::Registry, lidvid, source);
    }

    async fn groups_of(store: InMemoryStore) -> (Vec<VersionGroup>, PassReport) {
        let client = StoreClient::new(Arc::new(store), 2, RetryPolicy::immediate(1));
        let mut grouper = VersionGrouper::new(client.read(provenance_query()));
        let mut report = PassReport::default();
        let mut groups = vec![];
        while let Some(group) = grouper.next_group(&mut report).await.unwrap() {
            groups.push(group);
        }
        (groups, report)
    }

    #[test_log::test]
    fn test_successor_chain() {
        let group = VersionGroup {
            lid: "urn:nasa:pds:x".parse().unwrap(),
            members: vec![
                doc("urn:nasa:pds:x::1.0"),
                doc("urn:nasa:pds:x::2.0"),
                doc("urn:nasa:pds:x::3.0"),
            ],
        };
        let computed = resolve_successors(&group);
        let successor = |i: usize| computed[i].fields[METADATA_SUCCESSOR_KEY].clone();
        assert_eq!(successor(0), DesiredValue::string("urn:nasa:pds:x::2.0"));
        assert_eq!(successor(1), DesiredValue::string("urn:nasa:pds:x::3.0"));
        assert_eq!(successor(2), DesiredValue::cleared());
        assert_eq!(group.latest().unwrap().id, "urn:nasa:pds:x::3.0");
    }

    #[test_log::test]
    fn test_single_version_has_no_successor() {
        let group = VersionGroup {
            lid: "urn:nasa:pds:y".parse().unwrap(),
            members: vec![doc("urn:nasa:pds:y::1.0")],
        };
        let computed = resolve_successors(&group);
        assert_eq!(computed.len(), 1);
        assert_eq!(
            computed[0].fields[METADATA_SUCCESSOR_KEY],
            DesiredValue::cleared()
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_grouping_orders_versions_numerically() {
        let store = InMemoryStore::new();
        // store-side sort is textual, so 1.10 arrives before 1.9
        for lidvid in [
            "urn:nasa:pds:a::1.10",
            "urn:nasa:pds:a::1.9",
            "urn:nasa:pds:a::2.0",
            "urn:nasa:pds:b::1.0",
        ] {
            published(&store, lidvid, json!({}));
        }
        let (groups, report) = groups_of(store).await;
        assert_eq!(groups.len(), 2);
        let versions: Vec<String> = groups[0]
            .members
            .iter()
            .map(|m| m.lidvid.vid.to_string())
            .collect();
        assert_eq!(versions, vec!["1.9", "1.10", "2.0"]);
        assert!(report.skipped.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_malformed_version_is_excluded_not_fatal() {
        let store = InMemoryStore::new();
        published(&store, "urn:nasa:pds:a::1.0", json!({}));
        published(&store, "urn:nasa:pds:a::2.0", json!({}));
        store.insert(
            IndexKind::Registry,
            "urn:nasa:pds:a::two",
            json!({"lid": "urn:nasa:pds:a", "vid": "two", "lidvid": "urn:nasa:pds:a::two",
                   "ops:Tracking_Meta/ops:archive_status": "archived"}),
        );
        let (groups, report) = groups_of(store).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 2);
        assert_eq!(report.data_warnings, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_duplicate_version_skips_group() {
        let store = InMemoryStore::new();
        published(&store, "urn:nasa:pds:a::1.0", json!({}));
        store.insert(
            IndexKind::Registry,
            "urn:nasa:pds:a::1.0-copy",
            json!({"lid": "urn:nasa:pds:a", "vid": "1.0", "lidvid": "urn:nasa:pds:a::1.0",
                   "ops:Tracking_Meta/ops:archive_status": "certified"}),
        );
        published(&store, "urn:nasa:pds:b::1.0", json!({}));
        let (groups, report) = groups_of(store).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].lid.as_str(), "urn:nasa:pds:b");
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].unit, "LID urn:nasa:pds:a");
    }

    #[test_log::test(tokio::test)]
    async fn test_reappearing_lid_is_skipped() {
        let store = InMemoryStore::new();
        published(&store, "urn:nasa:pds:a::1.0", json!({}));
        published(&store, "urn:nasa:pds:b::1.0", json!({}));
        // a stale lid field sorts this version of `a` after `b`
        published(
            &store,
            "urn:nasa:pds:a::2.0",
            json!({"lid": "urn:nasa:pds:c"}),
        );
        let (groups, report) = groups_of(store).await;
        let lids: Vec<&str> = groups.iter().map(|g| g.lid.as_str()).collect();
        assert_eq!(lids, vec!["urn:nasa:pds:a", "urn:nasa:pds:b"]);
        assert_eq!(groups[0].members.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].unit, "LID urn:nasa:pds:a");
    }

    #[test_log::test(tokio::test)]
    async fn test_cancelled_pass_releases_its_read() {
        let store = Arc::new(InMemoryStore::new());
        for minor in 0..10 {
            published(&store, &format!("urn:nasa:pds:l{minor}::1.0"), json!({}));
        }
        let client = StoreClient::new(store.clone(), 3, RetryPolicy::immediate(1));
        let ctx = RunContext::new(Default::default());
        ctx.cancel.cancel();
        let (tx, _rx) = mpsc::channel(16);
        let mut report = PassReport::default();

        let result = compute_provenance(&client, &ctx, &tx, &mut report).await;
        assert!(matches!(result, Err(SweepersError::OperationCancelled)));
        assert!(report.documents_read < 10);
        assert_eq!(store.open_cursors(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_unpublished_documents_are_ignored() {
        let store = InMemoryStore::new();
        published(&store, "urn:nasa:pds:a::1.0", json!({}));
        published(
            &store,
            "urn:nasa:pds:a::2.0",
            json!({"ops:Tracking_Meta/ops:archive_status": "staged"}),
        );
        let (groups, _) = groups_of(store).await;
        assert_eq!(groups[0].members.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_successor_on_latest_is_cleared() {
        let store = InMemoryStore::new();
        published(&store, "urn:nasa:pds:x::1.0", json!({}));
        published(&store, "urn:nasa:pds:x::2.0", json!({}));
        published(
            &store,
            "urn:nasa:pds:x::3.0",
            json!({ METADATA_SUCCESSOR_KEY: "urn:nasa:pds:x::2.0" }),
        );
        let client = StoreClient::new(Arc::new(store), 10, RetryPolicy::immediate(1));
        let ctx = RunContext::new(Default::default());
        let (tx, mut rx) = mpsc::channel(16);
        let mut report = PassReport::default();
        compute_provenance(&client, &ctx, &tx, &mut report)
            .await
            .unwrap();
        drop(tx);

        let mut ops = vec![];
        while let Some(op) = rx.recv().await {
            ops.push(op);
        }
        assert_eq!(ops.len(), 3);
        let latest = ops.iter().find(|op| op.id == "urn:nasa:pds:x::3.0").unwrap();
        assert_eq!(latest.patch[METADATA_SUCCESSOR_KEY], Value::Null);
        let first = ops.iter().find(|op| op.id == "urn:nasa:pds:x::1.0").unwrap();
        assert_eq!(first.patch[METADATA_SUCCESSOR_KEY], json!("urn:nasa:pds:x::2.0"));
        assert_eq!(report.documents_read, 3);
        assert_eq!(report.operations_computed, 3);
    }
}
