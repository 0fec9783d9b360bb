//! Bundle and collection ancestry.
//!
//! - [`graph`]: builds the bundle → collection → product [ReferenceGraph]
//! - [`record`]: the per-product [AncestryRecord]
//! - [`resolve`]: reads a product's ancestry off the graph (direct collections, plus bundles
//!   exactly two hops up)
//!
//! The graph is built once per pass and is read-only afterwards. Products are then streamed from
//! the store with their current ancestry fields and diffed against the graph one at a time.
pub mod graph;
pub mod record;

pub use graph::{NodeKind, ReferenceGraph, ReferenceGraphBuilder};
pub use record::AncestryRecord;

use std::collections::BTreeSet;
use tokio::sync::mpsc;

use crate::{
    context::{PassReport, RunContext},
    document::{
        Document, FIELD_ALTERNATE_IDS, FIELD_COLLECTION_LIDVID, FIELD_LIDVID, FIELD_PRODUCT_LIDVID,
        FIELD_REF_LID_COLLECTION,
    },
    error::SweepersError,
    identifiers::LidVid,
    reconcile::{diff, WriteOperation},
    store::{DocumentStore, Query, StoreClient},
};

pub const METADATA_PARENT_BUNDLE_KEY: &str = "ops:Provenance/ops:parent_bundle_identifiers";
pub const METADATA_PARENT_COLLECTION_KEY: &str = "ops:Provenance/ops:parent_collection_identifiers";
pub const METADATA_ANCESTRY_VERSION_KEY: &str =
    "ops:Provenance/ops:registry_sweepers_ancestry_version";
pub const SWEEPERS_ANCESTRY_VERSION: i64 = 1;

/// Ancestry of one registry node, or `None` for unknown identifiers and products no collection
/// references. Bundles sit at the top of the hierarchy and always resolve to an empty record.
pub fn resolve(graph: &ReferenceGraph, lidvid: &LidVid) -> Option<AncestryRecord> {
    let mut record = AncestryRecord::new(lidvid.clone());
    match graph.kind_of(lidvid)? {
        NodeKind::Bundle => {}
        NodeKind::Collection => record.parent_bundles = graph.parents(lidvid),
        NodeKind::Product => {
            record.parent_collections = graph.parents(lidvid);
            if record.parent_collections.is_empty() {
                return None;
            }
            record.parent_bundles = record
                .parent_collections
                .iter()
                .flat_map(|collection| graph.parents(collection))
                .collect::<BTreeSet<_>>();
        }
    }
    Some(record)
}

fn ancestry_fields() -> [&'static str; 3] {
    [
        METADATA_PARENT_BUNDLE_KEY,
        METADATA_PARENT_COLLECTION_KEY,
        METADATA_ANCESTRY_VERSION_KEY,
    ]
}

pub fn bundles_query() -> Query {
    Query::bundles().including(
        [FIELD_LIDVID, FIELD_REF_LID_COLLECTION]
            .into_iter()
            .chain(ancestry_fields()),
    )
}

pub fn collections_query() -> Query {
    Query::collections().including(
        [FIELD_LIDVID, FIELD_ALTERNATE_IDS]
            .into_iter()
            .chain(ancestry_fields()),
    )
}

pub fn memberships_query() -> Query {
    Query::collection_members().including([FIELD_COLLECTION_LIDVID, FIELD_PRODUCT_LIDVID])
}

pub fn products_query() -> Query {
    Query::non_aggregates().including([FIELD_LIDVID].into_iter().chain(ancestry_fields()))
}

/// Reads bundles, collections and membership documents and builds the reference graph. The
/// bundle and collection documents are handed back so their stored ancestry can be diffed.
#[tracing::instrument(skip_all)]
pub async fn build_reference_graph<S: DocumentStore>(
    client: &StoreClient<S>,
    ctx: &RunContext,
    report: &mut PassReport,
) -> Result<(ReferenceGraph, Vec<Document>), SweepersError> {
    tracing::info!("Reading bundles and collections...");
    // both reads run to completion so a failure in one still releases the other's cursor
    let (bundles, collections) = tokio::join!(
        client.read(bundles_query()).collect_all(),
        client.read(collections_query()).collect_all()
    );
    let (bundles, collections) = (bundles?, collections?);
    report.documents_read += (bundles.len() + collections.len()) as u64;

    let mut builder = ReferenceGraphBuilder::new();
    for collection in &collections {
        builder.add_collection(collection, report);
    }
    for bundle in &bundles {
        builder.add_bundle(bundle, report);
    }

    tracing::info!("Reading collection memberships...");
    let mut memberships = client.read(memberships_query());
    let read = async {
        while let Some(doc) = memberships.next().await? {
            ctx.cancel.check()?;
            builder.add_membership(&doc, report);
        }
        Ok::<(), SweepersError>(())
    }
    .await;
    memberships.close().await;
    report.documents_read += memberships.served();
    read?;

    let mut aggregates = bundles;
    aggregates.extend(collections);
    Ok((builder.build(report), aggregates))
}

/// Compute stage of the ancestry pass: emits updates for bundles, collections and every product
/// whose stored ancestry differs from the graph. Products no collection references are left
/// untouched.
#[tracing::instrument(skip_all)]
pub async fn compute_ancestry<S: DocumentStore>(
    client: &StoreClient<S>,
    ctx: &RunContext,
    sink: &mpsc::Sender<WriteOperation>,
    report: &mut PassReport,
) -> Result<(), SweepersError> {
    let (graph, aggregates) = build_reference_graph(client, ctx, report).await?;

    let send = |op: WriteOperation| async move {
        sink.send(op)
            .await
            .map_err(|_| SweepersError::InvariantViolation("write stage stopped".into()))
    };

    for doc in &aggregates {
        let Ok(lidvid) = doc.lidvid() else {
            // already reported while building the graph
            continue;
        };
        let Some(record) = resolve(&graph, &lidvid) else {
            continue;
        };
        if graph.kind_of(&lidvid) == Some(NodeKind::Collection) && record.parent_bundles.is_empty()
        {
            tracing::warn!("Collection {lidvid} is not referenced by any bundle");
        }
        if let Some(op) = diff(&record.to_computed(doc.id.clone()), &doc.source) {
            report.operations_computed += 1;
            send(op).await?;
        }
    }
    drop(aggregates);
    ctx.cancel.check()?;

    tracing::info!("Reconciling ancestry of non-aggregate products...");
    let mut products = client.read(products_query());
    let mut unreferenced = 0u64;
    let reconciled = async {
        while let Some(doc) = products.next().await? {
            let lidvid = match doc.lidvid() {
                Ok(lidvid) => lidvid,
                Err(err) => {
                    report.data_warning(&doc.to_string(), err);
                    continue;
                }
            };
            let Some(record) = resolve(&graph, &lidvid) else {
                unreferenced += 1;
                continue;
            };
            if let Some(op) = diff(&record.to_computed(doc.id.clone()), &doc.source) {
                report.operations_computed += 1;
                send(op).await?;
                ctx.cancel.check()?;
            }
        }
        Ok::<(), SweepersError>(())
    }
    .await;
    products.close().await;
    report.documents_read += products.served();
    reconciled?;

    tracing::info!(
        "Ancestry computed for {} products ({unreferenced} not referenced by any collection), {} updates",
        products.served() - unreferenced,
        report.operations_computed
    );
    Ok(())
}
