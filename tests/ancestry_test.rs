//! Ancestry pass against the in-memory store.

mod common;

use common::{init_logging, test_context, Registry};
use registry_sweepers::{
    ancestry::{
        METADATA_ANCESTRY_VERSION_KEY, METADATA_PARENT_BUNDLE_KEY, METADATA_PARENT_COLLECTION_KEY,
        SWEEPERS_ANCESTRY_VERSION,
    },
    sweepers::run_ancestry,
};
use serde_json::{json, Value};

const BUNDLE: &str = "urn:nasa:pds:mission";
const DATA: &str = "urn:nasa:pds:mission:data";
const BROWSE: &str = "urn:nasa:pds:mission:browse";

fn ancestry(registry: &Registry, id: &str) -> (Option<Value>, Option<Value>) {
    (
        registry.store.field(id, METADATA_PARENT_BUNDLE_KEY),
        registry.store.field(id, METADATA_PARENT_COLLECTION_KEY),
    )
}

/// Two bundle versions; the first names the data collection by LIDVID, the second by LID.
/// `obs` belongs to both collections, `img` only to browse, `loose` to neither.
fn mission() -> Registry {
    let registry = Registry::new();
    registry.bundle(BUNDLE, "1.0", &[&format!("{DATA}::1.0"), &format!("{BROWSE}::1.0")]);
    registry.bundle(BUNDLE, "2.0", &[DATA]);
    registry.collection(DATA, "1.0", &[&format!("{DATA}:obs::1.0")]);
    registry.collection(DATA, "2.0", &[&format!("{DATA}:obs::1.0")]);
    registry.collection(
        BROWSE,
        "1.0",
        &[&format!("{DATA}:obs::1.0"), &format!("{BROWSE}:img::1.0")],
    );
    registry.observational(&format!("{DATA}:obs"), "1.0");
    registry.observational(&format!("{BROWSE}:img"), "1.0");
    registry.observational(&format!("{DATA}:loose"), "1.0");
    registry
}

#[tokio::test]
async fn test_products_receive_collections_and_bundles() {
    init_logging();
    let registry = mission();
    let report = run_ancestry(&test_context(), registry.store.clone()).await;
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.data_warnings, 0);

    let (bundles, collections) = ancestry(&registry, &format!("{DATA}:obs::1.0"));
    assert_eq!(
        bundles,
        Some(json!([format!("{BUNDLE}::1.0"), format!("{BUNDLE}::2.0")]))
    );
    assert_eq!(
        collections,
        Some(json!([
            format!("{BROWSE}::1.0"),
            format!("{DATA}::1.0"),
            format!("{DATA}::2.0")
        ]))
    );

    let (bundles, collections) = ancestry(&registry, &format!("{BROWSE}:img::1.0"));
    assert_eq!(bundles, Some(json!([format!("{BUNDLE}::1.0")])));
    assert_eq!(collections, Some(json!([format!("{BROWSE}::1.0")])));
}

#[tokio::test]
async fn test_collections_receive_their_bundles() {
    init_logging();
    let registry = mission();
    run_ancestry(&test_context(), registry.store.clone()).await;

    // DATA::2.0 is only reachable through the LID reference of bundle 2.0
    let (bundles, collections) = ancestry(&registry, &format!("{DATA}::2.0"));
    assert_eq!(bundles, Some(json!([format!("{BUNDLE}::2.0")])));
    assert_eq!(collections, Some(json!([])));

    let (bundles, _) = ancestry(&registry, &format!("{DATA}::1.0"));
    assert_eq!(
        bundles,
        Some(json!([format!("{BUNDLE}::1.0"), format!("{BUNDLE}::2.0")]))
    );
}

#[tokio::test]
async fn test_unreferenced_product_is_untouched() {
    init_logging();
    let registry = mission();
    run_ancestry(&test_context(), registry.store.clone()).await;
    assert_eq!(ancestry(&registry, &format!("{DATA}:loose::1.0")), (None, None));
    assert_eq!(
        registry
            .store
            .field(&format!("{DATA}:loose::1.0"), METADATA_ANCESTRY_VERSION_KEY),
        None
    );
}

#[tokio::test]
async fn test_bundles_are_marked_with_empty_ancestry() {
    init_logging();
    let registry = mission();
    let report = run_ancestry(&test_context(), registry.store.clone()).await;
    assert!(report.is_clean(), "{report:?}");

    for vid in ["1.0", "2.0"] {
        let id = format!("{BUNDLE}::{vid}");
        // no parents to record, so the fields stay absent
        assert_eq!(ancestry(&registry, &id), (None, None));
        assert_eq!(
            registry.store.field(&id, METADATA_ANCESTRY_VERSION_KEY),
            Some(json!(SWEEPERS_ANCESTRY_VERSION))
        );
    }
}

#[tokio::test]
async fn test_malformed_membership_only_affects_its_collection() {
    init_logging();
    let registry = mission();
    let broken = "urn:nasa:pds:mission:broken";
    registry.collection(broken, "1.0", &[]);
    registry.store.insert(
        registry_sweepers::store::IndexKind::Refs,
        "broken-refs",
        json!({ "collection_lidvid": format!("{broken}::1.0"), "product_lidvid": 42 }),
    );

    let report = run_ancestry(&test_context(), registry.store.clone()).await;
    assert!(report.fatal.is_none());
    assert_eq!(report.data_warnings, 1);
    let (_, collections) = ancestry(&registry, &format!("{BROWSE}:img::1.0"));
    assert_eq!(collections, Some(json!([format!("{BROWSE}::1.0")])));
}

#[tokio::test]
async fn test_rerun_after_convergence_is_write_free() {
    init_logging();
    let registry = mission();
    let ctx = test_context();
    let first = run_ancestry(&ctx, registry.store.clone()).await;
    assert!(first.operations_applied > 0);
    assert_eq!(first.operations_applied, first.operations_computed);

    let second = run_ancestry(&ctx, registry.store.clone()).await;
    assert_eq!(second.operations_computed, 0);

    // a newly referenced collection only touches what it changes
    registry.collection(BROWSE, "1.1", &[&format!("{BROWSE}:img::1.0")]);
    let third = run_ancestry(&ctx, registry.store.clone()).await;
    // browse::1.1 itself (no bundle yet) and img gaining a collection
    assert_eq!(third.operations_computed, 2);
}
