//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use registry_sweepers::{
    config::SweepersConfig,
    context::RunContext,
    retry::RetryPolicy,
    store::{IndexKind, InMemoryStore},
};
use serde_json::json;
use std::{cell::Cell, sync::Arc};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Small pages and batches, no backoff delays.
#[allow(dead_code)]
pub fn test_context() -> RunContext {
    let mut config = SweepersConfig::default();
    config.store.page_size = 3;
    config.writer.batch_max_count = 4;
    config.pipeline.queue_capacity = 2;
    config.retry.read = RetryPolicy::immediate(3);
    config.retry.batch = RetryPolicy::immediate(2);
    config.retry.item = RetryPolicy::immediate(3);
    RunContext::new(config)
}

/// Registry builder for [InMemoryStore] fixtures.
#[allow(dead_code)]
pub struct Registry {
    pub store: Arc<InMemoryStore>,
    refs: Cell<usize>,
}

#[allow(dead_code)]
impl Registry {
    pub fn new() -> Self {
        Registry {
            store: Arc::new(InMemoryStore::new()),
            refs: Cell::new(0),
        }
    }

    fn product(&self, lid: &str, vid: &str, class: &str, extra: serde_json::Value) -> String {
        let id = format!("{lid}::{vid}");
        let mut source = json!({
            "lid": lid,
            "vid": vid,
            "lidvid": id,
            "product_class": class,
            "ops:Tracking_Meta/ops:archive_status": "archived",
        });
        if let (Some(source), Some(extra)) = (source.as_object_mut(), extra.as_object()) {
            source.extend(extra.clone());
        }
        self.store.insert(IndexKind::Registry, id.clone(), source);
        id
    }

    pub fn bundle(&self, lid: &str, vid: &str, collections: &[&str]) -> String {
        self.product(
            lid,
            vid,
            "Product_Bundle",
            json!({ "ref_lid_collection": collections }),
        )
    }

    pub fn collection(&self, lid: &str, vid: &str, members: &[&str]) -> String {
        let id = self.product(lid, vid, "Product_Collection", json!({}));
        if !members.is_empty() {
            self.membership(&id, members);
        }
        id
    }

    pub fn membership(&self, collection: &str, members: &[&str]) {
        let refs = self.refs.get();
        self.refs.set(refs + 1);
        self.store.insert(
            IndexKind::Refs,
            format!("{collection}::P{refs}"),
            json!({ "collection_lidvid": collection, "product_lidvid": members }),
        );
    }

    pub fn observational(&self, lid: &str, vid: &str) -> String {
        self.product(lid, vid, "Product_Observational", json!({}))
    }

    pub fn with_fields(&self, lid: &str, vid: &str, extra: serde_json::Value) -> String {
        self.product(lid, vid, "Product_Observational", extra)
    }
}
