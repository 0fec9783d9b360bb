//! # registry-sweepers
//!
//! Derived relationship metadata for a paginated document registry.
//!
//! ## Overview
//!
//! Products in the registry are versioned (`LID::major.minor`) and arranged in a three-tier
//! hierarchy: bundles reference collections, collections reference basic products. The store holds
//! each document on its own, so two relationships have to be computed and written back onto the
//! documents by periodic batch passes:
//!
//! - **Provenance**: every non-latest version of a LID points at its immediate successor.
//! - **Ancestry**: every collection and product lists the bundles and collections that reference
//!   it, directly or through one intermediate tier.
//!
//! Both passes only write what differs from what is already stored, so a rerun over an unchanged
//! registry performs no writes at all.
//!
//! ## Architecture
//!
//! - **[`store`]**: the [`store::DocumentStore`] seam, paging/retry wrapper and two backends
//!   (OpenSearch over HTTP, and an in-memory store with failure injection)
//! - **[`provenance`]**: version grouping and successor resolution
//! - **[`ancestry`]**: reference graph construction and ancestry resolution
//! - **[`reconcile`]**: the diff engine that turns computed metadata into write operations
//! - **[`writer`]**: batched bulk writes with batch- and item-level retry
//! - **[`sweepers`]**: pass drivers wiring the compute and write stages together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use registry_sweepers::{
//!     config::SweepersConfig, context::{Pass, RunContext}, store::OpenSearchStore, sweepers,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SweepersConfig::from_toml_path("sweepers.toml")?.with_env_overrides()?;
//!     config.validate()?;
//!     let store = Arc::new(OpenSearchStore::from_config(&config.store)?);
//!     let ctx = RunContext::new(config);
//!
//!     let report = sweepers::run_all(&ctx, store, &[Pass::Provenance, Pass::Ancestry], false).await;
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod ancestry;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod identifiers;
pub mod provenance;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod sweepers;
pub mod writer;

pub use error::*;
