//! Reference Graph Builder.
//!
//! Nodes are LIDVIDs tagged with their tier; edges run bundle → collection → product. Reference
//! fields are read through [ReferenceSet] so scalar and list encodings are handled identically.
//! A bundle may name a collection by LID, in which case the edge goes to every known version of
//! that LID and of its aliases. Edges are resolved in [ReferenceGraphBuilder::build], after every
//! document has been added, so the result does not depend on the order documents arrive in.
use petgraph::{
    algo::{is_cyclic_directed, tarjan_scc},
    stable_graph::{NodeIndex, StableGraph},
    Direction,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    context::PassReport,
    document::{
        coerce_scalar, Document, ReferenceSet, FIELD_ALTERNATE_IDS, FIELD_COLLECTION_LIDVID,
        FIELD_PRODUCT_LIDVID, FIELD_REF_LID_COLLECTION,
    },
    identifiers::{Lid, LidVid, ProductIdentifier},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Bundle,
    Collection,
    Product,
}

impl NodeKind {
    /// The tier allowed to point at this one.
    fn parent(self) -> Option<NodeKind> {
        match self {
            NodeKind::Bundle => None,
            NodeKind::Collection => Some(NodeKind::Bundle),
            NodeKind::Product => Some(NodeKind::Collection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceNode {
    pub lidvid: LidVid,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceGraph {
    graph: StableGraph<ReferenceNode, ()>,
    index: HashMap<LidVid, NodeIndex>,
}

impl ReferenceGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn kind_of(&self, lidvid: &LidVid) -> Option<NodeKind> {
        self.index.get(lidvid).map(|idx| self.graph[*idx].kind)
    }

    /// Direct referrers of `lidvid`, deduplicated.
    pub fn parents(&self, lidvid: &LidVid) -> BTreeSet<LidVid> {
        self.neighbors(lidvid, Direction::Incoming)
    }

    /// Direct references made by `lidvid`, deduplicated.
    pub fn children(&self, lidvid: &LidVid) -> BTreeSet<LidVid> {
        self.neighbors(lidvid, Direction::Outgoing)
    }

    fn neighbors(&self, lidvid: &LidVid, direction: Direction) -> BTreeSet<LidVid> {
        match self.index.get(lidvid) {
            Some(idx) => self
                .graph
                .neighbors_directed(*idx, direction)
                .map(|n| self.graph[n].lidvid.clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    fn node(&mut self, lidvid: LidVid, kind: NodeKind) -> NodeIndex {
        if let Some(idx) = self.index.get(&lidvid) {
            return *idx;
        }
        let idx = self.graph.add_node(ReferenceNode {
            lidvid: lidvid.clone(),
            kind,
        });
        self.index.insert(lidvid, idx);
        idx
    }

    /// Adds `parent → child` if the tiers line up. A child that already exists under another tier
    /// is left untouched and the edge is refused.
    fn link(&mut self, parent: NodeIndex, child: LidVid, kind: NodeKind) -> Result<(), NodeKind> {
        if let Some(existing) = self.kind_of(&child) {
            if existing != kind {
                return Err(existing);
            }
        }
        if kind.parent() != Some(self.graph[parent].kind) {
            return Err(self.graph[parent].kind);
        }
        let child = self.node(child, kind);
        self.graph.add_edge(parent, child, ());
        Ok(())
    }

    /// Removes every strongly connected component larger than a single node, reporting the
    /// members as skipped. Tier checks keep the graph acyclic, so this is a last-resort guard.
    fn remove_cycles(&mut self, report: &mut PassReport) {
        if !is_cyclic_directed(&self.graph) {
            return;
        }
        for component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|idx| self.graph.contains_edge(*idx, *idx));
            if !cyclic {
                continue;
            }
            let mut members: Vec<String> = component
                .iter()
                .filter_map(|idx| self.graph.node_weight(*idx))
                .map(|node| node.lidvid.to_string())
                .collect();
            members.sort();
            report.skip(
                format!("subgraph [{}]", members.join(", ")),
                "reference cycle detected",
            );
            for idx in component {
                if let Some(node) = self.graph.remove_node(idx) {
                    self.index.remove(&node.lidvid);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ReferenceGraphBuilder {
    graph: ReferenceGraph,
    collections_by_lid: BTreeMap<Lid, BTreeSet<LidVid>>,
    aliases: BTreeMap<Lid, BTreeSet<Lid>>,
    bundle_refs: Vec<(LidVid, String, ProductIdentifier)>,
    memberships: Vec<(String, LidVid, Vec<LidVid>)>,
}

impl ReferenceGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_collection(&mut self, doc: &Document, report: &mut PassReport) {
        let lidvid = match doc.lidvid() {
            Ok(lidvid) => lidvid,
            Err(err) => {
                report.data_warning(&doc.to_string(), format!("unusable collection: {err}"));
                return;
            }
        };

        let mut lids = BTreeSet::from([lidvid.lid.clone()]);
        if let Some(value) = doc.field(FIELD_ALTERNATE_IDS) {
            match ReferenceSet::from_value(value) {
                Ok(ids) => {
                    for id in ids.iter() {
                        match id.parse::<ProductIdentifier>() {
                            Ok(identifier) => {
                                lids.insert(identifier.lid().clone());
                            }
                            Err(err) => report.data_warning(
                                &doc.to_string(),
                                format!("ignoring alternate id '{id}': {err}"),
                            ),
                        }
                    }
                }
                Err(err) => report.data_warning(&doc.to_string(), err),
            }
        }
        for lid in &lids {
            self.aliases
                .entry(lid.clone())
                .or_default()
                .extend(lids.iter().cloned());
        }

        self.collections_by_lid
            .entry(lidvid.lid.clone())
            .or_default()
            .insert(lidvid.clone());
        self.graph.node(lidvid, NodeKind::Collection);
    }

    pub fn add_bundle(&mut self, doc: &Document, report: &mut PassReport) {
        let lidvid = match doc.lidvid() {
            Ok(lidvid) => lidvid,
            Err(err) => {
                report.data_warning(&doc.to_string(), format!("unusable bundle: {err}"));
                return;
            }
        };
        self.graph.node(lidvid.clone(), NodeKind::Bundle);

        // absent or malformed references leave the bundle with no children
        let references = match doc.references(FIELD_REF_LID_COLLECTION) {
            Ok(references) => references,
            Err(err) => {
                report.data_warning(&doc.to_string(), err);
                return;
            }
        };
        for reference in references.iter() {
            match reference.parse::<ProductIdentifier>() {
                Ok(identifier) => {
                    self.bundle_refs
                        .push((lidvid.clone(), doc.to_string(), identifier))
                }
                Err(err) => report.data_warning(
                    &doc.to_string(),
                    format!("ignoring collection reference '{reference}': {err}"),
                ),
            }
        }
    }

    /// Adds one collection membership document (`collection_lidvid` + `product_lidvid`).
    pub fn add_membership(&mut self, doc: &Document, report: &mut PassReport) {
        let collection = match doc
            .field(FIELD_COLLECTION_LIDVID)
            .map(coerce_scalar)
            .transpose()
        {
            Ok(Some(Some(Value::String(s)))) => s.parse::<LidVid>(),
            Ok(_) => {
                report.data_warning(
                    &doc.to_string(),
                    format!("missing or non-string '{FIELD_COLLECTION_LIDVID}'"),
                );
                return;
            }
            Err(err) => Err(err),
        };
        let collection = match collection {
            Ok(collection) => collection,
            Err(err) => {
                report.data_warning(&doc.to_string(), err);
                return;
            }
        };

        let products = match doc.references(FIELD_PRODUCT_LIDVID) {
            Ok(products) => products,
            Err(err) => {
                report.data_warning(&doc.to_string(), err);
                return;
            }
        };
        let mut members = Vec::with_capacity(products.len());
        for product in products.iter() {
            match product.parse::<LidVid>() {
                Ok(lidvid) => members.push(lidvid),
                Err(err) => report.data_warning(
                    &doc.to_string(),
                    format!("ignoring member '{product}': {err}"),
                ),
            }
        }
        self.memberships.push((doc.to_string(), collection, members));
    }

    /// Versions of every collection LID aliased with `lid`.
    fn collection_versions(&self, lid: &Lid) -> BTreeSet<LidVid> {
        let fallback = BTreeSet::from([lid.clone()]);
        self.aliases
            .get(lid)
            .unwrap_or(&fallback)
            .iter()
            .filter_map(|alias| self.collections_by_lid.get(alias))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn build(mut self, report: &mut PassReport) -> ReferenceGraph {
        let bundle_refs = std::mem::take(&mut self.bundle_refs);
        for (bundle, source, identifier) in bundle_refs {
            let targets = match &identifier {
                ProductIdentifier::LidVid(lidvid) => {
                    if self.graph.kind_of(lidvid) == Some(NodeKind::Collection) {
                        BTreeSet::from([lidvid.clone()])
                    } else {
                        BTreeSet::new()
                    }
                }
                ProductIdentifier::Lid(lid) => self.collection_versions(lid),
            };
            if targets.is_empty() {
                report.data_warning(
                    &source,
                    format!("no versions of referenced collection {identifier} exist in registry"),
                );
                continue;
            }
            let Some(&parent) = self.graph.index.get(&bundle) else {
                continue;
            };
            for target in targets {
                if let Err(existing) = self.graph.link(parent, target.clone(), NodeKind::Collection)
                {
                    report.skip(
                        format!("edge {bundle} -> {target}"),
                        format!("{target} is a {existing:?}, not a collection"),
                    );
                }
            }
        }

        let memberships = std::mem::take(&mut self.memberships);
        for (source, collection, members) in memberships {
            let parent = match self.graph.index.get(&collection) {
                Some(idx) if self.graph.kind_of(&collection) == Some(NodeKind::Collection) => *idx,
                _ => {
                    report.data_warning(
                        &source,
                        format!("collection {collection} does not exist in registry"),
                    );
                    continue;
                }
            };
            for member in members {
                if let Err(existing) = self.graph.link(parent, member.clone(), NodeKind::Product) {
                    report.skip(
                        format!("edge {collection} -> {member}"),
                        format!("{member} is a {existing:?}, not a basic product"),
                    );
                }
            }
        }

        self.graph.remove_cycles(report);
        tracing::info!(
            "Reference graph built: {} nodes, {} edges",
            self.graph.node_count(),
            self.graph.edge_count()
        );
        self.graph
    }
}
