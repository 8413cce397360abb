use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use fixedbitset::FixedBitSet;
use indexmap::IndexSet;
use petgraph::stable_graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::Direction;

use bramble_core::asset_graph::AssetGraph;
use bramble_core::asset_graph::NodeId;
use bramble_core::types::Asset;
use bramble_core::types::AssetId;
use bramble_core::types::BundleBehavior;
use bramble_core::types::Environment;
use bramble_core::types::FileType;
use bramble_core::types::MaybeBundleBehavior;
use bramble_core::types::Priority;
use bramble_core::types::Target;

/// Dense per-invocation index for an asset.
///
/// All bitsets over assets are indexed by this.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AssetIndex(pub u32);

impl AssetIndex {
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

/// Maps asset content keys to dense [`AssetIndex`] values and back.
///
/// Built once per invocation in the asset graph's discovery order; sized
/// before any bitset is allocated and never grown mid-pass.
#[derive(Debug, Default)]
pub struct AssetInterner {
  by_id: HashMap<AssetId, AssetIndex>,
  assets: Vec<Arc<Asset>>,
  node_ids: Vec<NodeId>,
}

impl AssetInterner {
  pub fn from_asset_graph(asset_graph: &AssetGraph) -> Self {
    let mut interner = Self::default();

    for asset in asset_graph.get_assets() {
      if interner.by_id.contains_key(&asset.id) {
        continue;
      }

      let Some(node_id) = asset_graph.get_node_id_by_content_key(&asset.id) else {
        continue;
      };

      let index = AssetIndex(u32::try_from(interner.assets.len()).expect("too many assets"));
      interner.by_id.insert(asset.id.clone(), index);
      interner.assets.push(asset.clone());
      interner.node_ids.push(*node_id);
    }

    interner
  }

  pub fn len(&self) -> usize {
    self.assets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.assets.is_empty()
  }

  pub fn index_of(&self, asset_id: &str) -> Option<AssetIndex> {
    self.by_id.get(asset_id).copied()
  }

  pub fn get(&self, index: AssetIndex) -> &Arc<Asset> {
    &self.assets[index.index()]
  }

  pub fn node_id(&self, index: AssetIndex) -> NodeId {
    self.node_ids[index.index()]
  }

  pub fn iter(&self) -> impl Iterator<Item = (AssetIndex, &Arc<Asset>)> {
    self
      .assets
      .iter()
      .enumerate()
      .map(|(i, asset)| (AssetIndex(i as u32), asset))
  }
}

/// Stable arena id of a bundle within the ideal graph.
pub type BundleId = NodeIndex;

/// Edge kind in the bundle-root graph driving availability propagation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BundleRootEdge {
  Parallel,
  Lazy,
}

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum BundleGraphNode {
  Root,
  Bundle(IdealBundle),
}

pub type BundleGraph = StableDiGraph<BundleGraphNode, ()>;

/// A bundle being assembled by the algorithm.
#[derive(Debug)]
pub struct IdealBundle {
  pub id: BundleId,

  /// The asset this bundle originates from. `None` for shared bundles.
  pub main_entry_asset: Option<AssetIndex>,

  /// Member assets, in placement order.
  pub assets: IndexSet<AssetIndex>,

  /// Cumulative byte size of the member assets.
  pub size: u64,

  pub bundle_type: FileType,

  pub env: Arc<Environment>,

  pub target: Target,

  pub behavior: MaybeBundleBehavior,

  pub needs_stable_name: bool,

  pub is_splittable: bool,

  /// Bundles that cause this bundle to load. Non-empty only for shared
  /// bundles.
  pub source_bundles: IndexSet<BundleId>,

  /// Assets logically loaded into this bundle without being duplicated here,
  /// because another synchronously available bundle already contains them.
  pub internalized_assets: FixedBitSet,

  /// Name of the manual shared bundle rule that created this bundle, if any.
  pub manual_shared_bundle: Option<String>,
}

impl IdealBundle {
  /// A bundle rooted at `asset` (entry or boundary bundle).
  pub fn from_root(
    root: AssetIndex,
    asset: &Asset,
    target: Target,
    needs_stable_name: bool,
    behavior: MaybeBundleBehavior,
    asset_count: usize,
  ) -> Self {
    let mut assets = IndexSet::new();
    assets.insert(root);

    Self {
      id: BundleId::end(),
      main_entry_asset: Some(root),
      assets,
      size: asset.size(),
      bundle_type: asset.file_type.clone(),
      env: asset.env.clone(),
      target,
      behavior,
      needs_stable_name,
      is_splittable: asset.is_bundle_splittable,
      source_bundles: IndexSet::new(),
      internalized_assets: FixedBitSet::with_capacity(asset_count),
      manual_shared_bundle: None,
    }
  }

  /// An entry-less shared bundle.
  pub fn shared(
    bundle_type: FileType,
    env: Arc<Environment>,
    target: Target,
    asset_count: usize,
  ) -> Self {
    Self {
      id: BundleId::end(),
      main_entry_asset: None,
      assets: IndexSet::new(),
      size: 0,
      bundle_type,
      env,
      target,
      behavior: None,
      needs_stable_name: false,
      is_splittable: true,
      source_bundles: IndexSet::new(),
      internalized_assets: FixedBitSet::with_capacity(asset_count),
      manual_shared_bundle: None,
    }
  }

  pub fn is_shared(&self) -> bool {
    self.main_entry_asset.is_none() && !self.source_bundles.is_empty()
  }

  pub fn is_inline(&self) -> bool {
    self.behavior == Some(BundleBehavior::Inline)
  }

  pub fn is_isolated(&self) -> bool {
    self.behavior == Some(BundleBehavior::Isolated)
  }
}

/// The finalized output of the bundling algorithm.
///
/// Bundles live as node weights of a stable graph, so `BundleId`s stay valid
/// across removals. The synthetic root's children are the bundle group
/// roots.
#[derive(Debug)]
pub struct IdealGraph {
  pub graph: BundleGraph,
  pub root: BundleId,

  /// Bundle ids that open a bundle group (entries and async boundaries).
  pub bundle_group_roots: IndexSet<BundleId>,

  /// Dependency content key -> bundles created for it, keyed by priority.
  pub dependency_bundles: HashMap<String, Vec<(Priority, BundleId)>>,

  /// Asset -> (dependency content key, referencing bundle) pairs.
  pub asset_references: HashMap<AssetIndex, Vec<(String, BundleId)>>,

  /// Assets routed into manual shared bundles.
  pub manual_asset_to_bundle: HashMap<AssetIndex, BundleId>,

  pub assets: AssetInterner,

  pub decisions: DecisionLog,

  /// User-facing warnings collected while bundling (e.g. skipped manual
  /// shared bundle rules).
  pub diagnostics: Vec<bramble_core::diagnostic::Diagnostic>,
}

impl IdealGraph {
  pub fn new(assets: AssetInterner) -> Self {
    let mut graph = BundleGraph::new();
    let root = graph.add_node(BundleGraphNode::Root);

    Self {
      graph,
      root,
      bundle_group_roots: IndexSet::new(),
      dependency_bundles: HashMap::new(),
      asset_references: HashMap::new(),
      manual_asset_to_bundle: HashMap::new(),
      assets,
      decisions: DecisionLog::default(),
      diagnostics: Vec::new(),
    }
  }

  pub fn create_bundle(&mut self, bundle: IdealBundle) -> BundleId {
    let id = self.graph.add_node(BundleGraphNode::Bundle(bundle));
    if let Some(BundleGraphNode::Bundle(bundle)) = self.graph.node_weight_mut(id) {
      bundle.id = id;
    }
    id
  }

  pub fn bundle(&self, id: BundleId) -> Option<&IdealBundle> {
    match self.graph.node_weight(id) {
      Some(BundleGraphNode::Bundle(bundle)) => Some(bundle),
      _ => None,
    }
  }

  pub fn bundle_mut(&mut self, id: BundleId) -> Option<&mut IdealBundle> {
    match self.graph.node_weight_mut(id) {
      Some(BundleGraphNode::Bundle(bundle)) => Some(bundle),
      _ => None,
    }
  }

  /// Invariant-checked lookup: the id must refer to a live non-root bundle.
  pub fn expect_bundle(&self, id: BundleId) -> anyhow::Result<&IdealBundle> {
    self
      .bundle(id)
      .with_context(|| format!("expected a live bundle at node {}", id.index()))
  }

  pub fn expect_bundle_mut(&mut self, id: BundleId) -> anyhow::Result<&mut IdealBundle> {
    self
      .bundle_mut(id)
      .with_context(|| format!("expected a live bundle at node {}", id.index()))
  }

  pub fn bundle_ids(&self) -> Vec<BundleId> {
    let mut ids: Vec<BundleId> = self
      .graph
      .node_indices()
      .filter(|id| *id != self.root)
      .collect();
    ids.sort();
    ids
  }

  pub fn add_edge(&mut self, from: BundleId, to: BundleId) {
    if self.graph.find_edge(from, to).is_none() {
      self.graph.add_edge(from, to, ());
    }
  }

  pub fn remove_edge(&mut self, from: BundleId, to: BundleId) {
    if let Some(edge) = self.graph.find_edge(from, to) {
      self.graph.remove_edge(edge);
    }
  }

  pub fn remove_bundle(&mut self, id: BundleId) {
    self.bundle_group_roots.shift_remove(&id);
    self.graph.remove_node(id);
  }

  pub fn children(&self, id: BundleId) -> Vec<BundleId> {
    let mut children: Vec<BundleId> = self
      .graph
      .neighbors_directed(id, Direction::Outgoing)
      .collect();
    children.reverse();
    children
  }

  pub fn parents(&self, id: BundleId) -> Vec<BundleId> {
    let mut parents: Vec<BundleId> = self
      .graph
      .neighbors_directed(id, Direction::Incoming)
      .filter(|parent| *parent != self.root)
      .collect();
    parents.reverse();
    parents
  }

  /// The group root plus the bundles directly reachable from it.
  pub fn direct_group_members(&self, group_root: BundleId) -> Vec<BundleId> {
    let mut members = vec![group_root];
    members.extend(self.children(group_root));
    members
  }

  /// Every bundle transitively reachable from the group root, including it.
  pub fn transitive_group_members(&self, group_root: BundleId) -> Vec<BundleId> {
    let mut members = Vec::new();
    let mut stack = vec![group_root];

    while let Some(id) = stack.pop() {
      if members.contains(&id) {
        continue;
      }
      members.push(id);
      for child in self.children(id) {
        if !members.contains(&child) {
          stack.push(child);
        }
      }
    }

    members
  }
}

/// Typed decision event.
///
/// The decision log is a debugging/visualization audit trail explaining why
/// the algorithm made a particular choice. It is never consulted for
/// correctness.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionKind {
  EntryBundleCreated {
    bundle: BundleId,
    root_asset: AssetIndex,
  },
  BoundaryCreated {
    bundle: BundleId,
    root_asset: AssetIndex,
    priority: Priority,
    isolated: bool,
  },
  InGroupBundleCreated {
    bundle: BundleId,
    root_asset: AssetIndex,
  },
  ManualBundleCreated {
    bundle: BundleId,
    rule: String,
  },
  AvailabilityComputed {
    root_asset: AssetIndex,
    ancestor_assets_len: usize,
  },
  BundleInternalized {
    root_asset: AssetIndex,
  },
  AssetPlaced {
    asset: AssetIndex,
    bundle: BundleId,
  },
  SharedBundleCreated {
    bundle: BundleId,
    source_count: usize,
  },
  BundleReused {
    asset: AssetIndex,
    bundle: BundleId,
  },
  BundlePruned {
    bundle: BundleId,
    size: u64,
  },
  BundleRemovedFromGroup {
    bundle: BundleId,
    group: BundleId,
  },
  BundlesMerged {
    survivor: BundleId,
    merged: BundleId,
  },
}

/// Single decision event with a monotonically increasing sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
  pub seq: u64,
  pub phase: &'static str,
  pub kind: DecisionKind,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecisionLog {
  next_seq: u64,
  pub decisions: Vec<Decision>,
}

impl DecisionLog {
  pub fn push(&mut self, phase: &'static str, kind: DecisionKind) {
    let seq = self.next_seq;
    self.next_seq += 1;

    self.decisions.push(Decision { seq, phase, kind });
  }

  pub fn is_empty(&self) -> bool {
    self.decisions.is_empty()
  }
}

/// Summary stats for one bundling invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdealGraphBuildStats {
  pub assets: usize,
  pub dependencies: usize,
  pub bundles: usize,
}
