use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::ensure;
use fixedbitset::FixedBitSet;
use indexmap::IndexMap;
use indexmap::IndexSet;
use petgraph::stable_graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;

use bramble_core::asset_graph::AssetGraph;
use bramble_core::diagnostic::Diagnostic;
use bramble_core::types::Asset;
use bramble_core::types::FileType;

use crate::config::BundlingConfig;

use super::types::AssetIndex;
use super::types::AssetInterner;
use super::types::BundleId;
use super::types::BundleRootEdge;
use super::types::DecisionKind;
use super::types::IdealBundle;
use super::types::IdealGraph;
use super::types::IdealGraphBuildStats;

/// Where a bundle root lives: its bundle and the bundle group it belongs to.
#[derive(Clone, Copy, Debug)]
pub struct BundleRootInfo {
  pub bundle: BundleId,
  pub group: BundleId,
}

/// A manual shared bundle rule with its root scope resolved against the
/// asset graph.
#[derive(Clone, Debug)]
pub struct ResolvedManualRule {
  pub name: String,
  pub globs: Vec<String>,
  pub types: Option<Vec<FileType>>,
  pub root: Option<AssetIndex>,
  pub split: Option<u32>,
}

/// All shared mutable state for one bundling invocation.
///
/// Every map and cache the phases touch lives here with clear ownership; the
/// context is dropped at the end of the pass, which also discards all
/// invocation-scoped memoization.
pub struct BundlingContext<'a> {
  pub asset_graph: &'a AssetGraph,
  pub config: &'a BundlingConfig,

  /// The graph being assembled. Owns the asset interner and decision log.
  pub graph: IdealGraph,

  /// Bundle-root asset -> its bundle.
  pub bundles: HashMap<AssetIndex, BundleId>,

  /// Bundle roots in creation order.
  pub bundle_roots: IndexMap<AssetIndex, BundleRootInfo>,

  /// Entry assets in discovery order.
  pub entries: IndexSet<AssetIndex>,

  /// Non-sync dependency targets folded into their referencing bundle
  /// (parallel/inline targets without a type change). Reachability treats
  /// edges to these as sync continuations.
  pub folded_assets: HashSet<AssetIndex>,

  /// Constant module -> its single referencing parent asset.
  pub constant_parents: HashMap<AssetIndex, AssetIndex>,

  /// Manual shared bundle rules that survived root resolution.
  pub manual_rules: Vec<ResolvedManualRule>,

  /// Asset -> index into `manual_rules`.
  pub manual_asset_rules: HashMap<AssetIndex, usize>,

  /// Manual bundle key ("name,type[,partition]") -> bundle.
  pub manual_bundle_keys: HashMap<String, BundleId>,

  /// Shared bundle key (sorted source roots + type) -> bundle.
  pub shared_bundle_keys: HashMap<String, BundleId>,

  /// (parent bundle, asset type) -> type-change child bundle.
  pub type_change_bundles: HashMap<(BundleId, FileType), BundleId>,

  /// User-facing warnings collected during the pass.
  pub diagnostics: Vec<Diagnostic>,

  // Reachability state. Bitsets are sized once against the final asset and
  // bundle-root counts when the phase starts.
  /// Bundle roots in dense order (parallel to `reachable_assets`).
  pub roots: Vec<AssetIndex>,
  pub root_index_of: HashMap<AssetIndex, usize>,

  /// Per asset: which bundle roots reach it synchronously.
  pub reachable_roots: Vec<FixedBitSet>,

  /// Per bundle root: which assets it reaches synchronously.
  pub reachable_assets: Vec<FixedBitSet>,

  /// Per bundle root: assets guaranteed loaded before it executes.
  /// `None` until the first parent path has been propagated.
  pub ancestor_assets: Vec<Option<FixedBitSet>>,

  /// Auxiliary graph over bundle-root assets only, discarded after the
  /// reachability phase finalizes internalization.
  pub bundle_root_graph: StableDiGraph<AssetIndex, BundleRootEdge>,
  pub bundle_root_nodes: HashMap<AssetIndex, NodeIndex>,

  /// Invocation-scoped memoization for merge validity checks.
  pub merge_validity: HashMap<(BundleId, BundleId), bool>,
}

impl<'a> BundlingContext<'a> {
  pub fn new(asset_graph: &'a AssetGraph, config: &'a BundlingConfig) -> Self {
    let assets = AssetInterner::from_asset_graph(asset_graph);
    let graph = IdealGraph::new(assets);

    Self {
      asset_graph,
      config,
      graph,
      bundles: HashMap::new(),
      bundle_roots: IndexMap::new(),
      entries: IndexSet::new(),
      folded_assets: HashSet::new(),
      constant_parents: HashMap::new(),
      manual_rules: Vec::new(),
      manual_asset_rules: HashMap::new(),
      manual_bundle_keys: HashMap::new(),
      shared_bundle_keys: HashMap::new(),
      type_change_bundles: HashMap::new(),
      diagnostics: Vec::new(),
      roots: Vec::new(),
      root_index_of: HashMap::new(),
      reachable_roots: Vec::new(),
      reachable_assets: Vec::new(),
      ancestor_assets: Vec::new(),
      bundle_root_graph: StableDiGraph::new(),
      bundle_root_nodes: HashMap::new(),
      merge_validity: HashMap::new(),
    }
  }

  pub fn asset(&self, index: AssetIndex) -> &Arc<Asset> {
    self.graph.assets.get(index)
  }

  pub fn asset_count(&self) -> usize {
    self.graph.assets.len()
  }

  pub fn decision(&mut self, phase: &'static str, kind: DecisionKind) {
    self.graph.decisions.push(phase, kind);
  }

  pub fn warn(&mut self, diagnostic: Diagnostic) {
    self.diagnostics.push(diagnostic);
  }

  /// Whether a bundle root receives reachable assets unconditionally
  /// (instead of participating in sharing): entries, non-splittable,
  /// isolated, and name-stable bundles.
  pub fn is_entry_like(&self, root: AssetIndex) -> bool {
    if self.entries.contains(&root) {
      return true;
    }

    let Some(info) = self.bundle_roots.get(&root) else {
      return false;
    };
    let Some(bundle) = self.graph.bundle(info.bundle) else {
      return false;
    };

    !bundle.is_splittable || bundle.is_isolated() || bundle.needs_stable_name
  }

  /// Maps a bitset over root indices to the roots that still exist
  /// (internalization may have deleted some), in dense root order.
  pub fn live_roots(&self, bits: &FixedBitSet) -> Vec<AssetIndex> {
    bits
      .ones()
      .map(|i| self.roots[i])
      .filter(|root| self.bundle_roots.contains_key(root))
      .collect()
  }

  /// Adds an asset to a bundle, accounting size once per membership.
  ///
  /// An asset of a different type than the bundle is routed into a
  /// same-target type-change child bundle instead of mixing types.
  pub fn add_asset_to_bundle(
    &mut self,
    bundle_id: BundleId,
    asset_index: AssetIndex,
    phase: &'static str,
  ) -> anyhow::Result<()> {
    let (asset_type, asset_size, asset_behavior) = {
      let asset = self.graph.assets.get(asset_index);
      (asset.file_type.clone(), asset.size(), asset.bundle_behavior)
    };

    let bundle_type = self.graph.expect_bundle(bundle_id)?.bundle_type.clone();

    if bundle_type == asset_type {
      let bundle = self.graph.expect_bundle_mut(bundle_id)?;
      if bundle.assets.insert(asset_index) {
        bundle.size += asset_size;
        self.decision(
          phase,
          DecisionKind::AssetPlaced {
            asset: asset_index,
            bundle: bundle_id,
          },
        );
      }
      return Ok(());
    }

    // Type change: the asset lands in a child bundle of the same target.
    let child_id = match self.type_change_bundles.get(&(bundle_id, asset_type.clone())) {
      Some(child_id) => *child_id,
      None => {
        let target = self.graph.expect_bundle(bundle_id)?.target.clone();
        let asset = self.graph.assets.get(asset_index).clone();
        let child = IdealBundle::from_root(
          asset_index,
          &asset,
          target,
          false,
          asset_behavior,
          self.asset_count(),
        );
        let child_id = self.graph.create_bundle(child);
        self.graph.add_edge(bundle_id, child_id);
        self
          .type_change_bundles
          .insert((bundle_id, asset_type), child_id);
        self.decision(
          phase,
          DecisionKind::InGroupBundleCreated {
            bundle: child_id,
            root_asset: asset_index,
          },
        );
        child_id
      }
    };

    let child = self.graph.expect_bundle_mut(child_id)?;
    if child.assets.insert(asset_index) {
      child.size += asset_size;
      self.decision(
        phase,
        DecisionKind::AssetPlaced {
          asset: asset_index,
          bundle: child_id,
        },
      );
    }

    Ok(())
  }

  /// Validates final invariants, drops all working state, and returns the
  /// finished graph.
  pub fn finish(self, dependencies: usize) -> anyhow::Result<(IdealGraph, IdealGraphBuildStats)> {
    let mut graph = self.graph;
    graph.diagnostics = self.diagnostics;

    // No orphan bundles: every surviving bundle is loadable.
    for id in graph.bundle_ids() {
      let bundle = graph.expect_bundle(id)?;
      ensure!(
        !bundle.source_bundles.is_empty()
          || graph.bundle_group_roots.contains(&id)
          || bundle.main_entry_asset.is_some(),
        "bundle {} has no main entry, no source bundles and is not a bundle group root",
        id.index()
      );
    }

    // Coverage: no asset may be silently dropped.
    let mut covered = FixedBitSet::with_capacity(graph.assets.len());
    for id in graph.bundle_ids() {
      let bundle = graph.expect_bundle(id)?;
      for asset in &bundle.assets {
        covered.insert(asset.index());
      }
    }
    for (index, asset) in graph.assets.iter() {
      ensure!(
        covered.contains(index.index()),
        "asset {} was not assigned to any bundle",
        asset.id
      );
    }

    let stats = IdealGraphBuildStats {
      assets: graph.assets.len(),
      dependencies,
      bundles: graph.bundle_ids().len(),
    };

    Ok((graph, stats))
  }
}
