use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::Context;
use fixedbitset::FixedBitSet;
use petgraph::algo::kosaraju_scc;
use petgraph::algo::toposort;
use petgraph::stable_graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::debug;
use tracing::instrument;

use bramble_core::asset_graph::NodeId;
use bramble_core::types::Priority;

use super::context::BundlingContext;
use super::types::AssetIndex;
use super::types::BundleRootEdge;
use super::types::DecisionKind;

/// Computes, per asset, which bundle roots reach it synchronously, and
/// builds the bundle-root graph whose parallel/lazy edges drive availability
/// propagation.
#[instrument(level = "debug", skip_all)]
pub fn compute_reachability(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  let asset_count = ctx.asset_count();

  ctx.roots = ctx.bundle_roots.keys().copied().collect();
  ctx.root_index_of = ctx
    .roots
    .iter()
    .enumerate()
    .map(|(i, root)| (*root, i))
    .collect();

  let root_count = ctx.roots.len();
  ctx.reachable_roots = vec![FixedBitSet::with_capacity(root_count); asset_count];
  ctx.reachable_assets = vec![FixedBitSet::with_capacity(asset_count); root_count];

  for root in ctx.roots.clone() {
    let node = ctx.bundle_root_graph.add_node(root);
    ctx.bundle_root_nodes.insert(root, node);
  }

  for (root_index, root) in ctx.roots.clone().into_iter().enumerate() {
    trace_root(ctx, root, root_index)?;
  }

  debug!(
    bundle_roots = root_count,
    bundle_root_edges = ctx.bundle_root_graph.edge_count(),
    "ideal graph: computed reachability"
  );
  Ok(())
}

/// Scoped depth-first walk from one bundle root, descending only through
/// sync dependencies (and folded non-sync targets, which live in the
/// referencing bundle).
fn trace_root(
  ctx: &mut BundlingContext<'_>,
  root: AssetIndex,
  root_index: usize,
) -> anyhow::Result<()> {
  let root_env_context = ctx.asset(root).env.context;
  let root_node = *ctx
    .bundle_root_nodes
    .get(&root)
    .context("bundle root missing from bundle-root graph")?;

  let mut stack: Vec<NodeId> = vec![ctx.graph.assets.node_id(root)];
  let mut visited: HashSet<NodeId> = HashSet::new();

  while let Some(node) = stack.pop() {
    if !visited.insert(node) {
      continue;
    }

    let Some(asset) = ctx.asset_graph.get_asset(&node) else {
      continue;
    };
    let Some(asset_index) = ctx.graph.assets.index_of(&asset.id) else {
      continue;
    };

    if asset_index != root {
      ctx.reachable_roots[asset_index.index()].insert(root_index);
      ctx.reachable_assets[root_index].insert(asset_index.index());
    }

    for dep_node in ctx.asset_graph.asset_dependencies(&node) {
      let Some(dep) = ctx.asset_graph.get_dependency(&dep_node).cloned() else {
        continue;
      };

      for target_node in ctx.asset_graph.dependency_assets(&dep_node) {
        let Some(target_asset) = ctx.asset_graph.get_asset(&target_node) else {
          continue;
        };
        let Some(target_index) = ctx.graph.assets.index_of(&target_asset.id) else {
          continue;
        };

        let sync_edge = dep.priority == Priority::Sync
          || (ctx.folded_assets.contains(&target_index)
            && !ctx.bundle_roots.contains_key(&target_index));

        if sync_edge {
          // A sync edge into a behavior-carrying bundle root (isolated or
          // inline boundary) stays in its own bundle; do not pull it into
          // this root's reachable set.
          let boundary_with_behavior = ctx
            .bundle_roots
            .get(&target_index)
            .and_then(|info| ctx.graph.bundle(info.bundle))
            .is_some_and(|bundle| bundle.behavior.is_some());

          if !boundary_with_behavior {
            stack.push(target_node);
          }
          continue;
        }

        // Crossing a non-sync edge: record a bundle-root graph edge when the
        // target bundle carries no special behavior and shares the execution
        // context of this root.
        if target_index == root {
          continue;
        }

        let Some(target_info) = ctx.bundle_roots.get(&target_index) else {
          continue;
        };
        let Some(target_bundle) = ctx.graph.bundle(target_info.bundle) else {
          continue;
        };

        if target_bundle.behavior.is_some() || target_bundle.env.context != root_env_context {
          continue;
        }

        let kind = match dep.priority {
          Priority::Parallel => BundleRootEdge::Parallel,
          Priority::Conditional if ctx.config.load_conditional_bundles_in_parallel => {
            BundleRootEdge::Parallel
          }
          _ => BundleRootEdge::Lazy,
        };

        let target_root_node = *ctx
          .bundle_root_nodes
          .get(&target_index)
          .context("bundle root target missing from bundle-root graph")?;

        if ctx
          .bundle_root_graph
          .find_edge(root_node, target_root_node)
          .is_none()
        {
          ctx
            .bundle_root_graph
            .add_edge(root_node, target_root_node, kind);
        }
      }
    }
  }

  Ok(())
}

/// Propagates ancestor availability across the bundle-root graph.
///
/// Entries are seeded with the empty set. Each node contributes its own
/// ancestors plus everything its bundle group loads; lazy children intersect
/// what every parent path guarantees, and parallel children additionally see
/// earlier parallel siblings.
#[instrument(level = "debug", skip_all)]
pub fn compute_ancestor_availability(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  let root_count = ctx.roots.len();
  let asset_count = ctx.asset_count();
  ctx.ancestor_assets = vec![None; root_count];

  for entry in ctx.entries.clone() {
    if let Some(&root_index) = ctx.root_index_of.get(&entry) {
      ctx.ancestor_assets[root_index] = Some(FixedBitSet::with_capacity(asset_count));
    }
  }

  match toposort(&ctx.bundle_root_graph, None) {
    Ok(order) => {
      propagate_availability_dag(ctx, order)?;
      debug!(
        bundle_roots = root_count,
        "ideal graph: computed availability (dag)"
      );
    }
    Err(_) => {
      // The bundle-root graph can be cyclic (mutually lazy imports);
      // condense strongly connected components and propagate conservatively
      // at SCC granularity.
      propagate_availability_scc(ctx)?;
      debug!(
        bundle_roots = root_count,
        "ideal graph: computed availability (scc)"
      );
    }
  }

  for (root_index, root) in ctx.roots.clone().into_iter().enumerate() {
    let ancestor_assets_len = ctx.ancestor_assets[root_index]
      .as_ref()
      .map_or(0, |bits| bits.count_ones(..));
    ctx.decision(
      "availability",
      DecisionKind::AvailabilityComputed {
        root_asset: root,
        ancestor_assets_len,
      },
    );
  }

  Ok(())
}

/// Everything guaranteed loaded once `root`'s bundle group has loaded: its
/// own ancestors plus the members (and their sync closures) of every bundle
/// in the group.
fn available_from_root(ctx: &BundlingContext<'_>, root: AssetIndex) -> anyhow::Result<FixedBitSet> {
  let asset_count = ctx.asset_count();
  let root_index = *ctx
    .root_index_of
    .get(&root)
    .context("bundle root not indexed")?;

  let info = ctx
    .bundle_roots
    .get(&root)
    .context("bundle root missing during availability")?;
  let bundle = ctx.graph.expect_bundle(info.bundle)?;

  if bundle.is_isolated() {
    return Ok(FixedBitSet::with_capacity(asset_count));
  }

  let mut available = ctx.ancestor_assets[root_index]
    .clone()
    .unwrap_or_else(|| FixedBitSet::with_capacity(asset_count));

  for member_id in ctx.graph.direct_group_members(info.group) {
    let Some(member) = ctx.graph.bundle(member_id) else {
      continue;
    };
    for &member_asset in &member.assets {
      available.insert(member_asset.index());
      if let Some(&member_root_index) = ctx.root_index_of.get(&member_asset) {
        available.union_with(&ctx.reachable_assets[member_root_index]);
      }
    }
  }

  Ok(available)
}

fn propagate_availability_dag(
  ctx: &mut BundlingContext<'_>,
  order: Vec<NodeIndex>,
) -> anyhow::Result<()> {
  let asset_count = ctx.asset_count();

  for node in order {
    let root = *ctx
      .bundle_root_graph
      .node_weight(node)
      .context("bundle-root graph node missing")?;

    let available = available_from_root(ctx, root)?;

    // Children in edge insertion order, which is discovery order and thus
    // load order for parallel siblings.
    let mut children: Vec<(NodeIndex, BundleRootEdge)> = ctx
      .bundle_root_graph
      .edges_directed(node, Direction::Outgoing)
      .map(|edge| (edge.target(), *edge.weight()))
      .collect();
    children.reverse();

    let mut parallel_availability = FixedBitSet::with_capacity(asset_count);

    for (child_node, kind) in children {
      let child_root = *ctx
        .bundle_root_graph
        .node_weight(child_node)
        .context("bundle-root graph child missing")?;
      let child_index = *ctx
        .root_index_of
        .get(&child_root)
        .context("child bundle root not indexed")?;

      let to_propagate = if kind == BundleRootEdge::Parallel {
        let mut combined = available.clone();
        combined.union_with(&parallel_availability);
        combined
      } else {
        available.clone()
      };

      ctx.ancestor_assets[child_index] = Some(match ctx.ancestor_assets[child_index].take() {
        None => to_propagate,
        Some(mut previous) => {
          previous.intersect_with(&to_propagate);
          previous
        }
      });

      // Later parallel siblings may assume this one already ran; it never
      // sees itself.
      if kind == BundleRootEdge::Parallel {
        parallel_availability.insert(child_root.index());
        parallel_availability.union_with(&ctx.reachable_assets[child_index]);
      }
    }
  }

  Ok(())
}

/// Cycle fallback: condense SCCs into a DAG and propagate the intersection
/// of parent availability at SCC granularity. Parallel sibling ordering is
/// not refined inside cycles.
fn propagate_availability_scc(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  let asset_count = ctx.asset_count();
  let sccs: Vec<Vec<NodeIndex>> = kosaraju_scc(&ctx.bundle_root_graph);

  let mut scc_of: HashMap<NodeIndex, usize> = HashMap::new();
  for (i, scc) in sccs.iter().enumerate() {
    for &node in scc {
      scc_of.insert(node, i);
    }
  }

  let mut scc_graph: StableDiGraph<usize, ()> = StableDiGraph::new();
  let scc_nodes: Vec<NodeIndex> = (0..sccs.len()).map(|i| scc_graph.add_node(i)).collect();

  for edge in ctx.bundle_root_graph.edge_indices() {
    let Some((source, target)) = ctx.bundle_root_graph.edge_endpoints(edge) else {
      continue;
    };
    let (sa, sb) = (scc_of[&source], scc_of[&target]);
    if sa != sb && scc_graph.find_edge(scc_nodes[sa], scc_nodes[sb]).is_none() {
      scc_graph.add_edge(scc_nodes[sa], scc_nodes[sb], ());
    }
  }

  let order = toposort(&scc_graph, None)
    .map_err(|_| anyhow::anyhow!("SCC condensation graph unexpectedly cyclic"))?;

  let mut available_for_scc: Vec<FixedBitSet> =
    vec![FixedBitSet::with_capacity(asset_count); sccs.len()];

  for scc_node in order {
    let scc_index = *scc_graph
      .node_weight(scc_node)
      .context("SCC node missing")?;

    let parents: Vec<usize> = scc_graph
      .neighbors_directed(scc_node, Direction::Incoming)
      .filter_map(|p| scc_graph.node_weight(p).copied())
      .collect();

    let mut incoming: Option<FixedBitSet> = None;
    for parent in parents {
      let parent_bits = available_for_scc[parent].clone();
      incoming = Some(match incoming {
        None => parent_bits,
        Some(mut previous) => {
          previous.intersect_with(&parent_bits);
          previous
        }
      });
    }

    for &member_node in &sccs[scc_index] {
      let root = *ctx
        .bundle_root_graph
        .node_weight(member_node)
        .context("bundle-root graph node missing")?;
      let root_index = *ctx
        .root_index_of
        .get(&root)
        .context("bundle root not indexed")?;

      ctx.ancestor_assets[root_index] = Some(match (ctx.ancestor_assets[root_index].take(), &incoming)
      {
        (None, None) => FixedBitSet::with_capacity(asset_count),
        (None, Some(bits)) => bits.clone(),
        (Some(previous), None) => previous,
        (Some(mut previous), Some(bits)) => {
          previous.intersect_with(bits);
          previous
        }
      });
    }

    // What this SCC offers its children: the union of everything available
    // from its member roots.
    let mut scc_available = FixedBitSet::with_capacity(asset_count);
    for &member_node in &sccs[scc_index] {
      let root = *ctx
        .bundle_root_graph
        .node_weight(member_node)
        .context("bundle-root graph node missing")?;
      scc_available.union_with(&available_from_root(ctx, root)?);
    }
    available_for_scc[scc_index] = scc_available;
  }

  Ok(())
}

/// Deletes lazy bundle roots whose asset is already guaranteed on every
/// parent path, marking them internalized on each parent instead.
#[instrument(level = "debug", skip_all)]
pub fn internalize_async_bundles(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  let mut internalized = 0usize;

  for root in ctx.roots.clone() {
    if !ctx.bundle_roots.contains_key(&root) || ctx.entries.contains(&root) {
      continue;
    }

    let node = *ctx
      .bundle_root_nodes
      .get(&root)
      .context("bundle root missing from bundle-root graph")?;

    let incoming: Vec<(AssetIndex, BundleRootEdge)> = ctx
      .bundle_root_graph
      .edges_directed(node, Direction::Incoming)
      .filter_map(|edge| {
        let parent = ctx.bundle_root_graph.node_weight(edge.source())?;
        Some((*parent, *edge.weight()))
      })
      .collect();

    if incoming.is_empty()
      || incoming
        .iter()
        .any(|(_, kind)| *kind == BundleRootEdge::Parallel)
    {
      continue;
    }

    let info = *ctx
      .bundle_roots
      .get(&root)
      .context("bundle root missing")?;
    let bundle = ctx.graph.expect_bundle(info.bundle)?;
    if bundle.manual_shared_bundle.is_some() || bundle.behavior.is_some() {
      continue;
    }

    let guaranteed_everywhere = incoming.iter().all(|(parent, _)| {
      let Some(&parent_index) = ctx.root_index_of.get(parent) else {
        return false;
      };
      ctx.reachable_assets[parent_index].contains(root.index())
        || ctx.ancestor_assets[parent_index]
          .as_ref()
          .is_some_and(|bits| bits.contains(root.index()))
    });

    if !guaranteed_everywhere {
      continue;
    }

    for (parent, _) in &incoming {
      let Some(parent_info) = ctx.bundle_roots.get(parent) else {
        continue;
      };
      let parent_bundle_id = parent_info.bundle;
      if let Some(parent_bundle) = ctx.graph.bundle_mut(parent_bundle_id) {
        parent_bundle.internalized_assets.insert(root.index());
      }
    }

    ctx.bundle_roots.shift_remove(&root);
    ctx.bundles.remove(&root);
    ctx.graph.remove_bundle(info.bundle);
    ctx.bundle_root_graph.remove_node(node);
    ctx.bundle_root_nodes.remove(&root);

    ctx.decision(
      "internalization",
      DecisionKind::BundleInternalized { root_asset: root },
    );
    internalized += 1;
  }

  if internalized > 0 {
    debug!(internalized, "ideal graph: internalized async bundles");
  }
  Ok(())
}
