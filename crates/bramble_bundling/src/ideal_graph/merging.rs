use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::HashSet;

use fixedbitset::FixedBitSet;
use tracing::debug;
use tracing::instrument;

use bramble_core::types::Priority;

use crate::config::AsyncMergeConfig;
use crate::config::MergeInternalization;
use crate::config::SimilarityMergeConfig;
use crate::priority_queue::PriorityQueue;

use super::clustering;
use super::context::BundlingContext;
use super::types::AssetIndex;
use super::types::BundleId;
use super::types::DecisionKind;

/// Runs the post-placement merge passes in order: size pruning, parallel
/// request limit enforcement, then the optional similarity and async merge
/// heuristics.
#[instrument(level = "debug", skip_all)]
pub fn merge_bundles(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  prune_undersized_shared_bundles(ctx)?;
  enforce_parallel_request_limits(ctx)?;

  if let Some(config) = ctx.config.similarity_merge.clone() {
    merge_similar_shared_bundles(ctx, &config)?;
  }

  if let Some(config) = ctx.config.async_merge.clone() {
    merge_async_bundles(ctx, &config)?;
  }

  // Memoized merge-validity results are invocation-scoped; clear them so a
  // later pass over a mutated graph cannot observe stale answers.
  ctx.merge_validity.clear();

  Ok(())
}

/// Dissolves shared bundles under `min_bundle_size` back into their source
/// bundles. Running the pass twice is a no-op.
#[instrument(level = "debug", skip_all)]
fn prune_undersized_shared_bundles(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  let mut pruned = 0usize;

  for bundle_id in ctx.graph.bundle_ids() {
    let Some(bundle) = ctx.graph.bundle(bundle_id) else {
      continue;
    };

    if !bundle.is_shared()
      || bundle.manual_shared_bundle.is_some()
      || bundle.size >= ctx.config.min_bundle_size
    {
      continue;
    }

    let size = bundle.size;
    let assets: Vec<AssetIndex> = bundle.assets.iter().copied().collect();
    let sources: Vec<BundleId> = bundle.source_bundles.iter().copied().collect();

    for source in sources {
      for asset in &assets {
        ctx.add_asset_to_bundle(source, *asset, "merging")?;
      }
    }

    forget_bundle_keys(ctx, bundle_id);
    ctx.graph.remove_bundle(bundle_id);
    ctx.decision(
      "merging",
      DecisionKind::BundlePruned {
        bundle: bundle_id,
        size,
      },
    );
    pruned += 1;
  }

  if pruned > 0 {
    debug!(pruned, "ideal graph: pruned undersized shared bundles");
  }
  Ok(())
}

/// Brings every bundle group under `max_parallel_requests` non-inline
/// bundles by removing the smallest shared bundles first.
#[instrument(level = "debug", skip_all)]
fn enforce_parallel_request_limits(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  for group in ctx.graph.bundle_group_roots.clone() {
    if ctx.graph.bundle(group).is_none() {
      continue;
    }

    loop {
      let members = ctx.graph.transitive_group_members(group);
      let non_inline = members
        .iter()
        .filter(|id| {
          ctx
            .graph
            .bundle(**id)
            .is_some_and(|bundle| !bundle.is_inline())
        })
        .count();

      if non_inline <= ctx.config.max_parallel_requests {
        break;
      }

      // Size-sorted stack: descending, so popping yields the smallest
      // eligible shared bundle (lowest id on ties).
      let mut removable: Vec<(u64, BundleId)> = members
        .iter()
        .filter(|id| **id != group)
        .filter_map(|id| {
          let bundle = ctx.graph.bundle(*id)?;
          (bundle.is_shared() && bundle.manual_shared_bundle.is_none())
            .then_some((bundle.size, *id))
        })
        .collect();

      if removable.is_empty() {
        break;
      }

      removable.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
      let Some((_, smallest)) = removable.pop() else {
        break;
      };

      remove_shared_bundle_from_group(ctx, smallest, group)?;
    }
  }

  Ok(())
}

/// Detaches a shared bundle from one bundle group, folding its assets back
/// into the group's source bundles. A bundle left with no incoming source is
/// deleted outright.
fn remove_shared_bundle_from_group(
  ctx: &mut BundlingContext<'_>,
  bundle_id: BundleId,
  group: BundleId,
) -> anyhow::Result<()> {
  let members: HashSet<BundleId> = ctx
    .graph
    .transitive_group_members(group)
    .into_iter()
    .collect();

  let (assets, sources) = {
    let bundle = ctx.graph.expect_bundle(bundle_id)?;
    let assets: Vec<AssetIndex> = bundle.assets.iter().copied().collect();
    let sources: Vec<BundleId> = bundle.source_bundles.iter().copied().collect();
    (assets, sources)
  };

  for source in sources {
    if !members.contains(&source) {
      continue;
    }

    for asset in &assets {
      ctx.add_asset_to_bundle(source, *asset, "merging")?;
    }

    ctx.graph.remove_edge(source, bundle_id);
    let bundle = ctx.graph.expect_bundle_mut(bundle_id)?;
    bundle.source_bundles.shift_remove(&source);
  }

  ctx.decision(
    "merging",
    DecisionKind::BundleRemovedFromGroup {
      bundle: bundle_id,
      group,
    },
  );

  let orphaned = ctx
    .graph
    .expect_bundle(bundle_id)?
    .source_bundles
    .is_empty();
  if orphaned {
    forget_bundle_keys(ctx, bundle_id);
    ctx.graph.remove_bundle(bundle_id);
  }

  Ok(())
}

/// Merges clusters of shared bundles whose source-bundle sets overlap above
/// the configured threshold. The lowest bundle id in a cluster survives.
#[instrument(level = "debug", skip_all)]
fn merge_similar_shared_bundles(
  ctx: &mut BundlingContext<'_>,
  config: &SimilarityMergeConfig,
) -> anyhow::Result<()> {
  let clusters = clustering::similarity_clusters(ctx, config);
  if clusters.is_empty() {
    return Ok(());
  }

  let mut merged = 0usize;
  for cluster in clusters {
    let survivor = cluster[0];
    for other in cluster.into_iter().skip(1) {
      merge_shared_into(ctx, survivor, other, config.internalization)?;
      merged += 1;
    }
  }

  debug!(merged, "ideal graph: merged similar shared bundles");
  Ok(())
}

fn merge_shared_into(
  ctx: &mut BundlingContext<'_>,
  survivor: BundleId,
  other: BundleId,
  internalization: MergeInternalization,
) -> anyhow::Result<()> {
  let (assets, sources, internalized, children) = {
    let bundle = ctx.graph.expect_bundle(other)?;
    (
      bundle.assets.iter().copied().collect::<Vec<_>>(),
      bundle.source_bundles.iter().copied().collect::<Vec<_>>(),
      bundle.internalized_assets.clone(),
      ctx.graph.children(other),
    )
  };

  for asset in assets {
    ctx.add_asset_to_bundle(survivor, asset, "merging")?;
  }

  for source in &sources {
    ctx.graph.add_edge(*source, survivor);
  }
  for child in children {
    if child != survivor {
      ctx.graph.add_edge(survivor, child);
    }
  }

  let survivor_bundle = ctx.graph.expect_bundle_mut(survivor)?;
  survivor_bundle.source_bundles.extend(sources);
  match internalization {
    MergeInternalization::Union => {
      survivor_bundle.internalized_assets.union_with(&internalized);
    }
    MergeInternalization::Intersection => {
      survivor_bundle
        .internalized_assets
        .intersect_with(&internalized);
    }
  }

  forget_bundle_keys(ctx, other);
  ctx.graph.remove_bundle(other);
  ctx.decision(
    "merging",
    DecisionKind::BundlesMerged {
      survivor,
      merged: other,
    },
  );

  Ok(())
}

#[derive(Clone, Copy, Debug)]
struct MergeCandidate {
  a: BundleId,
  b: BundleId,
  score: f64,
}

/// Greedy best-first merging of small async bundle roots, scored by shared
/// parents, bundle-group size overlap, and an overfetch penalty.
///
/// Popped candidates whose bundles were merged away are remapped through the
/// merge history chain and re-scored rather than trusted; equal scores break
/// towards the lowest bundle ids.
#[instrument(level = "debug", skip_all)]
fn merge_async_bundles(
  ctx: &mut BundlingContext<'_>,
  config: &AsyncMergeConfig,
) -> anyhow::Result<()> {
  let candidates: Vec<BundleId> = ctx
    .graph
    .bundle_group_roots
    .clone()
    .into_iter()
    .filter(|id| is_async_merge_candidate(ctx, *id, config))
    .collect();

  if candidates.len() < 2 {
    return Ok(());
  }

  let mut queue = PriorityQueue::new(|a: &MergeCandidate, b: &MergeCandidate| {
    a.score
      .partial_cmp(&b.score)
      .unwrap_or(Ordering::Equal)
      .then_with(|| (b.a, b.b).cmp(&(a.a, a.b)))
  });

  for i in 0..candidates.len() {
    for j in (i + 1)..candidates.len() {
      let (a, b) = ordered_pair(candidates[i], candidates[j]);
      if !merge_valid(ctx, a, b) {
        continue;
      }
      if let Some(score) = score_pair(ctx, config, a, b) {
        if score >= config.score_threshold {
          queue.push(MergeCandidate { a, b, score });
        }
      }
    }
  }

  let mut remap: HashMap<BundleId, BundleId> = HashMap::new();
  let mut merged = 0usize;

  while let Some(candidate) = queue.pop() {
    let a = resolve(&remap, candidate.a);
    let b = resolve(&remap, candidate.b);
    if a == b {
      continue;
    }
    if ctx.graph.bundle(a).is_none() || ctx.graph.bundle(b).is_none() {
      continue;
    }

    let (a, b) = ordered_pair(a, b);

    if (a, b) != (candidate.a, candidate.b) {
      // Stale entry: one side was merged elsewhere since this was pushed.
      // Re-score the remapped pair instead of acting on stale order.
      if merge_valid(ctx, a, b) {
        if let Some(score) = score_pair(ctx, config, a, b) {
          if score >= config.score_threshold {
            queue.push(MergeCandidate { a, b, score });
          }
        }
      }
      continue;
    }

    if !merge_valid(ctx, a, b) {
      continue;
    }

    merge_async_pair(ctx, a, b)?;
    remap.insert(b, a);
    merged += 1;

    // The survivor's group changed; re-score it against the remaining
    // candidates.
    for other in &candidates {
      let other = resolve(&remap, *other);
      if other == a || ctx.graph.bundle(other).is_none() {
        continue;
      }
      let (x, y) = ordered_pair(a, other);
      if !merge_valid(ctx, x, y) {
        continue;
      }
      if let Some(score) = score_pair(ctx, config, x, y) {
        if score >= config.score_threshold {
          queue.push(MergeCandidate { a: x, b: y, score });
        }
      }
    }
  }

  if merged > 0 {
    // Re-home dependency and manual mappings through the merge chain.
    for targets in ctx.graph.dependency_bundles.values_mut() {
      for (_, bundle_id) in targets.iter_mut() {
        *bundle_id = resolve(&remap, *bundle_id);
      }
    }
    for bundle_id in ctx.graph.manual_asset_to_bundle.values_mut() {
      *bundle_id = resolve(&remap, *bundle_id);
    }
    for references in ctx.graph.asset_references.values_mut() {
      for (_, bundle_id) in references.iter_mut() {
        *bundle_id = resolve(&remap, *bundle_id);
      }
    }

    debug!(merged, "ideal graph: merged async bundles");
  }

  Ok(())
}

fn ordered_pair(a: BundleId, b: BundleId) -> (BundleId, BundleId) {
  if a <= b {
    (a, b)
  } else {
    (b, a)
  }
}

fn resolve(remap: &HashMap<BundleId, BundleId>, mut id: BundleId) -> BundleId {
  while let Some(next) = remap.get(&id) {
    id = *next;
  }
  id
}

fn is_async_merge_candidate(
  ctx: &BundlingContext<'_>,
  id: BundleId,
  config: &AsyncMergeConfig,
) -> bool {
  let Some(bundle) = ctx.graph.bundle(id) else {
    return false;
  };

  let Some(main_entry) = bundle.main_entry_asset else {
    return false;
  };

  bundle.behavior.is_none()
    && bundle.manual_shared_bundle.is_none()
    && !ctx.entries.contains(&main_entry)
    && bundle.size <= config.max_candidate_size
}

/// Memoized structural validity: only same-typed bundles for the same
/// environment and target may merge.
fn merge_valid(ctx: &mut BundlingContext<'_>, a: BundleId, b: BundleId) -> bool {
  if let Some(valid) = ctx.merge_validity.get(&(a, b)) {
    return *valid;
  }

  let valid = match (ctx.graph.bundle(a), ctx.graph.bundle(b)) {
    (Some(bundle_a), Some(bundle_b)) => {
      bundle_a.bundle_type == bundle_b.bundle_type
        && bundle_a.env == bundle_b.env
        && bundle_a.target == bundle_b.target
    }
    _ => false,
  };

  ctx.merge_validity.insert((a, b), valid);
  valid
}

/// Weighted score for merging two async bundle roots, or `None` when either
/// side is no longer a viable candidate.
fn score_pair(
  ctx: &BundlingContext<'_>,
  config: &AsyncMergeConfig,
  a: BundleId,
  b: BundleId,
) -> Option<f64> {
  let bundle_a = ctx.graph.bundle(a)?;
  let bundle_b = ctx.graph.bundle(b)?;

  if bundle_a.size > config.max_candidate_size || bundle_b.size > config.max_candidate_size {
    return None;
  }

  let parents_a = loader_parents(ctx, a);
  let parents_b = loader_parents(ctx, b);
  let common_parents = parents_a.intersection(&parents_b).count();
  let union_parents = parents_a.len() + parents_b.len() - common_parents;
  let parent_overlap = if union_parents == 0 {
    0.0
  } else {
    common_parents as f64 / union_parents as f64
  };

  let group_a = group_asset_bits(ctx, a);
  let group_b = group_asset_bits(ctx, b);

  let mut intersection = group_a.clone();
  intersection.intersect_with(&group_b);
  let mut union = group_a.clone();
  union.union_with(&group_b);

  let overlap_bytes = bitset_bytes(ctx, &intersection);
  let union_bytes = bitset_bytes(ctx, &union);
  let size_overlap = if union_bytes == 0 {
    0.0
  } else {
    overlap_bytes as f64 / union_bytes as f64
  };

  // Bytes a visitor of either group would newly fetch after the merge.
  let mut a_only = group_a.clone();
  a_only.difference_with(&group_b);
  let mut b_only = group_b.clone();
  b_only.difference_with(&group_a);
  let overfetch_bytes = bitset_bytes(ctx, &a_only) + bitset_bytes(ctx, &b_only);
  let overfetch = (overfetch_bytes as f64 / config.max_overfetch_bytes as f64).min(1.0);

  Some(
    config.parent_weight * parent_overlap + config.size_weight * size_overlap
      - config.overfetch_weight * overfetch,
  )
}

/// Bundles containing an asset that lazily loads this bundle root.
fn loader_parents(ctx: &BundlingContext<'_>, id: BundleId) -> HashSet<BundleId> {
  let mut parents = HashSet::new();

  let Some(main_entry) = ctx.graph.bundle(id).and_then(|b| b.main_entry_asset) else {
    return parents;
  };

  let node = ctx.graph.assets.node_id(main_entry);
  for dep_node in ctx.asset_graph.incoming_dependencies(&node) {
    let Some(dep) = ctx.asset_graph.get_dependency(&dep_node) else {
      continue;
    };
    if dep.priority != Priority::Lazy && dep.priority != Priority::Conditional {
      continue;
    }
    let Some(source_index) = dep
      .source_asset_id
      .as_deref()
      .and_then(|source| ctx.graph.assets.index_of(source))
    else {
      continue;
    };

    for bundle_id in ctx.graph.bundle_ids() {
      if ctx
        .graph
        .bundle(bundle_id)
        .is_some_and(|bundle| bundle.assets.contains(&source_index))
      {
        parents.insert(bundle_id);
      }
    }
  }

  parents
}

/// Union of member assets of every bundle in the group rooted at `id`.
fn group_asset_bits(ctx: &BundlingContext<'_>, id: BundleId) -> FixedBitSet {
  let mut bits = FixedBitSet::with_capacity(ctx.asset_count());

  for member in ctx.graph.transitive_group_members(id) {
    if let Some(bundle) = ctx.graph.bundle(member) {
      for asset in &bundle.assets {
        bits.insert(asset.index());
      }
    }
  }

  bits
}

fn bitset_bytes(ctx: &BundlingContext<'_>, bits: &FixedBitSet) -> u64 {
  bits
    .ones()
    .map(|index| ctx.graph.assets.get(AssetIndex(index as u32)).size())
    .sum()
}

/// Merges async bundle `b` into `a`, re-homing edges, group membership and
/// internalized assets.
fn merge_async_pair(
  ctx: &mut BundlingContext<'_>,
  a: BundleId,
  b: BundleId,
) -> anyhow::Result<()> {
  let (assets, internalized, parents, children) = {
    let bundle = ctx.graph.expect_bundle(b)?;
    (
      bundle.assets.iter().copied().collect::<Vec<_>>(),
      bundle.internalized_assets.clone(),
      ctx.graph.parents(b),
      ctx.graph.children(b),
    )
  };

  for asset in assets {
    ctx.add_asset_to_bundle(a, asset, "merging")?;
  }

  for parent in parents {
    if parent != a {
      ctx.graph.add_edge(parent, a);
    }
  }
  for child in children {
    if child == a {
      continue;
    }
    ctx.graph.add_edge(a, child);
    if let Some(child_bundle) = ctx.graph.bundle_mut(child) {
      if child_bundle.source_bundles.shift_remove(&b) {
        child_bundle.source_bundles.insert(a);
      }
    }
  }

  // The merged bundle's bookkeeping moves to the survivor: both roots'
  // internalized guarantees still hold because the merged bundle is a
  // superset.
  let survivor = ctx.graph.expect_bundle_mut(a)?;
  survivor.internalized_assets.union_with(&internalized);

  if let Some(root_asset) = ctx.graph.expect_bundle(b)?.main_entry_asset {
    ctx.bundles.remove(&root_asset);
    ctx.bundle_roots.shift_remove(&root_asset);
  }

  forget_bundle_keys(ctx, b);
  ctx.graph.remove_bundle(b);
  ctx.decision(
    "merging",
    DecisionKind::BundlesMerged {
      survivor: a,
      merged: b,
    },
  );

  Ok(())
}

/// Drops map entries that point at a bundle being removed.
fn forget_bundle_keys(ctx: &mut BundlingContext<'_>, id: BundleId) {
  ctx.shared_bundle_keys.retain(|_, bundle| *bundle != id);
  ctx.manual_bundle_keys.retain(|_, bundle| *bundle != id);
  ctx
    .type_change_bundles
    .retain(|(parent, _), bundle| *parent != id && *bundle != id);
}
