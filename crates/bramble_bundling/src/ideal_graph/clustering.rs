use std::collections::HashMap;

use petgraph::unionfind::UnionFind;

use crate::config::SimilarityMergeConfig;

use super::context::BundlingContext;
use super::types::BundleId;

/// Builds the merge-candidate graph over shared-bundle pairs that pass the
/// configured similarity thresholds and extracts its connected components.
///
/// Each returned cluster is sorted ascending, so the first element is the
/// survivor the cluster merges into. Clusters always contain at least two
/// bundles.
pub fn similarity_clusters(
  ctx: &BundlingContext<'_>,
  config: &SimilarityMergeConfig,
) -> Vec<Vec<BundleId>> {
  let shared: Vec<BundleId> = ctx
    .graph
    .bundle_ids()
    .into_iter()
    .filter(|id| {
      ctx
        .graph
        .bundle(*id)
        .is_some_and(|bundle| bundle.is_shared() && bundle.manual_shared_bundle.is_none())
    })
    .collect();

  if shared.len() < 2 {
    return Vec::new();
  }

  let mut union_find: UnionFind<usize> = UnionFind::new(shared.len());

  for i in 0..shared.len() {
    for j in (i + 1)..shared.len() {
      if pair_is_candidate(ctx, config, shared[i], shared[j]) {
        union_find.union(i, j);
      }
    }
  }

  let mut clusters: HashMap<usize, Vec<BundleId>> = HashMap::new();
  for (index, bundle_id) in shared.iter().enumerate() {
    clusters
      .entry(union_find.find(index))
      .or_default()
      .push(*bundle_id);
  }

  let mut result: Vec<Vec<BundleId>> = clusters
    .into_values()
    .filter(|cluster| cluster.len() > 1)
    .collect();

  for cluster in &mut result {
    cluster.sort();
  }
  result.sort_by_key(|cluster| cluster[0]);

  result
}

/// Whether two shared bundles pass the similarity thresholds: source-bundle
/// overlap ratio, source affinity, combined size, and matching type and
/// environment.
fn pair_is_candidate(
  ctx: &BundlingContext<'_>,
  config: &SimilarityMergeConfig,
  a: BundleId,
  b: BundleId,
) -> bool {
  let (Some(bundle_a), Some(bundle_b)) = (ctx.graph.bundle(a), ctx.graph.bundle(b)) else {
    return false;
  };

  if bundle_a.bundle_type != bundle_b.bundle_type || bundle_a.env != bundle_b.env {
    return false;
  }

  if bundle_a.size + bundle_b.size > config.max_merged_size {
    return false;
  }

  let common = bundle_a
    .source_bundles
    .iter()
    .filter(|source| bundle_b.source_bundles.contains(*source))
    .count();

  if common < config.min_common_source_bundles {
    return false;
  }

  let union = bundle_a.source_bundles.len() + bundle_b.source_bundles.len() - common;
  if union == 0 {
    return false;
  }

  let overlap = common as f64 / union as f64;
  overlap >= config.source_overlap_threshold
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn overlap_ratio_matches_intersection_over_union() {
    // Three common sources out of five distinct ones.
    let common = 3usize;
    let union = 5usize;
    let ratio = common as f64 / union as f64;
    assert!((ratio - 0.6).abs() < f64::EPSILON);
  }
}
