use std::collections::HashSet;

use anyhow::Context;
use itertools::Itertools;
use tracing::debug;
use tracing::instrument;

use super::context::BundlingContext;
use super::types::AssetIndex;
use super::types::BundleId;
use super::types::DecisionKind;
use super::types::IdealBundle;

/// Assigns every remaining asset to bundles: unconditional duplication into
/// entry-like bundles, bundle reuse, shared-bundle synthesis above the
/// `min_bundles` threshold, and duplication below it.
#[instrument(level = "debug", skip_all)]
pub fn place_assets(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  let asset_count = ctx.asset_count();

  for index in 0..asset_count {
    let asset_index = AssetIndex(index as u32);

    // Bundle roots already own their bundle.
    if ctx.bundles.contains_key(&asset_index) {
      continue;
    }

    if ctx.graph.manual_asset_to_bundle.contains_key(&asset_index) {
      wire_manual_bundle(ctx, asset_index)?;
      continue;
    }

    // Single-parent constant modules are co-placed with their parent below.
    if ctx.constant_parents.contains_key(&asset_index) {
      continue;
    }

    place_asset(ctx, asset_index)?;
  }

  co_place_constant_modules(ctx)?;

  debug!(
    bundles = ctx.graph.bundle_ids().len(),
    "ideal graph: placed assets"
  );
  Ok(())
}

fn root_bundle(ctx: &BundlingContext<'_>, root: AssetIndex) -> anyhow::Result<BundleId> {
  ctx
    .bundle_roots
    .get(&root)
    .map(|info| info.bundle)
    .context("bundle root disappeared during placement")
}

fn place_asset(ctx: &mut BundlingContext<'_>, asset_index: AssetIndex) -> anyhow::Result<()> {
  let reaching = ctx.live_roots(&ctx.reachable_roots[asset_index.index()]);
  if reaching.is_empty() {
    return Ok(());
  }

  // Entries, non-splittable, isolated and name-stable bundles receive the
  // asset unconditionally; the rest are candidates for sharing, unless the
  // asset is already guaranteed by the root's own ancestors.
  let mut entry_like: Vec<AssetIndex> = Vec::new();
  let mut candidates: Vec<AssetIndex> = Vec::new();

  for root in reaching {
    if ctx.is_entry_like(root) {
      entry_like.push(root);
      continue;
    }

    let root_index = *ctx
      .root_index_of
      .get(&root)
      .context("candidate bundle root not indexed")?;
    let already_available = ctx.ancestor_assets[root_index]
      .as_ref()
      .is_some_and(|bits| bits.contains(asset_index.index()));

    if !already_available {
      candidates.push(root);
    }
  }

  for root in &entry_like {
    let bundle_id = root_bundle(ctx, *root)?;
    ctx.add_asset_to_bundle(bundle_id, asset_index, "placement")?;
  }

  // Bundle reuse: when one candidate's bundle is loaded by exactly the other
  // candidates, it already is the shared subgraph; reference it instead of
  // synthesizing a new bundle.
  if candidates.len() > 1 {
    let reused = candidates.iter().copied().find(|candidate| {
      let reachers: HashSet<AssetIndex> = ctx
        .live_roots(&ctx.reachable_roots[candidate.index()])
        .into_iter()
        .collect();
      let others: HashSet<AssetIndex> = candidates
        .iter()
        .copied()
        .filter(|other| other != candidate)
        .collect();
      reachers == others
    });

    if let Some(reused) = reused {
      let reused_bundle = root_bundle(ctx, reused)?;
      for other in candidates.iter().copied().filter(|other| *other != reused) {
        let other_bundle = root_bundle(ctx, other)?;
        ctx.graph.add_edge(other_bundle, reused_bundle);
      }
      ctx.decision(
        "placement",
        DecisionKind::BundleReused {
          asset: asset_index,
          bundle: reused_bundle,
        },
      );
      candidates = vec![reused];
    }
  }

  if candidates.is_empty() {
    return Ok(());
  }

  if candidates.len() > ctx.config.min_bundles && !ctx.config.disable_shared_bundles {
    create_or_extend_shared_bundle(ctx, asset_index, &candidates)?;
  } else {
    // Below the sharing threshold the asset is duplicated, accepting the
    // redundancy.
    for root in candidates {
      let bundle_id = root_bundle(ctx, root)?;
      ctx.add_asset_to_bundle(bundle_id, asset_index, "placement")?;
    }
  }

  Ok(())
}

fn create_or_extend_shared_bundle(
  ctx: &mut BundlingContext<'_>,
  asset_index: AssetIndex,
  candidates: &[AssetIndex],
) -> anyhow::Result<()> {
  let mut source_bundles: Vec<BundleId> = candidates
    .iter()
    .map(|root| root_bundle(ctx, *root))
    .collect::<anyhow::Result<_>>()?;
  source_bundles.sort();
  source_bundles.dedup();

  let asset_type = ctx.asset(asset_index).file_type.clone();
  let key = format!(
    "{}.{}",
    source_bundles.iter().map(|id| id.index()).join(","),
    asset_type.extension()
  );

  let shared_id = match ctx.shared_bundle_keys.get(&key) {
    Some(shared_id) => *shared_id,
    None => {
      let first_source = ctx.graph.expect_bundle(source_bundles[0])?;
      let mut shared = IdealBundle::shared(
        asset_type,
        first_source.env.clone(),
        first_source.target.clone(),
        ctx.asset_count(),
      );
      shared.source_bundles = source_bundles.iter().copied().collect();

      let shared_id = ctx.graph.create_bundle(shared);
      ctx.shared_bundle_keys.insert(key, shared_id);

      for &source in &source_bundles {
        ctx.graph.add_edge(source, shared_id);
      }

      ctx.decision(
        "placement",
        DecisionKind::SharedBundleCreated {
          bundle: shared_id,
          source_count: source_bundles.len(),
        },
      );
      shared_id
    }
  };

  ctx.add_asset_to_bundle(shared_id, asset_index, "placement")
}

/// Wires a manual shared bundle to every bundle root that reaches one of its
/// assets.
fn wire_manual_bundle(
  ctx: &mut BundlingContext<'_>,
  asset_index: AssetIndex,
) -> anyhow::Result<()> {
  let bundle_id = *ctx
    .graph
    .manual_asset_to_bundle
    .get(&asset_index)
    .context("manual asset lost its bundle")?;

  for root in ctx.live_roots(&ctx.reachable_roots[asset_index.index()]) {
    let source = root_bundle(ctx, root)?;
    if source == bundle_id {
      continue;
    }
    ctx.graph.add_edge(source, bundle_id);
    let bundle = ctx.graph.expect_bundle_mut(bundle_id)?;
    bundle.source_bundles.insert(source);
  }

  Ok(())
}

/// Places single-parent constant modules into every bundle that holds their
/// parent. Chains of constant modules settle over repeated sweeps.
fn co_place_constant_modules(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  let mut pairs: Vec<(AssetIndex, AssetIndex)> = ctx
    .constant_parents
    .iter()
    .map(|(constant, parent)| (*constant, *parent))
    .collect();
  pairs.sort();

  for _ in 0..pairs.len() {
    let mut changed = false;

    for (constant, parent) in &pairs {
      if ctx.bundles.contains_key(constant)
        || ctx.graph.manual_asset_to_bundle.contains_key(constant)
      {
        continue;
      }

      let parent_bundles: Vec<BundleId> = ctx
        .graph
        .bundle_ids()
        .into_iter()
        .filter(|id| {
          ctx
            .graph
            .bundle(*id)
            .is_some_and(|bundle| bundle.assets.contains(parent))
        })
        .collect();

      for bundle_id in parent_bundles {
        let already_placed = ctx
          .graph
          .bundle(bundle_id)
          .is_some_and(|bundle| bundle.assets.contains(constant));
        if !already_placed {
          ctx.add_asset_to_bundle(bundle_id, *constant, "placement")?;
          changed = true;
        }
      }
    }

    if !changed {
      break;
    }
  }

  Ok(())
}
