//! Ideal bundle graph construction.
//!
//! The algorithm runs as explicit phases over one [`context::BundlingContext`]:
//!
//! 1. [`builder`] walks the asset graph once, creating entry bundles and
//!    bundle roots at dependency-priority and behavior boundaries.
//! 2. [`reachability`] computes per-asset reachable roots and per-root
//!    ancestor availability with fixed-size bitsets, then internalizes lazy
//!    bundles that every parent already guarantees.
//! 3. [`placement`] assigns every remaining asset: unconditionally into
//!    entry-like bundles, by reusing an existing bundle, into a synthesized
//!    shared bundle, or duplicated below the sharing threshold.
//! 4. [`merging`] prunes undersized shared bundles, enforces the parallel
//!    request limit per bundle group, and optionally runs the similarity and
//!    async merge heuristics.

pub mod builder;
pub mod clustering;
pub mod context;
pub mod merging;
pub mod placement;
pub mod reachability;
pub mod types;


use tracing::instrument;

use bramble_core::asset_graph::AssetGraph;

use crate::config::BundlingConfig;

use self::context::BundlingContext;
use self::types::IdealGraph;
use self::types::IdealGraphBuildStats;

/// Runs the full bundling pipeline for one invocation.
///
/// The whole pass either completes or fails; no partial graph is ever
/// returned as if it were valid.
#[instrument(level = "debug", skip_all)]
pub fn build_ideal_graph(
  asset_graph: &AssetGraph,
  config: &BundlingConfig,
) -> anyhow::Result<(IdealGraph, IdealGraphBuildStats)> {
  let dependencies = asset_graph.get_dependencies().count();

  let mut ctx = BundlingContext::new(asset_graph, config);

  builder::create_bundles(&mut ctx)?;
  reachability::compute_reachability(&mut ctx)?;
  reachability::compute_ancestor_availability(&mut ctx)?;
  reachability::internalize_async_bundles(&mut ctx)?;
  placement::place_assets(&mut ctx)?;
  merging::merge_bundles(&mut ctx)?;

  ctx.finish(dependencies)
}
