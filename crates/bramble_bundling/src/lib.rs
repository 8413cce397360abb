pub mod config;
pub mod ideal_graph;
pub mod priority_queue;

use anyhow::Context;
use thiserror::Error;
use tracing::debug;

use bramble_core::asset_graph::AssetGraph;
use bramble_core::diagnostic::Diagnostic;

pub use crate::config::BundlingConfig;
pub use crate::ideal_graph::types::IdealGraph;
pub use crate::ideal_graph::types::IdealGraphBuildStats;

/// Errors that are the user's to fix, as opposed to internal invariant
/// failures which surface as plain `anyhow` errors.
#[derive(Debug, Error)]
pub enum BundlingError {
  #[error("{0}")]
  Diagnostic(Diagnostic),
}

/// Bundler algorithms take an asset graph and assign assets to bundles.
pub trait Bundler {
  fn bundle(&self, asset_graph: &AssetGraph) -> anyhow::Result<IdealGraph>;
}

/// The ideal-bundle-graph bundler.
///
/// Each invocation owns all of its graphs, bitsets and caches; independent
/// invocations may run concurrently.
#[derive(Debug, Default)]
pub struct IdealGraphBundler {
  config: BundlingConfig,
}

impl IdealGraphBundler {
  pub fn new(config: BundlingConfig) -> anyhow::Result<Self> {
    config.validate().context("invalid bundling config")?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &BundlingConfig {
    &self.config
  }

  pub fn build_ideal_graph(
    &self,
    asset_graph: &AssetGraph,
  ) -> anyhow::Result<(IdealGraph, IdealGraphBuildStats)> {
    ideal_graph::build_ideal_graph(asset_graph, &self.config)
      .context("building the ideal bundle graph")
  }
}

impl Bundler for IdealGraphBundler {
  fn bundle(&self, asset_graph: &AssetGraph) -> anyhow::Result<IdealGraph> {
    let (graph, stats) = self.build_ideal_graph(asset_graph)?;

    debug!(
      assets = stats.assets,
      dependencies = stats.dependencies,
      bundles = stats.bundles,
      "ideal graph bundling finished"
    );

    Ok(graph)
  }
}
