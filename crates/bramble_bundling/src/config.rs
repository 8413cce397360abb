use std::collections::HashSet;

use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;

/// Resolved bundler configuration.
///
/// Validation happens eagerly via [`BundlingConfig::validate`] so the graph
/// algorithm never observes malformed settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundlingConfig {
  /// An asset reachable from more than this many bundles is extracted into a
  /// shared bundle; at or below it, the asset is duplicated.
  pub min_bundles: usize,

  /// Shared bundles smaller than this (in bytes) are dissolved back into
  /// their source bundles.
  pub min_bundle_size: u64,

  /// Maximum number of non-inline bundles a bundle group may fetch at once.
  pub max_parallel_requests: usize,

  /// Disables shared bundle synthesis entirely; assets are duplicated
  /// instead.
  pub disable_shared_bundles: bool,

  /// Load conditional bundles together with their referencing bundle group
  /// rather than on demand.
  pub load_conditional_bundles_in_parallel: bool,

  /// Manually configured shared bundles, matched by file path glob.
  pub manual_shared_bundles: Vec<ManualSharedBundle>,

  /// Optional similarity-driven shared bundle merging.
  pub similarity_merge: Option<SimilarityMergeConfig>,

  /// Optional overfetch-scored async bundle merging.
  pub async_merge: Option<AsyncMergeConfig>,
}

impl Default for BundlingConfig {
  fn default() -> Self {
    Self {
      min_bundles: 1,
      min_bundle_size: 30_000,
      max_parallel_requests: 6,
      disable_shared_bundles: false,
      load_conditional_bundles_in_parallel: false,
      manual_shared_bundles: Vec::new(),
      similarity_merge: None,
      async_merge: None,
    }
  }
}

impl BundlingConfig {
  pub fn validate(&self) -> anyhow::Result<()> {
    let mut names: HashSet<&str> = HashSet::new();
    for manual in &self.manual_shared_bundles {
      if manual.name.is_empty() {
        return Err(anyhow!("manual shared bundle requires a name"));
      }
      if !names.insert(manual.name.as_str()) {
        return Err(anyhow!(
          "duplicate manual shared bundle name: {}",
          manual.name
        ));
      }
      if manual.assets.is_empty() {
        return Err(anyhow!(
          "manual shared bundle {} requires at least one asset glob",
          manual.name
        ));
      }
      if manual.split == Some(0) {
        return Err(anyhow!(
          "manual shared bundle {} has a split factor of zero",
          manual.name
        ));
      }
    }

    if let Some(similarity) = &self.similarity_merge {
      if !(0.0..=1.0).contains(&similarity.source_overlap_threshold) {
        return Err(anyhow!(
          "similarityMerge.sourceOverlapThreshold must be within [0, 1], got {}",
          similarity.source_overlap_threshold
        ));
      }
    }

    if let Some(async_merge) = &self.async_merge {
      if async_merge.max_overfetch_bytes == 0 {
        return Err(anyhow!("asyncMerge.maxOverfetchBytes must be non-zero"));
      }
      for (name, weight) in [
        ("parentWeight", async_merge.parent_weight),
        ("sizeWeight", async_merge.size_weight),
        ("overfetchWeight", async_merge.overfetch_weight),
      ] {
        if weight < 0.0 || !weight.is_finite() {
          return Err(anyhow!("asyncMerge.{name} must be a non-negative number"));
        }
      }
    }

    Ok(())
  }
}

/// A manually configured shared bundle.
///
/// Assets whose project-relative file path matches one of the globs (and the
/// optional `types` filter) are routed into a single named bundle instead of
/// going through automatic placement.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualSharedBundle {
  pub name: String,

  /// Glob patterns matched against asset file paths.
  pub assets: Vec<String>,

  /// Restricts matching to assets of these types (file extensions).
  #[serde(default)]
  pub types: Option<Vec<String>>,

  /// Restricts matching to assets reachable from this file.
  ///
  /// When the root file is absent from the asset graph the rule is skipped
  /// with a warning.
  #[serde(default)]
  pub root: Option<String>,

  /// Partitions matched assets into this many bundles, keyed by a stable
  /// hash of the asset id, to spread parallel loads.
  #[serde(default)]
  pub split: Option<u32>,
}

/// How merged bundles combine their internalized-asset sets.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeInternalization {
  /// Only assets internalized on every side stay internalized.
  #[default]
  Intersection,
  Union,
}

/// Parameters for the similarity-based shared bundle merge pass.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimilarityMergeConfig {
  /// Minimum source-bundle overlap ratio (|intersection| / |union|) for a
  /// pair of shared bundles to become merge candidates.
  pub source_overlap_threshold: f64,

  /// Candidate pairs whose combined size exceeds this are not merged.
  pub max_merged_size: u64,

  /// Candidate pairs must share at least this many source bundles.
  pub min_common_source_bundles: usize,

  pub internalization: MergeInternalization,
}

impl Default for SimilarityMergeConfig {
  fn default() -> Self {
    Self {
      source_overlap_threshold: 0.75,
      max_merged_size: 150_000,
      min_common_source_bundles: 1,
      internalization: MergeInternalization::default(),
    }
  }
}

/// Parameters for the async bundle merge pass.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AsyncMergeConfig {
  /// Async bundle roots larger than this are never merge candidates.
  pub max_candidate_size: u64,

  /// Minimum weighted score for a pair to be merged.
  pub score_threshold: f64,

  /// Weight of the shared-parent overlap ratio.
  pub parent_weight: f64,

  /// Weight of the bundle-group size-overlap ratio.
  pub size_weight: f64,

  /// Weight of the (penalizing) normalized overfetch term.
  pub overfetch_weight: f64,

  /// Overfetch normalization ceiling in bytes; merges that would newly load
  /// this many bytes score the full penalty.
  pub max_overfetch_bytes: u64,
}

impl Default for AsyncMergeConfig {
  fn default() -> Self {
    Self {
      max_candidate_size: 100_000,
      score_threshold: 0.5,
      parent_weight: 0.5,
      size_weight: 0.5,
      overfetch_weight: 1.0,
      max_overfetch_bytes: 50_000,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manual(name: &str) -> ManualSharedBundle {
    ManualSharedBundle {
      name: name.to_string(),
      assets: vec!["**/vendor/**".to_string()],
      types: None,
      root: None,
      split: None,
    }
  }

  #[test]
  fn default_config_is_valid() {
    assert!(BundlingConfig::default().validate().is_ok());
  }

  #[test]
  fn duplicate_manual_names_are_rejected() {
    let config = BundlingConfig {
      manual_shared_bundles: vec![manual("vendor"), manual("vendor")],
      ..BundlingConfig::default()
    };

    let error = config.validate().unwrap_err();
    assert!(error.to_string().contains("duplicate manual shared bundle"));
  }

  #[test]
  fn zero_split_is_rejected() {
    let mut rule = manual("vendor");
    rule.split = Some(0);
    let config = BundlingConfig {
      manual_shared_bundles: vec![rule],
      ..BundlingConfig::default()
    };

    assert!(config.validate().is_err());
  }

  #[test]
  fn out_of_range_similarity_threshold_is_rejected() {
    let config = BundlingConfig {
      similarity_merge: Some(SimilarityMergeConfig {
        source_overlap_threshold: 1.5,
        ..SimilarityMergeConfig::default()
      }),
      ..BundlingConfig::default()
    };

    assert!(config.validate().is_err());
  }

  #[test]
  fn config_deserializes_from_camel_case() {
    let config: BundlingConfig = serde_json::from_str(
      r#"{
        "minBundles": 2,
        "minBundleSize": 10000,
        "maxParallelRequests": 8,
        "manualSharedBundles": [
          {"name": "vendor", "assets": ["node_modules/**"], "split": 3}
        ]
      }"#,
    )
    .unwrap();

    assert_eq!(config.min_bundles, 2);
    assert_eq!(config.min_bundle_size, 10_000);
    assert_eq!(config.max_parallel_requests, 8);
    assert_eq!(config.manual_shared_bundles[0].split, Some(3));
    assert!(config.validate().is_ok());
  }
}
