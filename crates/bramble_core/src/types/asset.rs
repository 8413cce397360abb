use std::hash::Hash;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::hash::IdentifierHasher;

use super::bundle::MaybeBundleBehavior;
use super::environment::Environment;
use super::file_type::FileType;

pub type AssetId = String;

#[derive(Debug)]
pub struct CreateAssetIdParams<'a> {
  pub environment_id: &'a str,
  /// All paths should be normalized to a project relative string to generate
  /// a consistent hash.
  pub file_path: &'a str,
  pub file_type: &'a FileType,
  pub query: Option<&'a str>,
}

pub fn create_asset_id(params: CreateAssetIdParams<'_>) -> String {
  tracing::debug!(?params, "Creating asset id");

  let CreateAssetIdParams {
    environment_id,
    file_path,
    file_type,
    query,
  } = params;

  let mut hasher = IdentifierHasher::default();

  environment_id.hash(&mut hasher);
  file_path.hash(&mut hasher);
  query.hash(&mut hasher);
  file_type.hash(&mut hasher);

  format!("{:016x}", hasher.finish())
}

/// An asset is a compilation unit produced by the upstream asset graph
///
/// The bundler never mutates assets; it only decides which bundles they are
/// placed into.
#[derive(Default, PartialEq, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
  /// The main identity hash for the asset. It is consistent for the entire
  /// build and between builds.
  pub id: AssetId,

  /// Controls which bundle the asset is placed into
  pub bundle_behavior: MaybeBundleBehavior,

  /// The environment of the asset
  pub env: Arc<Environment>,

  /// The file path to the asset
  pub file_path: PathBuf,

  /// The file type of the asset, which may change during transformation
  #[serde(rename = "type")]
  pub file_type: FileType,

  /// Indicates if the asset is used as a bundle entry
  ///
  /// This controls whether a bundle can be split into multiple, or whether
  /// all of the dependencies must be placed in a single bundle.
  pub is_bundle_splittable: bool,

  /// True if this is a 'constant module', meaning it only exports constant
  /// assignment statements. Constant modules reachable from a single parent
  /// are always co-placed with that parent instead of being shared.
  pub is_constant_module: bool,

  /// Whether this asset can be omitted if none of its exports are being used
  pub side_effects: bool,

  /// Statistics about the asset
  pub stats: AssetStats,
}

impl Asset {
  /// Byte size of the asset's transformed output.
  pub fn size(&self) -> u64 {
    u64::from(self.stats.size)
  }
}

/// Statistics that pertain to an asset
#[derive(PartialEq, Eq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct AssetStats {
  pub size: u32,
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn create_asset_id_is_stable_for_equal_inputs() {
    let env_id = Environment::default().id();
    let params = |query| CreateAssetIdParams {
      environment_id: &env_id,
      file_path: "src/main.js",
      file_type: &FileType::Js,
      query,
    };

    assert_eq!(create_asset_id(params(None)), create_asset_id(params(None)));
    assert_ne!(
      create_asset_id(params(None)),
      create_asset_id(params(Some("worker")))
    );
  }
}
