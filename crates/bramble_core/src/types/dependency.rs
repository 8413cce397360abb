use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use derive_builder::Builder;
use serde::Deserialize;
use serde::Serialize;
use serde_repr::Deserialize_repr;
use serde_repr::Serialize_repr;

use crate::hash::IdentifierHasher;
use crate::types::AssetId;

use super::bundle::MaybeBundleBehavior;
use super::environment::Environment;
use super::target::Target;

pub fn create_dependency_id(
  source_asset_id: Option<&AssetId>,
  specifier: &str,
  environment_id: &str,
  target: Option<&Target>,
  specifier_type: &SpecifierType,
  bundle_behavior: &MaybeBundleBehavior,
  priority: &Priority,
) -> String {
  let mut hasher = IdentifierHasher::new();

  source_asset_id.hash(&mut hasher);
  specifier.hash(&mut hasher);
  environment_id.hash(&mut hasher);
  target.hash(&mut hasher);
  specifier_type.hash(&mut hasher);
  bundle_behavior.hash(&mut hasher);
  priority.hash(&mut hasher);

  format!("{:016x}", hasher.finish())
}

/// A dependency denotes a connection between two assets
#[derive(Hash, PartialEq, Clone, Debug, Default, Builder, Deserialize, Serialize)]
#[builder(default, setter(into))]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
  /// Controls the behavior of the bundle the resolved asset is placed into
  ///
  /// This option is used in combination with priority to determine when the
  /// bundle is loaded.
  pub bundle_behavior: MaybeBundleBehavior,

  /// The environment of the dependency
  pub env: Arc<Environment>,

  /// Determines when the dependency should be loaded
  pub priority: Priority,

  /// The id of the asset with this dependency
  pub source_asset_id: Option<AssetId>,

  /// The import or export specifier that connects two assets together
  pub specifier: String,

  /// How the specifier should be interpreted
  pub specifier_type: SpecifierType,

  /// The target associated with an entry, if any
  #[serde(default)]
  pub target: Option<Box<Target>>,

  /// Whether the dependency is an entry
  pub is_entry: bool,

  /// Whether the dependency is optional
  ///
  /// If an optional dependency cannot be resolved, it will not fail the build.
  pub is_optional: bool,

  /// Indicates that the name should be stable over time, even when the
  /// content of the bundle changes
  ///
  /// When the dependency is a bundle entry (priority is "parallel" or
  /// "lazy"), this controls the naming of that bundle. Useful for service
  /// workers or RSS feeds, where the URL must remain consistent over time.
  pub needs_stable_name: bool,
}

impl Dependency {
  pub fn id(&self) -> String {
    create_dependency_id(
      self.source_asset_id.as_ref(),
      &self.specifier,
      &self.env.id(),
      self.target.as_deref(),
      &self.specifier_type,
      &self.bundle_behavior,
      &self.priority,
    )
  }

  pub fn entry(entry: String, target: Target) -> Dependency {
    Dependency {
      env: target.env.clone(),
      is_entry: true,
      needs_stable_name: true,
      specifier: entry,
      specifier_type: SpecifierType::Url,
      target: Some(Box::new(target)),
      ..Dependency::default()
    }
  }

  pub fn new(specifier: String, env: Arc<Environment>) -> Dependency {
    Dependency {
      env,
      specifier,
      ..Dependency::default()
    }
  }
}

/// Determines when a dependency should load
#[derive(Clone, Copy, Debug, Deserialize_repr, Eq, Hash, PartialEq, Serialize_repr)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
#[derive(Default)]
pub enum Priority {
  /// Resolves the dependency synchronously, placing the resolved asset in
  /// the same bundle as the parent or another bundle that is already on the
  /// page
  #[default]
  Sync = 0,
  /// Places the dependency in a separate bundle loaded in parallel with the
  /// current bundle
  Parallel = 1,
  /// The dependency should be placed in a separate bundle that is loaded
  /// later
  Lazy = 2,
  /// The dependency should be placed in a separate bundle that is loaded
  /// conditionally
  Conditional = 3,
}

/// The type of the import specifier
#[derive(Clone, Copy, Debug, Deserialize_repr, Eq, Hash, PartialEq, Serialize_repr)]
#[repr(u8)]
#[derive(Default)]
pub enum SpecifierType {
  /// An ES Module specifier
  #[default]
  Esm = 0,

  /// A CommonJS specifier
  CommonJS = 1,

  /// A URL that works as in a browser
  Url = 2,
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn dependency_ids_depend_on_priority() {
    let sync_dep = DependencyBuilder::default()
      .specifier("./shared.js".to_string())
      .priority(Priority::Sync)
      .build()
      .unwrap();

    let lazy_dep = DependencyBuilder::default()
      .specifier("./shared.js".to_string())
      .priority(Priority::Lazy)
      .build()
      .unwrap();

    assert_ne!(sync_dep.id(), lazy_dep.id());
    assert_eq!(sync_dep.id(), sync_dep.id());
  }

  #[test]
  fn entry_dependencies_are_stable_named() {
    let dep = Dependency::entry("entry.js".to_string(), Target::default());
    assert!(dep.is_entry);
    assert!(dep.needs_stable_name);
    assert!(dep.target.is_some());
  }
}
