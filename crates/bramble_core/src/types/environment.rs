use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::hash::IdentifierHasher;

pub type EnvironmentRef = Arc<Environment>;

/// The environment the built code will run in
///
/// Bundles may only reference each other when their environments share an
/// execution context, so this participates in bundle-root graph edges.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
  /// The environment the output should run in
  pub context: EnvironmentContext,

  /// Whether this is a library build
  ///
  /// Library targets are bundled as a single unit for consumption by another
  /// tool rather than split for a browser.
  pub is_library: bool,

  /// Determines what type of module to output
  pub output_format: OutputFormat,

  pub source_type: SourceType,
}

impl Environment {
  pub fn id(&self) -> String {
    let mut hasher = IdentifierHasher::new();
    self.context.hash(&mut hasher);
    self.is_library.hash(&mut hasher);
    self.output_format.hash(&mut hasher);
    self.source_type.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
  }
}

/// The environment the output should run in
///
/// This informs bramble what environment-specific APIs are available.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentContext {
  #[default]
  Browser,
  Node,
  ServiceWorker,
  WebWorker,
  Worklet,
}

impl EnvironmentContext {
  pub fn is_node(&self) -> bool {
    matches!(self, EnvironmentContext::Node)
  }

  pub fn is_browser(&self) -> bool {
    use EnvironmentContext::*;
    matches!(self, Browser | WebWorker | ServiceWorker | Worklet)
  }

  pub fn is_worker(&self) -> bool {
    use EnvironmentContext::*;
    matches!(self, WebWorker | ServiceWorker)
  }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
  #[default]
  Global,
  #[serde(rename = "commonjs")]
  CommonJS,
  #[serde(rename = "esmodule")]
  EsModule,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SourceType {
  #[default]
  #[serde(rename = "module")]
  Module,
  #[serde(rename = "script")]
  Script,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn environment_ids_are_stable_per_value() {
    let a = Environment::default();
    let b = Environment::default();
    assert_eq!(a.id(), b.id());

    let node = Environment {
      context: EnvironmentContext::Node,
      output_format: OutputFormat::CommonJS,
      ..Environment::default()
    };
    assert_ne!(a.id(), node.id());
  }
}
