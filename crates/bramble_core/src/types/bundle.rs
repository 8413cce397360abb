use serde_repr::Deserialize_repr;
use serde_repr::Serialize_repr;

/// Overrides where the resolved asset may be placed.
#[derive(Clone, Copy, Debug, Deserialize_repr, Eq, Hash, PartialEq, Serialize_repr)]
#[repr(u8)]
pub enum BundleBehavior {
  /// The asset is inlined into its parent bundle rather than being loaded
  /// as a separate request.
  Inline = 0,
  /// The asset is placed in its own bundle group, with nothing assumed
  /// available from ancestors.
  Isolated = 1,
}

pub type MaybeBundleBehavior = Option<BundleBehavior>;
