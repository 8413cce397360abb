use xxhash_rust::xxh3::Xxh3;
use xxhash_rust::xxh3::xxh3_64;

/// Bramble needs a hasher for generating certain identifiers used in the
/// bundle graph.
///
/// The hashes don't need to be incredibly fast, but they should be stable
/// across runs, machines, platforms and versions.
pub type IdentifierHasher = Xxh3;

pub fn hash_string(s: String) -> String {
  hash_bytes(s.as_bytes())
}

pub fn hash_bytes(s: &[u8]) -> String {
  let res = xxh3_64(s);
  format!("{:016x}", res)
}

/// Stable numeric hash used for partitioning (e.g. manual shared bundle
/// `split` factors).
pub fn hash_to_u64(s: &str) -> u64 {
  xxh3_64(s.as_bytes())
}
