use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use petgraph::stable_graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::Direction;

use crate::types::Asset;
use crate::types::Dependency;

#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum AssetGraphNode {
  Root,
  Asset(Arc<Asset>),
  Dependency(Arc<Dependency>),
}

pub type NodeId = usize;

/// Visitor verdict for [`AssetGraph::traverse`].
///
/// Replaces mutable "skip children" side-channels: the visitor states what
/// should happen next and the traversal obeys.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraversalControl {
  Continue,
  SkipChildren,
  Stop,
}

/// The resolved module graph handed to the bundler.
///
/// Nodes alternate between assets and dependencies: an asset's outgoing
/// neighbors are its dependencies, and a dependency's outgoing neighbors are
/// the assets it resolved to. Entry dependencies hang off the synthetic root.
#[derive(Clone, Debug)]
pub struct AssetGraph {
  graph: StableDiGraph<NodeId, ()>,
  nodes: Vec<AssetGraphNode>,
  content_key_to_node_id: HashMap<String, NodeId>,
  node_id_to_node_index: HashMap<NodeId, NodeIndex>,
  root_node_id: NodeId,
}

impl Default for AssetGraph {
  fn default() -> Self {
    Self::new()
  }
}

impl AssetGraph {
  pub fn new() -> Self {
    let mut graph = StableDiGraph::new();

    let mut node_id_to_node_index = HashMap::new();
    let nodes = vec![AssetGraphNode::Root];
    let root_node_id = 0;

    node_id_to_node_index.insert(root_node_id, graph.add_node(root_node_id));

    AssetGraph {
      graph,
      nodes,
      content_key_to_node_id: HashMap::new(),
      node_id_to_node_index,
      root_node_id,
    }
  }

  pub fn root_node(&self) -> NodeId {
    self.root_node_id
  }

  pub fn get_node(&self, idx: &NodeId) -> Option<&AssetGraphNode> {
    self.nodes.get(*idx)
  }

  fn add_node(&mut self, content_key: String, node: AssetGraphNode) -> NodeId {
    if let Some(existing_node_id) = self.content_key_to_node_id.get(&content_key) {
      return *existing_node_id;
    }

    let node_id = self.nodes.len();
    self.nodes.push(node);
    self.content_key_to_node_id.insert(content_key, node_id);

    let node_index = self.graph.add_node(node_id);
    self.node_id_to_node_index.insert(node_id, node_index);

    node_id
  }

  pub fn add_asset(&mut self, asset: Arc<Asset>) -> NodeId {
    self.add_node(asset.id.clone(), AssetGraphNode::Asset(asset))
  }

  pub fn add_dependency(&mut self, dependency: Dependency) -> NodeId {
    self.add_node(
      dependency.id(),
      AssetGraphNode::Dependency(Arc::new(dependency)),
    )
  }

  /// Adds an entry dependency, connected to the graph root so a root
  /// traversal discovers all entries.
  pub fn add_entry_dependency(&mut self, dependency: Dependency) -> NodeId {
    let dependency_idx = self.add_dependency(dependency);
    let root_node_id = self.root_node_id;
    self.add_edge(&root_node_id, &dependency_idx);
    dependency_idx
  }

  pub fn add_edge(&mut self, from_idx: &NodeId, to_idx: &NodeId) {
    if !self.has_edge(from_idx, to_idx) {
      self.graph.add_edge(
        self.node_id_to_node_index[from_idx],
        self.node_id_to_node_index[to_idx],
        (),
      );
    }
  }

  pub fn has_edge(&self, from_idx: &NodeId, to_idx: &NodeId) -> bool {
    self.graph.contains_edge(
      self.node_id_to_node_index[from_idx],
      self.node_id_to_node_index[to_idx],
    )
  }

  pub fn get_node_id_by_content_key(&self, content_key: &str) -> Option<&NodeId> {
    self.content_key_to_node_id.get(content_key)
  }

  pub fn get_asset(&self, idx: &NodeId) -> Option<&Arc<Asset>> {
    match self.get_node(idx)? {
      AssetGraphNode::Asset(asset) => Some(asset),
      _ => None,
    }
  }

  pub fn get_dependency(&self, idx: &NodeId) -> Option<&Arc<Dependency>> {
    match self.get_node(idx)? {
      AssetGraphNode::Dependency(dependency) => Some(dependency),
      _ => None,
    }
  }

  pub fn get_assets(&self) -> impl Iterator<Item = &Arc<Asset>> {
    self.nodes.iter().filter_map(|node| match node {
      AssetGraphNode::Asset(asset) => Some(asset),
      _ => None,
    })
  }

  pub fn get_dependencies(&self) -> impl Iterator<Item = &Arc<Dependency>> {
    self.nodes.iter().filter_map(|node| match node {
      AssetGraphNode::Dependency(dependency) => Some(dependency),
      _ => None,
    })
  }

  /// Outgoing neighbors in insertion order.
  pub fn get_outgoing_neighbors(&self, idx: &NodeId) -> Vec<NodeId> {
    let mut neighbors: Vec<NodeId> = self
      .graph
      .neighbors_directed(self.node_id_to_node_index[idx], Direction::Outgoing)
      .filter_map(|node_index| self.graph.node_weight(node_index).copied())
      .collect();
    // petgraph yields neighbors in reverse insertion order.
    neighbors.reverse();
    neighbors
  }

  pub fn get_incoming_neighbors(&self, idx: &NodeId) -> Vec<NodeId> {
    let mut neighbors: Vec<NodeId> = self
      .graph
      .neighbors_directed(self.node_id_to_node_index[idx], Direction::Incoming)
      .filter_map(|node_index| self.graph.node_weight(node_index).copied())
      .collect();
    neighbors.reverse();
    neighbors
  }

  /// The dependency nodes hanging off an asset.
  pub fn asset_dependencies(&self, asset_idx: &NodeId) -> Vec<NodeId> {
    self
      .get_outgoing_neighbors(asset_idx)
      .into_iter()
      .filter(|idx| self.get_dependency(idx).is_some())
      .collect()
  }

  /// The asset nodes a dependency resolved to.
  pub fn dependency_assets(&self, dep_idx: &NodeId) -> Vec<NodeId> {
    self
      .get_outgoing_neighbors(dep_idx)
      .into_iter()
      .filter(|idx| self.get_asset(idx).is_some())
      .collect()
  }

  /// The dependency nodes targeting an asset.
  pub fn incoming_dependencies(&self, asset_idx: &NodeId) -> Vec<NodeId> {
    self
      .get_incoming_neighbors(asset_idx)
      .into_iter()
      .filter(|idx| self.get_dependency(idx).is_some())
      .collect()
  }

  /// Depth-first preorder traversal from `start`.
  ///
  /// The visitor decides per node whether to descend, skip the subtree, or
  /// stop the whole traversal. Nodes are visited at most once.
  pub fn traverse<F>(&self, start: NodeId, mut visit: F)
  where
    F: FnMut(NodeId, &AssetGraphNode) -> TraversalControl,
  {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = vec![start];

    while let Some(node_id) = stack.pop() {
      if !visited.insert(node_id) {
        continue;
      }

      let Some(node) = self.get_node(&node_id) else {
        continue;
      };

      match visit(node_id, node) {
        TraversalControl::Stop => return,
        TraversalControl::SkipChildren => continue,
        TraversalControl::Continue => {}
      }

      let mut children = self.get_outgoing_neighbors(&node_id);
      children.reverse();
      for child in children {
        if !visited.contains(&child) {
          stack.push(child);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;

  use crate::types::{Asset, Dependency, Environment, FileType, Priority, Target};

  use super::*;

  fn asset(id: &str, path: &str) -> Arc<Asset> {
    Arc::new(Asset {
      id: id.into(),
      file_path: path.into(),
      file_type: FileType::Js,
      env: Arc::new(Environment::default()),
      is_bundle_splittable: true,
      ..Asset::default()
    })
  }

  #[test]
  fn entry_dependencies_are_reachable_from_root() {
    let mut graph = AssetGraph::new();

    let entry_dep = Dependency::entry("entry.js".to_string(), Target::default());
    let dep_node = graph.add_entry_dependency(entry_dep);

    let entry_asset = graph.add_asset(asset("a", "entry.js"));
    graph.add_edge(&dep_node, &entry_asset);

    let mut seen = Vec::new();
    graph.traverse(graph.root_node(), |node_id, _| {
      seen.push(node_id);
      TraversalControl::Continue
    });

    assert_eq!(seen, vec![graph.root_node(), dep_node, entry_asset]);
  }

  #[test]
  fn skip_children_prunes_a_subtree() {
    let mut graph = AssetGraph::new();

    let entry_dep = Dependency::entry("entry.js".to_string(), Target::default());
    let dep_node = graph.add_entry_dependency(entry_dep);
    let entry_asset = graph.add_asset(asset("a", "entry.js"));
    graph.add_edge(&dep_node, &entry_asset);

    let mut lazy_dep = Dependency::new("./lazy.js".to_string(), Arc::new(Environment::default()));
    lazy_dep.priority = Priority::Lazy;
    lazy_dep.source_asset_id = Some("a".into());
    let lazy_dep_node = graph.add_dependency(lazy_dep);
    graph.add_edge(&entry_asset, &lazy_dep_node);

    let lazy_asset = graph.add_asset(asset("b", "lazy.js"));
    graph.add_edge(&lazy_dep_node, &lazy_asset);

    let mut seen = Vec::new();
    graph.traverse(graph.root_node(), |node_id, node| {
      seen.push(node_id);
      if matches!(node, AssetGraphNode::Dependency(dep) if dep.priority == Priority::Lazy) {
        TraversalControl::SkipChildren
      } else {
        TraversalControl::Continue
      }
    });

    assert!(seen.contains(&lazy_dep_node));
    assert!(!seen.contains(&lazy_asset));
  }

  #[test]
  fn incoming_dependencies_resolve_referencing_edges() {
    let mut graph = AssetGraph::new();

    let entry_dep = Dependency::entry("entry.js".to_string(), Target::default());
    let dep_node = graph.add_entry_dependency(entry_dep);
    let entry_asset = graph.add_asset(asset("a", "entry.js"));
    graph.add_edge(&dep_node, &entry_asset);

    assert_eq!(graph.incoming_dependencies(&entry_asset), vec![dep_node]);
    assert_eq!(graph.dependency_assets(&dep_node), vec![entry_asset]);
  }
}
