use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bramble_bundling::config::BundlingConfig;
use bramble_bundling::Bundler;
use bramble_bundling::IdealGraphBundler;
use bramble_core::asset_graph::AssetGraph;
use bramble_core::types::{
  Asset, AssetStats, Dependency, DependencyBuilder, Environment, FileType, Priority,
  SpecifierType, Target,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{prelude::SliceRandom, rngs::StdRng, Rng, SeedableRng};

/// Parameters controlling the synthetic graph shape.
///
/// The generator is layered to resemble a real application:
///
/// - Layer 0: entry assets
/// - Layer 1: route modules (lazy deps from entries)
/// - Layer 2: component modules (sync deps from routes)
/// - Layer 3: shared utility modules (sync deps from many components)
/// - Plus: some components import CSS (sync deps with a type change)
#[derive(Debug, Clone, Copy)]
struct GraphConfig {
  num_entries: usize,
  num_routes: usize,
  num_components: usize,
  num_utils: usize,
  /// Fraction of components that import a CSS sibling (0.0 - 1.0).
  css_ratio: f64,
  seed: u64,
}

fn kind_tag(kind: &str) -> u8 {
  match kind {
    "entry" => 0x01,
    "route" => 0x02,
    "component" => 0x03,
    "util" => 0x04,
    "styles" => 0x05,
    _ => 0x0f,
  }
}

/// Returns `(asset_id_hex, file_path)`.
fn make_ids(kind: &str, idx: usize, file_type: &FileType) -> (String, String) {
  let file_path = format!("{kind}-{idx}.{}", file_type.extension());
  let asset_id = format!("{:02x}{:030x}", kind_tag(kind), idx);
  (asset_id, file_path)
}

fn create_asset(id: String, file_path: String, file_type: FileType, size: u32) -> Asset {
  Asset {
    id,
    file_path: file_path.into(),
    file_type,
    env: Arc::new(Environment::default()),
    is_bundle_splittable: true,
    stats: AssetStats { size },
    ..Asset::default()
  }
}

fn add_edge_with_dep(
  asset_graph: &mut AssetGraph,
  asset_nodes: &HashMap<String, usize>,
  from_asset_id: &str,
  to_asset_id: &str,
  specifier: String,
  priority: Priority,
) {
  let dep = DependencyBuilder::default()
    .specifier(specifier)
    .specifier_type(SpecifierType::Esm)
    .env(Arc::new(Environment::default()))
    .priority(priority)
    .source_asset_id(from_asset_id.to_string())
    .build()
    .expect("valid dependency");

  let dep_node = asset_graph.add_dependency(dep);
  asset_graph.add_edge(&asset_nodes[from_asset_id], &dep_node);
  asset_graph.add_edge(&dep_node, &asset_nodes[to_asset_id]);
}

/// Generates a deterministic synthetic asset graph.
fn generate_asset_graph(cfg: GraphConfig) -> AssetGraph {
  assert!(cfg.num_entries > 0, "need at least one entry");

  let mut rng = StdRng::seed_from_u64(cfg.seed);
  let mut asset_graph = AssetGraph::new();
  let mut asset_nodes: HashMap<String, usize> = HashMap::new();

  let mut entry_ids = Vec::with_capacity(cfg.num_entries);
  for i in 0..cfg.num_entries {
    let (asset_id, file_path) = make_ids("entry", i, &FileType::Js);
    let entry_dep = Dependency::entry(file_path.clone(), Target::default());
    let entry_dep_node = asset_graph.add_entry_dependency(entry_dep);

    let node = asset_graph.add_asset(Arc::new(create_asset(
      asset_id.clone(),
      file_path,
      FileType::Js,
      rng.gen_range(500..5_000),
    )));
    asset_graph.add_edge(&entry_dep_node, &node);
    asset_nodes.insert(asset_id.clone(), node);
    entry_ids.push(asset_id);
  }

  let mut layer = |kind: &str, count: usize, file_type: FileType, rng: &mut StdRng| {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
      let (asset_id, file_path) = make_ids(kind, i, &file_type);
      let node = asset_graph.add_asset(Arc::new(create_asset(
        asset_id.clone(),
        file_path,
        file_type.clone(),
        rng.gen_range(200..20_000),
      )));
      asset_nodes.insert(asset_id.clone(), node);
      ids.push(asset_id);
    }
    ids
  };

  let route_ids = layer("route", cfg.num_routes, FileType::Js, &mut rng);
  let component_ids = layer("component", cfg.num_components, FileType::Js, &mut rng);
  let util_ids = layer("util", cfg.num_utils, FileType::Js, &mut rng);
  let css_count = ((cfg.num_components as f64) * cfg.css_ratio).round() as usize;
  let css_ids = layer("styles", css_count, FileType::Css, &mut rng);

  // Entries lazily import a handful of routes each.
  let routes_per_entry = 5usize.min(route_ids.len()).max(1);
  for entry in &entry_ids {
    for route in route_ids.choose_multiple(&mut rng, routes_per_entry) {
      add_edge_with_dep(
        &mut asset_graph,
        &asset_nodes,
        entry,
        route,
        format!("./{route}"),
        Priority::Lazy,
      );
    }
  }

  // Routes sync-import components.
  let components_per_route = 4usize.min(component_ids.len()).max(1);
  for route in &route_ids {
    for component in component_ids.choose_multiple(&mut rng, components_per_route) {
      add_edge_with_dep(
        &mut asset_graph,
        &asset_nodes,
        route,
        component,
        format!("./{component}"),
        Priority::Sync,
      );
    }
  }

  // Components sync-import shared utilities.
  let utils_per_component = 3usize.min(util_ids.len()).max(1);
  for component in &component_ids {
    for util in util_ids.choose_multiple(&mut rng, utils_per_component) {
      add_edge_with_dep(
        &mut asset_graph,
        &asset_nodes,
        component,
        util,
        format!("./{util}"),
        Priority::Sync,
      );
    }
  }

  // Some components import CSS, creating type-change boundaries.
  for (component, css) in component_ids.iter().zip(css_ids.iter()) {
    add_edge_with_dep(
      &mut asset_graph,
      &asset_nodes,
      component,
      css,
      format!("./{css}"),
      Priority::Sync,
    );
  }

  asset_graph
}

fn bundling_benchmark(c: &mut Criterion) {
  let mut group = c.benchmark_group("ideal_graph_bundling");
  group.measurement_time(Duration::from_secs(10));

  for (name, cfg) in [
    (
      "small",
      GraphConfig {
        num_entries: 1,
        num_routes: 10,
        num_components: 40,
        num_utils: 10,
        css_ratio: 0.2,
        seed: 1,
      },
    ),
    (
      "medium",
      GraphConfig {
        num_entries: 2,
        num_routes: 50,
        num_components: 400,
        num_utils: 60,
        css_ratio: 0.2,
        seed: 2,
      },
    ),
    (
      "large",
      GraphConfig {
        num_entries: 4,
        num_routes: 200,
        num_components: 2_000,
        num_utils: 250,
        css_ratio: 0.15,
        seed: 3,
      },
    ),
  ] {
    let asset_graph = generate_asset_graph(cfg);
    let bundler = IdealGraphBundler::new(BundlingConfig::default()).expect("valid config");

    group.bench_with_input(BenchmarkId::new("bundle", name), &asset_graph, |b, graph| {
      b.iter(|| {
        let ideal = bundler.bundle(black_box(graph)).expect("bundling succeeds");
        black_box(ideal);
      })
    });
  }

  group.finish();
}

criterion_group!(benches, bundling_benchmark);
criterion_main!(benches);
