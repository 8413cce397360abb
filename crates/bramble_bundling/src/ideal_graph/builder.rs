use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use anyhow::ensure;
use fixedbitset::FixedBitSet;
use glob_match::glob_match;
use tracing::debug;
use tracing::instrument;

use bramble_core::asset_graph::NodeId;
use bramble_core::diagnostic::Diagnostic;
use bramble_core::hash::hash_to_u64;
use bramble_core::types::BundleBehavior;
use bramble_core::types::Dependency;
use bramble_core::types::FileType;
use bramble_core::types::Priority;
use bramble_core::types::Target;

use crate::BundlingError;

use super::context::BundlingContext;
use super::context::BundleRootInfo;
use super::context::ResolvedManualRule;
use super::types::AssetIndex;
use super::types::BundleId;
use super::types::DecisionKind;
use super::types::IdealBundle;

/// One stack frame of the bundle-group traversal.
///
/// Mirrors the recursion of the asset graph walk: each frame knows which
/// bundle group it is inside and which bundle references the asset.
#[derive(Clone, Debug)]
struct Frame {
  node: NodeId,
  group_root: AssetIndex,
  group_bundle: BundleId,
  referencing_bundle: BundleId,
  target: Target,
}

/// Creates entry bundles and all bundle-root boundaries in a single pass
/// over the asset graph.
#[instrument(level = "debug", skip_all)]
pub fn create_bundles(ctx: &mut BundlingContext<'_>) -> anyhow::Result<()> {
  resolve_manual_rules(ctx);
  collect_constant_parents(ctx);

  let entries = extract_entries(ctx)?;
  ensure!(!entries.is_empty(), "asset graph had no entry assets");

  let mut entry_frames: Vec<Frame> = Vec::new();

  for (entry_index, entry_dep) in entries.iter() {
    let target = entry_dep
      .target
      .as_deref()
      .cloned()
      .context("entry dependency missing a target")?;

    let bundle_id = match ctx.bundles.get(entry_index) {
      Some(bundle_id) => *bundle_id,
      None => {
        let asset = ctx.asset(*entry_index).clone();
        let bundle = IdealBundle::from_root(
          *entry_index,
          &asset,
          target.clone(),
          entry_dep.needs_stable_name,
          asset.bundle_behavior,
          ctx.asset_count(),
        );
        let bundle_id = ctx.graph.create_bundle(bundle);
        let root = ctx.graph.root;
        ctx.graph.add_edge(root, bundle_id);
        ctx.graph.bundle_group_roots.insert(bundle_id);
        ctx.bundles.insert(*entry_index, bundle_id);
        ctx.bundle_roots.insert(
          *entry_index,
          BundleRootInfo {
            bundle: bundle_id,
            group: bundle_id,
          },
        );
        ctx.entries.insert(*entry_index);
        ctx.decision(
          "boundaries",
          DecisionKind::EntryBundleCreated {
            bundle: bundle_id,
            root_asset: *entry_index,
          },
        );
        bundle_id
      }
    };

    ctx
      .graph
      .dependency_bundles
      .entry(entry_dep.id())
      .or_default()
      .push((Priority::Sync, bundle_id));

    entry_frames.push(Frame {
      node: ctx.graph.assets.node_id(*entry_index),
      group_root: *entry_index,
      group_bundle: bundle_id,
      referencing_bundle: bundle_id,
      target,
    });
  }

  let mut stack: Vec<Frame> = entry_frames.into_iter().rev().collect();
  let mut visited: HashSet<NodeId> = HashSet::new();

  while let Some(frame) = stack.pop() {
    if !visited.insert(frame.node) {
      continue;
    }

    let Some(asset) = ctx.asset_graph.get_asset(&frame.node).cloned() else {
      continue;
    };
    let Some(asset_index) = ctx.graph.assets.index_of(&asset.id) else {
      continue;
    };

    assign_manual_bundle(ctx, asset_index, &frame.target)?;

    let mut child_frames: Vec<Frame> = Vec::new();

    for dep_node in ctx.asset_graph.asset_dependencies(&frame.node) {
      let Some(dep) = ctx.asset_graph.get_dependency(&dep_node).cloned() else {
        continue;
      };

      for target_node in ctx.asset_graph.dependency_assets(&dep_node) {
        let Some(child_asset) = ctx.asset_graph.get_asset(&target_node).cloned() else {
          continue;
        };
        let Some(child_index) = ctx.graph.assets.index_of(&child_asset.id) else {
          continue;
        };

        let behavior = dep.bundle_behavior.or(child_asset.bundle_behavior);
        let isolated = behavior == Some(BundleBehavior::Isolated);

        if dep.priority == Priority::Lazy || dep.priority == Priority::Conditional || isolated {
          if isolated && frame.target.env.is_library {
            return Err(
              BundlingError::Diagnostic(
                Diagnostic::error(format!(
                  "{} cannot be isolated inside the library target {}",
                  child_asset.file_path.display(),
                  frame.target.name,
                ))
                .with_origin("bramble_bundling")
                .with_hint("library targets emit a single unit and cannot isolate bundles"),
              )
              .into(),
            );
          }

          let bundle_id = match ctx.bundles.get(&child_index) {
            Some(bundle_id) => *bundle_id,
            None => {
              let bundle = IdealBundle::from_root(
                child_index,
                &child_asset,
                frame.target.clone(),
                dep.needs_stable_name,
                behavior,
                ctx.asset_count(),
              );
              let bundle_id = ctx.graph.create_bundle(bundle);
              let root = ctx.graph.root;
              ctx.graph.add_edge(root, bundle_id);
              ctx.graph.bundle_group_roots.insert(bundle_id);
              ctx.bundles.insert(child_index, bundle_id);
              ctx.bundle_roots.insert(
                child_index,
                BundleRootInfo {
                  bundle: bundle_id,
                  group: bundle_id,
                },
              );
              ctx.decision(
                "boundaries",
                DecisionKind::BoundaryCreated {
                  bundle: bundle_id,
                  root_asset: child_index,
                  priority: dep.priority,
                  isolated,
                },
              );
              bundle_id
            }
          };

          ctx
            .graph
            .dependency_bundles
            .entry(dep.id())
            .or_default()
            .push((dep.priority, bundle_id));

          // Conditional bundles configured to load in parallel are wired to
          // their referencing bundle so both arrive at the same time.
          if dep.priority == Priority::Conditional && ctx.config.load_conditional_bundles_in_parallel
          {
            ctx.graph.add_edge(frame.referencing_bundle, bundle_id);
          }

          child_frames.push(Frame {
            node: target_node,
            group_root: child_index,
            group_bundle: bundle_id,
            referencing_bundle: bundle_id,
            target: frame.target.clone(),
          });
        } else if dep.priority == Priority::Parallel || behavior == Some(BundleBehavior::Inline) {
          let referencing_type = ctx
            .graph
            .expect_bundle(frame.referencing_bundle)?
            .bundle_type
            .clone();

          if child_asset.file_type != referencing_type {
            let bundle_id = match ctx.bundles.get(&child_index) {
              Some(bundle_id) => *bundle_id,
              None => {
                let bundle = IdealBundle::from_root(
                  child_index,
                  &child_asset,
                  frame.target.clone(),
                  dep.needs_stable_name,
                  behavior,
                  ctx.asset_count(),
                );
                let bundle_id = ctx.graph.create_bundle(bundle);
                ctx.graph.add_edge(frame.referencing_bundle, bundle_id);
                ctx.graph.add_edge(frame.group_bundle, bundle_id);
                ctx.bundles.insert(child_index, bundle_id);
                ctx.bundle_roots.insert(
                  child_index,
                  BundleRootInfo {
                    bundle: bundle_id,
                    group: frame.group_bundle,
                  },
                );
                ctx.decision(
                  "boundaries",
                  DecisionKind::InGroupBundleCreated {
                    bundle: bundle_id,
                    root_asset: child_index,
                  },
                );
                bundle_id
              }
            };

            ctx
              .graph
              .dependency_bundles
              .entry(dep.id())
              .or_default()
              .push((dep.priority, bundle_id));
            ctx
              .graph
              .asset_references
              .entry(child_index)
              .or_default()
              .push((dep.id(), frame.referencing_bundle));

            child_frames.push(Frame {
              node: target_node,
              group_root: frame.group_root,
              group_bundle: frame.group_bundle,
              referencing_bundle: bundle_id,
              target: frame.target.clone(),
            });
          } else if let Some(existing) = ctx.bundles.get(&child_index).copied() {
            // The asset is already a bundle root elsewhere; reference that
            // bundle instead of folding.
            ctx.graph.add_edge(frame.referencing_bundle, existing);
            ctx
              .graph
              .dependency_bundles
              .entry(dep.id())
              .or_default()
              .push((dep.priority, existing));
          } else {
            // Same type: the asset is folded into the referencing bundle.
            // Reachability treats this edge as a sync continuation so the
            // folded subtree stays covered.
            ctx.folded_assets.insert(child_index);
            ctx.add_asset_to_bundle(frame.referencing_bundle, child_index, "boundaries")?;
            ctx
              .graph
              .asset_references
              .entry(child_index)
              .or_default()
              .push((dep.id(), frame.referencing_bundle));

            child_frames.push(Frame {
              node: target_node,
              ..frame.clone()
            });
          }
        } else {
          // Sync: no new bundle; the asset is visited within the current
          // bundle context and placed later.
          child_frames.push(Frame {
            node: target_node,
            ..frame.clone()
          });
        }
      }
    }

    for child_frame in child_frames.into_iter().rev() {
      if !visited.contains(&child_frame.node) {
        stack.push(child_frame);
      }
    }
  }

  debug!(
    bundles = ctx.graph.bundle_ids().len(),
    bundle_roots = ctx.bundle_roots.len(),
    entries = ctx.entries.len(),
    "ideal graph: created bundle roots"
  );
  Ok(())
}

#[instrument(level = "debug", skip_all)]
fn extract_entries(
  ctx: &BundlingContext<'_>,
) -> anyhow::Result<Vec<(AssetIndex, Arc<Dependency>)>> {
  let mut entries: Vec<(AssetIndex, Arc<Dependency>)> = Vec::new();

  for dep in ctx.asset_graph.get_dependencies() {
    if !dep.is_entry {
      continue;
    }

    let Some(dep_node) = ctx.asset_graph.get_node_id_by_content_key(&dep.id()) else {
      continue;
    };

    for asset_node in ctx.asset_graph.dependency_assets(dep_node) {
      if let Some(asset) = ctx.asset_graph.get_asset(&asset_node) {
        if let Some(index) = ctx.graph.assets.index_of(&asset.id) {
          entries.push((index, dep.clone()));
        }
      }
    }
  }

  debug!(entries = entries.len(), "ideal graph: extracted entries");
  Ok(entries)
}

/// Resolves manual shared bundle rules against the asset graph and maps each
/// matching asset to its rule. The first matching rule wins.
#[instrument(level = "debug", skip_all)]
fn resolve_manual_rules(ctx: &mut BundlingContext<'_>) {
  if ctx.config.manual_shared_bundles.is_empty() {
    return;
  }

  let mut scopes: Vec<Option<FixedBitSet>> = Vec::new();

  for rule in &ctx.config.manual_shared_bundles {
    let root = match &rule.root {
      None => None,
      Some(root_path) => {
        let found = ctx
          .graph
          .assets
          .iter()
          .find(|(_, asset)| asset.file_path.ends_with(root_path))
          .map(|(index, _)| index);

        if found.is_none() {
          ctx.warn(
            Diagnostic::warning(format!(
              "manual shared bundle {} skipped: root {root_path} was not found in the asset graph",
              rule.name
            ))
            .with_origin("bramble_bundling"),
          );
          continue;
        }
        found
      }
    };

    let scope = root.map(|root| reachable_asset_scope(ctx, root));
    scopes.push(scope);

    ctx.manual_rules.push(ResolvedManualRule {
      name: rule.name.clone(),
      globs: rule.assets.clone(),
      types: rule
        .types
        .as_ref()
        .map(|types| types.iter().map(|t| FileType::from_extension(t)).collect()),
      root,
      split: rule.split,
    });
  }

  for (asset_index, asset) in ctx.graph.assets.iter() {
    let path = asset.file_path.to_string_lossy();

    for (rule_index, rule) in ctx.manual_rules.iter().enumerate() {
      if let Some(scope) = &scopes[rule_index] {
        if !scope.contains(asset_index.index()) {
          continue;
        }
      }

      if let Some(types) = &rule.types {
        if !types.contains(&asset.file_type) {
          continue;
        }
      }

      if rule.globs.iter().any(|glob| glob_match(glob, &path)) {
        ctx.manual_asset_rules.insert(asset_index, rule_index);
        break;
      }
    }
  }

  debug!(
    rules = ctx.manual_rules.len(),
    matched_assets = ctx.manual_asset_rules.len(),
    "ideal graph: resolved manual shared bundles"
  );
}

/// All assets reachable from `root` through dependencies of any priority.
fn reachable_asset_scope(ctx: &BundlingContext<'_>, root: AssetIndex) -> FixedBitSet {
  let mut scope = FixedBitSet::with_capacity(ctx.asset_count());
  let mut stack = vec![ctx.graph.assets.node_id(root)];
  let mut visited: HashSet<NodeId> = HashSet::new();

  while let Some(node) = stack.pop() {
    if !visited.insert(node) {
      continue;
    }
    if let Some(asset) = ctx.asset_graph.get_asset(&node) {
      if let Some(index) = ctx.graph.assets.index_of(&asset.id) {
        scope.insert(index.index());
      }
    }
    stack.extend(ctx.asset_graph.get_outgoing_neighbors(&node));
  }

  scope
}

/// Tracks constant modules referenced by exactly one parent asset. They are
/// co-placed with that parent instead of participating in sharing.
#[instrument(level = "debug", skip_all)]
fn collect_constant_parents(ctx: &mut BundlingContext<'_>) {
  for (asset_index, asset) in ctx.graph.assets.iter() {
    if !asset.is_constant_module {
      continue;
    }

    let node = ctx.graph.assets.node_id(asset_index);
    let incoming = ctx.asset_graph.incoming_dependencies(&node);
    if incoming.len() != 1 {
      continue;
    }

    let parent = ctx
      .asset_graph
      .get_dependency(&incoming[0])
      .and_then(|dep| dep.source_asset_id.as_deref())
      .and_then(|source| ctx.graph.assets.index_of(source));

    if let Some(parent) = parent {
      ctx.constant_parents.insert(asset_index, parent);
    }
  }

  if !ctx.constant_parents.is_empty() {
    debug!(
      constant_modules = ctx.constant_parents.len(),
      "ideal graph: tracked single-parent constant modules"
    );
  }
}

/// Routes an asset into its manual shared bundle, creating the bundle (or
/// split partition) on first use.
fn assign_manual_bundle(
  ctx: &mut BundlingContext<'_>,
  asset_index: AssetIndex,
  target: &Target,
) -> anyhow::Result<()> {
  if ctx.bundles.contains_key(&asset_index)
    || ctx.graph.manual_asset_to_bundle.contains_key(&asset_index)
  {
    return Ok(());
  }

  let Some(rule_index) = ctx.manual_asset_rules.get(&asset_index).copied() else {
    return Ok(());
  };

  let (name, split) = {
    let rule = &ctx.manual_rules[rule_index];
    (rule.name.clone(), rule.split)
  };
  let asset = ctx.asset(asset_index).clone();

  let mut key = format!("{},{}", name, asset.file_type.extension());
  if let Some(split) = split {
    let partition = hash_to_u64(&asset.id) % u64::from(split);
    key.push_str(&format!(",{partition}"));
  }

  let bundle_id = match ctx.manual_bundle_keys.get(&key) {
    Some(bundle_id) => *bundle_id,
    None => {
      let mut bundle = IdealBundle::shared(
        asset.file_type.clone(),
        asset.env.clone(),
        target.clone(),
        ctx.asset_count(),
      );
      bundle.manual_shared_bundle = Some(name.clone());
      let bundle_id = ctx.graph.create_bundle(bundle);
      ctx.manual_bundle_keys.insert(key, bundle_id);
      ctx.decision(
        "boundaries",
        DecisionKind::ManualBundleCreated {
          bundle: bundle_id,
          rule: name,
        },
      );
      bundle_id
    }
  };

  ctx.add_asset_to_bundle(bundle_id, asset_index, "boundaries")?;
  ctx.graph.manual_asset_to_bundle.insert(asset_index, bundle_id);

  Ok(())
}
