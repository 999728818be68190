//! Targeting and excluding.

use std::collections::BTreeSet;

use caldera_addrs::Targetable;
use caldera_diags::Diagnostics;
use caldera_graph::{Graph, NodeId};
use tracing::debug;

use crate::nodes::Node;
use crate::transform::Transformer;

/// Prunes the graph to a user-selected subset.
///
/// With targets, each directly targeted resource vertex is retained together
/// with all of its ancestors (its dependencies). With excludes, each
/// matching vertex and its descendants (its dependents) are dropped, and
/// everything remaining is retained with its ancestors. In both modes an
/// output whose resource-kind dependency set is fully retained is retained
/// too, because outputs cannot be addressed directly.
pub struct TargetingTransformer {
  pub targets: Vec<Targetable>,
  pub excludes: Vec<Targetable>,
}

impl Transformer for TargetingTransformer {
  fn name(&self) -> &'static str {
    "TargetingTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    let retained = if !self.targets.is_empty() {
      self.select_targeted(graph)
    } else if !self.excludes.is_empty() {
      self.remove_excluded(graph)
    } else {
      return Ok(());
    };

    for id in graph.node_ids() {
      if !retained.contains(&id) {
        if let Some(node) = graph.node(id) {
          debug!(node = %node, "removing, filtered by targeting");
        }
        graph.remove_node(id);
      }
    }
    Ok(())
  }
}

impl TargetingTransformer {
  fn select_targeted(&self, graph: &mut Graph<Node>) -> BTreeSet<NodeId> {
    let mut retained = BTreeSet::new();

    for id in graph.node_ids() {
      let Some(addr) = graph.node(id).and_then(Node::target_addr) else {
        continue;
      };
      if self.targets.iter().any(|t| t.contains(&addr)) {
        retained.insert(id);
        retained.extend(graph.ancestors(id));
        // Dynamically expanding vertices filter their instances against
        // the same target list at walk time.
        if let Some(node) = graph.node_mut(id) {
          node.set_targets(self.targets.clone());
        }
      }
    }

    self.add_retained_outputs(graph, &mut retained);
    retained
  }

  fn remove_excluded(&self, graph: &mut Graph<Node>) -> BTreeSet<NodeId> {
    let mut excluded: BTreeSet<NodeId> = BTreeSet::new();
    let mut targetable: Vec<(NodeId, Targetable)> = Vec::new();

    for id in graph.node_ids() {
      let Some(addr) = graph.node(id).and_then(Node::target_addr) else {
        continue;
      };
      targetable.push((id, addr));
    }

    for (id, addr) in &targetable {
      let directly = self.excludes.iter().any(|t| t.contains(addr));
      if directly {
        excluded.insert(*id);
      }
      if directly || self.descendants_excluded(addr) {
        // Resources depending on an excluded vertex go with it, except
        // sibling instances contained in the same resource address.
        for dependent in graph.descendants(*id) {
          let Some(dep_addr) = graph.node(dependent).and_then(Node::target_addr) else {
            continue;
          };
          if !addr.contains(&dep_addr) {
            excluded.insert(dependent);
          }
        }
      }
    }

    let mut retained = BTreeSet::new();
    for (id, _) in &targetable {
      if excluded.contains(id) {
        continue;
      }
      retained.insert(*id);
      retained.extend(graph.ancestors(*id));
      if let Some(node) = graph.node_mut(*id) {
        node.set_excludes(self.excludes.clone());
      }
    }

    self.add_retained_outputs(graph, &mut retained);
    retained
  }

  /// Whether an exclude might match instances expanded under this address
  /// later, in which case dependents must be excluded conservatively.
  fn descendants_excluded(&self, addr: &Targetable) -> bool {
    self.excludes.iter().any(|t| addr.contains(t))
  }

  /// Outputs cannot be targeted directly: retain each output whose
  /// resource-kind dependencies are all retained, plus its dependencies.
  fn add_retained_outputs(&self, graph: &Graph<Node>, retained: &mut BTreeSet<NodeId>) {
    let mut additions = BTreeSet::new();
    for (id, node) in graph.nodes() {
      if !node.is_output() {
        continue;
      }
      let deps = graph.ancestors(id);
      let mut found = 0usize;
      let mut all_retained = true;
      for dep in &deps {
        if graph.node(*dep).and_then(Node::target_addr).is_none() {
          continue;
        }
        if retained.contains(dep) {
          found += 1;
        } else {
          all_retained = false;
          break;
        }
      }
      if found > 0 && all_retained {
        additions.insert(id);
        additions.extend(deps);
      }
    }
    retained.extend(additions);
  }
}
