//! Create-before-destroy forcing and destroy-edge ordering.

use std::collections::{BTreeMap, BTreeSet};

use caldera_diags::{Diagnostic, Diagnostics};
use caldera_graph::{Graph, NodeId};
use caldera_state::State;
use tracing::debug;

use crate::nodes::Node;
use crate::transform::Transformer;

/// A create-before-destroy vertex cannot safely depend on a vertex that is
/// not, because reversing the destroy edges would introduce a cycle. Any
/// vertex with the capability whose dependents include a CBD vertex is
/// therefore forced into create-before-destroy too.
pub struct ForcedCbdTransformer;

impl Transformer for ForcedCbdTransformer {
  fn name(&self) -> &'static str {
    "ForcedCbdTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    let mut diags = Diagnostics::new();
    let candidates: Vec<NodeId> = graph
      .nodes()
      .filter(|(_, node)| node.creates_before_destroy() == Some(false))
      .map(|(id, _)| id)
      .collect();

    for id in candidates {
      let forced = graph
        .descendants(id)
        .iter()
        .any(|dep| {
          graph.node(*dep).and_then(Node::creates_before_destroy) == Some(true)
        });
      if !forced {
        continue;
      }
      let name = graph.node(id).map(|n| n.to_string()).unwrap_or_default();
      debug!(node = %name, "forcing create_before_destroy due to dependent");
      if let Some(node) = graph.node_mut(id) {
        if let Err(e) = node.set_create_before_destroy(true) {
          diags.push(Diagnostic::error(
            "Cannot force create_before_destroy",
            format!("{}: {}.", name, e),
          ));
        }
      }
    }

    if diags.has_errors() { Err(diags) } else { Ok(()) }
  }
}

/// Orders destroy vertices.
///
/// Destroy ordering is the inverse of create ordering: if B depends on A,
/// then A's destroy waits for B's destroy. For a replace of one address the
/// default order is destroy-then-create; under create-before-destroy the
/// edge reverses (the destroy waits for the replacement's creation) and the
/// destroy additionally waits for everything that depended on the original
/// object, so dependents switch over before the old object goes away.
pub struct DestroyEdgeTransformer {
  pub state: State,
}

impl Transformer for DestroyEdgeTransformer {
  fn name(&self) -> &'static str {
    "DestroyEdgeTransformer"
  }

  fn transform(&mut self, graph: &mut Graph<Node>) -> Result<(), Diagnostics> {
    let mut creators: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
    let mut destroyers: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
    for (id, node) in graph.nodes() {
      if let Some(addr) = node.creator_addr() {
        creators.entry(addr.to_string()).or_default().push(id);
      }
      if let Some((addr, _)) = node.destroyer_addr() {
        destroyers.entry(addr.to_string()).or_default().push(id);
      }
    }
    if destroyers.is_empty() {
      return Ok(());
    }

    // Capture reference-derived dependency context before adding edges.
    let creator_deps: BTreeMap<NodeId, BTreeSet<NodeId>> = creators
      .values()
      .flatten()
      .map(|id| (*id, graph.ancestors(*id)))
      .collect();
    let creator_dependents: BTreeMap<NodeId, BTreeSet<NodeId>> = creators
      .values()
      .flatten()
      .map(|id| (*id, graph.descendants(*id)))
      .collect();

    // Same-address pairing: create-before-destroy reverses the edge.
    for (addr, destroyer_ids) in &destroyers {
      for &destroyer in destroyer_ids {
        let cbd = graph
          .node(destroyer)
          .and_then(Node::creates_before_destroy)
          .unwrap_or(false);
        for &creator in creators.get(addr).into_iter().flatten() {
          if cbd {
            debug!(addr = %addr, "destroy waits for replacement creation");
            graph.connect(destroyer, creator);
          } else {
            graph.connect(creator, destroyer);
          }
        }

        // CBD: dependents of the original object must switch over before
        // the old object is destroyed.
        if cbd {
          for &creator in creators.get(addr).into_iter().flatten() {
            for &dependent in creator_dependents.get(&creator).into_iter().flatten() {
              if dependent != destroyer
                && graph.node(dependent).is_some_and(|n| n.destroyer_addr().is_none())
              {
                graph.connect(destroyer, dependent);
              }
            }
          }
        }
      }
    }

    // Cross-address inversion via configuration references: for creators
    // C(B) depending on C(A), destroy(A) waits for destroy(B).
    for (addr_b, creator_ids) in &creators {
      for &creator_b in creator_ids {
        for dep in creator_deps.get(&creator_b).into_iter().flatten() {
          let Some(addr_a) = graph.node(*dep).and_then(Node::creator_addr) else {
            continue;
          };
          let addr_a = addr_a.to_string();
          if addr_a == *addr_b {
            continue;
          }
          for &destroyer_a in destroyers.get(&addr_a).into_iter().flatten() {
            for &destroyer_b in destroyers.get(addr_b).into_iter().flatten() {
              graph.connect(destroyer_a, destroyer_b);
            }
          }
        }
      }
    }

    // Cross-address inversion via state-recorded dependencies, for objects
    // whose configuration is gone.
    for (addr, instance) in self.state.all_resource_instances() {
      let addr_b = addr.to_string();
      let Some(destroyer_b_ids) = destroyers.get(&addr_b) else {
        continue;
      };
      let dependencies = instance
        .current
        .iter()
        .chain(instance.deposed.values())
        .flat_map(|o| o.dependencies.iter());
      for dep_resource in dependencies {
        for (addr_a, destroyer_a_ids) in &destroyers {
          let matches = destroyer_a_ids.iter().any(|id| {
            graph
              .node(*id)
              .and_then(|n| n.destroyer_addr())
              .map(|(a, _)| a.abs_resource() == *dep_resource)
              .unwrap_or(false)
          });
          if !matches || addr_a == &addr_b {
            continue;
          }
          for &destroyer_a in destroyer_a_ids {
            for &destroyer_b in destroyer_b_ids {
              graph.connect(destroyer_a, destroyer_b);
            }
          }
        }
      }
    }

    Ok(())
  }
}
