use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

/// Opaque, stable identity for one vertex within one graph. Ids are never
/// reused after removal and do not migrate between graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  /// The graph contains at least one cycle; the message names its members.
  #[error("cycle detected in dependency graph: {0}")]
  Cycle(String),
  /// After construction the graph must funnel into exactly one sink.
  #[error("graph has {count} root vertices ({names}); expected exactly one")]
  MultipleRoots { count: usize, names: String },
  /// The single sink is not the synthetic root sentinel.
  #[error("graph root vertex {0} is not a root sentinel")]
  WrongRoot(String),
  #[error("graph is empty")]
  Empty,
}

/// A DAG of vertices of type `N`. An edge `(source, target)` means the
/// source depends on the target: the target is visited first. Duplicate
/// edges collapse; self-edges are ignored.
#[derive(Debug, Clone)]
pub struct Graph<N> {
  next: u32,
  nodes: BTreeMap<NodeId, N>,
  /// id -> the ids it depends on (edge targets).
  down: BTreeMap<NodeId, BTreeSet<NodeId>>,
  /// id -> the ids depending on it (edge sources).
  up: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl<N> Default for Graph<N> {
  fn default() -> Self {
    Self { next: 0, nodes: BTreeMap::new(), down: BTreeMap::new(), up: BTreeMap::new() }
  }
}

impl<N> Graph<N> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_node(&mut self, node: N) -> NodeId {
    let id = NodeId(self.next);
    self.next += 1;
    self.nodes.insert(id, node);
    self.down.insert(id, BTreeSet::new());
    self.up.insert(id, BTreeSet::new());
    id
  }

  pub fn remove_node(&mut self, id: NodeId) -> Option<N> {
    let node = self.nodes.remove(&id)?;
    for dep in self.down.remove(&id).unwrap_or_default() {
      if let Some(up) = self.up.get_mut(&dep) {
        up.remove(&id);
      }
    }
    for dependent in self.up.remove(&id).unwrap_or_default() {
      if let Some(down) = self.down.get_mut(&dependent) {
        down.remove(&id);
      }
    }
    Some(node)
  }

  /// Record that `source` depends on `target`. Unknown ids and self-edges
  /// are ignored.
  pub fn connect(&mut self, source: NodeId, target: NodeId) {
    if source == target || !self.nodes.contains_key(&source) || !self.nodes.contains_key(&target) {
      return;
    }
    self.down.entry(source).or_default().insert(target);
    self.up.entry(target).or_default().insert(source);
  }

  pub fn disconnect(&mut self, source: NodeId, target: NodeId) {
    if let Some(down) = self.down.get_mut(&source) {
      down.remove(&target);
    }
    if let Some(up) = self.up.get_mut(&target) {
      up.remove(&source);
    }
  }

  pub fn has_edge(&self, source: NodeId, target: NodeId) -> bool {
    self.down.get(&source).is_some_and(|d| d.contains(&target))
  }

  pub fn node(&self, id: NodeId) -> Option<&N> {
    self.nodes.get(&id)
  }

  pub fn node_mut(&mut self, id: NodeId) -> Option<&mut N> {
    self.nodes.get_mut(&id)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn node_ids(&self) -> Vec<NodeId> {
    self.nodes.keys().copied().collect()
  }

  pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &N)> {
    self.nodes.iter().map(|(id, n)| (*id, n))
  }

  pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
    self
      .down
      .iter()
      .flat_map(|(src, targets)| targets.iter().map(|t| (*src, *t)))
      .collect()
  }

  /// Direct dependencies of `id`: the vertices that must complete before it.
  pub fn dependencies_of(&self, id: NodeId) -> BTreeSet<NodeId> {
    self.down.get(&id).cloned().unwrap_or_default()
  }

  /// Direct dependents of `id`: the vertices waiting on it.
  pub fn dependents_of(&self, id: NodeId) -> BTreeSet<NodeId> {
    self.up.get(&id).cloned().unwrap_or_default()
  }

  /// Transitive closure of dependencies.
  pub fn ancestors(&self, id: NodeId) -> BTreeSet<NodeId> {
    self.closure(id, &self.down)
  }

  /// Transitive closure of dependents.
  pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
    self.closure(id, &self.up)
  }

  fn closure(&self, id: NodeId, edges: &BTreeMap<NodeId, BTreeSet<NodeId>>) -> BTreeSet<NodeId> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<NodeId> = edges.get(&id).map(|s| s.iter().copied().collect()).unwrap_or_default();
    while let Some(next) = stack.pop() {
      if seen.insert(next) {
        if let Some(more) = edges.get(&next) {
          stack.extend(more.iter().copied());
        }
      }
    }
    seen
  }

  /// Vertices in dependency order: every vertex appears after all of its
  /// dependencies. Fails if the graph has a cycle.
  pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError>
  where
    N: fmt::Display,
  {
    let mut remaining: BTreeMap<NodeId, usize> =
      self.nodes.keys().map(|id| (*id, self.dependencies_of(*id).len())).collect();
    let mut ready: Vec<NodeId> =
      remaining.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
    let mut order = Vec::with_capacity(self.nodes.len());

    while let Some(id) = ready.pop() {
      remaining.remove(&id);
      order.push(id);
      for dependent in self.dependents_of(id) {
        if let Some(count) = remaining.get_mut(&dependent) {
          *count -= 1;
          if *count == 0 {
            ready.push(dependent);
          }
        }
      }
    }

    if order.len() != self.nodes.len() {
      let stuck: Vec<String> =
        remaining.keys().filter_map(|id| self.node(*id)).map(|n| n.to_string()).collect();
      return Err(GraphError::Cycle(stuck.join(", ")));
    }
    Ok(order)
  }

  /// Strongly-connected components with more than one member, i.e. the
  /// cycles. Uses Tarjan's algorithm, iteratively to keep stack depth flat.
  pub fn find_cycles(&self) -> Vec<Vec<NodeId>> {
    struct Frame {
      node: NodeId,
      deps: Vec<NodeId>,
      pos: usize,
    }

    let mut index = 0u32;
    let mut indices: BTreeMap<NodeId, u32> = BTreeMap::new();
    let mut lowlink: BTreeMap<NodeId, u32> = BTreeMap::new();
    let mut on_stack: BTreeSet<NodeId> = BTreeSet::new();
    let mut stack: Vec<NodeId> = Vec::new();
    let mut cycles = Vec::new();

    for &start in self.nodes.keys() {
      if indices.contains_key(&start) {
        continue;
      }
      indices.insert(start, index);
      lowlink.insert(start, index);
      index += 1;
      stack.push(start);
      on_stack.insert(start);
      let mut frames = vec![Frame {
        node: start,
        deps: self.dependencies_of(start).into_iter().collect(),
        pos: 0,
      }];

      while !frames.is_empty() {
        let top = frames.len() - 1;
        let node = frames[top].node;
        if frames[top].pos < frames[top].deps.len() {
          let next = frames[top].deps[frames[top].pos];
          frames[top].pos += 1;
          if !indices.contains_key(&next) {
            indices.insert(next, index);
            lowlink.insert(next, index);
            index += 1;
            stack.push(next);
            on_stack.insert(next);
            frames.push(Frame {
              node: next,
              deps: self.dependencies_of(next).into_iter().collect(),
              pos: 0,
            });
          } else if on_stack.contains(&next) {
            let low = lowlink[&node].min(indices[&next]);
            lowlink.insert(node, low);
          }
        } else {
          frames.pop();
          if let Some(parent) = frames.last() {
            let low = lowlink[&parent.node].min(lowlink[&node]);
            lowlink.insert(parent.node, low);
          }
          if lowlink[&node] == indices[&node] {
            let mut component = Vec::new();
            while let Some(member) = stack.pop() {
              on_stack.remove(&member);
              component.push(member);
              if member == node {
                break;
              }
            }
            if component.len() > 1 {
              component.sort();
              cycles.push(component);
            }
          }
        }
      }
    }

    cycles.sort();
    cycles
  }

  /// Check the structural invariants: no cycles, and exactly one sink vertex
  /// (no dependents) for which `is_root` holds. Run after every transformer.
  pub fn validate(&self, is_root: impl Fn(&N) -> bool) -> Result<(), GraphError>
  where
    N: fmt::Display,
  {
    if self.is_empty() {
      return Err(GraphError::Empty);
    }

    let cycles = self.find_cycles();
    if !cycles.is_empty() {
      let names: Vec<String> = cycles[0]
        .iter()
        .filter_map(|id| self.node(*id))
        .map(|n| n.to_string())
        .collect();
      return Err(GraphError::Cycle(names.join(", ")));
    }

    let sinks: Vec<NodeId> =
      self.nodes.keys().filter(|id| self.dependents_of(**id).is_empty()).copied().collect();
    if sinks.len() != 1 {
      let names: Vec<String> =
        sinks.iter().filter_map(|id| self.node(*id)).map(|n| n.to_string()).collect();
      return Err(GraphError::MultipleRoots { count: sinks.len(), names: names.join(", ") });
    }
    let root = sinks[0];
    if !self.node(root).is_some_and(&is_root) {
      let name = self.node(root).map(|n| n.to_string()).unwrap_or_default();
      return Err(GraphError::WrongRoot(name));
    }
    Ok(())
  }

  /// Add a root sentinel depending on every current sink, so the whole graph
  /// funnels into one final vertex.
  pub fn add_root(&mut self, root: N) -> NodeId {
    let sinks: Vec<NodeId> =
      self.nodes.keys().filter(|id| self.dependents_of(**id).is_empty()).copied().collect();
    let root_id = self.add_node(root);
    for sink in sinks {
      self.connect(root_id, sink);
    }
    root_id
  }

  /// Remove any edge `(a, c)` for which a longer path `a -> b -> ... -> c`
  /// already exists. Strictly cosmetic: reachability is unchanged.
  pub fn transitive_reduction(&mut self)
  where
    N: fmt::Display,
  {
    let Ok(order) = self.topo_order() else {
      // A cyclic graph fails validation separately; don't touch it here.
      return;
    };

    // Reachability sets built dependencies-first.
    let mut reach: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    for &id in &order {
      let mut set = BTreeSet::new();
      for dep in self.dependencies_of(id) {
        set.insert(dep);
        if let Some(sub) = reach.get(&dep) {
          set.extend(sub.iter().copied());
        }
      }
      reach.insert(id, set);
    }

    for &id in &order {
      let deps: Vec<NodeId> = self.dependencies_of(id).into_iter().collect();
      for &dep in &deps {
        let redundant = deps
          .iter()
          .filter(|other| **other != dep)
          .any(|other| reach.get(other).is_some_and(|set| set.contains(&dep)));
        if redundant {
          self.disconnect(id, dep);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Clone, PartialEq)]
  struct Named(&'static str);

  impl fmt::Display for Named {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.0)
    }
  }

  fn chain() -> (Graph<Named>, NodeId, NodeId, NodeId) {
    let mut g = Graph::new();
    let a = g.add_node(Named("a"));
    let b = g.add_node(Named("b"));
    let c = g.add_node(Named("c"));
    g.connect(b, a);
    g.connect(c, b);
    (g, a, b, c)
  }

  #[test]
  fn ancestors_and_descendants() {
    let (g, a, b, c) = chain();
    assert_eq!(g.ancestors(c), BTreeSet::from([a, b]));
    assert_eq!(g.ancestors(a), BTreeSet::new());
    assert_eq!(g.descendants(a), BTreeSet::from([b, c]));
    assert_eq!(g.descendants(c), BTreeSet::new());
  }

  #[test]
  fn duplicate_and_self_edges_collapse() {
    let mut g = Graph::new();
    let a = g.add_node(Named("a"));
    let b = g.add_node(Named("b"));
    g.connect(b, a);
    g.connect(b, a);
    g.connect(a, a);
    assert_eq!(g.edges(), vec![(b, a)]);
  }

  #[test]
  fn topo_order_respects_dependencies() {
    let (g, a, b, c) = chain();
    let order = g.topo_order().unwrap();
    let pos = |id| order.iter().position(|x| *x == id).unwrap();
    assert!(pos(a) < pos(b));
    assert!(pos(b) < pos(c));
  }

  #[test]
  fn cycle_is_detected_and_named() {
    let (mut g, a, _, c) = chain();
    g.connect(a, c);
    let err = g.topo_order().unwrap_err();
    assert!(matches!(err, GraphError::Cycle(_)));
    let cycles = g.find_cycles();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].len(), 3);
  }

  #[test]
  fn removal_cleans_up_edges() {
    let (mut g, a, b, c) = chain();
    g.remove_node(b);
    assert_eq!(g.len(), 2);
    assert!(g.dependencies_of(c).is_empty());
    assert!(g.dependents_of(a).is_empty());
  }

  #[test]
  fn validate_demands_single_root_sentinel() {
    let (mut g, _, _, _) = chain();
    // Two sinks: add a disconnected node.
    g.add_node(Named("loose"));
    assert!(matches!(
      g.validate(|n| n.0 == "root"),
      Err(GraphError::MultipleRoots { count: 2, .. })
    ));

    g.add_root(Named("root"));
    g.validate(|n| n.0 == "root").unwrap();
  }

  #[test]
  fn validate_rejects_non_sentinel_root() {
    let (g, _, _, _) = chain();
    assert!(matches!(g.validate(|n| n.0 == "root"), Err(GraphError::WrongRoot(_))));
  }

  #[test]
  fn transitive_reduction_removes_shortcut_edges() {
    let (mut g, a, b, c) = chain();
    g.connect(c, a);
    assert!(g.has_edge(c, a));
    g.transitive_reduction();
    assert!(!g.has_edge(c, a));
    assert!(g.has_edge(c, b));
    assert!(g.has_edge(b, a));
  }

  /// Reachability must be identical before and after reduction, for every
  /// DAG over four vertices with edges i -> j only when i > j (enumerating
  /// all 64 edge subsets keeps this exhaustive and deterministic).
  #[test]
  fn transitive_reduction_preserves_reachability() {
    let pairs = [(1usize, 0usize), (2, 0), (2, 1), (3, 0), (3, 1), (3, 2)];
    for mask in 0u32..(1 << pairs.len()) {
      let mut g: Graph<Named> = Graph::new();
      let names = [Named("n0"), Named("n1"), Named("n2"), Named("n3")];
      let ids: Vec<NodeId> = names.iter().map(|n| g.add_node(n.clone())).collect();
      for (bit, (src, dst)) in pairs.iter().enumerate() {
        if mask & (1 << bit) != 0 {
          g.connect(ids[*src], ids[*dst]);
        }
      }

      let before_anc: Vec<_> = ids.iter().map(|id| g.ancestors(*id)).collect();
      let before_desc: Vec<_> = ids.iter().map(|id| g.descendants(*id)).collect();
      let edges_before = g.edges().len();
      g.transitive_reduction();
      let after_anc: Vec<_> = ids.iter().map(|id| g.ancestors(*id)).collect();
      let after_desc: Vec<_> = ids.iter().map(|id| g.descendants(*id)).collect();

      assert_eq!(before_anc, after_anc, "ancestors changed for mask {:#b}", mask);
      assert_eq!(before_desc, after_desc, "descendants changed for mask {:#b}", mask);
      assert!(g.edges().len() <= edges_before);
    }
  }
}
