//! Concurrent graph walk.
//!
//! Vertices are spawned as tokio tasks the moment their dependencies have
//! completed; independent vertices run concurrently. A vertex whose
//! dependency failed (or was skipped) is skipped. Dynamically expandable
//! vertices produce a subgraph that is validated and walked to completion
//! before the vertex counts as done: synchronous from the parent's point
//! of view, concurrent within. Panics inside a visit are caught, logged
//! with their payload, and surfaced as bug diagnostics instead of taking
//! the whole walk down.

use std::collections::BTreeMap;

use caldera_diags::{Diagnostic, Diagnostics};
use caldera_graph::{Graph, NodeId};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::EvalContext;
use crate::nodes::Node;

/// Upper bound on nested dynamic expansion. Real configurations are nowhere
/// near this; hitting it means expansion is feeding on its own output.
pub const MAX_EXPAND_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VertexState {
  Pending,
  Running,
  Done,
  Failed,
  Skipped,
}

/// Walk the graph to completion and return the union of all diagnostics.
pub async fn walk(graph: Graph<Node>, ctx: EvalContext) -> Diagnostics {
  let execution_id = uuid::Uuid::new_v4().to_string();
  info!(execution_id = %execution_id, vertices = graph.len(), "starting graph walk");
  let mut diags = walk_at_depth(graph, ctx, 0).await;
  diags.sort();
  info!(execution_id = %execution_id, diagnostics = diags.len(), "graph walk finished");
  diags
}

fn walk_at_depth(
  graph: Graph<Node>,
  ctx: EvalContext,
  depth: usize,
) -> BoxFuture<'static, Diagnostics> {
  Box::pin(walk_inner(graph, ctx, depth))
}

async fn walk_inner(graph: Graph<Node>, ctx: EvalContext, depth: usize) -> Diagnostics {
  if ctx.is_cancelled() {
    return EvalContext::cancelled_diag();
  }
  let mut diags = Diagnostics::new();
  let mut states: BTreeMap<NodeId, VertexState> =
    graph.node_ids().into_iter().map(|id| (id, VertexState::Pending)).collect();
  let mut waiting: BTreeMap<NodeId, usize> = graph
    .node_ids()
    .into_iter()
    .map(|id| (id, graph.dependencies_of(id).len()))
    .collect();

  let mut tasks: JoinSet<(NodeId, Diagnostics)> = JoinSet::new();
  let mut cancelled = false;

  let spawn_ready = |tasks: &mut JoinSet<(NodeId, Diagnostics)>,
                     states: &mut BTreeMap<NodeId, VertexState>,
                     waiting: &BTreeMap<NodeId, usize>,
                     graph: &Graph<Node>,
                     ctx: &EvalContext| {
    let ready: Vec<NodeId> = waiting
      .iter()
      .filter(|(id, pending)| **pending == 0 && states[*id] == VertexState::Pending)
      .map(|(id, _)| *id)
      .collect();
    for id in ready {
      let Some(node) = graph.node(id).cloned() else { continue };
      states.insert(id, VertexState::Running);
      let ctx = ctx.clone();
      tasks.spawn(async move {
        let result = visit(node, ctx, depth).await;
        (id, result)
      });
    }
  };

  spawn_ready(&mut tasks, &mut states, &waiting, &graph, &ctx);

  while let Some(joined) = tasks.join_next().await {
    let (id, vertex_diags) = match joined {
      Ok(result) => result,
      Err(join_err) => {
        // Task-level failures other than panics (cancellation) have no
        // vertex identity left; record and continue draining.
        error!(error = %join_err, "graph walk task failed");
        diags.push(Diagnostic::bug("Graph walk task failed", join_err.to_string()));
        continue;
      }
    };

    let failed = vertex_diags.has_errors();
    diags.extend(vertex_diags);
    states.insert(id, if failed { VertexState::Failed } else { VertexState::Done });
    if failed {
      if let Some(node) = graph.node(id) {
        debug!(node = %node, "vertex failed; skipping its dependents");
      }
    }

    // Unblock (or skip) dependents.
    let mut queue: Vec<NodeId> = vec![id];
    while let Some(current) = queue.pop() {
      let current_state = states[&current];
      for dependent in graph.dependents_of(current) {
        if states[&dependent] != VertexState::Pending {
          continue;
        }
        match current_state {
          VertexState::Failed | VertexState::Skipped => {
            states.insert(dependent, VertexState::Skipped);
            queue.push(dependent);
          }
          _ => {
            if let Some(pending) = waiting.get_mut(&dependent) {
              *pending = pending.saturating_sub(1);
            }
          }
        }
      }
    }

    if ctx.is_cancelled() {
      cancelled = true;
      // Let in-flight vertices finish; spawn nothing new.
      continue;
    }
    spawn_ready(&mut tasks, &mut states, &waiting, &graph, &ctx);
  }

  let skipped = states.values().filter(|s| **s == VertexState::Skipped).count();
  if skipped > 0 {
    warn!(skipped, "vertices skipped because a dependency failed");
  }
  if cancelled {
    diags.extend(EvalContext::cancelled_diag());
  }
  diags
}

/// Visit one vertex: bind the context to the vertex's module instance, run
/// its behavior, then expand and recursively walk any dynamic subgraph.
async fn visit(node: Node, ctx: EvalContext, depth: usize) -> Diagnostics {
  let bound_ctx = match node.path_binding() {
    Some(path) => ctx.with_path(path),
    None => ctx.clone(),
  };

  let node_name = node.to_string();
  let result = std::panic::AssertUnwindSafe(async {
    let mut diags = node.execute(&bound_ctx).await;
    if diags.has_errors() {
      return diags;
    }

    if let Some(expansion) = node.dynamic_expand(&bound_ctx) {
      match expansion {
        Ok(subgraph) => {
          if let Err(e) = subgraph.validate(Node::is_root) {
            diags.push(Diagnostic::bug(
              "Malformed dynamic subgraph",
              format!("The expansion of {} produced an invalid graph: {}", node_name, e),
            ));
            return diags;
          }
          if depth + 1 > MAX_EXPAND_DEPTH {
            diags.push(Diagnostic::bug(
              "Dynamic expansion too deep",
              format!(
                "Expanding {} exceeded the maximum nesting depth of {}",
                node_name, MAX_EXPAND_DEPTH
              ),
            ));
            return diags;
          }
          debug!(node = %node_name, vertices = subgraph.len(), "walking dynamic subgraph");
          diags.extend(walk_at_depth(subgraph, ctx.clone(), depth + 1).await);
        }
        Err(expand_diags) => diags.extend(expand_diags),
      }
    }
    diags
  })
  .catch_unwind()
  .await;

  match result {
    Ok(diags) => diags,
    Err(payload) => {
      let message = panic_message(payload.as_ref());
      error!(node = %node_name, panic = %message, "panic during vertex visit");
      Diagnostic::bug(
        "Panic during graph walk",
        format!("The vertex {} panicked: {}", node_name, message),
      )
      .into()
    }
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
