//! Caldera execution engine.
//!
//! The engine turns a declarative [`caldera_config::Config`] into ordered
//! lifecycle actions over resource instances.
//!
//! # Architecture
//!
//! ```text
//! Engine
//! ├── plan(config, state, opts)     -> (Plan, Diagnostics)
//! ├── apply(config, plan, state)    -> (State, Diagnostics)
//! └── validate(config)              -> Diagnostics
//!
//! GraphBuilder
//! └── fixed transformer pipeline per operation:
//!     config -> orphans -> schema attach -> references -> providers
//!     -> diff (apply) -> targeting -> destroy/CBD edges -> root
//!     -> transitive reduction
//!
//! walk(graph, ctx)
//! └── concurrent traversal: a vertex runs once its dependencies finished;
//!     dynamically-expandable vertices produce a subgraph that is validated
//!     and walked to completion before the vertex is considered done.
//! ```
//!
//! Every vertex executes against an [`EvalContext`]: the per-walk façade
//! over the provider cache, the synchronized plan/state containers, the
//! instance expander and the shared concurrency limiter.

mod builder;
mod context;
mod engine;
mod eval;
mod expand;
mod nodes;
mod transform;
mod walker;

pub use builder::GraphBuilder;
pub use context::{EvalContext, VariableValue, WalkInputs, WalkOperation};
pub use engine::{Engine, EngineConfig, PlanOpts};
pub use eval::{Ref, Scope, refs_in};
pub use expand::Expander;
pub use nodes::{
  ApplyInstanceNode, CloseProviderNode, DestroyInstanceNode, ForgetInstanceNode, ModuleCallNode,
  Node, OpenInstanceNode, OrphanInstanceNode, OutputNode, PlanInstanceNode, ProviderInstanceNode,
  ProviderNode, ResourceNode, VariableNode,
};
pub use walker::{MAX_EXPAND_DEPTH, walk};
