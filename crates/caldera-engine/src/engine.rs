//! Public engine API.

use std::collections::BTreeMap;
use std::sync::Arc;

use caldera_addrs::Targetable;
use caldera_config::Config;
use caldera_diags::{Diagnostic, Diagnostics};
use caldera_plan::{Plan, SyncPlan};
use caldera_provider::{ProviderFactories, ProvisionerFactories, SchemaCache};
use caldera_state::{State, SyncState};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::builder::GraphBuilder;
use crate::context::{EvalContext, WalkInputs, WalkOperation};
use crate::walker::walk;

/// Engine-wide settings, threaded explicitly from the entry point: there is
/// no process-global configuration.
#[derive(Clone)]
pub struct EngineConfig {
  /// Upper bound on concurrent provider operations across a whole walk.
  pub parallelism: usize,
  pub cancel: CancellationToken,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self { parallelism: 10, cancel: CancellationToken::new() }
  }
}

/// Inputs to a plan operation.
#[derive(Debug, Clone, Default)]
pub struct PlanOpts {
  /// Plan the destruction of everything instead of convergence.
  pub destroy: bool,
  pub targets: Vec<Targetable>,
  /// Mutually exclusive with `targets`.
  pub excludes: Vec<Targetable>,
  /// Instances to replace even if their diff is empty.
  pub force_replace: Vec<Targetable>,
  /// Instance address -> remote id to import during the plan.
  pub import_targets: BTreeMap<String, String>,
  pub variables: BTreeMap<String, Value>,
}

/// The engine: owns the provider factories and pre-loaded schemas, and runs
/// plan/apply/validate operations. Every operation returns a diagnostics
/// collection; an error-severity diagnostic means the operation did not
/// complete, but partial effects (resources already applied) are not rolled
/// back.
pub struct Engine {
  config: EngineConfig,
  factories: Arc<ProviderFactories>,
  provisioners: Arc<ProvisionerFactories>,
  schemas: Arc<SchemaCache>,
}

impl Engine {
  pub fn new(config: EngineConfig, factories: ProviderFactories, schemas: SchemaCache) -> Self {
    Self {
      config,
      factories: Arc::new(factories),
      provisioners: Arc::new(ProvisionerFactories::new()),
      schemas: Arc::new(schemas),
    }
  }

  /// Register provisioner factories alongside the provider factories.
  pub fn with_provisioners(mut self, provisioners: ProvisionerFactories) -> Self {
    self.provisioners = Arc::new(provisioners);
    self
  }

  /// Compute the set of changes needed to converge (or destroy) the given
  /// configuration against the given state.
  #[instrument(name = "plan", skip(self, config, state, opts))]
  pub async fn plan(&self, config: &Config, state: &State, opts: PlanOpts) -> (Plan, Diagnostics) {
    let mut diags = config.check();
    if !opts.targets.is_empty() && !opts.excludes.is_empty() {
      diags.push(Diagnostic::error(
        "Invalid combination of arguments",
        "Targets and excludes are mutually exclusive; specify at most one of them.",
      ));
    }
    if diags.has_errors() {
      return (Plan { changes: Vec::new(), errored: true }, diags);
    }

    let op = if opts.destroy { WalkOperation::PlanDestroy } else { WalkOperation::Plan };
    let config = Arc::new(config.clone());
    let plan = SyncPlan::new();
    let ctx = EvalContext::new(
      op,
      config.clone(),
      SyncState::new(state.clone()),
      plan.clone(),
      self.schemas.clone(),
      self.factories.clone(),
      self.provisioners.clone(),
      WalkInputs {
        root_variables: opts.variables.clone(),
        force_replace: opts.force_replace.clone(),
        import_targets: opts.import_targets.clone(),
      },
      self.config.parallelism,
      self.config.cancel.clone(),
    );

    let builder = GraphBuilder {
      op,
      config,
      state: state.clone(),
      schemas: self.schemas.clone(),
      plan: None,
      targets: opts.targets,
      excludes: opts.excludes,
    };
    let graph = match builder.build() {
      Ok(graph) => graph,
      Err(build_diags) => {
        diags.extend(build_diags);
        return (Plan { changes: Vec::new(), errored: true }, diags);
      }
    };

    info!(vertices = graph.len(), "starting plan walk");
    diags.extend(walk(graph, ctx).await);

    let mut result = plan.snapshot();
    result.errored = diags.has_errors();
    (result, diags)
  }

  /// Execute a previously computed plan, returning the resulting state.
  #[instrument(name = "apply", skip(self, config, plan, state, variables))]
  pub async fn apply(
    &self,
    config: &Config,
    plan: &Plan,
    state: &State,
    variables: BTreeMap<String, Value>,
  ) -> (State, Diagnostics) {
    let mut diags = Diagnostics::new();
    if plan.errored {
      diags.push(Diagnostic::error(
        "Cannot apply errored plan",
        "The given plan is incomplete because its producing operation reported errors, so it cannot be applied.",
      ));
      return (state.clone(), diags);
    }

    let config = Arc::new(config.clone());
    let sync_state = SyncState::new(state.clone());
    let ctx = EvalContext::new(
      WalkOperation::Apply,
      config.clone(),
      sync_state.clone(),
      SyncPlan::from_plan(plan.clone()),
      self.schemas.clone(),
      self.factories.clone(),
      self.provisioners.clone(),
      WalkInputs { root_variables: variables, ..Default::default() },
      self.config.parallelism,
      self.config.cancel.clone(),
    );

    let builder = GraphBuilder {
      op: WalkOperation::Apply,
      config,
      state: state.clone(),
      schemas: self.schemas.clone(),
      plan: Some(plan.clone()),
      targets: Vec::new(),
      excludes: Vec::new(),
    };
    let graph = match builder.build() {
      Ok(graph) => graph,
      Err(build_diags) => {
        diags.extend(build_diags);
        return (state.clone(), diags);
      }
    };

    info!(vertices = graph.len(), changes = plan.changes.len(), "starting apply walk");
    diags.extend(walk(graph, ctx).await);
    (sync_state.snapshot(), diags)
  }

  /// Check the configuration without touching state: structural validation
  /// plus a validate walk that exercises expansion and provider-side
  /// config validation.
  #[instrument(name = "validate", skip(self, config))]
  pub async fn validate(&self, config: &Config) -> Diagnostics {
    let mut diags = config.check();
    if diags.has_errors() {
      return diags;
    }

    let config = Arc::new(config.clone());
    let ctx = EvalContext::new(
      WalkOperation::Validate,
      config.clone(),
      SyncState::new(State::new()),
      SyncPlan::new(),
      self.schemas.clone(),
      self.factories.clone(),
      self.provisioners.clone(),
      WalkInputs::default(),
      self.config.parallelism,
      self.config.cancel.clone(),
    );

    let builder = GraphBuilder {
      op: WalkOperation::Validate,
      config,
      state: State::new(),
      schemas: self.schemas.clone(),
      plan: None,
      targets: Vec::new(),
      excludes: Vec::new(),
    };
    match builder.build() {
      Ok(graph) => diags.extend(walk(graph, ctx).await),
      Err(build_diags) => diags.extend(build_diags),
    }
    diags
  }
}
