use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use caldera_addrs::{ResourceMode, Targetable};
use caldera_config::Config;
use caldera_diags::Diagnostics;
use caldera_engine::{Engine, EngineConfig, PlanOpts};
use caldera_plan::Plan;
use caldera_provider::{
  Provider, ProviderFactories, Provisioner, ProvisionerFactories, SchemaCache, TestProvider,
  TestProvisioner,
};
use caldera_state::State;

/// Caldera - a declarative infrastructure-orchestration engine
#[derive(Parser)]
#[command(name = "caldera")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Maximum number of concurrent provider operations
  #[arg(long, global = true, default_value_t = 10)]
  parallelism: usize,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Compute the changes needed to converge the configuration
  Plan {
    /// Path to the configuration file (JSON)
    config_file: PathBuf,

    /// Path to the current state file (JSON)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Write the computed plan to this file
    #[arg(long)]
    out: Option<PathBuf>,

    /// Limit the plan to these addresses and their dependencies
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Exclude these addresses and their dependents (conflicts with --target)
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Force replacement of these instances
    #[arg(long = "replace")]
    replace: Vec<String>,

    /// Plan the destruction of all managed objects
    #[arg(long)]
    destroy: bool,

    /// Set a root module variable, as name=value with a JSON value
    #[arg(long = "var")]
    vars: Vec<String>,
  },

  /// Execute a previously computed plan
  Apply {
    /// Path to the configuration file (JSON)
    config_file: PathBuf,

    /// Path to the plan file produced by `caldera plan --out`
    #[arg(long)]
    plan: PathBuf,

    /// Path to the current state file (JSON)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Write the resulting state to this file
    #[arg(long)]
    state_out: Option<PathBuf>,

    /// Set a root module variable, as name=value with a JSON value
    #[arg(long = "var")]
    vars: Vec<String>,
  },

  /// Check the configuration without touching any state
  Validate {
    /// Path to the configuration file (JSON)
    config_file: PathBuf,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
  match cli.command {
    Commands::Plan { config_file, state, out, targets, excludes, replace, destroy, vars } => {
      let config = load_config(&config_file)?;
      let state = load_state(state.as_deref())?;
      let engine = build_engine(&config, cli.parallelism);

      let opts = PlanOpts {
        destroy,
        targets: parse_targets(&targets)?,
        excludes: parse_targets(&excludes)?,
        force_replace: parse_targets(&replace)?,
        import_targets: BTreeMap::new(),
        variables: parse_vars(&vars)?,
      };
      let (plan, diags) = engine.plan(&config, &state, opts).await;

      print_plan(&plan);
      print_diags(&diags);
      if let Some(out) = out {
        let encoded = serde_json::to_string_pretty(&plan)?;
        std::fs::write(&out, encoded)
          .with_context(|| format!("failed to write plan file: {}", out.display()))?;
        eprintln!("Plan written to {}", out.display());
      }
      exit_for(&diags)
    }

    Commands::Apply { config_file, plan, state, state_out, vars } => {
      let config = load_config(&config_file)?;
      let prior_state = load_state(state.as_deref())?;
      let plan_content = std::fs::read_to_string(&plan)
        .with_context(|| format!("failed to read plan file: {}", plan.display()))?;
      let plan: Plan =
        serde_json::from_str(&plan_content).context("failed to parse plan file")?;
      let engine = build_engine(&config, cli.parallelism);

      let (new_state, diags) =
        engine.apply(&config, &plan, &prior_state, parse_vars(&vars)?).await;

      print_diags(&diags);
      if let Some(out) = state_out {
        let encoded = serde_json::to_string_pretty(&new_state)?;
        std::fs::write(&out, encoded)
          .with_context(|| format!("failed to write state file: {}", out.display()))?;
        eprintln!("State written to {}", out.display());
      }
      exit_for(&diags)
    }

    Commands::Validate { config_file } => {
      let config = load_config(&config_file)?;
      let engine = build_engine(&config, cli.parallelism);
      let diags = engine.validate(&config).await;
      if diags.is_empty() {
        println!("Configuration is valid.");
      }
      print_diags(&diags);
      exit_for(&diags)
    }
  }
}

fn load_config(path: &std::path::Path) -> Result<Config> {
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read configuration file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse configuration file: {}", path.display()))
}

fn load_state(path: Option<&std::path::Path>) -> Result<State> {
  let Some(path) = path else {
    return Ok(State::new());
  };
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read state file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse state file: {}", path.display()))
}

/// Wire up the built-in `test` provider (serving every managed type the
/// configuration mentions with a `test` prefix) and the `test-exec`
/// provisioner.
fn build_engine(config: &Config, parallelism: usize) -> Engine {
  let mut managed: Vec<String> = vec!["test_thing".to_string()];
  collect_managed_types(config, &mut managed);
  let type_refs: Vec<&str> = managed.iter().map(String::as_str).collect();
  let provider = TestProvider::with_managed_types(&type_refs);
  let provisioner = TestProvisioner::new();

  let mut schemas = SchemaCache::default();
  schemas.insert("test", provider.schema());
  schemas.insert_provisioner("test-exec", provisioner.schema());

  let mut factories = ProviderFactories::new();
  factories.insert("test".to_string(), provider.factory());
  let mut provisioners = ProvisionerFactories::new();
  provisioners.insert("test-exec".to_string(), provisioner.factory());

  let engine_config = EngineConfig { parallelism, cancel: CancellationToken::new() };
  Engine::new(engine_config, factories, schemas).with_provisioners(provisioners)
}

fn collect_managed_types(config: &Config, out: &mut Vec<String>) {
  for resource in &config.resources {
    if resource.mode == ResourceMode::Managed
      && resource.resource().implied_provider() == "test"
      && !out.contains(&resource.type_name)
    {
      out.push(resource.type_name.clone());
    }
  }
  for call in &config.module_calls {
    collect_managed_types(&call.config, out);
  }
}

fn parse_targets(addrs: &[String]) -> Result<Vec<Targetable>> {
  addrs
    .iter()
    .map(|addr| Targetable::parse(addr).map_err(|e| anyhow::anyhow!(e)))
    .collect()
}

fn parse_vars(vars: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
  let mut out = BTreeMap::new();
  for var in vars {
    let Some((name, raw)) = var.split_once('=') else {
      bail!("invalid --var {:?}: expected name=value", var);
    };
    let value = serde_json::from_str(raw).unwrap_or(serde_json::Value::String(raw.to_string()));
    out.insert(name.to_string(), value);
  }
  Ok(out)
}

fn print_plan(plan: &Plan) {
  if plan.changes.is_empty() {
    println!("No changes. The infrastructure matches the configuration.");
    return;
  }
  println!("Caldera planned the following actions:");
  for change in &plan.changes {
    match &change.deposed {
      Some(key) => println!("  {} (deposed {}): {}", change.addr, key, change.action),
      None => println!("  {}: {}", change.addr, change.action),
    }
  }
}

fn print_diags(diags: &Diagnostics) {
  for diag in diags {
    eprintln!("{}", diag);
  }
}

fn exit_for(diags: &Diagnostics) -> Result<()> {
  if diags.has_errors() {
    bail!("operation finished with errors");
  }
  Ok(())
}
