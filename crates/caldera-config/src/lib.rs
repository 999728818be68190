//! Declarative configuration model.
//!
//! A [`Config`] describes one module: its input variables, provider blocks,
//! resources, outputs, nested module calls and removed blocks. Expression
//! fields (`count`, `for_each`, `alias`, attribute values) are stored as
//! template source strings and evaluated by the engine at walk time, so the
//! model itself stays passive and serializable.

mod config;
mod validate;

pub use config::{
  Config, Lifecycle, ModuleCall, OutputConfig, ProviderBlock, ProviderRef, ProvisionWhen,
  ProvisionerConfig, RemovedBlock, ResourceConfig, VariableConfig,
};
