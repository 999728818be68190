//! Provider contract.
//!
//! Providers are out-of-process collaborators in the full system; the engine
//! only depends on the [`Provider`] trait here, a factory registry to
//! instantiate them, and a pre-loaded [`SchemaCache`]. The [`TestProvider`]
//! is a deterministic in-memory implementation used by the CLI's built-in
//! `test` provider type and throughout the engine tests.

mod provider;
mod provisioner;
mod schema;
mod test_provider;

pub use provider::{
  ApplyChangeRequest, ApplyChangeResponse, PlanChangeRequest, PlanChangeResponse, Provider,
  ProviderError, ProviderFactories, ProviderFactory, ReadRequest, ReadResponse,
  UpgradeStateRequest, UpgradeStateResponse,
};
pub use provisioner::{
  ProvisionRequest, Provisioner, ProvisionerError, ProvisionerFactories, ProvisionerFactory,
  TestProvisioner,
};
pub use schema::{AttrSchema, ProviderSchema, Schema, SchemaCache};
pub use test_provider::TestProvider;
