//! Address types shared across the caldera workspace.
//!
//! Addresses form a hierarchy: a [`Resource`] names a configuration block, a
//! [`ConfigResource`] qualifies it with a static module path, an
//! [`AbsResource`] with a concrete module instance, and an
//! [`AbsResourceInstance`] adds the instance key produced by `count` or
//! `for_each` expansion. All address types render in the canonical syntax
//! users type on the command line (`module.a["x"].test_thing.web[0]`), and
//! targeting works through [`Targetable`] containment.

mod instance;
mod module;
mod provider;
mod resource;
mod target;

pub use instance::{DeposedKey, InstanceKey};
pub use module::{ModuleInstance, ModuleInstanceStep, ModulePath};
pub use provider::{AbsProviderConfig, AbsProviderInstance};
pub use resource::{AbsResource, AbsResourceInstance, ConfigResource, Resource, ResourceMode};
pub use target::{TargetParseError, Targetable};
