//! Resource state.
//!
//! The state records, per module instance, the "current" object of every
//! resource instance plus any deposed objects retained during
//! create-before-destroy replacement. The engine only ever touches state
//! through [`SyncState`], which serializes access for concurrent graph
//! vertices; reading and writing state files is left to the caller.

mod state;
mod sync;

pub use state::{
  InstanceState, ModuleState, ObjectStatus, OutputValue, ResourceInstanceObject, ResourceState,
  State,
};
pub use sync::{StateError, SyncState};
