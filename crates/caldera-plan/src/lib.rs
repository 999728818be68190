//! Planned changes.
//!
//! A plan is a set of [`ResourceInstanceChange`]s, each tagging one resource
//! instance (or one of its deposed objects) with the lifecycle action decided
//! for it. Changes are produced during the plan walk and later drive which
//! concrete node types the apply graph instantiates per address.

mod change;
mod sync;

pub use change::{Action, Plan, ResourceInstanceChange};
pub use sync::SyncPlan;
