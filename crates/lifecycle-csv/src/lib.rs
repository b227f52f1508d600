//! ClusterServiceVersion reconciliation engine
//!
//! Evaluates what a CSV requires, installs what it declares, provisions the
//! serving chain for the APIs it owns, and hands off to its successor when it
//! is replaced. The operator binary wires [`reconcile`] and [`error_policy`]
//! into a kube-runtime `Controller`.

pub mod apiservice;
pub mod controller;
pub mod install;
pub mod phase;
pub mod pki;
pub mod plan;
pub mod rbac;
pub mod replacement;
pub mod requirements;
pub mod resource;
pub mod store;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, CONTROLLER_NAME};
pub use store::{ClusterStore, KubeStore};

pub use lifecycle_common::{Error, Result};
