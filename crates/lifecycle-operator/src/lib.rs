//! Lifecycle operator: runs the ClusterServiceVersion controller against a cluster

pub mod cli;
pub mod controller_runner;
pub mod startup;
