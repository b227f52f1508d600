//! Integration tests for the lifecycle operator
//!
//! These tests run the CSV controller in-process against a kind cluster and
//! tell the story of how a cluster administrator installs and upgrades an
//! operator through ClusterServiceVersions.
//!
//! - `csv_lifecycle`: install, requirement gating, and upgrade by replacement

mod csv_lifecycle;
mod helpers;
