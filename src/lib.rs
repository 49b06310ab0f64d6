//! Per-pool lifecycle manager for ephemeral CI runner pods.
//!
//! A [`manager::RunnerPoolManager`] owns one [`manage_loop::ManageLoop`] per
//! runner pool. Each loop periodically correlates the pool's pods (as seen by
//! the cluster API and by each pod's own status endpoint) with the runners
//! registered on the remote CI provider, then deletes, recycles or unlinks
//! pods and prunes offline runners accordingly.
//!
//! The crate is a library: the surrounding controller decides *when* pools
//! start and stop, this crate decides *what happens* while they run.

pub mod config;
pub mod manage_loop;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod pods;
pub mod registry;
pub mod status;
