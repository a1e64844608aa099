//! Core distribution engine for pakdepot.
//!
//! Fetches installable packages from the fastest available source, balancing
//! a peer-to-peer swarm against ranked HTTP mirrors under a shared bandwidth
//! budget. The [`coordinator::DistributionCoordinator`] is the top-level API;
//! the other modules are the services it arbitrates between.

pub mod bandwidth;
pub mod cache;
pub mod catalog;
pub mod chunk_store;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mirror_registry;
pub mod peer_network;
pub mod protocol;
pub mod storage;
pub mod types;

pub use coordinator::DistributionCoordinator;
pub use error::{DepotError, DepotResult};
