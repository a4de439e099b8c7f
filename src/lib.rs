//! Hybridstore - storage and database failover coordinator
//!
//! Manages a primary and a hot-standby backup database plus up to three
//! file-storage providers (local disk, an S3-compatible bucket and a Google
//! Cloud Storage bucket). Health is probed on demand; every switch,
//! preference change and migration is an explicit operator action.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod errors;
pub mod failover;
pub mod health;
pub mod metrics;
pub mod migration;
pub mod routes;
pub mod server;
pub mod storage;

#[cfg(test)]
mod testing;
