//! Core library for the distributed document-permission synchronization
//! engine: Redis fencing, the beat/generator/upsert/validator/monitor
//! pipeline, and the DB contracts each of them depends on.
//!
//! Binaries (`permsync-beat`, `permsync-worker`) wire these modules
//! together with a concrete Redis connection, a concrete Diesel pool, and
//! whatever per-source `DocSync`/`CredentialValidator` implementations the
//! deployment registers.

pub mod beat;
pub mod config;
pub mod db;
pub mod due;
pub mod error;
pub mod fence;
pub mod generator;
pub mod lock;
pub mod model;
pub mod monitor;
pub mod queue;
pub mod upsert;
pub mod validator;

#[cfg(test)]
mod test_support;
