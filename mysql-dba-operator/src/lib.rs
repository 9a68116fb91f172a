//! Kubernetes operator that provisions MySQL databases, users and grants.

pub mod cluster;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod password;
pub mod registry;
pub mod session;
pub mod sql;
pub mod validation;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
