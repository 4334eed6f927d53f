//! Admission control proxy for the Nomad job API
//!
//! Sits between clients and the orchestrator, intercepts job submissions
//! (register, plan, validate), runs the configured admission pipeline over the
//! embedded job, forwards the possibly-rewritten request upstream and folds
//! admission warnings into the upstream response. Everything else is proxied
//! unchanged.

pub mod admission;
pub mod config;
pub mod error;
pub mod policy;
pub mod proxy;

pub use error::{Error, Result};
