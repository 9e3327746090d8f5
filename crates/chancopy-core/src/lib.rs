//! Core transfer pipeline for the channel copier.
//!
//! This crate is framework-agnostic. The messaging platform, the operator chat and
//! archive storage live behind ports (traits) implemented in adapter crates.

pub mod archive;
pub mod backoff;
pub mod config;
pub mod domain;
pub mod engine;
pub mod enumerator;
pub mod errors;
pub mod formatting;
pub mod jobs;
pub mod logging;
pub mod messaging;
pub mod platform;
pub mod progress;
pub mod resolver;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
