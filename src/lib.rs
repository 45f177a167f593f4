//! Resumable batch orchestration for conversational record enrichment.
//!
//! Records flow `raw -> assigned -> transformed -> merged -> cleaned`; each
//! arrow is an atomically written artifact whose presence is the only
//! resumability signal.
pub mod assign;
pub mod cli;
pub mod config;
pub mod errors;
pub mod invoke;
pub mod model;
pub mod publish;
pub mod runner;
pub mod sampler;
pub mod staging;
pub mod store;
pub mod transform;
pub mod util;
pub mod validate;
pub mod workflow;
