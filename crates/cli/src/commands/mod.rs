//! CLI command implementations

pub mod instances;
pub mod workloads;
