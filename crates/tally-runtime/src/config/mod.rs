//! Run configuration.
//!
//! Run configs are YAML or JSON documents validated against an embedded
//! JSON Schema, then checked semantically.

mod parser;
mod schema;

pub use parser::{ConfigError, RetryConfig, RunConfig};
pub use schema::validate_run_config_schema;
