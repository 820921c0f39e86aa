//! JSON Schema validation for run configuration.
//!
//! Run configs are validated against `schema/run_config.schema.json`
//! before they are deserialized.

use std::sync::OnceLock;

use serde_json::Value;

const RUN_CONFIG_SCHEMA_JSON: &str = include_str!("../../schema/run_config.schema.json");

static RUN_CONFIG_VALIDATOR: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// The compiled run config validator, or why the embedded schema is unusable.
fn run_config_validator() -> Result<&'static jsonschema::Validator, String> {
    RUN_CONFIG_VALIDATOR
        .get_or_init(|| {
            let schema: Value = serde_json::from_str(RUN_CONFIG_SCHEMA_JSON)
                .map_err(|e| format!("run config schema is not valid JSON: {}", e))?;
            jsonschema::options()
                .build(&schema)
                .map_err(|e| format!("run config schema does not compile: {}", e))
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Validate a run configuration value, collecting every violation.
pub fn validate_run_config_schema(config: &Value) -> Result<(), Vec<String>> {
    let validator = run_config_validator().map_err(|e| vec![e])?;
    let violations: Vec<String> = validator
        .iter_errors(config)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
