//! JSON Schema validation for dispatch configuration.
//!
//! The schema is embedded at compile time and compiled once on first use.
//! It catches structural mistakes (unknown keys, unknown task kinds,
//! malformed durations) before serde sees the document, so operators get
//! every problem reported at once instead of the first deserialize error.

use std::sync::OnceLock;

const DISPATCH_SCHEMA_JSON: &str = include_str!("../../schema/dispatch.schema.json");

static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    COMPILED_SCHEMA
        .get_or_init(|| {
            let schema_value: serde_json::Value = serde_json::from_str(DISPATCH_SCHEMA_JSON)
                .map_err(|e| format!("Invalid schema JSON: {}", e))?;
            jsonschema::options()
                .build(&schema_value)
                .map_err(|e| format!("Failed to compile schema: {}", e))
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Validate a config document against the schema.
///
/// Returns every violation, each suffixed with its JSON pointer.
pub fn validate_config_schema(config_json: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(config_json)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check a config document without collecting errors.
pub fn is_valid_config(config_json: &serde_json::Value) -> bool {
    get_validator()
        .map(|v| v.is_valid(config_json))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_config_passes_schema() {
        let value = json!({ "routing": { "default_backend": "claude" } });
        assert!(validate_config_schema(&value).is_ok());
        assert!(is_valid_config(&value));
    }

    #[test]
    fn test_missing_routing_fails() {
        let value = json!({ "backends": {} });
        let errors = validate_config_schema(&value).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_unknown_top_level_key_fails() {
        let value = json!({
            "routing": { "default_backend": "claude" },
            "telemetry": { "enabled": true }
        });
        assert!(!is_valid_config(&value));
    }

    #[test]
    fn test_unknown_task_kind_fails() {
        let value = json!({
            "routing": {
                "default_backend": "claude",
                "rules": { "poetry": ["claude"] }
            }
        });
        assert!(!is_valid_config(&value));
    }

    #[test]
    fn test_reports_every_violation() {
        let value = json!({
            "routing": { "default_backend": "" },
            "resilience": {
                "retry": { "max_attempts": 0 },
                "rate_limit": { "refill_rate": -1 }
            }
        });
        let errors = validate_config_schema(&value).unwrap_err();
        assert!(errors.len() >= 3, "got {:?}", errors);
    }

    #[test]
    fn test_backend_requires_max_tokens() {
        let value = json!({
            "routing": { "default_backend": "claude" },
            "backends": { "claude": { "capabilities": { "streaming": true } } }
        });
        assert!(!is_valid_config(&value));
    }
}
