//! Environment variable substitution for configuration text
//!
//! `${NAME}` is replaced with the value of `NAME`; `${NAME:-fallback}` uses
//! `fallback` when `NAME` is unset. Substitution runs once over the raw
//! document, so values are not themselves expanded.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

use crate::config::ConfigError;

/// `${NAME}` or `${NAME:-default}`
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var pattern is valid")
});

/// Substitute environment variable references in `input`.
///
/// Every unset variable without a default is reported in a single error.
///
/// ```
/// use cloudfs::env::substitute_env_vars;
///
/// std::env::set_var("CLOUDFS_DOC_REGION", "eu-west-1");
/// let result = substitute_env_vars("region=${CLOUDFS_DOC_REGION}").unwrap();
/// assert_eq!(result, "region=eu-west-1");
/// ```
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing: Vec<String> = Vec::new();

    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        match (env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_unchanged() {
        let input = "uri: memory://scratch";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_substitution_repeated() {
        env::set_var("CLOUDFS_ENV_TENANT", "alice");
        let result = substitute_env_vars("/srv/${CLOUDFS_ENV_TENANT}/${CLOUDFS_ENV_TENANT}").unwrap();
        assert_eq!(result, "/srv/alice/alice");
        env::remove_var("CLOUDFS_ENV_TENANT");
    }

    #[test]
    fn test_default_used_only_when_unset() {
        env::remove_var("CLOUDFS_ENV_UNSET_1");
        let result = substitute_env_vars("level: ${CLOUDFS_ENV_UNSET_1:-warn}").unwrap();
        assert_eq!(result, "level: warn");

        env::set_var("CLOUDFS_ENV_SET_1", "trace");
        let result = substitute_env_vars("level: ${CLOUDFS_ENV_SET_1:-warn}").unwrap();
        assert_eq!(result, "level: trace");
        env::remove_var("CLOUDFS_ENV_SET_1");

        assert_eq!(substitute_env_vars("${CLOUDFS_ENV_UNSET_2:-}").unwrap(), "");
    }

    #[test]
    fn test_missing_variables_reported_together() {
        let err = substitute_env_vars("${CLOUDFS_MISSING_A} ${CLOUDFS_MISSING_B} ${CLOUDFS_MISSING_A}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("CLOUDFS_MISSING_A, CLOUDFS_MISSING_B"), "{}", err);
    }

    #[test]
    fn test_partial_patterns_ignored() {
        let input = "$VAR and {VAR} and ${1BAD}";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }
}
