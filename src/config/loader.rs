//! Configuration loader with environment variable expansion

use super::{Config, ConfigError};
use lazy_static::lazy_static;
use regex_lite::Regex;
use std::path::Path;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in a string.
    ///
    /// Supports two syntaxes:
    /// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
    /// - `${VAR_NAME:-default}` - Expansion with default value
    fn expand_env_vars(s: &str) -> String {
        let mut last_match = 0;
        let mut result = String::with_capacity(s.len());

        for cap in ENV_VAR.captures_iter(s) {
            let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };

            result.push_str(&s[last_match..full_match.start()]);

            match std::env::var(var_name.as_str()) {
                Ok(val) => result.push_str(&val),
                Err(_) => match cap.get(2) {
                    Some(default) => result.push_str(default.as_str()),
                    None => result.push_str(full_match.as_str()),
                },
            }

            last_match = full_match.end();
        }

        result.push_str(&s[last_match..]);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_expand_env_vars() {
        std::env::set_var("UPLOAD_TEST_VAR", "test_value");
        let expanded = ConfigLoader::expand_env_vars("key: ${UPLOAD_TEST_VAR}");
        assert_eq!(expanded, "key: test_value");
        std::env::remove_var("UPLOAD_TEST_VAR");
    }

    #[test]
    #[serial_test::serial]
    fn test_expand_env_vars_default_and_missing() {
        std::env::remove_var("UPLOAD_MISSING_VAR");
        let expanded =
            ConfigLoader::expand_env_vars("a: ${UPLOAD_MISSING_VAR:-8MB}, b: ${UPLOAD_MISSING_VAR}");
        assert_eq!(expanded, "a: 8MB, b: ${UPLOAD_MISSING_VAR}");
    }
}
