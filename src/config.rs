//! Runtime configuration.
//!
//! Values come from the process environment, after an optional `.env` file has been
//! loaded with `dotenvy`. Invalid values are reported and replaced by their defaults.

use std::str::FromStr;

pub const DATABASE_URL_VAR: &str = "PICTAG_DATABASE_URL";
pub const MAX_NODES_VAR: &str = "PICTAG_MAX_NODES";
pub const CASE_SENSITIVE_VAR: &str = "PICTAG_CASE_SENSITIVE";

pub const DEFAULT_DATABASE_URL: &str = "sqlite:./db/pictures.db";
pub const DEFAULT_MAX_NODES: usize = 1000;

/// Settings of the tag query compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Upper bound on the number of nodes visited while expanding compound tags.
    pub max_nodes: usize,
    /// Case sensitivity of pattern pseudo-tags that carry no explicit `i`/`s` flag.
    pub case_sensitive_default: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
            case_sensitive_default: false,
        }
    }
}

impl CompilerConfig {
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive_default = case_sensitive;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub compiler: CompilerConfig,
    pub database: DatabaseConfig,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env file");
            }
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let url = lookup(DATABASE_URL_VAR)
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(defaults.database.url);
        let max_nodes = parse_or_default(
            MAX_NODES_VAR,
            lookup(MAX_NODES_VAR),
            defaults.compiler.max_nodes,
        );
        let case_sensitive_default = lookup(CASE_SENSITIVE_VAR)
            .map(|value| match parse_bool(&value) {
                Some(b) => b,
                None => {
                    tracing::warn!(key = CASE_SENSITIVE_VAR, %value, "invalid boolean, using default");
                    defaults.compiler.case_sensitive_default
                }
            })
            .unwrap_or(defaults.compiler.case_sensitive_default);

        Config {
            compiler: CompilerConfig {
                max_nodes,
                case_sensitive_default,
            },
            database: DatabaseConfig { url },
        }
    }
}

fn parse_or_default<T>(key: &str, value: Option<String>, default: T) -> T
where
    T: FromStr + Copy,
{
    let Some(value) = value else {
        return default;
    };

    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!(key, %value, "invalid value, using default");
            default
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{CompilerConfig, Config, DEFAULT_DATABASE_URL, DEFAULT_MAX_NODES};
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert_eq!(Config::default(), config);
        assert_eq!(DEFAULT_DATABASE_URL, config.database.url);
        assert_eq!(DEFAULT_MAX_NODES, config.compiler.max_nodes);
        assert!(!config.compiler.case_sensitive_default);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PICTAG_DATABASE_URL", "sqlite::memory:"),
            ("PICTAG_MAX_NODES", " 250 "),
            ("PICTAG_CASE_SENSITIVE", "Yes"),
        ]);

        assert_eq!("sqlite::memory:", config.database.url);
        assert_eq!(
            CompilerConfig::default()
                .with_max_nodes(250)
                .with_case_sensitive(true),
            config.compiler
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("PICTAG_DATABASE_URL", "  "),
            ("PICTAG_MAX_NODES", "-3"),
            ("PICTAG_CASE_SENSITIVE", "maybe"),
        ]);

        assert_eq!(Config::default(), config);
    }
}
