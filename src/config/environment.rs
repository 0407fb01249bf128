//! Environment lookup and execution-context detection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Environment markers set by short-lived function platforms.
const SERVERLESS_MARKERS: &[&str] = &[
    "VERCEL",
    "AWS_LAMBDA_FUNCTION_NAME",
    "NETLIFY",
    "FUNCTIONS_WORKER_RUNTIME",
    "K_SERVICE",
];

type Lookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Source of environment variables.
///
/// Reads the process environment in production and a fixed map in tests, so
/// configuration code never has to mutate global process state.
#[derive(Clone)]
pub struct EnvSource {
    lookup: Arc<Lookup>,
}

impl EnvSource {
    /// Reads from the process environment.
    #[must_use]
    pub fn process() -> Self {
        Self {
            lookup: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Reads from a fixed set of key/value pairs.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            lookup: Arc::new(move |key| map.get(key).cloned()),
        }
    }

    /// An environment with no variables set.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_pairs(std::iter::empty::<(String, String)>())
    }

    /// Returns the value of `key`, treating blank values as unset.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    /// Returns the first of `keys` that is set.
    #[must_use]
    pub fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }

    /// Whether `key` is set to a non-blank value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::process()
    }
}

impl fmt::Debug for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvSource").finish_non_exhaustive()
    }
}

/// Whether the process runs on a short-lived function platform.
///
/// Only affects how large the relational pool is allowed to grow.
#[must_use]
pub fn is_serverless(env: &EnvSource) -> bool {
    SERVERLESS_MARKERS.iter().any(|marker| env.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_values_are_unset() {
        let env = EnvSource::from_pairs([("DB_HOST", "  "), ("DB_USER", "desk")]);
        assert_eq!(env.get("DB_HOST"), None);
        assert_eq!(env.get("DB_USER").as_deref(), Some("desk"));
    }

    #[test]
    fn test_first_of_prefers_earlier_keys() {
        let env = EnvSource::from_pairs([("DB_PASS", "second"), ("DB_PASSWORD", "first")]);
        assert_eq!(
            env.first_of(&["DB_PASSWORD", "DB_PASS"]).as_deref(),
            Some("first")
        );

        let env = EnvSource::from_pairs([("DB_PASS", "only")]);
        assert_eq!(
            env.first_of(&["DB_PASSWORD", "DB_PASS"]).as_deref(),
            Some("only")
        );
    }

    #[test]
    fn test_serverless_detection() {
        assert!(!is_serverless(&EnvSource::empty()));
        assert!(is_serverless(&EnvSource::from_pairs([("VERCEL", "1")])));
        assert!(is_serverless(&EnvSource::from_pairs([(
            "AWS_LAMBDA_FUNCTION_NAME",
            "feedback-api"
        )])));
    }
}
