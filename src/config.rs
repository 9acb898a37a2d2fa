use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::etl::DEFAULT_CONCURRENCY;
use crate::fetch::DEFAULT_BASE_URL;

pub const DEFAULT_DATABASE_PATH: &str = "data/disease.db";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";

/// Runtime settings, read from the environment (and `.env`).
///
/// | Variable           | Default                                        |
/// |--------------------|------------------------------------------------|
/// | `DATABASE_PATH`    | `data/disease.db`                              |
/// | `FLUVIEW_BASE_URL` | `https://api.delphi.cmu.edu/epidata/fluview/`  |
/// | `DELPHI_API_KEY`   | unset (requests go out without a key)          |
/// | `ETL_CONCURRENCY`  | `5`                                            |
/// | `BIND_ADDR`        | `127.0.0.1:8000`                               |
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: PathBuf,
    pub base_url: String,
    pub api_key: Option<String>,
    pub concurrency: usize,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            concurrency: DEFAULT_CONCURRENCY,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let concurrency = match get("ETL_CONCURRENCY") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("ETL_CONCURRENCY must be a positive integer, got {raw:?}"))?
                .max(1),
            None => defaults.concurrency,
        };

        Ok(Self {
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            base_url: get("FLUVIEW_BASE_URL").unwrap_or(defaults.base_url),
            api_key: get("DELPHI_API_KEY"),
            concurrency,
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.database_path, PathBuf::from("data/disease.db"));
    }

    #[test]
    fn test_reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_PATH", "/tmp/ili.db"),
            ("DELPHI_API_KEY", "abc"),
            ("ETL_CONCURRENCY", "12"),
            ("BIND_ADDR", "0.0.0.0:9000"),
        ]))
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/ili.db"));
        assert_eq!(config.api_key.as_deref(), Some("abc"));
        assert_eq!(config.concurrency, 12);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_blank_api_key_is_unset() {
        let config = Config::from_lookup(lookup(&[("DELPHI_API_KEY", "  ")])).unwrap();
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn test_bad_concurrency_is_an_error() {
        assert!(Config::from_lookup(lookup(&[("ETL_CONCURRENCY", "many")])).is_err());
    }
}
