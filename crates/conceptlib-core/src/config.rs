//! Runtime configuration for the core.
//!
//! Values come from `CONCEPTLIB_*` environment variables (binaries load a
//! `.env` file first) and fall back to [`crate::defaults`].
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `CONCEPTLIB_READ_ONLY` | Global read-only mode; `can_edit` is always false |
//! | `CONCEPTLIB_STALE_EDIT_CHECK` | Default concurrency policy for saves |
//! | `CONCEPTLIB_MAX_GRAPH_DEPTH` | Depth bound for concept reference traversal |
//! | `CONCEPTLIB_BRAND_SCOPES` | `BRAND=1,2;OTHER=3` static brand collection scopes |

use std::collections::{BTreeMap, BTreeSet};
use std::env;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::TagId;

/// What to do when the editor's last-seen revision is no longer the latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Fail with `Error::StaleEdit`.
    #[default]
    Enforce,
    /// Apply the edit anyway. Meant for system-initiated updates.
    Overwrite,
}

/// Core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub read_only: bool,
    pub concurrency_policy: ConcurrencyPolicy,
    pub max_graph_depth: usize,
    /// Static brand scopes. Brands missing here impose no filter.
    #[serde(default)]
    pub brand_scopes: BTreeMap<String, BTreeSet<TagId>>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            read_only: defaults::READ_ONLY,
            concurrency_policy: if defaults::STALE_EDIT_CHECK {
                ConcurrencyPolicy::Enforce
            } else {
                ConcurrencyPolicy::Overwrite
            },
            max_graph_depth: defaults::MAX_GRAPH_DEPTH,
            brand_scopes: BTreeMap::new(),
        }
    }
}

impl CoreConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = env::var("CONCEPTLIB_READ_ONLY") {
            config.read_only = parse_bool("CONCEPTLIB_READ_ONLY", &value)?;
        }
        if let Ok(value) = env::var("CONCEPTLIB_STALE_EDIT_CHECK") {
            config.concurrency_policy = if parse_bool("CONCEPTLIB_STALE_EDIT_CHECK", &value)? {
                ConcurrencyPolicy::Enforce
            } else {
                ConcurrencyPolicy::Overwrite
            };
        }
        if let Ok(value) = env::var("CONCEPTLIB_MAX_GRAPH_DEPTH") {
            config.max_graph_depth = value.trim().parse().map_err(|_| {
                Error::Config(format!("CONCEPTLIB_MAX_GRAPH_DEPTH must be a number, got: {}", value))
            })?;
        }
        if let Ok(value) = env::var("CONCEPTLIB_BRAND_SCOPES") {
            config.brand_scopes = parse_brand_scopes(&value)?;
        }

        config.validate()?;
        debug!(
            subsystem = "core",
            component = "config",
            read_only = config.read_only,
            concurrency_policy = ?config.concurrency_policy,
            max_graph_depth = config.max_graph_depth,
            brand_count = config.brand_scopes.len(),
            "Core configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_graph_depth == 0 {
            return Err(Error::Config(
                "max_graph_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_concurrency_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency_policy = policy;
        self
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{} must be a boolean, got: {}", name, value))),
    }
}

/// Parse `BRAND=1,2;OTHER=3`.
pub fn parse_brand_scopes(value: &str) -> Result<BTreeMap<String, BTreeSet<TagId>>> {
    let mut scopes = BTreeMap::new();
    for entry in value.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (brand, ids) = entry
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("Brand scope entry missing '=': {}", entry)))?;
        let brand = brand.trim();
        if brand.is_empty() {
            return Err(Error::Config(format!("Brand scope entry has no name: {}", entry)));
        }
        let mut set = BTreeSet::new();
        for id in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let tag: TagId = id
                .parse()
                .map_err(|_| Error::Config(format!("Invalid collection id '{}' for brand {}", id, brand)))?;
            set.insert(tag);
        }
        scopes.insert(brand.to_string(), set);
    }
    Ok(scopes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert!(!config.read_only);
        assert_eq!(config.concurrency_policy, ConcurrencyPolicy::Enforce);
        assert_eq!(config.max_graph_depth, defaults::MAX_GRAPH_DEPTH);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_brand_scopes() {
        let scopes = parse_brand_scopes("HDRUK=42,43; ADP = 7 ;").unwrap();
        assert_eq!(scopes.len(), 2);
        assert!(scopes["HDRUK"].contains(&42));
        assert!(scopes["ADP"].contains(&7));
    }

    #[test]
    fn test_parse_brand_scopes_empty_set_allowed() {
        let scopes = parse_brand_scopes("OPEN=").unwrap();
        assert!(scopes["OPEN"].is_empty());
    }

    #[test]
    fn test_parse_brand_scopes_errors() {
        assert!(parse_brand_scopes("HDRUK").is_err());
        assert!(parse_brand_scopes("=1").is_err());
        assert!(parse_brand_scopes("HDRUK=x").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "TRUE").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn test_zero_depth_rejected() {
        let config = CoreConfig {
            max_graph_depth: 0,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
