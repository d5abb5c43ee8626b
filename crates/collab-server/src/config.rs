//! Engine configuration
//!
//! TOML file, all keys optional. Seeds name files whose content a document
//! starts from the first time someone joins it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,
    /// Accepted operations retained per document for transforming stale
    /// submits.
    pub max_history: usize,
    /// Per-document event fan-out buffer; slow subscribers past this lag
    /// get a fresh snapshot instead of the missed events.
    pub broadcast_capacity: usize,
    #[serde(rename = "seed")]
    pub seeds: Vec<Seed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Seed {
    pub doc: String,
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4720".to_string(),
            max_history: 256,
            broadcast_capacity: 256,
            seeds: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            bind_addr = "0.0.0.0:9000"
            max_history = 512

            [[seed]]
            doc = "index.html"
            path = "seeds/index.html"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.max_history, 512);
        // unset keys fall back to defaults
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.seeds[0].doc, "index.html");
    }

    #[test]
    fn test_empty_config_is_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bind_addr, Config::default().bind_addr);
        assert!(config.seeds.is_empty());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("bind_adr = \"oops\"").is_err());
    }
}
