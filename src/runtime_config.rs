// =============================================================================
// Process configuration & symbol catalog bootstrap
// =============================================================================
//
// Two distinct layers of configuration:
//   - `ProcessConfig` comes from the environment at startup (bind address,
//     database path, real-feed base URL) — it never changes for the life of
//     the process.
//   - `SymbolCatalogFile` is the bootstrap seed for the hot-reloadable
//     `SymbolConfig` table (app_state.rs): read once if the persistence
//     layer's own table is empty, then the database becomes authoritative.
//     Saved with the same atomic tmp + rename pattern as the rest of this
//     codebase's on-disk config handling, so a crash mid-write can't corrupt
//     the seed file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app_state::ProcessConfig;
use crate::types::SymbolConfig;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> String {
    "otc-core.sqlite3".to_string()
}

fn default_real_feed_base_url() -> String {
    "http://localhost:9100/prices".to_string()
}

fn default_symbol_catalog_path() -> String {
    "symbol_catalog.json".to_string()
}

impl ProcessConfig {
    /// Read process configuration from the environment, applying the same
    /// defaults a developer running this locally without a `.env` file would
    /// get. Call `dotenv::dotenv()` before this if a `.env` file should be
    /// honoured.
    pub fn from_env() -> Self {
        Self {
            listen_addr: std::env::var("OTC_BIND_ADDR").unwrap_or_else(|_| default_bind_addr()),
            db_path: std::env::var("OTC_DB_PATH").unwrap_or_else(|_| default_db_path()),
            real_feed_base_url: std::env::var("OTC_REAL_FEED_URL").unwrap_or_else(|_| default_real_feed_base_url()),
            real_feed_ws_url: std::env::var("OTC_REAL_FEED_WS_URL").ok(),
        }
    }

    /// Path to the symbol catalog bootstrap file, from `OTC_SYMBOL_CATALOG`.
    pub fn symbol_catalog_path() -> String {
        std::env::var("OTC_SYMBOL_CATALOG").unwrap_or_else(|_| default_symbol_catalog_path())
    }
}

/// On-disk bootstrap seed for the symbol catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolCatalogFile {
    pub symbols: Vec<SymbolConfig>,
}

impl SymbolCatalogFile {
    /// A reasonable starting catalog: a handful of major forex pairs plus
    /// one always-open crypto pair, so the process has something to serve
    /// ticks for on a completely fresh deployment.
    pub fn default_catalog() -> Self {
        Self {
            symbols: vec![
                SymbolConfig::default_forex("EUR/USD"),
                SymbolConfig::default_forex("GBP/USD"),
                SymbolConfig::default_forex("USD/JPY"),
                SymbolConfig::default_crypto("BTC/USD"),
            ],
        }
    }

    /// Load the catalog from `path`, falling back to `default_catalog` (and
    /// writing it out) if the file does not exist yet.
    pub fn load_or_bootstrap(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let catalog = Self::default_catalog();
            catalog.save(path).context("failed to write bootstrap symbol catalog")?;
            info!(path = %path.display(), "wrote bootstrap symbol catalog");
            return Ok(catalog);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read symbol catalog from {}", path.display()))?;
        let catalog: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse symbol catalog from {}", path.display()))?;
        info!(path = %path.display(), count = catalog.symbols.len(), "loaded symbol catalog");
        Ok(catalog)
    }

    /// Persist the catalog to `path` using an atomic write (write to `.tmp`,
    /// then rename), matching this codebase's established config-save
    /// pattern.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise symbol catalog to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp symbol catalog to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp symbol catalog to {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_validates() {
        for cfg in SymbolCatalogFile::default_catalog().symbols {
            assert!(cfg.validate().is_ok(), "{} failed validation", cfg.symbol);
        }
    }

    #[test]
    fn load_or_bootstrap_writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = SymbolCatalogFile::load_or_bootstrap(&path).unwrap();
        assert!(path.exists());
        assert_eq!(catalog.symbols.len(), 4);
    }

    #[test]
    fn load_or_bootstrap_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let mut custom = SymbolCatalogFile::default_catalog();
        custom.symbols.truncate(1);
        custom.save(&path).unwrap();

        let loaded = SymbolCatalogFile::load_or_bootstrap(&path).unwrap();
        assert_eq!(loaded.symbols.len(), 1);
    }

    #[test]
    fn process_config_from_env_applies_defaults() {
        std::env::remove_var("OTC_BIND_ADDR");
        std::env::remove_var("OTC_DB_PATH");
        std::env::remove_var("OTC_REAL_FEED_URL");
        let cfg = ProcessConfig::from_env();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.db_path, "otc-core.sqlite3");
    }
}
