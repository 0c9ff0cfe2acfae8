use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::catalog::EntityKind;

const EMBEDDED_DEFAULT_CONFIG: &str = include_str!("../../../config/default-catalogtool.toml");

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CatalogToolConfig {
    pub site: SiteSection,
    pub redirects: RedirectsSection,
    pub assets: AssetsSection,
    pub http: HttpSection,
    pub catalog: CatalogSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SiteSection {
    pub domains: Vec<String>,
    pub shop_path: String,
    pub collections_index: String,
    #[serde(default)]
    pub extra_collections: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RedirectsSection {
    pub vendor_prefix: String,
    #[serde(default)]
    pub collections: BTreeMap<String, RedirectTarget>,
    #[serde(default)]
    pub pages: Vec<PageRename>,
}

/// Replacement for a legacy collection handle.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RedirectTarget {
    /// A single handle; empty means the collections index.
    Single(String),
    /// Candidates tried in order; the first live collection wins.
    Candidates(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PageRename {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AssetsSection {
    pub cdn_hosts: Vec<String>,
    pub extensions: Vec<String>,
    pub fallback_extension: String,
    pub products_dir: String,
    pub collections_dir: String,
    pub products_url_prefix: String,
    pub collections_url_prefix: String,
}

impl AssetsSection {
    pub fn is_remote(&self, reference: &str) -> bool {
        self.cdn_hosts
            .iter()
            .any(|host| !host.is_empty() && reference.contains(host.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CatalogSection {
    pub files: Vec<CatalogFileSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CatalogFileSpec {
    pub path: String,
    pub kind: EntityKind,
    pub content_field: Option<String>,
}

impl CatalogFileSpec {
    /// Field holding HTML for this file: explicit override, else the kind's default.
    pub fn content_field(&self) -> Option<&str> {
        match self.content_field.as_deref() {
            Some(field) if !field.trim().is_empty() => Some(field),
            Some(_) => None,
            None => self.kind.default_content_field(),
        }
    }
}

/// Effective HTTP settings after environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub workers: usize,
}

impl CatalogToolConfig {
    /// Resolve HTTP settings: env > config.
    pub fn http_settings(&self) -> HttpSettings {
        self.http_settings_with_lookup(|key| env::var(key).ok())
    }

    pub fn http_settings_with_lookup<F>(&self, lookup_env: F) -> HttpSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let user_agent = lookup_env("CATALOGTOOL_USER_AGENT")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.http.user_agent.clone());
        let timeout_ms = parse_env(&lookup_env, "CATALOGTOOL_HTTP_TIMEOUT_MS")
            .unwrap_or(self.http.timeout_ms);
        let attempts = parse_env(&lookup_env, "CATALOGTOOL_HTTP_ATTEMPTS")
            .filter(|value| *value > 0)
            .unwrap_or(self.http.attempts);
        let retry_delay_ms = parse_env(&lookup_env, "CATALOGTOOL_HTTP_RETRY_DELAY_MS")
            .unwrap_or(self.http.retry_delay_ms);
        let workers = parse_env(&lookup_env, "CATALOGTOOL_WORKERS")
            .filter(|value| *value > 0)
            .unwrap_or(self.http.workers);
        HttpSettings {
            user_agent,
            timeout_ms,
            attempts,
            retry_delay_ms,
            workers,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.site.domains.iter().all(|domain| domain.trim().is_empty()) {
            bail!("[site] domains must name at least one domain");
        }
        if self.assets.extensions.is_empty() {
            bail!("[assets] extensions cannot be empty");
        }
        if self.http.attempts == 0 {
            bail!("[http] attempts must be at least 1");
        }
        if self.http.workers == 0 {
            bail!("[http] workers must be at least 1");
        }
        for rename in &self.redirects.pages {
            if self
                .redirects
                .pages
                .iter()
                .any(|other| other.from == rename.to)
            {
                bail!(
                    "page rename {} -> {} chains into another rename",
                    rename.from,
                    rename.to
                );
            }
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup_env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup_env(key).and_then(|value| value.trim().parse::<T>().ok())
}

pub fn embedded_default_config() -> &'static str {
    EMBEDDED_DEFAULT_CONFIG
}

/// Load the embedded defaults overlaid with `config_path`. A missing file yields the defaults.
pub fn load_config(config_path: &Path) -> Result<CatalogToolConfig> {
    if !config_path.exists() {
        return parse_config(None);
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    parse_config(Some(&content))
        .with_context(|| format!("failed to parse {}", config_path.display()))
}

/// Parse the embedded defaults, then merge `overlay` over them table by table.
pub fn parse_config(overlay: Option<&str>) -> Result<CatalogToolConfig> {
    let mut root = toml::from_str::<Value>(EMBEDDED_DEFAULT_CONFIG)
        .context("embedded default config is not valid TOML")?;
    if let Some(overlay) = overlay {
        let overlay = toml::from_str::<Value>(overlay)?;
        if !overlay.is_table() {
            bail!("top-level TOML must be a table");
        }
        merge_tables(&mut root, overlay);
    }
    let config: CatalogToolConfig = root.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Tables merge key by key; every other value (arrays included) replaces the base.
fn merge_tables(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                let nested = value.is_table() && base_table.get(&key).is_some_and(Value::is_table);
                match base_table.get_mut(&key) {
                    Some(existing) if nested => merge_tables(existing, value),
                    _ => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
