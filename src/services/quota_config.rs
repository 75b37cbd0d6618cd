//! Quota configuration file format and loader.

use crate::core::config::home_config_dir;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ROLLING_SECONDS: i64 = 5 * 60 * 60;
pub const DEFAULT_WEEKLY_SECONDS: i64 = 7 * 24 * 60 * 60;

/// How the weekly cap of a model is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeeklyLimit {
    /// Wall-clock request hours.
    Hours(u64),
    /// Input plus output tokens.
    Tokens(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaModelConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub rolling_tokens: i64,
    /// `hours` or `tokens`, case-insensitive.
    #[serde(default)]
    pub weekly_limit_type: String,
    #[serde(default)]
    pub weekly_limit_value: i64,
    #[serde(default)]
    pub warn_pct: f64,
}

impl QuotaModelConfig {
    pub fn rolling_cap(&self) -> Option<u64> {
        (self.rolling_tokens > 0).then_some(self.rolling_tokens as u64)
    }

    /// Weekly limit, if a positive value with a known type is configured.
    pub fn weekly_limit(&self) -> Option<WeeklyLimit> {
        if self.weekly_limit_value <= 0 {
            return None;
        }
        let value = self.weekly_limit_value as u64;
        if self.weekly_limit_type.eq_ignore_ascii_case("hours") {
            Some(WeeklyLimit::Hours(value))
        } else if self.weekly_limit_type.eq_ignore_ascii_case("tokens") {
            Some(WeeklyLimit::Tokens(value))
        } else {
            None
        }
    }

    /// Weekly token capacity; hours-based limits have none.
    pub fn weekly_token_cap(&self) -> Option<u64> {
        match self.weekly_limit() {
            Some(WeeklyLimit::Tokens(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaWindows {
    #[serde(default)]
    pub rolling_seconds: i64,
    #[serde(default)]
    pub weekly_seconds: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotasFile {
    #[serde(default)]
    pub windows: QuotaWindows,
    #[serde(default)]
    pub models: BTreeMap<String, QuotaModelConfig>,
}

impl QuotasFile {
    /// Built-in configuration: 5h rolling, 7d weekly, no model caps.
    pub fn builtin() -> Self {
        Self {
            windows: QuotaWindows {
                rolling_seconds: DEFAULT_ROLLING_SECONDS,
                weekly_seconds: DEFAULT_WEEKLY_SECONDS,
            },
            models: BTreeMap::new(),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse quotas JSON")
    }

    pub fn rolling_window(&self) -> Duration {
        positive_secs(self.windows.rolling_seconds, DEFAULT_ROLLING_SECONDS)
    }

    pub fn weekly_window(&self) -> Duration {
        positive_secs(self.windows.weekly_seconds, DEFAULT_WEEKLY_SECONDS)
    }

    pub fn model(&self, name: &str) -> Option<&QuotaModelConfig> {
        self.models.get(name)
    }
}

fn positive_secs(value: i64, default: i64) -> Duration {
    Duration::from_secs(if value > 0 { value } else { default } as u64)
}

/// Quota file precedence: `CCP_QUOTAS_FILE`, user config, project config, example.
pub fn default_quota_paths(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(env) = std::env::var("CCP_QUOTAS_FILE") {
        if !env.trim().is_empty() {
            paths.push(PathBuf::from(env.trim()));
        }
    }
    if let Some(dir) = home_config_dir() {
        paths.push(dir.join("quotas.json"));
    }
    paths.push(root.join("configs").join("quotas.json"));
    paths.push(root.join("configs").join("quotas.example.json"));
    paths
}

/// Load the first readable quota file. Unreadable paths are skipped; a file
/// that exists but does not parse is an error.
pub fn load_quotas(paths: &[PathBuf]) -> Result<(QuotasFile, PathBuf)> {
    for path in paths {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        let cfg = QuotasFile::parse(&content)
            .with_context(|| format!("Failed to load quotas file: {}", path.display()))?;
        return Ok((cfg, path.clone()));
    }
    Err(anyhow!("no quotas config found"))
}
