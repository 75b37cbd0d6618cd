//! Routing policy and provider catalog.
//!
//! Both are immutable once loaded. A reload builds a fresh value and swaps it
//! in whole; nothing here is mutated in place.

use crate::core::config::{expand_env_vars, home_config_dir};
use crate::services::lane::Lane;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Policy used when no policy file is present or the file is unusable.
pub const EMBEDDED_POLICY_JSON: &str = r#"{
  "version": "embedded-1",
  "routes": [
    {"pattern": "*haiku*", "lane": "zai"},
    {"pattern": "*", "lane": "anth"}
  ],
  "providers": {
    "anth": {"base_url": "https://api.anthropic.com", "pass_through": true, "fallback_env": "ANTHROPIC_AUTH_TOKEN"},
    "zai": {"base_url": "https://api.z.ai/api/anthropic", "header_mode": "x-api-key"}
  }
}"#;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRoute {
    pub pattern: String,
    pub lane: String,
}

/// Per-lane provider metadata carried by a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyProvider {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub header_mode: String,
    #[serde(default = "default_true")]
    pub pass_through: bool,
    #[serde(default)]
    pub fallback_env: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub routes: Vec<PolicyRoute>,
    #[serde(default)]
    pub providers: HashMap<String, PolicyProvider>,
}

impl Policy {
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse policy JSON")
    }

    pub fn embedded() -> Self {
        // The embedded document is a compile-time constant covered by tests.
        Self::parse(EMBEDDED_POLICY_JSON).unwrap_or_default()
    }

    /// Provider metadata for `lane_name`; `anth` and `anthropic` are aliases.
    pub fn provider(&self, lane_name: &str) -> Option<&PolicyProvider> {
        let wanted = Lane::from_provider_id(lane_name)?;
        self.providers
            .iter()
            .find(|(id, _)| Lane::from_provider_id(id) == Some(wanted))
            .map(|(_, p)| p)
    }

    /// Lane named by the first route whose pattern matches `model`.
    pub fn lane_for_model(&self, model: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|route| match_pattern(&route.pattern, model))
            .map(|route| route.lane.as_str())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|exp| exp <= now)
    }
}

/// Policy file precedence: `CCP_POLICY_FILE`, user config, project config.
pub fn default_policy_paths(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(env) = std::env::var("CCP_POLICY_FILE") {
        if !env.trim().is_empty() {
            paths.push(PathBuf::from(env.trim()));
        }
    }
    if let Some(dir) = home_config_dir() {
        paths.push(dir.join("policy.json"));
    }
    paths.push(root.join("configs").join("policy.json"));
    paths
}

/// Load the first readable policy file, falling back to the embedded policy
/// when none exists, the file fails to parse, or it has expired.
pub fn resolve_policy(paths: &[PathBuf]) -> Policy {
    for path in paths {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        match Policy::parse(&content) {
            Ok(policy) if policy.is_expired_at(Utc::now()) => {
                tracing::warn!(
                    path = %path.display(),
                    version = %policy.version,
                    "Policy expired; using embedded policy"
                );
                return Policy::embedded();
            }
            Ok(policy) => {
                tracing::info!(path = %path.display(), version = %policy.version, "Loaded policy");
                return policy;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Invalid policy ({:#}); using embedded policy", e);
                return Policy::embedded();
            }
        }
    }
    Policy::embedded()
}

/// One provider in the external catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Name of the environment variable holding the credential.
    #[serde(default)]
    pub key_env: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub header_mode: String,
    /// Patterns appended after the catalog's explicit route list.
    #[serde(default)]
    pub routes: Vec<String>,
}

impl ProviderEntry {
    pub fn has_credential(&self) -> bool {
        !self.key_env.is_empty()
            && std::env::var(&self.key_env)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRoute {
    pub pattern: String,
    pub provider: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCatalog {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
    #[serde(default)]
    pub routes: Vec<ProviderRoute>,
}

impl ProviderCatalog {
    /// Parse a catalog document. JSON is used for `.json` paths and YAML for
    /// everything else; `${VAR}` references are expanded first.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let catalog: ProviderCatalog = if is_json {
            serde_json::from_str(&expanded)
                .with_context(|| format!("Failed to parse provider catalog: {}", path.display()))?
        } else {
            serde_yaml::from_str(&expanded)
                .with_context(|| format!("Failed to parse provider catalog: {}", path.display()))?
        };
        if catalog.providers.is_empty() {
            bail!("provider catalog {} declares no providers", path.display());
        }
        Ok(catalog)
    }

    /// Lane of the first route matching `model` whose provider is declared in
    /// this catalog and names a known lane. Explicit routes come first, then
    /// each provider's own `routes` patterns.
    pub fn lane_for_model(&self, model: &str) -> Option<Lane> {
        let explicit = self
            .routes
            .iter()
            .map(|r| (r.pattern.as_str(), r.provider.as_str()));
        let per_provider = self.providers.iter().flat_map(|(name, entry)| {
            entry
                .routes
                .iter()
                .map(move |pattern| (pattern.as_str(), name.as_str()))
        });

        explicit
            .chain(per_provider)
            .filter(|(pattern, _)| match_pattern(pattern, model))
            .filter(|(_, provider)| self.providers.contains_key(*provider))
            .find_map(|(_, provider)| Lane::from_provider_id(provider))
    }
}

/// Loaded catalog plus where it came from. `error` marks a catalog that failed
/// to load; routing then ignores it and readiness reports 503.
#[derive(Debug, Clone)]
pub struct CatalogState {
    pub catalog: ProviderCatalog,
    pub source: String,
    pub error: Option<String>,
}

impl CatalogState {
    pub fn empty() -> Self {
        Self {
            catalog: ProviderCatalog::default(),
            source: "<embedded>".to_string(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            catalog: ProviderCatalog::default(),
            source: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

/// Catalog precedence: `CCP_PROVIDERS_FILE`, user config, project config, example.
pub fn default_provider_paths(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(env) = std::env::var("CCP_PROVIDERS_FILE") {
        if !env.trim().is_empty() {
            paths.push(PathBuf::from(env.trim()));
        }
    }
    if let Some(dir) = home_config_dir() {
        paths.push(dir.join("providers.yaml"));
    }
    paths.push(root.join("configs").join("providers.yaml"));
    paths.push(root.join("configs").join("providers.example.yaml"));
    paths
}

/// Load the first existing catalog file. `Ok(None)` means no file was found.
pub fn load_provider_catalog(paths: &[PathBuf]) -> Result<Option<(ProviderCatalog, PathBuf)>> {
    for path in paths {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        let catalog = ProviderCatalog::parse(&content, path)?;
        return Ok(Some((catalog, path.clone())));
    }
    Ok(None)
}

/// Load the catalog into a [`CatalogState`], logging the outcome.
pub fn load_catalog_state(paths: &[PathBuf]) -> CatalogState {
    match load_provider_catalog(paths) {
        Ok(Some((catalog, path))) => {
            tracing::info!(
                path = %path.display(),
                providers = catalog.providers.len(),
                routes = catalog.routes.len(),
                "Loaded provider catalog"
            );
            CatalogState {
                catalog,
                source: path.display().to_string(),
                error: None,
            }
        }
        Ok(None) => CatalogState::empty(),
        Err(e) => {
            tracing::warn!("Provider catalog unusable: {:#}", e);
            CatalogState::failed(format!("{e:#}"))
        }
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Case-insensitive shell-glob match (`*`, `?`, `[...]`). `*` does not cross
/// `/`. A pattern that is not a valid glob degrades to prefix/suffix matching
/// on its `*`-delimited ends.
pub fn match_pattern(pattern: &str, name: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    let name = name.trim().to_lowercase();
    match Pattern::new(&pattern) {
        Ok(glob) => glob.matches_with(&name, MATCH_OPTIONS),
        Err(e) => {
            tracing::debug!(pattern = %pattern, error = %e, "Invalid glob, matching by prefix/suffix");
            match_affixes(&pattern, &name)
        }
    }
}

fn match_affixes(pattern: &str, name: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(_), Some(_)) if pattern.len() >= 2 => name.contains(&pattern[1..pattern.len() - 1]),
        (Some(suffix), None) => name.ends_with(suffix),
        (None, Some(prefix)) => name.starts_with(prefix),
        _ => pattern == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    #[test]
    fn test_match_pattern_basics() {
        assert!(match_pattern("*haiku*", "claude-haiku-4.5"));
        assert!(match_pattern("claude-*", "Claude-Sonnet-4.5"));
        assert!(match_pattern("*-4.5", "claude-opus-4.5"));
        assert!(match_pattern("glm-4.?", "glm-4.6"));
        assert!(match_pattern("*", ""));
        assert!(!match_pattern("*haiku*", "claude-sonnet-4.5"));
        assert!(!match_pattern("glm", "glm-4.6"));
        assert!(!match_pattern("", "glm"));
    }

    #[test]
    fn test_match_pattern_classes_and_separators() {
        assert!(match_pattern("claude-[34]-*", "claude-3-opus"));
        assert!(match_pattern("claude-[34]-*", "CLAUDE-4-sonnet"));
        assert!(!match_pattern("claude-[34]-*", "claude-5-opus"));
        assert!(match_pattern("glm-4.[!5]", "glm-4.6"));
        assert!(!match_pattern("*haiku*", "vendor/claude-haiku"));
        assert!(match_pattern("vendor/*", "vendor/claude-haiku"));
    }

    #[test]
    fn test_invalid_glob_falls_back_to_affixes() {
        // an unclosed class is not a valid glob
        assert!(match_pattern("claude-[*", "claude-[x]"));
        assert!(!match_pattern("claude-[*", "claude-3"));
        assert!(match_pattern("*[beta", "glm-4.6-[beta"));
        assert!(match_pattern("*[x*", "a[xb"));
        assert!(match_pattern("[", "["));
        assert!(!match_pattern("[", "a"));
    }

    #[test]
    fn test_embedded_policy_parses() {
        let policy = Policy::parse(EMBEDDED_POLICY_JSON).unwrap();
        assert_eq!(policy.version, "embedded-1");
        assert_eq!(policy.lane_for_model("claude-haiku-4.5"), Some("zai"));
        assert_eq!(policy.lane_for_model("claude-sonnet-4.5"), Some("anth"));
        assert!(policy.provider("anthropic").is_some());
        assert!(policy.provider("anth").unwrap().pass_through);
    }

    #[test]
    fn test_policy_expiry() {
        let policy = Policy::parse(r#"{"version":"old","expires":"2020-01-01T00:00:00Z"}"#).unwrap();
        assert!(policy.is_expired_at(Utc::now()));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{"version":"old","expires":"2020-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(resolve_policy(&[path]).version, "embedded-1");
    }

    #[test]
    fn test_resolve_policy_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"version":"p7","routes":[{"pattern":"glm-*","lane":"zai"}]}"#,
        )
        .unwrap();
        let policy = resolve_policy(&[dir.path().join("missing.json"), path]);
        assert_eq!(policy.version, "p7");
        assert_eq!(policy.lane_for_model("GLM-4.6"), Some("zai"));
        assert_eq!(policy.lane_for_model("claude-haiku-4.5"), None);
    }

    #[test]
    fn test_catalog_routes_and_provider_patterns() {
        let yaml = r#"
providers:
  anth:
    key_env: ANTH_KEY
    base_url: https://anth.example.com
  zai:
    key_env: ZAI_KEY
    base_url: https://zai.example.com
    routes: ["glm-*"]
routes:
  - pattern: "*haiku*"
    provider: zai
  - pattern: "*opus*"
    provider: openrouter
  - pattern: "claude-*"
    provider: anth
"#;
        let catalog = ProviderCatalog::parse(yaml, Path::new("providers.yaml")).unwrap();
        assert_eq!(catalog.lane_for_model("claude-haiku-4.5"), Some(Lane::Zai));
        // undeclared provider is skipped, next matching route wins
        assert_eq!(catalog.lane_for_model("claude-opus-4.1"), Some(Lane::Anthropic));
        assert_eq!(catalog.lane_for_model("glm-4.6"), Some(Lane::Zai));
        assert_eq!(catalog.lane_for_model("gpt-5"), None);
    }

    #[test]
    fn test_catalog_json_and_invalid() {
        let json = r#"{"providers":{"zai":{"base_url":"https://z"}}}"#;
        let catalog = ProviderCatalog::parse(json, Path::new("providers.json")).unwrap();
        assert_eq!(catalog.providers["zai"].base_url, "https://z");

        assert!(ProviderCatalog::parse("providers: []\n", Path::new("bad.yaml")).is_err());
        assert!(ProviderCatalog::parse("providers: {}\n", Path::new("empty.yaml")).is_err());
    }

    #[test]
    #[serial]
    fn test_catalog_env_expansion() {
        unsafe {
            std::env::set_var("CCP_TEST_CATALOG_BASE", "https://expanded.example.com");
        }
        let yaml = "providers:\n  anth:\n    base_url: ${CCP_TEST_CATALOG_BASE}\n";
        let catalog = ProviderCatalog::parse(yaml, Path::new("p.yaml")).unwrap();
        assert_eq!(
            catalog.providers["anth"].base_url,
            "https://expanded.example.com"
        );
        unsafe {
            std::env::remove_var("CCP_TEST_CATALOG_BASE");
        }
    }

    #[test]
    fn test_load_catalog_precedence_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.yaml");
        let second = dir.path().join("second.yaml");
        std::fs::write(&first, "providers:\n  anth:\n    base_url: https://first\n").unwrap();
        std::fs::write(&second, "providers:\n  anth:\n    base_url: https://second\n").unwrap();

        let state = load_catalog_state(&[dir.path().join("nope.yaml"), first.clone(), second]);
        assert!(state.is_healthy());
        assert_eq!(state.source, first.display().to_string());
        assert_eq!(state.catalog.providers["anth"].base_url, "https://first");

        let none = load_catalog_state(&[dir.path().join("nope.yaml")]);
        assert!(none.is_healthy());
        assert_eq!(none.source, "<embedded>");

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "providers: []\n").unwrap();
        let failed = load_catalog_state(&[bad]);
        assert!(!failed.is_healthy());
    }

    mod props {
        use super::super::match_pattern;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn star_matches_everything(name in "[a-z0-9.-]{0,24}") {
                prop_assert!(match_pattern("*", &name));
            }

            #[test]
            fn literal_matches_itself_case_insensitively(name in "[a-z0-9.-]{1,24}") {
                prop_assert!(match_pattern(&name, &name.to_uppercase()));
            }

            #[test]
            fn prefix_glob_matches_prefixed_names(prefix in "[a-z]{1,8}", rest in "[a-z0-9.-]{0,16}") {
                let name = format!("{prefix}{rest}");
                let pattern = format!("{prefix}*");
                prop_assert!(match_pattern(&pattern, &name));
            }
        }
    }
}
