//! Configuration management for the routing proxy.
//!
//! Everything is read from the process environment (optionally seeded from a
//! `.env` file by `main`). A routing [`Policy`] may supply provider defaults;
//! explicit environment variables always win over the policy, and the policy
//! wins over built-in constants.

use crate::services::lane::HeaderMode;
use crate::services::policy::Policy;
use crate::services::router::RerouteMode;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";
pub const DEFAULT_ZAI_BASE: &str = "https://api.z.ai/api/anthropic";
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_FALLBACK_ENV: &str = "ANTHROPIC_AUTH_TOKEN";

/// Main proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server: ServerConfig,

    /// Base URL of the default lane.
    pub anthropic_base_url: String,
    /// Base URL of the offload lane.
    pub zai_base_url: String,
    /// Offload lane credential. `None` disables every offload decision that
    /// requires a credential.
    pub zai_api_key: Option<String>,
    /// Which header carries the offload credential.
    pub zai_header_mode: HeaderMode,
    /// Keep the client's `authorization` header on the default lane.
    pub anthropic_pass_through: bool,
    /// Bearer token injected on the default lane when the client sent none.
    pub anthropic_fallback_token: Option<String>,
    /// `anthropic-version` used when the client does not send one.
    pub anthropic_version: String,

    pub reroute_mode: RerouteMode,
    pub paused: bool,
    pub force_haiku_to_zai: bool,
    pub force_h1: bool,

    /// Manual model pin from `CCP_MODEL`.
    pub manual_model: Option<String>,
    /// Manual model pin file, re-read on every request.
    pub manual_model_file: Option<PathBuf>,

    pub timeouts: TimeoutConfig,
    pub quota_cooldown: Duration,

    pub dev_enable: bool,
    pub net_fallback: bool,
    pub backoff_simulation: bool,

    /// Root for `configs/`, `results/` and relative log paths.
    pub repo_root: PathBuf,
    pub license_file: Option<PathBuf>,

    pub calibration_interval: Duration,
    pub partials_dir: Option<PathBuf>,
    pub usage_log: UsageLogConfig,

    pub store: StoreConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Per-phase upstream timeouts.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub dial: Duration,
    pub tls: Duration,
    pub header: Duration,
    pub json: Duration,
    /// Zero disables the idle timer.
    pub sse_idle: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(5),
            tls: Duration::from_secs(5),
            header: Duration::from_secs(15),
            json: Duration::from_secs(30),
            sse_idle: Duration::from_secs(120),
        }
    }
}

/// JSONL usage/anomaly log configuration.
#[derive(Debug, Clone)]
pub struct UsageLogConfig {
    pub enabled: bool,
    pub usage_path: PathBuf,
    pub anomaly_path: PathBuf,
    /// Rotate to `<path>.1` once the file grows past this many bytes.
    pub max_bytes: u64,
    pub buffer_size: usize,
}

impl Default for UsageLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            usage_path: PathBuf::from("logs/usage.jsonl"),
            anomaly_path: PathBuf::from("logs/anomalies.jsonl"),
            max_bytes: 50 * 1024 * 1024,
            buffer_size: 1000,
        }
    }
}

/// Sample store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub enabled: bool,
    pub rollup_interval: Duration,
    pub sample_ttl_days: u32,
    pub rollup_retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rollup_interval: Duration::from_secs(300),
            sample_ttl_days: 7,
            rollup_retention_days: 30,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

impl Default for ProxyConfig {
    /// Built-in defaults with every optional feature off. Tests start here and
    /// override what they need.
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            anthropic_base_url: DEFAULT_ANTHROPIC_BASE.to_string(),
            zai_base_url: DEFAULT_ZAI_BASE.to_string(),
            zai_api_key: None,
            zai_header_mode: HeaderMode::XApiKey,
            anthropic_pass_through: true,
            anthropic_fallback_token: None,
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.to_string(),
            reroute_mode: RerouteMode::Hybrid,
            paused: false,
            force_haiku_to_zai: false,
            force_h1: false,
            manual_model: None,
            manual_model_file: None,
            timeouts: TimeoutConfig::default(),
            quota_cooldown: Duration::from_secs(300),
            dev_enable: false,
            net_fallback: false,
            backoff_simulation: false,
            repo_root: PathBuf::from("."),
            license_file: None,
            calibration_interval: Duration::from_secs(3600),
            partials_dir: None,
            usage_log: UsageLogConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Self {
        Self::from_env_with_policy(None)
    }

    /// Load configuration from the environment, taking provider defaults from
    /// `policy` where the environment is silent.
    pub fn from_env_with_policy(policy: Option<&Policy>) -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_non_empty("PORT").and_then(|p| p.parse().ok()) {
            config.server.port = port;
        }

        let anth_policy = policy.and_then(|p| p.provider("anthropic"));
        let zai_policy = policy.and_then(|p| p.provider("zai"));

        if let Some(base) = anth_policy.and_then(|p| non_empty(&p.base_url)) {
            config.anthropic_base_url = base;
        }
        if let Some(base) = zai_policy.and_then(|p| non_empty(&p.base_url)) {
            config.zai_base_url = base;
        }
        if let Some(base) = env_non_empty("ANTHROPIC_BASE_URL") {
            config.anthropic_base_url = base;
        }
        if let Some(base) = env_non_empty("ZAI_BASE_URL") {
            config.zai_base_url = base;
        }

        config.zai_api_key = env_non_empty("ZAI_API_KEY");
        config.zai_header_mode = env_non_empty("ZAI_HEADER_MODE")
            .or_else(|| zai_policy.and_then(|p| non_empty(&p.header_mode)))
            .and_then(|m| HeaderMode::parse(&m))
            .unwrap_or_default();

        let mut fallback_env = DEFAULT_FALLBACK_ENV.to_string();
        if let Some(anth) = anth_policy {
            if let Some(env) = non_empty(&anth.fallback_env) {
                fallback_env = env;
            }
            config.anthropic_pass_through = anth.pass_through;
        }
        config.anthropic_fallback_token = env_non_empty(&fallback_env);

        if let Some(version) = env_non_empty("ANTH_VERSION") {
            config.anthropic_version = version;
        }

        config.reroute_mode =
            RerouteMode::parse(&std::env::var("CCP_REROUTE_MODE").unwrap_or_default());
        config.paused = env_flag("OFFLOAD_PAUSED");
        config.force_haiku_to_zai = env_flag("FORCE_HAIKU_TO_ZAI");
        config.force_h1 = env_flag("MITM_FORCE_H1");

        config.manual_model = env_non_empty("CCP_MODEL");
        config.manual_model_file = home_config_dir().map(|dir| dir.join("model"));

        config.timeouts = TimeoutConfig {
            dial: duration_from_env("CCP_DIAL_TIMEOUT", config.timeouts.dial),
            tls: duration_from_env("CCP_TLS_TIMEOUT", config.timeouts.tls),
            header: duration_from_env("CCP_HEADER_TIMEOUT", config.timeouts.header),
            json: duration_from_env("CCP_JSON_TIMEOUT", config.timeouts.json),
            sse_idle: duration_from_env("CCP_SSE_IDLE_TIMEOUT", config.timeouts.sse_idle),
        };
        let cooldown = duration_from_env("CCP_QUOTA_COOLDOWN", config.quota_cooldown);
        if !cooldown.is_zero() {
            config.quota_cooldown = cooldown;
        }

        config.dev_enable = env_flag("CCP_DEV_ENABLE");
        config.net_fallback = env_flag("CCP_NET_FALLBACK");
        config.backoff_simulation = env_flag("SHIM_ENABLE_BACKOFF");

        config.repo_root = env_non_empty("CCC_REPO_ROOT")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        config.license_file = env_non_empty("CC_LICENSE_JSON").map(PathBuf::from);

        if let Some(minutes) = env_non_empty("CCP_CAL_SAMPLE_MINUTES")
            .and_then(|m| m.parse::<u64>().ok())
            .filter(|m| *m > 0)
        {
            config.calibration_interval = Duration::from_secs(minutes * 60);
        }

        let root = config.repo_root.clone();
        config.partials_dir = Some(resolve(
            &root,
            env_non_empty("CCP_PARTIALS_DIR").unwrap_or_else(|| "logs/partials".to_string()),
        ));

        config.usage_log = UsageLogConfig {
            enabled: std::env::var("CCP_USAGE_LOG_ENABLED")
                .map(|v| str_to_bool(&v))
                .unwrap_or(true),
            usage_path: resolve(
                &root,
                env_non_empty("CCP_USAGE_LOG").unwrap_or_else(|| "logs/usage.jsonl".to_string()),
            ),
            anomaly_path: resolve(
                &root,
                env_non_empty("CCP_ANOMALY_LOG")
                    .unwrap_or_else(|| "logs/anomalies.jsonl".to_string()),
            ),
            max_bytes: env_non_empty("CCP_USAGE_LOG_MAX_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(config.usage_log.max_bytes),
            buffer_size: config.usage_log.buffer_size,
        };

        config.store = StoreConfig {
            enabled: std::env::var("CCP_PERSIST")
                .map(|v| v.trim().is_empty() || str_to_bool(&v))
                .unwrap_or(true),
            rollup_interval: {
                let interval = duration_from_env("CCP_ROLLUP_INTERVAL", config.store.rollup_interval);
                if interval.is_zero() {
                    config.store.rollup_interval
                } else {
                    interval
                }
            },
            sample_ttl_days: positive_u32_env("CCP_SAMPLE_TTL_DAYS", 7),
            rollup_retention_days: positive_u32_env("CCP_ROLLUP_RETENTION_DAYS", 30),
        };

        config
    }

    /// Offload lane credential, if configured.
    pub fn zai_key(&self) -> Option<&str> {
        self.zai_api_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// `~/.config/ccp`, when a home directory is known.
pub fn home_config_dir() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".config").join("ccp"))
}

fn resolve(root: &Path, value: String) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| non_empty(&v))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| str_to_bool(&v)).unwrap_or(false)
}

fn positive_u32_env(name: &str, default: u32) -> u32 {
    env_non_empty(name)
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Read a duration from the environment, falling back to `default` when unset
/// or unparsable.
pub fn duration_from_env(name: &str, default: Duration) -> Duration {
    env_non_empty(name)
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Parse `150ms`, `5s`, `2m`, `1h`, compound forms like `1m30s`, or bare
/// seconds. Negative or malformed input yields `None`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return (secs >= 0.0 && secs.is_finite()).then(|| Duration::from_secs_f64(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
        if num_end == 0 {
            return None;
        }
        let (number, tail) = rest.split_at(num_end);
        let n: f64 = number.parse().ok()?;
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);
        let factor = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(n * factor);
        rest = next;
    }
    Some(total)
}

/// Expand environment variables in the format `${VAR}` or `${VAR:-default}`.
pub fn expand_env_vars(content: &str) -> String {
    static PATTERN: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    let Some(re) = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^}:]+)(?::-(.*?))?\}").ok())
        .as_ref()
    else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
    })
    .to_string()
}

/// Convert string to boolean.
pub fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
