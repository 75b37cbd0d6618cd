//! Upstream request construction.
//!
//! Each lane owns a [`HeaderStrategy`] (which credential headers it sends)
//! and a [`TokenExtractor`] (where its usage numbers live). Request headers
//! are always rebuilt from the client's headers for the lane actually being
//! dialed, so one lane's credentials never reach the other.

use crate::core::config::{ProxyConfig, TimeoutConfig};
use crate::services::lane::{HeaderMode, Lane};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::time::Duration;

const HOP_BY_HOP: [&str; 4] = ["content-length", "connection", "transfer-encoding", "host"];
const ANTHROPIC_VERSION: &str = "anthropic-version";
const X_API_KEY: &str = "x-api-key";

/// Credential handling for one lane.
pub trait HeaderStrategy: Send + Sync {
    /// Set this lane's credential headers on `headers`, which already hold
    /// the client's forwarded headers. `mode` overrides the configured
    /// header mode where the lane has one.
    fn apply_credentials(&self, headers: &mut HeaderMap, mode: Option<HeaderMode>);

    /// Configured header mode, if the lane has a choice.
    fn header_mode(&self) -> Option<HeaderMode> {
        None
    }
}

/// Default lane: keeps the client's bearer token unless pass-through is off,
/// then falls back to a configured token.
pub struct AnthropicHeaders {
    pub pass_through: bool,
    pub fallback_token: Option<String>,
}

impl HeaderStrategy for AnthropicHeaders {
    fn apply_credentials(&self, headers: &mut HeaderMap, _mode: Option<HeaderMode>) {
        headers.remove(X_API_KEY);
        if !self.pass_through {
            headers.remove(header::AUTHORIZATION);
        }
        if !headers.contains_key(header::AUTHORIZATION) {
            if let Some(token) = self.fallback_token.as_deref() {
                insert_bearer(headers, token);
            }
        }
    }
}

/// Offload lane: client credentials are always replaced by the lane key.
pub struct ZaiHeaders {
    pub api_key: String,
    pub mode: HeaderMode,
}

impl HeaderStrategy for ZaiHeaders {
    fn apply_credentials(&self, headers: &mut HeaderMap, mode: Option<HeaderMode>) {
        headers.remove(header::AUTHORIZATION);
        headers.remove(X_API_KEY);
        match mode.unwrap_or(self.mode) {
            HeaderMode::Authorization => insert_bearer(headers, &self.api_key),
            HeaderMode::XApiKey => {
                if let Ok(value) = HeaderValue::from_str(&self.api_key) {
                    headers.insert(X_API_KEY, value);
                }
            }
        }
    }

    fn header_mode(&self) -> Option<HeaderMode> {
        Some(self.mode)
    }
}

fn insert_bearer(headers: &mut HeaderMap, token: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
        headers.insert(header::AUTHORIZATION, value);
    }
}

/// Build the outbound headers for one dispatch.
pub fn build_upstream_headers(
    client: &HeaderMap,
    default_version: &str,
    strategy: &dyn HeaderStrategy,
    mode: Option<HeaderMode>,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(client.len() + 4);
    for (name, value) in client {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let version = client
        .get(ANTHROPIC_VERSION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default_version);
    if let Ok(value) = HeaderValue::from_str(version) {
        headers.insert(HeaderName::from_static(ANTHROPIC_VERSION), value);
    }
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    strategy.apply_credentials(&mut headers, mode);
    headers
}

/// reqwest 0.11 still speaks `http` 0.2; headers cross over byte for byte.
pub fn to_reqwest_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

pub fn from_reqwest_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

/// Where a lane reports token usage besides the response body.
pub trait TokenExtractor: Send + Sync {
    /// `(input, output)` from a JSON response body.
    fn from_json(&self, body: &[u8]) -> Option<(u64, u64)>;
    /// `(input, output)` from response headers.
    fn from_headers(&self, headers: &HeaderMap) -> Option<(u64, u64)>;
}

fn usage_from_body(body: &[u8], input_keys: &[&str], output_keys: &[&str]) -> Option<(u64, u64)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| usage.get(*k).and_then(Value::as_u64))
            .unwrap_or(0)
    };
    Some((pick(input_keys), pick(output_keys)))
}

fn header_u64(headers: &HeaderMap, name: &str) -> u64 {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn usage_from_headers(headers: &HeaderMap, input: &str, output: &str) -> Option<(u64, u64)> {
    let (i, o) = (header_u64(headers, input), header_u64(headers, output));
    (i > 0 || o > 0).then_some((i, o))
}

pub struct AnthropicTokens;

impl TokenExtractor for AnthropicTokens {
    fn from_json(&self, body: &[u8]) -> Option<(u64, u64)> {
        usage_from_body(body, &["input_tokens"], &["output_tokens"])
    }

    fn from_headers(&self, headers: &HeaderMap) -> Option<(u64, u64)> {
        usage_from_headers(headers, "anthropic-input-tokens", "anthropic-output-tokens")
    }
}

/// The offload lane also reports OpenAI-style usage names.
pub struct ZaiTokens;

impl TokenExtractor for ZaiTokens {
    fn from_json(&self, body: &[u8]) -> Option<(u64, u64)> {
        usage_from_body(
            body,
            &["input_tokens", "prompt_tokens"],
            &["output_tokens", "completion_tokens"],
        )
    }

    fn from_headers(&self, headers: &HeaderMap) -> Option<(u64, u64)> {
        usage_from_headers(headers, "x-usage-input-tokens", "x-usage-output-tokens")
    }
}

/// Fill whichever of `input`/`output` is still zero, body first, then headers.
pub fn backfill_tokens(
    extractor: &dyn TokenExtractor,
    headers: &HeaderMap,
    body: &[u8],
    mut input: u64,
    mut output: u64,
) -> (u64, u64) {
    if input > 0 && output > 0 {
        return (input, output);
    }
    if !body.is_empty() {
        if let Some((i, o)) = extractor.from_json(body) {
            if input == 0 {
                input = i;
            }
            if output == 0 {
                output = o;
            }
        }
    }
    if input == 0 || output == 0 {
        if let Some((i, o)) = extractor.from_headers(headers) {
            if input == 0 {
                input = i;
            }
            if output == 0 {
                output = o;
            }
        }
    }
    (input, output)
}

/// Everything needed to dial one lane.
pub struct LaneEndpoint {
    pub lane: Lane,
    pub base_url: String,
    pub headers: Box<dyn HeaderStrategy>,
    pub tokens: Box<dyn TokenExtractor>,
}

impl LaneEndpoint {
    pub fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    /// Header mode label for telemetry; empty for lanes without one.
    pub fn header_mode_label(&self) -> &'static str {
        self.headers.header_mode().map(HeaderMode::as_str).unwrap_or("")
    }
}

/// Per-lane endpoints.
pub struct LaneTable {
    anthropic: LaneEndpoint,
    zai: LaneEndpoint,
}

impl LaneTable {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            anthropic: LaneEndpoint {
                lane: Lane::Anthropic,
                base_url: config.anthropic_base_url.clone(),
                headers: Box::new(AnthropicHeaders {
                    pass_through: config.anthropic_pass_through,
                    fallback_token: config.anthropic_fallback_token.clone(),
                }),
                tokens: Box::new(AnthropicTokens),
            },
            zai: LaneEndpoint {
                lane: Lane::Zai,
                base_url: config.zai_base_url.clone(),
                headers: Box::new(ZaiHeaders {
                    api_key: config.zai_key().unwrap_or_default().to_string(),
                    mode: config.zai_header_mode,
                }),
                tokens: Box::new(ZaiTokens),
            },
        }
    }

    pub fn get(&self, lane: Lane) -> &LaneEndpoint {
        match lane {
            Lane::Anthropic => &self.anthropic,
            Lane::Zai => &self.zai,
        }
    }
}

/// HTTP clients: streaming requests have no overall deadline, buffered ones
/// are bounded by the JSON timeout.
#[derive(Clone)]
pub struct UpstreamClients {
    pub stream: reqwest::Client,
    pub json: reqwest::Client,
    /// Deadline for response headers on streaming requests.
    pub header_timeout: Duration,
}

impl UpstreamClients {
    pub fn new(timeouts: &TimeoutConfig, force_h1: bool) -> reqwest::Result<Self> {
        let builder = || {
            let builder = reqwest::Client::builder()
                .connect_timeout(timeouts.dial + timeouts.tls)
                .pool_max_idle_per_host(32)
                .pool_idle_timeout(Duration::from_secs(90))
                .tcp_keepalive(Duration::from_secs(60))
                .no_gzip()
                .no_brotli()
                .no_deflate();
            if force_h1 {
                builder.http1_only()
            } else {
                builder
            }
        };
        Ok(Self {
            stream: builder().build()?,
            json: builder().timeout(timeouts.json).build()?,
            header_timeout: timeouts.header,
        })
    }

    pub fn for_request(&self, stream: bool) -> &reqwest::Client {
        if stream {
            &self.stream
        } else {
            &self.json
        }
    }
}
