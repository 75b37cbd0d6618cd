//! Upstream lanes and the credential header modes of the offload lane.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical upstream a request can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Default, safe lane.
    Anthropic,
    /// Offload lane. Needs a credential and the `zai_offload` license feature.
    Zai,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Anthropic, Lane::Zai];

    pub const fn as_str(self) -> &'static str {
        match self {
            Lane::Anthropic => "anthropic",
            Lane::Zai => "zai",
        }
    }

    /// Short provider id written to the `upstream` field of telemetry.
    pub const fn upstream_label(self) -> &'static str {
        match self {
            Lane::Anthropic => "anth",
            Lane::Zai => "zai",
        }
    }

    /// Map a provider id from a catalog or policy to a lane. `anth` and
    /// `anthropic` both name the default lane.
    pub fn from_provider_id(id: &str) -> Option<Lane> {
        match id.trim().to_ascii_lowercase().as_str() {
            "anth" | "anthropic" => Some(Lane::Anthropic),
            "zai" => Some(Lane::Zai),
            _ => None,
        }
    }

    pub const fn is_offload(self) -> bool {
        matches!(self, Lane::Zai)
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which header carries the offload credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderMode {
    /// `x-api-key: <key>`
    #[default]
    XApiKey,
    /// `authorization: Bearer <key>`
    Authorization,
}

impl HeaderMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "authorization" | "bearer" => Some(HeaderMode::Authorization),
            "x-api-key" | "x_api_key" | "api-key" => Some(HeaderMode::XApiKey),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            HeaderMode::XApiKey => "x-api-key",
            HeaderMode::Authorization => "authorization",
        }
    }

    /// The other mode; used for the single 401 retry.
    pub const fn flip(self) -> Self {
        match self {
            HeaderMode::XApiKey => HeaderMode::Authorization,
            HeaderMode::Authorization => HeaderMode::XApiKey,
        }
    }
}

impl fmt::Display for HeaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
