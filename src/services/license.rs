//! License claims and the offload-lane gate.
//!
//! Claims are read from the JSON file named by `CC_LICENSE_JSON`, in the shape
//! the issuer writes them (`exp` is Unix seconds). Signature checking is the
//! issuer's concern; expired or unreadable claims put the proxy in community
//! mode.

use crate::services::lane::Lane;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Feature that unlocks the offload lane.
pub const OFFLOAD_FEATURE: &str = "zai_offload";
pub const LICENSE_BLOCK: &str = "license_block";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LicenseClaims {
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub exp: Option<DateTime<Utc>>,
}

impl LicenseClaims {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f.eq_ignore_ascii_case(name))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp.is_some_and(|exp| exp <= now)
    }

    pub fn summary(&self) -> LicenseSummary {
        LicenseSummary {
            ok: true,
            plan: self.plan.clone(),
            features: self.features.clone(),
        }
    }
}

/// License block of `/v1/usage` and `/readyz`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LicenseSummary {
    pub ok: bool,
    pub plan: String,
    pub features: Vec<String>,
}

/// Load claims; `None` when unset, unreadable or expired.
pub fn load_license(path: Option<&Path>) -> Option<LicenseClaims> {
    let path = path?;
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), "License unreadable: {}", e);
            return None;
        }
    };
    let claims: LicenseClaims = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), "License invalid: {}", e);
            return None;
        }
    };
    if claims.is_expired_at(Utc::now()) {
        tracing::warn!(plan = %claims.plan, "License expired, running in community mode");
        return None;
    }
    tracing::info!(plan = %claims.plan, features = ?claims.features, "License loaded");
    Some(claims)
}

/// Downgrades the offload lane when the license lacks [`OFFLOAD_FEATURE`].
#[derive(Debug, Clone, Default)]
pub struct LicenseGate {
    claims: Option<LicenseClaims>,
}

impl LicenseGate {
    pub fn new(claims: Option<LicenseClaims>) -> Self {
        Self { claims }
    }

    pub fn claims(&self) -> Option<&LicenseClaims> {
        self.claims.as_ref()
    }

    pub fn summary(&self) -> Option<LicenseSummary> {
        self.claims.as_ref().map(LicenseClaims::summary)
    }

    /// `(effective lane, block reason)`.
    pub fn enforce(&self, lane: Lane) -> (Lane, Option<&'static str>) {
        if !lane.is_offload() {
            return (lane, None);
        }
        match &self.claims {
            Some(claims) if claims.has_feature(OFFLOAD_FEATURE) => (lane, None),
            _ => (Lane::Anthropic, Some(LICENSE_BLOCK)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(features: &[&str]) -> LicenseClaims {
        LicenseClaims {
            plan: "pro".into(),
            features: features.iter().map(|f| f.to_string()).collect(),
            exp: None,
        }
    }

    #[test]
    fn test_gate_without_claims_blocks_offload() {
        let gate = LicenseGate::new(None);
        assert_eq!(gate.enforce(Lane::Zai), (Lane::Anthropic, Some(LICENSE_BLOCK)));
        assert_eq!(gate.enforce(Lane::Anthropic), (Lane::Anthropic, None));
    }

    #[test]
    fn test_gate_requires_feature() {
        let gate = LicenseGate::new(Some(claims(&["usage_export"])));
        assert_eq!(gate.enforce(Lane::Zai).1, Some(LICENSE_BLOCK));

        let gate = LicenseGate::new(Some(claims(&[OFFLOAD_FEATURE])));
        assert_eq!(gate.enforce(Lane::Zai), (Lane::Zai, None));
        assert_eq!(gate.summary().unwrap().plan, "pro");
    }

    #[test]
    fn test_load_license_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live.json");
        std::fs::write(&live, r#"{"plan":"pro","features":["zai_offload"],"exp":32503680000}"#).unwrap();
        assert!(load_license(Some(live.as_path())).unwrap().has_feature("ZAI_OFFLOAD"));

        let expired = dir.path().join("expired.json");
        std::fs::write(&expired, r#"{"plan":"pro","features":["zai_offload"],"exp":978307200}"#).unwrap();
        assert!(load_license(Some(expired.as_path())).is_none());
        assert!(load_license(Some(dir.path().join("missing.json").as_path())).is_none());
        assert!(load_license(None).is_none());
    }

    #[test]
    fn test_load_issued_license() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("license.json");
        std::fs::write(
            &path,
            r#"{"schema":"ccp.license.v1","plan":"pro","features":["zai_offload"],"exp":4102444800}"#,
        )
        .unwrap();

        let claims = load_license(Some(path.as_path())).expect("issued license loads");
        assert_eq!(claims.plan, "pro");
        assert_eq!(claims.exp.map(|t| t.timestamp()), Some(4_102_444_800));
        assert_eq!(LicenseGate::new(Some(claims)).enforce(Lane::Zai), (Lane::Zai, None));
    }

    #[test]
    fn test_license_without_exp_never_expires() {
        let claims: LicenseClaims = serde_json::from_str(r#"{"plan":"team","features":[]}"#).unwrap();
        assert_eq!(claims.exp, None);
        assert!(!claims.is_expired_at(Utc::now()));

        let rejected = serde_json::from_str::<LicenseClaims>(r#"{"plan":"pro","exp":"2999-01-01T00:00:00Z"}"#);
        assert!(rejected.is_err());
    }
}
