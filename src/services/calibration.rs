//! External 429 gap measurements used by the calibration tick.
//!
//! A probe report is a markdown file whose last fenced `json` block holds an
//! array of per-model gap percentiles.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProbeGap {
    pub model: String,
    #[serde(default)]
    pub gap_seconds_p50: f64,
    #[serde(default)]
    pub gap_seconds_p95: f64,
    #[serde(default)]
    pub samples: u64,
}

/// `results/GLM_LIMIT_PROBE.md` under the repository root.
pub fn probe_report_path(root: &Path) -> PathBuf {
    root.join("results").join("GLM_LIMIT_PROBE.md")
}

/// Body of the last ```` ```json ```` fence in `content`.
pub fn extract_json_block(content: &str) -> Option<&str> {
    let start = content.rfind("```json")?;
    let body = &content[start + "```json".len()..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Parse probe gaps keyed by lowercase model name.
pub fn parse_probe_gaps(content: &str) -> Result<HashMap<String, ProbeGap>> {
    let block = extract_json_block(content).ok_or_else(|| anyhow!("no json block found"))?;
    let gaps: Vec<ProbeGap> =
        serde_json::from_str(block).context("Failed to parse probe gap JSON")?;
    Ok(gaps
        .into_iter()
        .filter(|g| !g.model.trim().is_empty())
        .map(|g| (g.model.trim().to_lowercase(), g))
        .collect())
}

/// Load probe gaps; a missing or malformed report yields an empty map.
pub fn load_probe_gaps(path: &Path) -> HashMap<String, ProbeGap> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    match parse_probe_gaps(&content) {
        Ok(gaps) => gaps,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Ignoring probe report: {:#}", e);
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"# GLM limit probe

Earlier draft:

```json
[{"model": "old", "gap_seconds_p50": 1}]
```

Final:

```json
[
  {"model": "GLM-4.6", "gap_seconds_p50": 12.5, "gap_seconds_p95": 48, "samples": 9},
  {"model": "", "gap_seconds_p50": 3}
]
```
"#;

    #[test]
    fn test_last_block_wins() {
        let gaps = parse_probe_gaps(REPORT).unwrap();
        assert_eq!(gaps.len(), 1);
        let glm = &gaps["glm-4.6"];
        assert_eq!(glm.gap_seconds_p50, 12.5);
        assert_eq!(glm.gap_seconds_p95, 48.0);
        assert_eq!(glm.samples, 9);
        assert!(!gaps.contains_key("old"));
    }

    #[test]
    fn test_missing_block() {
        assert!(extract_json_block("no fences here").is_none());
        assert!(parse_probe_gaps("```json\nnot json\n```").is_err());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_probe_gaps(&probe_report_path(dir.path())).is_empty());

        std::fs::create_dir_all(dir.path().join("results")).unwrap();
        std::fs::write(probe_report_path(dir.path()), REPORT).unwrap();
        assert_eq!(load_probe_gaps(&probe_report_path(dir.path())).len(), 1);
    }
}
