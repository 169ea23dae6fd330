//! Package resolution and the quality gate
//!
//! Identifies which ecosystem an identifier belongs to by probing the two
//! public registries, refuses remote-URL-disguised identifiers, and applies
//! a cheap admissibility filter before anything is ever spawned. Verdicts
//! are cached for the process lifetime.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::validate::{self, ParsedPackage};

/// Characters escaped when a package name becomes one URL path segment.
/// Scoped npm names carry a `/` that must not split the path.
const NAME_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'/').add(b'?').add(b'#').add(b'%');

/// Package ecosystem, decided by which registry knows the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Node,
    Python,
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ecosystem::Node => write!(f, "node"),
            Ecosystem::Python => write!(f, "python"),
        }
    }
}

/// Outcome of a successful ecosystem probe.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub ecosystem: Ecosystem,
    /// Raw registry metadata document for the package
    pub metadata: Value,
}

/// Cached quality verdict for one package identifier.
#[derive(Debug, Clone)]
struct QualityVerdict {
    ok: bool,
    reason: Option<String>,
}

/// Resolves package identifiers against the npm and PyPI registries.
pub struct Resolver {
    client: reqwest::Client,
    npm_registry: String,
    npm_api: String,
    pypi_registry: String,
    probe_timeout: Duration,
    min_monthly_downloads: u64,
    max_release_age: ChronoDuration,
    min_description_len: usize,
    quality_cache: DashMap<String, QualityVerdict>,
}

impl Resolver {
    pub fn new(config: &Config) -> Self {
        Self::with_endpoints(
            config,
            "https://registry.npmjs.org",
            "https://api.npmjs.org",
            "https://pypi.org",
        )
    }

    /// Construct against explicit registry endpoints. Tests point these at
    /// local mock servers.
    pub fn with_endpoints(
        config: &Config,
        npm_registry: &str,
        npm_api: &str,
        pypi_registry: &str,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            npm_registry: npm_registry.trim_end_matches('/').to_string(),
            npm_api: npm_api.trim_end_matches('/').to_string(),
            pypi_registry: pypi_registry.trim_end_matches('/').to_string(),
            probe_timeout: config.probe_timeout(),
            min_monthly_downloads: config.min_monthly_downloads,
            max_release_age: ChronoDuration::days(config.max_release_age_days),
            min_description_len: config.min_description_len,
            quality_cache: DashMap::new(),
        }
    }

    /// Identify the ecosystem for a package by probing npm first, PyPI second.
    ///
    /// Any 2xx from a registry claims the package for that ecosystem; both
    /// registries failing means the package does not exist anywhere we can
    /// install from.
    pub async fn resolve(&self, parsed: &ParsedPackage) -> Result<Resolved> {
        if validate::is_remote_identifier(&parsed.full_name) {
            return Err(Error::RemoteServerNotSupported);
        }

        let npm_url = format!(
            "{}/{}",
            self.npm_registry,
            utf8_percent_encode(&parsed.full_name, NAME_SEGMENT)
        );
        if let Some(metadata) = self.probe(&npm_url).await {
            debug!(package = %parsed.full_name, "resolved as node package");
            return Ok(Resolved { ecosystem: Ecosystem::Node, metadata });
        }

        let pypi_url = format!("{}/pypi/{}/json", self.pypi_registry, parsed.full_name);
        if let Some(metadata) = self.probe(&pypi_url).await {
            debug!(package = %parsed.full_name, "resolved as python package");
            return Ok(Resolved { ecosystem: Ecosystem::Python, metadata });
        }

        Err(Error::PackageNotFound(parsed.full_name.clone()))
    }

    /// One bounded GET; any non-2xx or transport error is a miss.
    async fn probe(&self, url: &str) -> Option<Value> {
        let response = self
            .client
            .get(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        // A 2xx decides the ecosystem even when the body is not valid JSON.
        Some(response.json::<Value>().await.unwrap_or(Value::Null))
    }

    /// Apply the minimum-quality filter, memoizing the verdict either way.
    ///
    /// The gate only exists to deter drive-by spawning of unknown or
    /// abandoned packages; it is cheap and approximate on purpose.
    pub async fn quality_gate(&self, parsed: &ParsedPackage, resolved: &Resolved) -> Result<()> {
        if let Some(verdict) = self.quality_cache.get(&parsed.full_name) {
            debug!(package = %parsed.full_name, ok = verdict.ok, "quality verdict from cache");
            return verdict_to_result(&verdict);
        }

        let reason = match resolved.ecosystem {
            Ecosystem::Node => self.check_node_downloads(&parsed.full_name).await,
            Ecosystem::Python => assess_python_metadata(
                &resolved.metadata,
                Utc::now(),
                self.max_release_age,
                self.min_description_len,
            ),
        };

        let verdict = QualityVerdict { ok: reason.is_none(), reason };
        if verdict.ok {
            info!(package = %parsed.full_name, ecosystem = %resolved.ecosystem, "package admitted");
        } else {
            warn!(
                package = %parsed.full_name,
                reason = verdict.reason.as_deref().unwrap_or(""),
                "package rejected by quality gate"
            );
        }

        let result = verdict_to_result(&verdict);
        self.quality_cache.insert(parsed.full_name.clone(), verdict);
        result
    }

    async fn check_node_downloads(&self, full_name: &str) -> Option<String> {
        let url = format!("{}/downloads/point/last-month/{}", self.npm_api, full_name);

        let downloads = match self.probe(&url).await {
            Some(body) => body.get("downloads").and_then(Value::as_u64).unwrap_or(0),
            None => return Some("download statistics unavailable".to_string()),
        };

        assess_node_downloads(downloads, self.min_monthly_downloads)
    }

    /// Drop every cached verdict.
    pub fn flush_quality_cache(&self) {
        self.quality_cache.clear();
    }
}

fn verdict_to_result(verdict: &QualityVerdict) -> Result<()> {
    if verdict.ok {
        Ok(())
    } else {
        Err(Error::QualityCheckFailed(
            verdict.reason.clone().unwrap_or_else(|| "rejected".to_string()),
        ))
    }
}

fn assess_node_downloads(downloads: u64, minimum: u64) -> Option<String> {
    if downloads >= minimum {
        None
    } else {
        Some(format!(
            "{} downloads last month (minimum {})",
            downloads, minimum
        ))
    }
}

/// PyPI heuristic: a release within the age window and a non-trivial
/// description. Returns the rejection reason, or `None` when admissible.
fn assess_python_metadata(
    metadata: &Value,
    now: DateTime<Utc>,
    max_age: ChronoDuration,
    min_description_len: usize,
) -> Option<String> {
    let description_len = metadata
        .get("info")
        .and_then(|info| {
            info.get("summary")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or_else(|| info.get("description").and_then(Value::as_str))
        })
        .map(str::len)
        .unwrap_or(0);

    if description_len <= min_description_len {
        return Some("package has no meaningful description".to_string());
    }

    let has_recent_release = metadata
        .get("releases")
        .and_then(Value::as_object)
        .map(|releases| {
            releases.values().flat_map(|files| files.as_array().into_iter().flatten()).any(
                |file| {
                    file.get("upload_time_iso_8601")
                        .and_then(Value::as_str)
                        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                        .map(|uploaded| now.signed_duration_since(uploaded) <= max_age)
                        .unwrap_or(false)
                },
            )
        })
        .unwrap_or(false);

    if !has_recent_release {
        return Some("no release within the last year".to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pypi_metadata(summary: &str, uploaded: DateTime<Utc>) -> Value {
        json!({
            "info": { "summary": summary },
            "releases": {
                "1.0.0": [ { "upload_time_iso_8601": uploaded.to_rfc3339() } ]
            }
        })
    }

    #[test]
    fn node_download_threshold() {
        assert!(assess_node_downloads(100, 100).is_none());
        assert!(assess_node_downloads(99, 100).is_some());
        assert!(assess_node_downloads(0, 100).is_some());
    }

    #[test]
    fn python_recent_release_and_description_pass() {
        let now = Utc::now();
        let metadata = pypi_metadata("an mcp server doing things", now - ChronoDuration::days(30));
        assert!(
            assess_python_metadata(&metadata, now, ChronoDuration::days(365), 10).is_none()
        );
    }

    #[test]
    fn python_stale_release_fails() {
        let now = Utc::now();
        let metadata = pypi_metadata("an mcp server doing things", now - ChronoDuration::days(400));
        let reason = assess_python_metadata(&metadata, now, ChronoDuration::days(365), 10);
        assert!(reason.unwrap().contains("release"));
    }

    #[test]
    fn python_short_description_fails() {
        let now = Utc::now();
        let metadata = pypi_metadata("short", now - ChronoDuration::days(1));
        let reason = assess_python_metadata(&metadata, now, ChronoDuration::days(365), 10);
        assert!(reason.unwrap().contains("description"));
    }

    #[test]
    fn python_description_falls_back_to_long_form() {
        let now = Utc::now();
        let metadata = json!({
            "info": {
                "summary": "",
                "description": "a longer free-form description body"
            },
            "releases": {
                "0.1.0": [ { "upload_time_iso_8601": (now - ChronoDuration::days(2)).to_rfc3339() } ]
            }
        });
        assert!(
            assess_python_metadata(&metadata, now, ChronoDuration::days(365), 10).is_none()
        );
    }

    #[test]
    fn python_missing_releases_fails() {
        let now = Utc::now();
        let metadata = json!({ "info": { "summary": "an mcp server doing things" } });
        assert!(assess_python_metadata(&metadata, now, ChronoDuration::days(365), 10).is_some());
    }
}
