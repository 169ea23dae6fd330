//! Resolver and quality-gate tests against mock registries
//!
//! Both public registries are stood in for by wiremock servers, so these
//! tests never touch the network.

use chrono::{Duration as ChronoDuration, Utc};
use mcpaas::config::Config;
use mcpaas::error::Error;
use mcpaas::resolver::{Ecosystem, Resolver};
use mcpaas::validate::parse_package;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Registries {
    npm: MockServer,
    npm_api: MockServer,
    pypi: MockServer,
}

impl Registries {
    async fn start() -> Self {
        Self {
            npm: MockServer::start().await,
            npm_api: MockServer::start().await,
            pypi: MockServer::start().await,
        }
    }

    fn resolver(&self) -> Resolver {
        Resolver::with_endpoints(
            &Config::default(),
            &self.npm.uri(),
            &self.npm_api.uri(),
            &self.pypi.uri(),
        )
    }
}

fn pypi_document(summary: &str, days_ago: i64) -> serde_json::Value {
    json!({
        "info": { "summary": summary },
        "releases": {
            "1.0.0": [{
                "upload_time_iso_8601": (Utc::now() - ChronoDuration::days(days_ago)).to_rfc3339()
            }]
        }
    })
}

#[tokio::test]
async fn npm_2xx_resolves_as_node() {
    let registries = Registries::start().await;
    Mock::given(method("GET"))
        .and(path("/cool-mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "cool-mcp"})))
        .mount(&registries.npm)
        .await;

    let resolver = registries.resolver();
    let resolved = resolver.resolve(&parse_package("cool-mcp")).await.unwrap();
    assert_eq!(resolved.ecosystem, Ecosystem::Node);
    assert_eq!(resolved.metadata["name"], "cool-mcp");
}

#[tokio::test]
async fn npm_miss_falls_back_to_pypi() {
    let registries = Registries::start().await;
    Mock::given(method("GET"))
        .and(path("/snake-mcp"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&registries.npm)
        .await;
    Mock::given(method("GET"))
        .and(path("/pypi/snake-mcp/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pypi_document("a python mcp server", 10)))
        .mount(&registries.pypi)
        .await;

    let resolver = registries.resolver();
    let resolved = resolver.resolve(&parse_package("snake-mcp")).await.unwrap();
    assert_eq!(resolved.ecosystem, Ecosystem::Python);
}

#[tokio::test]
async fn both_registries_missing_is_package_not_found() {
    let registries = Registries::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&registries.npm)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&registries.pypi)
        .await;

    let resolver = registries.resolver();
    let err = resolver.resolve(&parse_package("no-such-pkg")).await.unwrap_err();
    assert!(matches!(err, Error::PackageNotFound(_)));
    assert_eq!(err.jsonrpc_code(), -32020);
}

#[tokio::test]
async fn version_suffix_is_stripped_before_probing() {
    let registries = Registries::start().await;
    Mock::given(method("GET"))
        .and(path("/pinned-mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&registries.npm)
        .await;

    let resolver = registries.resolver();
    let resolved = resolver.resolve(&parse_package("pinned-mcp@1.2.3")).await.unwrap();
    assert_eq!(resolved.ecosystem, Ecosystem::Node);
}

#[tokio::test]
async fn remote_identifier_never_probes() {
    let registries = Registries::start().await;
    let resolver = registries.resolver();

    let err = resolver.resolve(&parse_package("mcp-remote")).await.unwrap_err();
    assert!(matches!(err, Error::RemoteServerNotSupported));
    assert!(registries.npm.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn node_quality_gate_enforces_download_floor() {
    let registries = Registries::start().await;
    Mock::given(method("GET"))
        .and(path("/busy-mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&registries.npm)
        .await;
    Mock::given(method("GET"))
        .and(path("/downloads/point/last-month/busy-mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"downloads": 5000})))
        .mount(&registries.npm_api)
        .await;
    Mock::given(method("GET"))
        .and(path("/quiet-mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&registries.npm)
        .await;
    Mock::given(method("GET"))
        .and(path("/downloads/point/last-month/quiet-mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"downloads": 3})))
        .mount(&registries.npm_api)
        .await;

    let resolver = registries.resolver();

    let busy = parse_package("busy-mcp");
    let resolved = resolver.resolve(&busy).await.unwrap();
    assert!(resolver.quality_gate(&busy, &resolved).await.is_ok());

    let quiet = parse_package("quiet-mcp");
    let resolved = resolver.resolve(&quiet).await.unwrap();
    let err = resolver.quality_gate(&quiet, &resolved).await.unwrap_err();
    assert!(matches!(err, Error::QualityCheckFailed(_)));
    assert_eq!(err.jsonrpc_code(), -32025);
}

#[tokio::test]
async fn python_quality_gate_requires_recent_release() {
    let registries = Registries::start().await;
    Mock::given(method("GET"))
        .and(path("/stale-mcp"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&registries.npm)
        .await;
    Mock::given(method("GET"))
        .and(path("/pypi/stale-mcp/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(pypi_document("a python mcp server", 500)),
        )
        .mount(&registries.pypi)
        .await;

    let resolver = registries.resolver();
    let stale = parse_package("stale-mcp");
    let resolved = resolver.resolve(&stale).await.unwrap();
    let err = resolver.quality_gate(&stale, &resolved).await.unwrap_err();
    assert!(matches!(err, Error::QualityCheckFailed(_)));
}

#[tokio::test]
async fn quality_verdict_is_cached_for_process_lifetime() {
    let registries = Registries::start().await;
    Mock::given(method("GET"))
        .and(path("/cached-mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&registries.npm)
        .await;
    Mock::given(method("GET"))
        .and(path("/downloads/point/last-month/cached-mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"downloads": 250})))
        .expect(1)
        .mount(&registries.npm_api)
        .await;

    let resolver = registries.resolver();
    let parsed = parse_package("cached-mcp");
    let resolved = resolver.resolve(&parsed).await.unwrap();

    // Second call must be served from the cache; the mock allows one hit.
    assert!(resolver.quality_gate(&parsed, &resolved).await.is_ok());
    assert!(resolver.quality_gate(&parsed, &resolved).await.is_ok());

    resolver.flush_quality_cache();
}
