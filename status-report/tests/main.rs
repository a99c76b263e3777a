use serde_json::{json, Value};
use status_report::{
    wrap, CheckSet, OutputFormat, StatusReportService, VersionCache, DEFAULT_TIMEOUT,
    HEALTHCHECK_PATH, PINGDOM_PATH,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_service() -> StatusReportService {
    StatusReportService::with_version_cache(VersionCache::with_manifest("/nonexistent/Cargo.toml"))
}

fn checks(entries: &[(&str, String)]) -> CheckSet {
    entries
        .iter()
        .map(|(name, url)| (name.to_string(), url.clone()))
        .collect()
}

#[tokio::test]
async fn test_all_checks_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/db"))
        .respond_with(ResponseTemplate::new(200).set_body_string("up"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_string("up"))
        .mount(&server)
        .await;

    let check_set = checks(&[
        ("db", format!("{}/db", server.uri())),
        ("queue", format!("{}/queue", server.uri())),
    ]);
    let response = test_service()
        .report(&check_set, DEFAULT_TIMEOUT, OutputFormat::Json)
        .await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.headers["Content-Type"], "application/json");
    assert_eq!(response.headers["X-Version"], "n/a");

    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["status"], "OK");
    assert!(body["db"].is_u64());
    assert!(body["queue"].is_u64());
    assert!(body["response_time"].is_u64());
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_failing_check_downgrades_report() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let bad_url = format!("{}/bad", server.uri());
    let check_set = checks(&[
        ("good", format!("{}/good", server.uri())),
        ("bad", bad_url.clone()),
    ]);
    let response = test_service()
        .report(&check_set, DEFAULT_TIMEOUT, OutputFormat::Json)
        .await;

    assert_eq!(response.status_code, 503);

    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["url"], bad_url);
    assert_eq!(body["error"]["status"], 503);
    assert_eq!(body["error"]["body"], "busy");
    // Sibling results are discarded on failure.
    assert!(body.get("good").is_none());
}

#[tokio::test]
async fn test_connection_refused_maps_to_500() {
    // Port 1 is never listening.
    let check_set = checks(&[("dep1", "http://127.0.0.1:1/".to_string())]);
    let response = test_service()
        .report(&check_set, DEFAULT_TIMEOUT, OutputFormat::Json)
        .await;

    assert_eq!(response.status_code, 500);

    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["url"], "http://127.0.0.1:1/");
    assert_eq!(body["error"]["status"], 500);
    assert!(!body["error"]["body"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_is_a_probe_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let check_set = checks(&[("slow", format!("{}/slow", server.uri()))]);
    let response = test_service()
        .report(&check_set, Duration::from_millis(50), OutputFormat::Json)
        .await;

    assert_eq!(response.status_code, 500);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["status"], 500);
}

#[tokio::test]
async fn test_invalid_check_names_are_never_probed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    // A check with an invalid name must not produce any request.
    Mock::given(method("GET"))
        .and(path("/never"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let check_set = checks(&[
        ("dep1", format!("{}/ok", server.uri())),
        ("Bad-Name", format!("{}/never", server.uri())),
    ]);
    let response = test_service()
        .report(&check_set, DEFAULT_TIMEOUT, OutputFormat::Json)
        .await;

    assert_eq!(response.status_code, 200);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["status"], "OK");
    assert!(body["dep1"].is_u64());
    assert!(body.get("Bad-Name").is_none());
}

#[tokio::test]
async fn test_pingdom_format_is_wrapped_xml() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/db"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let check_set = checks(&[("db", format!("{}/db", server.uri()))]);
    let response = test_service()
        .report(&check_set, DEFAULT_TIMEOUT, OutputFormat::PingdomXml)
        .await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.headers["Content-Type"], "application/xml");
    assert!(response.body.starts_with("<pingdom_http_custom_check>"));
    assert!(response.body.ends_with("</pingdom_http_custom_check>"));
    assert!(response.body.contains("<status>OK</status>"));
    assert!(response.body.contains("<db>"));
}

#[tokio::test]
async fn test_direct_report_uses_parameter_keys_as_checks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dep"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let params = json!({
        "__ow_path": "/ignored",
        "dep1": format!("{}/dep", server.uri()),
    });
    let response = test_service().direct_report(&params).await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.headers["Content-Type"], "application/xml");
    assert!(response.body.contains("<status>OK</status>"));
    assert!(response.body.contains("<dep1>"));
    // The control key is filtered out, not probed.
    assert!(!response.body.contains("__ow_path"));
}

mod routing {
    use super::*;

    fn counting_handler(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(Value) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, lambda_runtime::Error>>>>
    {
        move |params: Value| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "echo": params }))
            })
        }
    }

    #[tokio::test]
    async fn test_pingdom_path_never_invokes_handler() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/db"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = wrap(
            counting_handler(calls.clone()),
            checks(&[("db", format!("{}/db", server.uri()))]),
        );

        let result = wrapped
            .handle(json!({ "__ow_path": PINGDOM_PATH }))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result["statusCode"], 200);
        assert_eq!(result["headers"]["Content-Type"], "application/xml");
        assert!(result["body"]
            .as_str()
            .unwrap()
            .starts_with("<pingdom_http_custom_check>"));
    }

    #[tokio::test]
    async fn test_healthcheck_path_returns_raw_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/db"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = wrap(
            counting_handler(calls.clone()),
            checks(&[("db", format!("{}/db", server.uri()))]),
        );

        let result = wrapped
            .handle(json!({ "__ow_path": HEALTHCHECK_PATH }))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result["statusCode"], 200);
        assert_eq!(result["headers"]["Content-Type"], "application/json");

        let body: Value = serde_json::from_str(result["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["status"], "OK");
        assert!(body["db"].is_u64());
    }

    #[tokio::test]
    async fn test_other_paths_delegate_unmodified() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = wrap(counting_handler(calls.clone()), CheckSet::new());

        let params = json!({ "__ow_path": "/api/things", "payload": 7 });
        let result = wrapped.handle(params.clone()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result, json!({ "echo": params }));
    }

    #[tokio::test]
    async fn test_missing_path_delegates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = wrap(counting_handler(calls.clone()), CheckSet::new());

        wrapped.handle(json!({ "payload": 7 })).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

mod versioning {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_version_header_comes_from_manifest() {
        let mut manifest = tempfile::NamedTempFile::new().unwrap();
        writeln!(manifest, "[package]\nname = \"demo\"\nversion = \"2.4.6\"").unwrap();

        let service =
            StatusReportService::with_version_cache(VersionCache::with_manifest(manifest.path()));
        let response = service
            .report(&CheckSet::new(), DEFAULT_TIMEOUT, OutputFormat::Json)
            .await;

        assert_eq!(response.headers["X-Version"], "2.4.6");
        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["version"], "2.4.6");
    }

    #[tokio::test]
    async fn test_version_is_stable_across_reports() {
        let mut manifest = tempfile::NamedTempFile::new().unwrap();
        writeln!(manifest, "[package]\nname = \"demo\"\nversion = \"2.4.6\"").unwrap();

        let service =
            StatusReportService::with_version_cache(VersionCache::with_manifest(manifest.path()));

        let first = service
            .report(&CheckSet::new(), DEFAULT_TIMEOUT, OutputFormat::Json)
            .await;
        // The manifest is consulted at most once per process lifetime.
        std::fs::write(
            manifest.path(),
            "[package]\nname = \"demo\"\nversion = \"0.0.1\"\n",
        )
        .unwrap();
        let second = service
            .report(&CheckSet::new(), DEFAULT_TIMEOUT, OutputFormat::Json)
            .await;

        assert_eq!(first.headers["X-Version"], "2.4.6");
        assert_eq!(second.headers["X-Version"], "2.4.6");
    }
}
