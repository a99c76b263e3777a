use futures::future::try_join_all;
use lambda_runtime::Error;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub const PINGDOM_PATH: &str = "/_status_check/pingdom.xml";
pub const HEALTHCHECK_PATH: &str = "/_status_check/healthcheck.json";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

const PATH_PARAM: &str = "__ow_path";
const ACTIVATION_ID_VAR: &str = "__OW_ACTIVATION_ID";
const PINGDOM_ROOT: &str = "pingdom_http_custom_check";

/// A named set of dependency URLs to probe, keyed by a short
/// lowercase-alphanumeric identifier.
pub type CheckSet = BTreeMap<String, String>;

// Captured detail of the first probe that failed. Rendered into the
// report's `error` field, never propagated as a fault.
#[derive(thiserror::Error, Serialize, Debug, Clone, PartialEq)]
#[error("check of {url} failed with status {status}")]
pub struct ProbeFailure {
    pub url: String,
    pub status: u16,
    pub body: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Report {
    pub status: String,
    pub version: String,
    pub response_time: u64,
    pub process: ProcessInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeFailure>,
    // One integer-millisecond timing per successfully probed check,
    // flattened into the top level under the check's name.
    #[serde(flatten)]
    pub timings: BTreeMap<String, u64>,
}

// The serverless web-action response shape expected by the platform.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Rendering strategy for a [`Report`]: what the body looks like and
/// under which MIME type it is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    PingdomXml,
    Json,
}

impl OutputFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::PingdomXml => "application/xml",
            OutputFormat::Json => "application/json",
        }
    }

    pub fn body(&self, report: &Report) -> String {
        match self {
            OutputFormat::PingdomXml => {
                let value = serde_json::to_value(report).unwrap_or_else(|err| {
                    error!("Failed to serialize report: {}", err);
                    serde_json::json!({ "status": "failed" })
                });
                xml(&value, PINGDOM_ROOT)
            }
            OutputFormat::Json => serde_json::to_string(report).unwrap_or_else(|err| {
                error!("Failed to serialize report: {}", err);
                r#"{"status":"failed"}"#.to_string()
            }),
        }
    }
}

/// Renders a nested value as an XML element tree: objects recurse into one
/// child element per key, strings are escaped, other scalars are
/// stringified as-is. No attributes, declaration, or namespaces.
pub fn xml(value: &Value, element: &str) -> String {
    let inner = match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, child)| xml(child, key))
            .collect::<String>(),
        Value::String(raw) => escape_xml(raw),
        other => other.to_string(),
    };
    format!("<{0}>{1}</{0}>", element, inner)
}

fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn is_valid_check_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

// Process-wide version tag, resolved from a TOML manifest at most once
// per cache.
pub struct VersionCache {
    manifest_path: PathBuf,
    resolved: OnceLock<String>,
}

impl VersionCache {
    pub fn new() -> Self {
        let path =
            std::env::var("STATUS_MANIFEST_PATH").unwrap_or_else(|_| "Cargo.toml".to_string());
        Self::with_manifest(path)
    }

    pub fn with_manifest(path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: path.into(),
            resolved: OnceLock::new(),
        }
    }

    pub fn resolve(&self) -> &str {
        self.resolved
            .get_or_init(|| match read_manifest_version(&self.manifest_path) {
                Ok(version) => version,
                Err(err) => {
                    warn!(
                        "Could not resolve version from {}: {}",
                        self.manifest_path.display(),
                        err
                    );
                    "n/a".to_string()
                }
            })
    }
}

impl Default for VersionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(serde::Deserialize)]
struct Manifest {
    package: ManifestPackage,
}

#[derive(serde::Deserialize)]
struct ManifestPackage {
    version: String,
}

fn read_manifest_version(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path)?;
    let manifest: Manifest = toml::from_str(&raw)?;
    Ok(manifest.package.version)
}

pub struct StatusReportService {
    client: Client,
    version: VersionCache,
}

impl StatusReportService {
    pub fn new() -> Self {
        Self::with_version_cache(VersionCache::new())
    }

    pub fn with_version_cache(version: VersionCache) -> Self {
        Self {
            client: Client::new(),
            version,
        }
    }

    /// Probes every retained check concurrently and renders the aggregated
    /// report. Never fails past this boundary: every outcome, including
    /// probe timeouts and connection errors, ends in a rendered report.
    pub async fn report(
        &self,
        checks: &CheckSet,
        timeout: Duration,
        format: OutputFormat,
    ) -> ActionResponse {
        let version = self.version.resolve().to_string();
        let start = Instant::now();

        let retained: Vec<(&str, &str)> = checks
            .iter()
            .filter(|(name, _)| {
                let valid = is_valid_check_name(name);
                if !valid {
                    debug!("Skipping check with invalid name: {}", name);
                }
                valid
            })
            .map(|(name, url)| (name.as_str(), url.as_str()))
            .collect();

        // Fail-fast join: the first probe failure resolves the join and
        // drops the sibling futures, cancelling their in-flight requests.
        let outcome = try_join_all(
            retained
                .into_iter()
                .map(|(name, url)| self.probe(name, url, timeout)),
        )
        .await;

        let response_time = start.elapsed().as_millis() as u64;
        let activation = std::env::var(ACTIVATION_ID_VAR).ok();

        let (report, status_code) = match outcome {
            Ok(timings) => (
                Report {
                    status: "OK".to_string(),
                    version: version.clone(),
                    response_time,
                    process: ProcessInfo { activation },
                    error: None,
                    timings: timings.into_iter().collect(),
                },
                200,
            ),
            Err(failure) => {
                warn!("Status check failed: {}", failure);
                let status_code = failure.status;
                (
                    Report {
                        status: "failed".to_string(),
                        version: version.clone(),
                        response_time,
                        process: ProcessInfo { activation },
                        error: Some(failure),
                        timings: BTreeMap::new(),
                    },
                    status_code,
                )
            }
        };

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), format.mime().to_string());
        headers.insert("X-Version".to_string(), version);

        ActionResponse {
            status_code,
            headers,
            body: format.body(&report),
        }
    }

    /// Renders a report directly from an invocation parameter object: its
    /// string-valued keys are the check specification (identifier filtering
    /// discards `__ow_*` control keys), output in the default XML format.
    pub async fn direct_report(&self, params: &Value) -> ActionResponse {
        let checks: CheckSet = match params.as_object() {
            Some(map) => map
                .iter()
                .filter_map(|(name, value)| {
                    value.as_str().map(|url| (name.clone(), url.to_string()))
                })
                .collect(),
            None => CheckSet::new(),
        };
        self.report(&checks, DEFAULT_TIMEOUT, OutputFormat::PingdomXml)
            .await
    }

    async fn probe(
        &self,
        name: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<(String, u64), ProbeFailure> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| ProbeFailure {
                url: url.to_string(),
                status: err.status().map(|s| s.as_u16()).unwrap_or(500),
                body: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| err.to_string());
            return Err(ProbeFailure {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        // Drain the body so the timing reflects a completed response.
        if let Err(err) = response.bytes().await {
            return Err(ProbeFailure {
                url: url.to_string(),
                status: 500,
                body: err.to_string(),
            });
        }

        Ok((name.to_string(), start.elapsed().as_millis() as u64))
    }
}

impl Default for StatusReportService {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing decorator over a request-handling function: the two well-known
/// status paths are answered by the report engine, everything else is
/// delegated to the wrapped handler unmodified.
pub fn wrap<H, Fut>(handler: H, checks: CheckSet) -> WrappedHandler<H>
where
    H: Fn(Value) -> Fut,
    Fut: Future<Output = Result<Value, Error>>,
{
    WrappedHandler {
        handler,
        checks,
        service: StatusReportService::new(),
        timeout: DEFAULT_TIMEOUT,
    }
}

pub struct WrappedHandler<H> {
    handler: H,
    checks: CheckSet,
    service: StatusReportService,
    timeout: Duration,
}

impl<H, Fut> WrappedHandler<H>
where
    H: Fn(Value) -> Fut,
    Fut: Future<Output = Result<Value, Error>>,
{
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn handle(&self, params: Value) -> Result<Value, Error> {
        match params.get(PATH_PARAM).and_then(Value::as_str) {
            Some(PINGDOM_PATH) => {
                let response = self
                    .service
                    .report(&self.checks, self.timeout, OutputFormat::PingdomXml)
                    .await;
                Ok(serde_json::to_value(response)?)
            }
            Some(HEALTHCHECK_PATH) => {
                let response = self
                    .service
                    .report(&self.checks, self.timeout, OutputFormat::Json)
                    .await;
                Ok(serde_json::to_value(response)?)
            }
            _ => (self.handler)(params).await,
        }
    }
}
