use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde_json::Value;
use status_report::{wrap, ActionResponse, CheckSet};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

// Answers anything that is not one of the status-check paths.
async fn fallthrough_handler(_params: Value) -> Result<Value, Error> {
    let response = ActionResponse {
        status_code: 404,
        headers: HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
        body: "Not Found".to_string(),
    };
    Ok(serde_json::to_value(response)?)
}

fn checks_from_env() -> CheckSet {
    let raw = std::env::var("STATUS_CHECKS").unwrap_or_else(|_| "{}".to_string());
    match serde_json::from_str(&raw) {
        Ok(checks) => checks,
        Err(err) => {
            warn!("Could not parse STATUS_CHECKS, running without checks: {}", err);
            CheckSet::new()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let timeout_ms = std::env::var("STATUS_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(10_000);

    let wrapped = wrap(fallthrough_handler, checks_from_env())
        .with_timeout(Duration::from_millis(timeout_ms));

    run(service_fn(|event: LambdaEvent<Value>| {
        wrapped.handle(event.payload)
    }))
    .await
}
