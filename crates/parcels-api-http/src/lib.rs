// # Parcels App Tracking API
//
// This crate provides the HTTP tracking API implementation for the parcel
// tracking reconciler, talking to the Parcels App v3 shipments endpoint.
//
// ## Implementation Notes
//
// - One HTTP request per call; retries and scheduling belong to the Reconciler
// - No caching; records are owned by the Reconciler and its StateStore
// - No background tasks
// - HTTP timeout on every request (30 seconds, 10 seconds for the probe)
// - Non-2xx statuses mapped to specific network errors (401/403, 429, 5xx)
//
// ## Security Requirements
//
// - API key NEVER appears in logs
// - API key is passed per call from the account settings, never stored here
//
// ## API Reference
//
// - Start a lookup: POST `/api/v3/shipments/tracking`
// - Poll a lookup: GET `/api/v3/shipments/tracking?uuid=...&apiKey=...&language=...`
// - Health probe: GET `/`

use async_trait::async_trait;
use parcels_core::BackendRegistry;
use parcels_core::config::{ApiConfig, TrackingConfig};
use parcels_core::traits::{
    ApiStatusSnapshot, InitResult, PollResult, ShipmentPayload, TrackingApi, TrackingApiFactory,
};
use parcels_core::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Parcels App base URL
pub const DEFAULT_BASE_URL: &str = "https://parcelsapp.com";

/// Path of the shipments tracking endpoint
const TRACKING_PATH: &str = "/api/v3/shipments/tracking";

/// Default HTTP timeout for tracking requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the health probe (10 seconds)
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Attribute label carrying the number of days in transit
const DAYS_TRANSIT_LABEL: &str = "days_transit";

/// Parcels App tracking API client
///
/// Stateless and single-shot. All coordination (token lifetime, merging,
/// persistence) is owned by the `Reconciler`.
#[derive(Debug, Clone)]
pub struct ParcelsAppClient {
    /// Service root, without a trailing slash
    base_url: String,

    /// HTTP client for API requests
    client: reqwest::Client,
}

impl ParcelsAppClient {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::config("Parcels App base URL cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    /// Create a client for the public service with the default timeout
    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_BASE_URL, DEFAULT_HTTP_TIMEOUT)
    }

    /// Service root this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn tracking_url(&self) -> String {
        format!("{}{}", self.base_url, TRACKING_PATH)
    }
}

#[async_trait]
impl TrackingApi for ParcelsAppClient {
    /// Start a lookup
    ///
    /// # API Call
    ///
    /// ```http
    /// POST /api/v3/shipments/tracking
    /// Content-Type: application/json
    ///
    /// {"shipments":[{"trackingId":"...","destinationCountry":"..."}],"language":"en","apiKey":"..."}
    /// ```
    async fn initiate_or_fetch(
        &self,
        account: &TrackingConfig,
        tracking_id: &str,
    ) -> Result<InitResult> {
        tracing::debug!("Starting Parcels App lookup for {}", tracking_id);

        let body = serde_json::json!({
            "shipments": [{
                "trackingId": tracking_id,
                "destinationCountry": account.destination_country,
            }],
            "language": account.language,
            "apiKey": account.api_key,
        });

        let response = self
            .client
            .post(self.tracking_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::network(format!("HTTP request failed: {}", e.without_url())))?;

        let text = read_success_body(response, "Lookup").await?;
        parse_init_response(&text)
    }

    /// Poll a pending lookup
    ///
    /// # API Call
    ///
    /// ```http
    /// GET /api/v3/shipments/tracking?uuid=...&apiKey=...&language=...
    /// ```
    async fn poll(&self, account: &TrackingConfig, token: &str) -> Result<PollResult> {
        tracing::debug!("Polling Parcels App lookup {}", token);

        let response = self
            .client
            .get(self.tracking_url())
            .query(&[
                ("uuid", token),
                ("apiKey", account.api_key.as_str()),
                ("language", account.language.as_str()),
            ])
            .send()
            .await
            // without_url keeps the API key out of the message
            .map_err(|e| Error::network(format!("HTTP request failed: {}", e.without_url())))?;

        let text = read_success_body(response, "Poll").await?;
        parse_poll_response(&text)
    }

    async fn probe(&self) -> ApiStatusSnapshot {
        let url = format!("{}/", self.base_url);
        let started = Instant::now();

        let response = match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Parcels App probe failed: {}", e);
                return ApiStatusSnapshot::unreachable();
            }
        };

        let status = response.status();
        // Latency covers the full body, like a browser page load
        if let Err(e) = response.bytes().await {
            tracing::warn!("Parcels App probe body could not be read: {}", e);
            return ApiStatusSnapshot::unreachable();
        }
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        ApiStatusSnapshot {
            reachable: status.is_success(),
            latency_ms: Some(latency_ms),
            http_code: Some(status.as_u16()),
            checked_at: chrono::Utc::now(),
        }
    }

    fn api_name(&self) -> &'static str {
        "parcels_app"
    }
}

/// Return the body of a 2xx response, or a network error describing the status
async fn read_success_body(response: reqwest::Response, operation: &str) -> Result<String> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());
        return Err(map_status_error(status.as_u16(), operation, &error_text));
    }

    response
        .text()
        .await
        .map_err(|e| Error::network(format!("Failed to read response body: {}", e.without_url())))
}

/// Map a non-2xx HTTP status to an error
fn map_status_error(status: u16, operation: &str, error_text: &str) -> Error {
    match status {
        401 | 403 => Error::network(format!(
            "Authentication failed: invalid API key or insufficient quota. Status: {}",
            status
        )),
        429 => Error::network(format!(
            "Rate limit exceeded. Please retry later. Status: {}",
            status
        )),
        500..=599 => Error::network(format!(
            "Parcels App server error (transient): {} - {}",
            status, error_text
        )),
        _ => Error::network(format!("{} failed: {} - {}", operation, status, error_text)),
    }
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    shipments: Vec<RawShipment>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    done: bool,
    #[serde(default)]
    shipments: Vec<RawShipment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawShipment {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    last_state: Option<RawLastState>,
    #[serde(default)]
    origin: Option<Value>,
    #[serde(default)]
    destination: Option<Value>,
    #[serde(default)]
    detected_carrier: Option<RawCarrier>,
    #[serde(default)]
    attributes: Vec<RawAttribute>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLastState {
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    location: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCarrier {
    #[serde(default)]
    name: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawAttribute {
    #[serde(default)]
    l: Option<String>,
    #[serde(default)]
    val: Value,
}

impl RawShipment {
    fn into_payload(self) -> ShipmentPayload {
        let days_in_transit = self
            .attributes
            .iter()
            .find(|attr| attr.l.as_deref() == Some(DAYS_TRANSIT_LABEL))
            .and_then(|attr| parse_days(&attr.val));
        let (message, location) = match self.last_state {
            Some(state) => (
                state.status.as_ref().and_then(text_value),
                state.location.as_ref().and_then(text_value),
            ),
            None => (None, None),
        };

        ShipmentPayload {
            status: self.status,
            message,
            location,
            origin: self.origin.as_ref().and_then(text_value),
            destination: self.destination.as_ref().and_then(text_value),
            carrier: self
                .detected_carrier
                .and_then(|carrier| carrier.name)
                .as_ref()
                .and_then(text_value),
            days_in_transit,
        }
    }
}

/// `days_transit` arrives as a number or a numeric string
fn parse_days(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Interpret the body of a lookup response
fn parse_init_response(body: &str) -> Result<InitResult> {
    let response: InitResponse = serde_json::from_str(body)
        .map_err(|e| Error::parse(format!("Invalid lookup response: {}", e)))?;

    if let Some(uuid) = response.uuid.filter(|uuid| !uuid.is_empty()) {
        return Ok(InitResult::Token(uuid));
    }

    response
        .shipments
        .into_iter()
        .next()
        .map(|shipment| InitResult::Shipment(shipment.into_payload()))
        .ok_or_else(|| Error::parse("Lookup response has neither uuid nor shipments"))
}

/// Interpret the body of a poll response
fn parse_poll_response(body: &str) -> Result<PollResult> {
    let response: PollResponse = serde_json::from_str(body)
        .map_err(|e| Error::parse(format!("Invalid poll response: {}", e)))?;

    if !response.done {
        return Ok(PollResult::Pending);
    }

    Ok(response
        .shipments
        .into_iter()
        .next()
        .map(|shipment| PollResult::Shipment(shipment.into_payload()))
        .unwrap_or(PollResult::Pending))
}

/// Factory for creating Parcels App clients
pub struct ParcelsAppFactory;

impl TrackingApiFactory for ParcelsAppFactory {
    fn create(&self, config: &ApiConfig) -> Result<Box<dyn TrackingApi>> {
        match config {
            ApiConfig::ParcelsApp {
                base_url,
                timeout_secs,
            } => {
                config.validate()?;
                let client =
                    ParcelsAppClient::new(base_url.clone(), Duration::from_secs(*timeout_secs))?;
                Ok(Box::new(client))
            }
            _ => Err(Error::config("Invalid config for Parcels App tracking API")),
        }
    }
}

/// Register the Parcels App tracking API with a registry
///
/// # Example
///
/// ```rust
/// use parcels_core::BackendRegistry;
///
/// let registry = BackendRegistry::with_builtin_stores();
/// parcels_api_http::register(&registry);
/// assert!(registry.has_api("parcels_app"));
/// ```
pub fn register(registry: &BackendRegistry) {
    registry.register_api("parcels_app", Box::new(ParcelsAppFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn account() -> TrackingConfig {
        TrackingConfig::new("secret-key", "Germany")
    }

    /// Serve one canned HTTP response on a local port
    ///
    /// Returns the base URL and a receiver for the raw request text.
    async fn one_shot_server(status_line: &str, body: &str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (request_tx, request_rx) = oneshot::channel();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if request_complete(&buf) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            let _ = request_tx.send(String::from_utf8_lossy(&buf).into_owned());
        });

        (format!("http://{}", addr), request_rx)
    }

    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        buf.len() >= header_end + 4 + content_length
    }

    #[test]
    fn test_parse_init_token() {
        let result = parse_init_response(r#"{"uuid":"u1"}"#).unwrap();
        assert_eq!(result, InitResult::Token("u1".to_string()));
    }

    #[test]
    fn test_parse_init_immediate_shipment() {
        let body = r#"{
            "shipments": [{
                "status": "transit",
                "lastState": {"status": "Departed facility", "location": "Leipzig"},
                "origin": "China",
                "destination": "Germany",
                "detectedCarrier": {"name": "DHL"},
                "attributes": [
                    {"l": "weight", "val": "1.2 kg"},
                    {"l": "days_transit", "val": 8}
                ]
            }]
        }"#;

        let InitResult::Shipment(payload) = parse_init_response(body).unwrap() else {
            panic!("expected an immediate shipment");
        };
        assert_eq!(payload.status.as_deref(), Some("transit"));
        assert_eq!(payload.message.as_deref(), Some("Departed facility"));
        assert_eq!(payload.location.as_deref(), Some("Leipzig"));
        assert_eq!(payload.origin.as_deref(), Some("China"));
        assert_eq!(payload.destination.as_deref(), Some("Germany"));
        assert_eq!(payload.carrier.as_deref(), Some("DHL"));
        assert_eq!(payload.days_in_transit, Some(8));
    }

    #[test]
    fn test_parse_init_without_uuid_or_shipments() {
        assert!(matches!(
            parse_init_response(r#"{"shipments": []}"#),
            Err(Error::Parse(_))
        ));
        assert!(matches!(parse_init_response("<html>"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_poll_pending() {
        assert_eq!(
            parse_poll_response(r#"{"done": false}"#).unwrap(),
            PollResult::Pending
        );
        // Done without shipments is still nothing to merge
        assert_eq!(
            parse_poll_response(r#"{"done": true, "shipments": []}"#).unwrap(),
            PollResult::Pending
        );
    }

    #[test]
    fn test_parse_poll_delivered() {
        let body = r#"{"done": true, "shipments": [{"status": "delivered", "lastState": {"status": "Delivered", "location": "NYC"}}]}"#;
        let PollResult::Shipment(payload) = parse_poll_response(body).unwrap() else {
            panic!("expected a resolved shipment");
        };
        assert_eq!(payload.status.as_deref(), Some("delivered"));
        assert_eq!(payload.message.as_deref(), Some("Delivered"));
        assert_eq!(payload.location.as_deref(), Some("NYC"));
        assert_eq!(payload.carrier, None);
        assert_eq!(payload.days_in_transit, None);
    }

    #[test]
    fn test_non_string_fields_are_dropped() {
        let body = r#"{"done": true, "shipments": [{
            "status": "transit",
            "lastState": {"status": "In transit", "location": {"city": "Leipzig"}},
            "detectedCarrier": {"name": 42}
        }]}"#;
        let PollResult::Shipment(payload) = parse_poll_response(body).unwrap() else {
            panic!("expected a resolved shipment");
        };
        assert_eq!(payload.status.as_deref(), Some("transit"));
        assert_eq!(payload.message.as_deref(), Some("In transit"));
        assert_eq!(payload.location, None);
        assert_eq!(payload.carrier, None);
    }

    #[test]
    fn test_days_transit_formats() {
        assert_eq!(parse_days(&serde_json::json!(12)), Some(12));
        assert_eq!(parse_days(&serde_json::json!("12")), Some(12));
        assert_eq!(parse_days(&serde_json::json!(" 4 ")), Some(4));
        assert_eq!(parse_days(&serde_json::json!("n/a")), None);
        assert_eq!(parse_days(&serde_json::json!(-1)), None);
        assert_eq!(parse_days(&Value::Null), None);
    }

    #[test]
    fn test_status_error_mapping() {
        let auth = map_status_error(401, "Lookup", "");
        assert!(matches!(&auth, Error::Network(msg) if msg.contains("Authentication")));

        let rate = map_status_error(429, "Lookup", "");
        assert!(matches!(&rate, Error::Network(msg) if msg.contains("Rate limit")));

        let server = map_status_error(503, "Poll", "maintenance");
        assert!(matches!(&server, Error::Network(msg) if msg.contains("maintenance")));

        assert!(map_status_error(400, "Poll", "bad").is_remote());
    }

    #[test]
    fn test_factory_creation() {
        let factory = ParcelsAppFactory;
        assert!(factory.create(&ApiConfig::default()).is_ok());

        let bad_url = ApiConfig::ParcelsApp {
            base_url: "ftp://parcelsapp.com".to_string(),
            timeout_secs: 30,
        };
        assert!(factory.create(&bad_url).is_err());

        let custom = ApiConfig::Custom {
            factory: "other".to_string(),
            config: serde_json::json!({}),
        };
        assert!(factory.create(&custom).is_err());
    }

    #[test]
    fn test_register() {
        let registry = BackendRegistry::new();
        register(&registry);
        assert!(registry.has_api("parcels_app"));

        let api = registry.create_api(&ApiConfig::default()).unwrap();
        assert_eq!(api.api_name(), "parcels_app");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client =
            ParcelsAppClient::new("https://parcelsapp.com/", DEFAULT_HTTP_TIMEOUT).unwrap();
        assert_eq!(client.base_url(), "https://parcelsapp.com");
        assert_eq!(
            client.tracking_url(),
            "https://parcelsapp.com/api/v3/shipments/tracking"
        );
        assert!(ParcelsAppClient::new("", DEFAULT_HTTP_TIMEOUT).is_err());
    }

    #[tokio::test]
    async fn test_initiate_sends_expected_request() {
        let (base_url, request_rx) = one_shot_server("200 OK", r#"{"uuid":"u1"}"#).await;
        let client = ParcelsAppClient::new(base_url, Duration::from_secs(5)).unwrap();

        let result = client.initiate_or_fetch(&account(), "ABC123").await.unwrap();
        assert_eq!(result, InitResult::Token("u1".to_string()));

        let request = request_rx.await.unwrap();
        assert!(request.starts_with("POST /api/v3/shipments/tracking"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["shipments"][0]["trackingId"], "ABC123");
        assert_eq!(body["shipments"][0]["destinationCountry"], "Germany");
        assert_eq!(body["language"], "en");
        assert_eq!(body["apiKey"], "secret-key");
    }

    #[tokio::test]
    async fn test_poll_sends_token_and_key() {
        let (base_url, request_rx) = one_shot_server("200 OK", r#"{"done": false}"#).await;
        let client = ParcelsAppClient::new(base_url, Duration::from_secs(5)).unwrap();

        let result = client.poll(&account(), "u1").await.unwrap();
        assert_eq!(result, PollResult::Pending);

        let request = request_rx.await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(request_line.starts_with("GET /api/v3/shipments/tracking?"));
        assert!(request_line.contains("uuid=u1"));
        assert!(request_line.contains("apiKey=secret-key"));
        assert!(request_line.contains("language=en"));
    }

    #[tokio::test]
    async fn test_server_error_is_network_error() {
        let (base_url, _request_rx) =
            one_shot_server("503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let client = ParcelsAppClient::new(base_url, Duration::from_secs(5)).unwrap();

        let result = client.initiate_or_fetch(&account(), "ABC123").await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_probe_reachable() {
        let (base_url, request_rx) = one_shot_server("200 OK", "{}").await;
        let client = ParcelsAppClient::new(base_url, Duration::from_secs(5)).unwrap();

        let status = client.probe().await;
        assert!(status.reachable);
        assert_eq!(status.http_code, Some(200));
        assert!(status.latency_ms.is_some());
        assert!(request_rx.await.unwrap().starts_with("GET / "));
    }

    #[tokio::test]
    async fn test_probe_non_success_is_unreachable() {
        let (base_url, _request_rx) = one_shot_server("502 Bad Gateway", "{}").await;
        let client = ParcelsAppClient::new(base_url, Duration::from_secs(5)).unwrap();

        let status = client.probe().await;
        assert!(!status.reachable);
        assert_eq!(status.http_code, Some(502));
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_unreachable() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            ParcelsAppClient::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let status = client.probe().await;
        assert!(!status.reachable);
        assert_eq!(status.http_code, None);
        assert_eq!(status.latency_ms, None);
    }
}
