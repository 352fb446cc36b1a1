//! DRM - content key delivery for encrypted items
//!
//! When the engine needs a decryption key for an encrypted asset it hands a
//! pending [`KeyLoadingRequest`] to the resource-loading hook. The resolver
//! answers it with one license-server round trip.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Key Delivery Resolver                │
//! ├─────────────────────────────────────────────────────┤
//! │                                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────┐  │
//! │  │ Certificate  │  │  Key request │  │ License  │  │
//! │  │   Source     │─▶│  (engine)    │─▶│ Transport│  │
//! │  └──────────────┘  └──────────────┘  └────┬─────┘  │
//! │                                           │        │
//! │                              ┌────────────┴──────┐ │
//! │                              │ finish(key | err) │ │
//! │                              └───────────────────┘ │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Every path finishes the pending engine request exactly once. A
//! [`KeyRequest`] that is dropped while still pending fails the engine request
//! with [`KeyDeliveryError::Abandoned`].

use crate::engine::{KeyLoadingRequest, ResourceLoader};
use crate::error::{Error, Result};
use crate::types::{DecryptionInfo, ItemId, PlayerConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Stage at which key delivery failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyDeliveryError {
    #[error("Loading request has no resource URL")]
    MissingUrl,

    #[error("Certificate unavailable: {0}")]
    CertificateUnavailable(String),

    #[error("Key request construction failed: {0}")]
    KeyRequestConstructionFailed(String),

    #[error("License server unavailable: {0}")]
    LicenseServerUnavailable(String),

    #[error("Key request dropped before completion")]
    Abandoned,
}

impl KeyDeliveryError {
    /// Numeric code reported to the engine
    pub fn code(&self) -> i64 {
        match self {
            KeyDeliveryError::MissingUrl => -1,
            KeyDeliveryError::CertificateUnavailable(_) => -2,
            KeyDeliveryError::KeyRequestConstructionFailed(_) => -3,
            KeyDeliveryError::LicenseServerUnavailable(_) => -5,
            KeyDeliveryError::Abandoned => -6,
        }
    }

    /// Stage name for logs
    pub fn stage(&self) -> &'static str {
        match self {
            KeyDeliveryError::MissingUrl => "missing_url",
            KeyDeliveryError::CertificateUnavailable(_) => "certificate_unavailable",
            KeyDeliveryError::KeyRequestConstructionFailed(_) => "key_request_construction_failed",
            KeyDeliveryError::LicenseServerUnavailable(_) => "license_server_unavailable",
            KeyDeliveryError::Abandoned => "abandoned",
        }
    }
}

/// Key request state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequestState {
    /// Waiting for the application certificate
    AwaitingCertificate,
    /// Certificate received, building the key request payload
    BuildingRequest,
    /// Payload sent to the license server
    AwaitingLicense,
    /// Key handed to the engine
    Delivered,
    /// Request failed
    Failed,
}

/// One in-flight key negotiation
pub struct KeyRequest {
    asset: ItemId,
    url: Url,
    state: KeyRequestState,
    certificate: Bytes,
    content_id: Bytes,
    payload: Bytes,
    issued_at: DateTime<Utc>,
    pending: Option<Box<dyn KeyLoadingRequest>>,
}

impl KeyRequest {
    /// Take ownership of a pending engine request.
    ///
    /// A request without a resource URL is failed immediately.
    pub fn accept(pending: Box<dyn KeyLoadingRequest>) -> std::result::Result<Self, KeyDeliveryError> {
        let Some(url) = pending.url().cloned() else {
            warn!(asset = %pending.asset(), "Key request has no resource URL");
            pending.finish(Err(KeyDeliveryError::MissingUrl));
            return Err(KeyDeliveryError::MissingUrl);
        };

        Ok(Self {
            asset: pending.asset(),
            url,
            state: KeyRequestState::AwaitingCertificate,
            certificate: Bytes::new(),
            content_id: Bytes::new(),
            payload: Bytes::new(),
            issued_at: Utc::now(),
            pending: Some(pending),
        })
    }

    pub fn asset(&self) -> ItemId {
        self.asset
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> KeyRequestState {
        self.state
    }

    pub fn certificate(&self) -> &Bytes {
        &self.certificate
    }

    pub fn content_id(&self) -> &Bytes {
        &self.content_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Store the certificate and ask the engine for the key request payload
    pub fn build_payload(
        &mut self,
        certificate: Bytes,
        content_id: &str,
    ) -> std::result::Result<Bytes, KeyDeliveryError> {
        self.state = KeyRequestState::BuildingRequest;
        self.certificate = certificate;
        self.content_id = Bytes::copy_from_slice(content_id.as_bytes());

        let pending = self.pending.as_ref().ok_or(KeyDeliveryError::Abandoned)?;
        let payload = pending
            .key_request_data(&self.certificate, &self.content_id)
            .map_err(KeyDeliveryError::KeyRequestConstructionFailed)?;

        self.payload = payload.clone();
        self.state = KeyRequestState::AwaitingLicense;
        Ok(payload)
    }

    /// Deliver the key to the engine
    pub fn complete(mut self, key: Bytes) {
        self.state = KeyRequestState::Delivered;
        self.finish(Ok(key));
    }

    /// Fail the engine request; returns the error for propagation
    pub fn fail(mut self, error: KeyDeliveryError) -> KeyDeliveryError {
        self.state = KeyRequestState::Failed;
        self.finish(Err(error.clone()));
        error
    }

    fn finish(&mut self, outcome: std::result::Result<Bytes, KeyDeliveryError>) {
        if let Some(pending) = self.pending.take() {
            let elapsed_ms = (Utc::now() - self.issued_at).num_milliseconds();
            match &outcome {
                Ok(key) => debug!(asset = %self.asset, bytes = key.len(), elapsed_ms, "Key request finished"),
                Err(e) => debug!(asset = %self.asset, stage = e.stage(), elapsed_ms, "Key request failed"),
            }
            pending.finish(outcome);
        }
    }
}

impl Drop for KeyRequest {
    fn drop(&mut self) {
        if self.pending.is_some() {
            warn!(asset = %self.asset, state = ?self.state, "Key request dropped while pending");
            self.state = KeyRequestState::Failed;
            self.finish(Err(KeyDeliveryError::Abandoned));
        }
    }
}

impl std::fmt::Debug for KeyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRequest")
            .field("asset", &self.asset)
            .field("url", &self.url.as_str())
            .field("state", &self.state)
            .field("payload_len", &self.payload.len())
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Source of application certificates
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn fetch(&self, locator: &Url) -> Result<Bytes>;
}

/// Reads `file://` locators from disk and fetches `http(s)://` locators
pub struct DefaultCertificateSource {
    client: Client,
}

impl DefaultCertificateSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertificateSource for DefaultCertificateSource {
    async fn fetch(&self, locator: &Url) -> Result<Bytes> {
        match locator.scheme() {
            "file" => {
                let path = locator
                    .to_file_path()
                    .map_err(|_| Error::certificate(locator.as_str(), "not a local path"))?;
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::certificate(locator.as_str(), e.to_string()))?;
                Ok(Bytes::from(data))
            }
            "http" | "https" => {
                let response = self.client.get(locator.clone()).send().await?;
                if !response.status().is_success() {
                    return Err(Error::certificate(
                        locator.as_str(),
                        format!("HTTP {}", response.status()),
                    ));
                }
                Ok(response.bytes().await?)
            }
            other => Err(Error::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

/// Certificate bundled with the host application
pub struct StaticCertificate(pub Bytes);

#[async_trait]
impl CertificateSource for StaticCertificate {
    async fn fetch(&self, _locator: &Url) -> Result<Bytes> {
        Ok(self.0.clone())
    }
}

/// Raw license server reply
#[derive(Debug, Clone)]
pub struct LicenseResponse {
    pub status: u16,
    pub body: Bytes,
}

impl LicenseResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Carries key request payloads to the license server
#[async_trait]
pub trait LicenseTransport: Send + Sync {
    async fn post(&self, url: &Url, payload: Bytes) -> Result<LicenseResponse>;
}

/// HTTP POST transport
pub struct HttpLicenseTransport {
    client: Client,
    headers: HashMap<String, String>,
    content_type: String,
}

impl HttpLicenseTransport {
    pub fn new(client: Client, config: &PlayerConfig) -> Self {
        Self {
            client,
            headers: config.license_headers.clone(),
            content_type: config.license_content_type.clone(),
        }
    }
}

#[async_trait]
impl LicenseTransport for HttpLicenseTransport {
    async fn post(&self, url: &Url, payload: Bytes) -> Result<LicenseResponse> {
        let mut request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, self.content_type.as_str())
            .body(payload);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| Error::LicenseRequest {
            url: url.to_string(),
            source: e,
        })?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| Error::LicenseRequest {
            url: url.to_string(),
            source: e,
        })?;

        Ok(LicenseResponse { status, body })
    }
}

/// Build the HTTP client used for certificates and licenses
pub fn http_client(config: &PlayerConfig) -> Result<Client> {
    let mut builder = Client::builder().user_agent(concat!("versa-core/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout_ms) = config.request_timeout_ms {
        builder = builder.timeout(Duration::from_millis(timeout_ms));
    }
    Ok(builder.build()?)
}

/// Resolves engine key requests against a license server
pub struct KeyDeliveryResolver {
    certificates: Arc<dyn CertificateSource>,
    transport: Arc<dyn LicenseTransport>,
    runtime: Handle,
    in_flight: Arc<Mutex<HashMap<ItemId, usize>>>,
}

impl KeyDeliveryResolver {
    /// Create a resolver that runs resolutions on `runtime`
    pub fn new(
        certificates: Arc<dyn CertificateSource>,
        transport: Arc<dyn LicenseTransport>,
        runtime: Handle,
    ) -> Self {
        Self {
            certificates,
            transport,
            runtime,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// HTTP-backed resolver on the current tokio runtime
    pub fn from_config(config: &PlayerConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let client = http_client(config)?;
        Ok(Self::new(
            Arc::new(DefaultCertificateSource::new(client.clone())),
            Arc::new(HttpLicenseTransport::new(client, config)),
            runtime,
        ))
    }

    /// Number of assets with a resolution in progress
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Resolve one key request. The pending engine request is finished on
    /// every path; the returned value mirrors what the engine received.
    #[instrument(skip(self, pending, info), fields(asset = %pending.asset()))]
    pub async fn resolve(
        &self,
        pending: Box<dyn KeyLoadingRequest>,
        info: &DecryptionInfo,
    ) -> std::result::Result<Bytes, KeyDeliveryError> {
        let request = KeyRequest::accept(pending)?;
        self.negotiate(request, info).await
    }

    async fn negotiate(
        &self,
        mut request: KeyRequest,
        info: &DecryptionInfo,
    ) -> std::result::Result<Bytes, KeyDeliveryError> {
        let _guard = InFlightGuard::enter(&self.in_flight, request.asset());

        info!(url = %request.url(), license_server = %info.license_server_url, "Resolving content key");

        let certificate = match self.certificates.fetch(&info.certificate_url).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                return Err(request.fail(KeyDeliveryError::CertificateUnavailable(
                    "certificate is empty".into(),
                )))
            }
            Err(e) => {
                warn!(certificate = %info.certificate_url, error = %e, "Certificate fetch failed");
                return Err(request.fail(KeyDeliveryError::CertificateUnavailable(e.to_string())));
            }
        };

        let payload = match request.build_payload(certificate, &info.content_id) {
            Ok(payload) => payload,
            Err(e) => return Err(request.fail(e)),
        };
        debug!(payload_bytes = payload.len(), "Key request payload built");

        let response = match self.transport.post(&info.license_server_url, payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "License request failed");
                return Err(request.fail(KeyDeliveryError::LicenseServerUnavailable(e.to_string())));
            }
        };

        if !response.is_success() {
            warn!(status = response.status, "License server rejected key request");
            return Err(request.fail(KeyDeliveryError::LicenseServerUnavailable(format!(
                "HTTP {}",
                response.status
            ))));
        }
        if response.body.is_empty() {
            warn!("License server returned an empty body");
            return Err(request.fail(KeyDeliveryError::LicenseServerUnavailable(
                "empty response body".into(),
            )));
        }

        info!(key_bytes = response.body.len(), "Content key delivered");
        request.complete(response.body.clone());
        Ok(response.body)
    }

    /// Start resolving in the background.
    ///
    /// Returns false when the request was failed synchronously.
    /// The engine request is wrapped before the task is spawned, so a task
    /// that never runs still fails it with [`KeyDeliveryError::Abandoned`].
    pub fn spawn(self: &Arc<Self>, pending: Box<dyn KeyLoadingRequest>, info: DecryptionInfo) -> bool {
        let request = match KeyRequest::accept(pending) {
            Ok(request) => request,
            Err(_) => return false,
        };

        let resolver = Arc::clone(self);
        self.runtime.spawn(async move {
            if let Err(e) = resolver.negotiate(request, &info).await {
                warn!(stage = e.stage(), error = %e, "Key delivery failed");
            }
        });
        true
    }
}

struct InFlightGuard {
    in_flight: Arc<Mutex<HashMap<ItemId, usize>>>,
    asset: ItemId,
}

impl InFlightGuard {
    fn enter(in_flight: &Arc<Mutex<HashMap<ItemId, usize>>>, asset: ItemId) -> Self {
        let mut map = in_flight.lock();
        let count = map.entry(asset).or_insert(0);
        if *count > 0 {
            warn!(asset = %asset, "Concurrent key request for an asset already being resolved");
        }
        *count += 1;
        Self {
            in_flight: Arc::clone(in_flight),
            asset,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock();
        if let Some(count) = map.get_mut(&self.asset) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.asset);
            }
        }
    }
}

/// Resource-loading hook bound to one encrypted item
pub struct KeyLoaderHook {
    resolver: Arc<KeyDeliveryResolver>,
    info: DecryptionInfo,
}

impl KeyLoaderHook {
    pub fn new(resolver: Arc<KeyDeliveryResolver>, info: DecryptionInfo) -> Self {
        Self { resolver, info }
    }
}

impl ResourceLoader for KeyLoaderHook {
    fn should_wait_for_loading(&self, request: Box<dyn KeyLoadingRequest>) -> bool {
        self.resolver.spawn(request, self.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Outcome = Arc<Mutex<Option<std::result::Result<Bytes, KeyDeliveryError>>>>;

    struct FakeRequest {
        asset: ItemId,
        url: Option<Url>,
        outcome: Outcome,
    }

    impl FakeRequest {
        fn boxed(url: Option<&str>) -> (Box<dyn KeyLoadingRequest>, Outcome) {
            let outcome: Outcome = Arc::new(Mutex::new(None));
            let request = FakeRequest {
                asset: ItemId::new(),
                url: url.map(|u| Url::parse(u).unwrap()),
                outcome: outcome.clone(),
            };
            (Box::new(request), outcome)
        }
    }

    impl KeyLoadingRequest for FakeRequest {
        fn asset(&self) -> ItemId {
            self.asset
        }

        fn url(&self) -> Option<&Url> {
            self.url.as_ref()
        }

        fn key_request_data(&self, certificate: &[u8], content_id: &[u8]) -> std::result::Result<Bytes, String> {
            if content_id.is_empty() {
                return Err("empty content id".into());
            }
            let mut spc = certificate.to_vec();
            spc.extend_from_slice(content_id);
            Ok(Bytes::from(spc))
        }

        fn finish(self: Box<Self>, outcome: std::result::Result<Bytes, KeyDeliveryError>) {
            let mut slot = self.outcome.lock();
            assert!(slot.is_none(), "request finished twice");
            *slot = Some(outcome);
        }
    }

    struct FailingCertificate;

    #[async_trait]
    impl CertificateSource for FailingCertificate {
        async fn fetch(&self, locator: &Url) -> Result<Bytes> {
            Err(Error::certificate(locator.as_str(), "unreadable"))
        }
    }

    struct FakeLicenseServer {
        status: u16,
        body: Bytes,
        calls: AtomicUsize,
        last_payload: Mutex<Option<Bytes>>,
    }

    impl FakeLicenseServer {
        fn new(status: u16, body: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: Bytes::from_static(body),
                calls: AtomicUsize::new(0),
                last_payload: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LicenseTransport for FakeLicenseServer {
        async fn post(&self, _url: &Url, payload: Bytes) -> Result<LicenseResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock() = Some(payload);
            Ok(LicenseResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    fn info(content_id: &str) -> DecryptionInfo {
        DecryptionInfo::new(
            content_id,
            Url::parse("https://example.com/fps/cert.der").unwrap(),
            Url::parse("https://example.com/fps/license").unwrap(),
        )
    }

    fn resolver(
        certificates: Arc<dyn CertificateSource>,
        server: Arc<FakeLicenseServer>,
    ) -> KeyDeliveryResolver {
        KeyDeliveryResolver::new(certificates, server, Handle::current())
    }

    fn cert() -> Arc<dyn CertificateSource> {
        Arc::new(StaticCertificate(Bytes::from_static(b"CERT")))
    }

    #[tokio::test]
    async fn test_successful_delivery() {
        let server = FakeLicenseServer::new(200, b"0123456789abcdef");
        let resolver = resolver(cert(), server.clone());
        let (request, outcome) = FakeRequest::boxed(Some("skd://asset-1"));

        let key = resolver.resolve(request, &info("asset-1")).await.unwrap();

        assert_eq!(key.len(), 16);
        assert_eq!(outcome.lock().clone(), Some(Ok(Bytes::from_static(b"0123456789abcdef"))));
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            server.last_payload.lock().clone(),
            Some(Bytes::from_static(b"CERTasset-1"))
        );
        assert_eq!(resolver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_server_error_fails_request() {
        let server = FakeLicenseServer::new(500, b"oops");
        let resolver = resolver(cert(), server.clone());
        let (request, outcome) = FakeRequest::boxed(Some("skd://asset-1"));

        let err = resolver.resolve(request, &info("asset-1")).await.unwrap_err();

        assert!(matches!(err, KeyDeliveryError::LicenseServerUnavailable(_)));
        assert_eq!(outcome.lock().clone(), Some(Err(err)));
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_body_fails_request() {
        let server = FakeLicenseServer::new(200, b"");
        let resolver = resolver(cert(), server);
        let (request, outcome) = FakeRequest::boxed(Some("skd://asset-1"));

        let err = resolver.resolve(request, &info("asset-1")).await.unwrap_err();

        assert!(matches!(err, KeyDeliveryError::LicenseServerUnavailable(_)));
        assert!(matches!(outcome.lock().clone(), Some(Err(_))));
    }

    #[tokio::test]
    async fn test_missing_url_fails_without_network() {
        let server = FakeLicenseServer::new(200, b"key");
        let resolver = resolver(cert(), server.clone());
        let (request, outcome) = FakeRequest::boxed(None);

        let err = resolver.resolve(request, &info("asset-1")).await.unwrap_err();

        assert_eq!(err, KeyDeliveryError::MissingUrl);
        assert_eq!(outcome.lock().clone(), Some(Err(KeyDeliveryError::MissingUrl)));
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreadable_certificate() {
        let server = FakeLicenseServer::new(200, b"key");
        let resolver = resolver(Arc::new(FailingCertificate), server.clone());
        let (request, outcome) = FakeRequest::boxed(Some("skd://asset-1"));

        let err = resolver.resolve(request, &info("asset-1")).await.unwrap_err();

        assert!(matches!(err, KeyDeliveryError::CertificateUnavailable(_)));
        assert!(matches!(outcome.lock().clone(), Some(Err(KeyDeliveryError::CertificateUnavailable(_)))));
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_inputs() {
        let server = FakeLicenseServer::new(200, b"key");
        let resolver = resolver(cert(), server.clone());
        let (request, outcome) = FakeRequest::boxed(Some("skd://asset-1"));

        let err = resolver.resolve(request, &info("")).await.unwrap_err();

        assert!(matches!(err, KeyDeliveryError::KeyRequestConstructionFailed(_)));
        assert!(matches!(outcome.lock().clone(), Some(Err(_))));
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_request_is_abandoned() {
        let (pending, outcome) = FakeRequest::boxed(Some("skd://asset-1"));
        let request = KeyRequest::accept(pending).unwrap();
        assert!(request.is_pending());
        drop(request);

        assert_eq!(outcome.lock().clone(), Some(Err(KeyDeliveryError::Abandoned)));
    }

    #[tokio::test]
    async fn test_spawn_missing_url_is_synchronous() {
        let server = FakeLicenseServer::new(200, b"key");
        let resolver = Arc::new(resolver(cert(), server));
        let (request, outcome) = FakeRequest::boxed(None);

        assert!(!resolver.spawn(request, info("asset-1")));
        assert_eq!(outcome.lock().clone(), Some(Err(KeyDeliveryError::MissingUrl)));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(KeyDeliveryError::MissingUrl.code(), -1);
        assert_eq!(KeyDeliveryError::LicenseServerUnavailable("x".into()).code(), -5);
        assert_eq!(KeyDeliveryError::Abandoned.stage(), "abandoned");
    }

    #[test]
    fn test_spawn_on_stopped_runtime_abandons_request() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        let server = FakeLicenseServer::new(200, b"key");
        let resolver = Arc::new(KeyDeliveryResolver::new(cert(), server.clone(), handle));
        let (request, outcome) = FakeRequest::boxed(Some("skd://asset-1"));

        assert!(resolver.spawn(request, info("asset-1")));
        assert_eq!(outcome.lock().clone(), Some(Err(KeyDeliveryError::Abandoned)));
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.in_flight(), 0);
    }

    // =========================================================================
    // Certificate sources and HTTP transport
    // =========================================================================

    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Local HTTP server answering every connection with one canned reply
    struct StubServer {
        addr: std::net::SocketAddr,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl StubServer {
        async fn start(status: u16, body: &'static [u8]) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = requests.clone();

            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let request = read_request(&mut stream).await;
                    seen.lock().push(request);
                    let head = format!(
                        "HTTP/1.1 {} Stub\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        status,
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                    let _ = stream.shutdown().await;
                }
            });

            Self { addr, requests }
        }

        fn url(&self, path: &str) -> Url {
            Url::parse(&format!("http://{}{}", self.addr, path)).unwrap()
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().clone()
        }
    }

    /// Read one request, headers plus a `content-length` body; lowercased
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_lowercase()
    }

    fn local_client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    fn certificate_file(contents: &[u8]) -> (NamedTempFile, Url) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        let url = Url::from_file_path(file.path()).unwrap();
        (file, url)
    }

    fn http_resolver(config: &PlayerConfig) -> KeyDeliveryResolver {
        let client = local_client();
        KeyDeliveryResolver::new(
            Arc::new(DefaultCertificateSource::new(client.clone())),
            Arc::new(HttpLicenseTransport::new(client, config)),
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_file_certificate_is_read() {
        let (_file, url) = certificate_file(b"APPLICATION-CERT");
        let source = DefaultCertificateSource::new(local_client());

        let bytes = source.fetch(&url).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"APPLICATION-CERT"));
    }

    #[tokio::test]
    async fn test_missing_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("absent.der")).unwrap();
        let source = DefaultCertificateSource::new(local_client());

        let err = source.fetch(&url).await.unwrap_err();
        assert_eq!(err.error_code(), "CERTIFICATE_FETCH");
    }

    #[tokio::test]
    async fn test_unsupported_certificate_scheme() {
        let source = DefaultCertificateSource::new(local_client());
        let err = source
            .fetch(&Url::parse("ftp://example.com/cert.der").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedScheme { ref scheme } if scheme == "ftp"));
    }

    #[tokio::test]
    async fn test_http_certificate_rejected_status() {
        let server = StubServer::start(404, b"").await;
        let source = DefaultCertificateSource::new(local_client());

        let err = source.fetch(&server.url("/cert.der")).await.unwrap_err();
        assert_eq!(err.error_code(), "CERTIFICATE_FETCH");
        assert!(server.requests()[0].starts_with("get /cert.der"));
    }

    #[tokio::test]
    async fn test_http_transport_sends_configured_headers() {
        let server = StubServer::start(200, b"0123456789abcdef").await;
        let mut config = PlayerConfig::default().with_license_header("X-Session-Token", "s3cret");
        config.license_content_type = "application/x-spc".to_string();
        let transport = HttpLicenseTransport::new(local_client(), &config);

        let response = transport
            .post(&server.url("/license"), Bytes::from_static(b"SPC-PAYLOAD"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body.len(), 16);
        let request = &server.requests()[0];
        assert!(request.starts_with("post /license"));
        assert!(request.contains("x-session-token: s3cret"));
        assert!(request.contains("content-type: application/x-spc"));
        assert!(request.ends_with("spc-payload"));
    }

    #[tokio::test]
    async fn test_http_transport_reports_status() {
        let server = StubServer::start(500, b"internal").await;
        let transport = HttpLicenseTransport::new(local_client(), &PlayerConfig::default());

        let response = transport.post(&server.url("/license"), Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_resolve_over_http() {
        let (_file, certificate_url) = certificate_file(b"CERT");
        let config = PlayerConfig::default().with_license_header("Authorization", "Bearer abc");

        for (status, body) in [(500u16, &b"oops"[..]), (200, &b""[..]), (200, &b"0123456789abcdef"[..])] {
            let server = StubServer::start(status, body).await;
            let resolver = http_resolver(&config);
            let info = DecryptionInfo::new("asset-1", certificate_url.clone(), server.url("/license"));
            let (request, outcome) = FakeRequest::boxed(Some("skd://asset-1"));

            let result = resolver.resolve(request, &info).await;

            if status == 200 && !body.is_empty() {
                assert_eq!(result.clone().unwrap().len(), 16);
            } else {
                assert!(matches!(result, Err(KeyDeliveryError::LicenseServerUnavailable(_))));
            }
            assert_eq!(outcome.lock().clone(), Some(result));

            let requests = server.requests();
            assert_eq!(requests.len(), 1);
            assert!(requests[0].contains("authorization: bearer abc"));
            assert!(requests[0].ends_with("certasset-1"));
        }
    }
}
