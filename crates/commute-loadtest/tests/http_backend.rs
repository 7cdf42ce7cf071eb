mod common;

use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use common::{test_config, two_category_catalog, wait_until, FakeTransports};
use commute_loadtest::catalog::Target;
use commute_loadtest::config::{BackendSettings, Timeouts};
use commute_loadtest::device::{DeviceIdentity, DeviceState};
use commute_loadtest::distribution::WorkloadAssignment;
use commute_loadtest::error::TransportError;
use commute_loadtest::transport::{
    BackendOp, BackendTransport, BrokerTransport, HttpBackend, TransportFactory,
};
use commute_loadtest::Orchestrator;
use serde_json::Value;
use std::sync::Arc;

const SECRET: &str = "load-test-secret";
const SESSION: &str = "session=abc123";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("x-loadtest-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == SECRET)
}

fn has_session(headers: &HeaderMap) -> bool {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(SESSION))
}

async fn register_device(headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::FORBIDDEN;
    }
    match body["id"].as_str() {
        Some(id) if id.starts_with("loadtest-") => StatusCode::CREATED,
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn login(Json(body): Json<Value>) -> impl IntoResponse {
    if body["email"].as_str().is_some_and(|e| e.ends_with("@test.invalid")) {
        (StatusCode::OK, [(header::SET_COOKIE, format!("{SESSION}; Path=/"))]).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn session_only(headers: HeaderMap) -> StatusCode {
    if has_session(&headers) {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn push_config(headers: HeaderMap, Path(_id): Path<String>, Json(body): Json<Value>) -> StatusCode {
    if !has_session(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    if body["lines"][0]["stop"].is_string() {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    }
}

async fn fetch_config(headers: HeaderMap, Path(_id): Path<String>) -> StatusCode {
    session_only(headers).await
}

async fn refresh(Path(_id): Path<String>) -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn logout() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Starts the stub backend and returns its base URL.
async fn spawn_backend() -> String {
    let app = Router::new()
        .route("/device/register", post(register_device))
        .route("/user/register", post(|| async { StatusCode::CREATED }))
        .route("/auth/login", post(login))
        .route("/user/device/link", post(session_only))
        .route("/device/:id/config", post(push_config).get(fetch_config))
        .route("/refresh/:id", post(refresh))
        .route("/auth/logout", post(logout));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

fn settings(server_url: String) -> BackendSettings {
    BackendSettings {
        server_url,
        secret_key: Some(SECRET.to_string()),
        ..Default::default()
    }
}

fn assignment() -> WorkloadAssignment {
    WorkloadAssignment {
        category: "cta".to_string(),
        target: Target::new("cta", "cta-subway", "Red", "40900", "N"),
    }
}

#[tokio::test]
async fn http_backend_keeps_session_cookie() {
    let backend = HttpBackend::new(&settings(spawn_backend().await)).unwrap();
    let identity = DeviceIdentity::generate();
    let assignment = assignment();
    let timeouts = Timeouts::default();
    let send = |op: BackendOp| {
        let request = op.request(&identity, &assignment, &timeouts);
        let backend = backend.clone();
        async move { backend.send(&request).await }
    };

    assert_eq!(send(BackendOp::RegisterDevice).await.unwrap(), 201);

    // No session yet
    assert_eq!(send(BackendOp::FetchConfiguration).await.unwrap(), 401);

    assert_eq!(send(BackendOp::Authenticate).await.unwrap(), 200);
    assert_eq!(send(BackendOp::PushConfiguration).await.unwrap(), 200);
    assert_eq!(send(BackendOp::FetchConfiguration).await.unwrap(), 200);
    assert_eq!(send(BackendOp::ForceRefresh).await.unwrap(), 503);
    assert_eq!(send(BackendOp::Logout).await.unwrap(), 204);
}

#[tokio::test]
async fn http_backend_reports_connection_failures() {
    // Nothing listens on the discard port
    let backend = HttpBackend::new(&settings("http://127.0.0.1:9".to_string())).unwrap();
    let request = BackendOp::RegisterDevice.request(
        &DeviceIdentity::generate(),
        &assignment(),
        &Timeouts::default(),
    );
    let err = backend.send(&request).await.unwrap_err();
    assert!(matches!(err, TransportError::Http(_)));
}

/// Real HTTP backend per device, fake broker.
struct HttpWithFakeBroker {
    settings: BackendSettings,
    brokers: FakeTransports,
}

impl TransportFactory for HttpWithFakeBroker {
    fn backend(&self, _: &DeviceIdentity) -> Result<Arc<dyn BackendTransport>, TransportError> {
        Ok(Arc::new(HttpBackend::new(&self.settings)?))
    }

    fn broker(&self, identity: &DeviceIdentity) -> Box<dyn BrokerTransport> {
        self.brokers.broker(identity)
    }
}

#[tokio::test]
async fn fleet_onboards_against_http_backend() {
    let transports = HttpWithFakeBroker {
        settings: settings(spawn_backend().await),
        brokers: FakeTransports::new(),
    };
    let orchestrator = Orchestrator::new(test_config(2), &two_category_catalog(), &transports).unwrap();
    let tasks = orchestrator.start().unwrap();

    let stats = Arc::clone(orchestrator.stats());
    wait_until(|| stats.active() == 2).await;

    // The stub refuses refreshes; the device stays active
    let device = Arc::clone(&orchestrator.devices()[0]);
    assert!(orchestrator.force_refresh(device.id()).await.is_err());
    assert_eq!(device.state(), DeviceState::Active);

    orchestrator.shutdown();
    tasks.join().await;

    for device in orchestrator.devices() {
        assert_eq!(device.state(), DeviceState::Done);
        let log = device.request_log();
        let logout = log.iter().find(|r| r.target == "/auth/logout").unwrap();
        assert_eq!(logout.status, Some(204));
        assert!(logout.ok);
    }
}
