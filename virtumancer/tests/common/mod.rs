//! Shared test utilities for virtumancer integration tests.

#![allow(dead_code)]

use futures::StreamExt;
use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use virtumancer::hub::{ClientId, ServerMessage};
use virtumancer::orchestrator::VerbTimeouts;
use virtumancer::pool::BackoffPolicy;
use virtumancer::rest::create_router;
use virtumancer::{Service, ServiceConfig, Store};
use virtumancer_hv::{DriverRegistry, TestDriver, TestHost};

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Tunables shrunk so tests finish quickly.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        discovery_interval: Duration::from_secs(1),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(10),
            factor: 2.0,
            max: Duration::from_millis(100),
            jitter: 0.0,
        },
        timeouts: VerbTimeouts {
            start: Duration::from_secs(5),
            shutdown: Duration::from_secs(1),
            reboot: Duration::from_secs(5),
            force_off: Duration::from_secs(5),
            force_reset: Duration::from_secs(5),
            suspend: Duration::from_secs(5),
            resume: Duration::from_secs(5),
            rebuild: Duration::from_secs(10),
        },
        poll_interval: Duration::from_millis(20),
        sampler_failure_limit: 3,
        client_buffer: 256,
        settings_ttl: Duration::ZERO,
    }
}

/// Test server wrapper running the full service and HTTP router on an
/// ephemeral port, backed by its own `test://` driver.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub service: Arc<Service>,
    pub driver: Arc<TestDriver>,
    token: CancellationToken,
    _data_dir: TempDir,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let data_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::open(data_dir.path())
            .await
            .expect("Failed to open store");

        let driver = Arc::new(TestDriver::new());
        let mut registry = DriverRegistry::new();
        registry.register("test", driver.clone());

        let token = CancellationToken::new();
        let service = Service::start(store, Arc::new(registry), test_config(), token.clone())
            .await
            .expect("Failed to start service");

        let router = create_router(service.clone());

        // Bind to port 0 to let the OS choose an available port
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
        let actual_addr = listener.local_addr().unwrap();

        let server_token = token.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(server_token.cancelled_owned())
                .await
                .expect("Server error");
        });

        Self {
            addr: actual_addr,
            client: Client::new(),
            service,
            driver,
            token,
            _data_dir: data_dir,
        }
    }

    /// Spawn a server with host `h1` on `test:///default` already added.
    pub async fn with_default_host() -> Self {
        let server = Self::spawn().await;
        let response = server
            .post_json(
                "/hosts",
                &serde_json::json!({"id": "h1", "uri": "test:///default"}),
            )
            .await;
        assert_eq!(response.status(), 201);
        server
    }

    /// The simulated hypervisor behind `uri`.
    pub fn hv_host(&self, uri: &str) -> Arc<TestHost> {
        self.driver.host(uri).expect("Unknown test host")
    }

    /// Get base URL for the REST API.
    pub fn base_url(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }

    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn post(&self, path: &str) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .put(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn patch_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .patch(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn delete(&self, path: &str) -> ReqwestResponse {
        self.client
            .delete(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    pub async fn delete_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .delete(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Open a real WebSocket connection to `/ws`.
    pub async fn ws_connect(&self) -> WsClient {
        let (socket, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .expect("WebSocket handshake failed");
        socket
    }

    /// Register an in-process hub client, as the WebSocket endpoint does.
    pub async fn hub_client(&self) -> (ClientId, mpsc::Receiver<ServerMessage>) {
        self.service.hub.register().await
    }

    /// Shutdown the service and the server.
    pub async fn shutdown(self) {
        self.service.shutdown().await;
        self.token.cancel();
    }
}

/// Receive until `pred` matches, failing after `timeout`.
pub async fn wait_for_message<F>(
    rx: &mut mpsc::Receiver<ServerMessage>,
    timeout: Duration,
    mut pred: F,
) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            let message = rx.recv().await.expect("Hub closed the client");
            if pred(&message) {
                return message;
            }
        }
    })
    .await
    .expect("Expected message did not arrive")
}

/// Poll `GET path` until `pred` holds on the JSON body.
pub async fn wait_for_json<F>(server: &TestServer, path: &str, timeout: Duration, pred: F) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let body: serde_json::Value = server.get(path).await.json().await.unwrap();
        if pred(&body) {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition on {} not met, last body: {}",
            path,
            body
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Read text frames until one parses to JSON matching `pred`.
pub async fn next_ws_json<F>(socket: &mut WsClient, timeout: Duration, pred: F) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            let frame = socket
                .next()
                .await
                .expect("Socket closed")
                .expect("Socket error");
            if let WsMessage::Text(text) = frame {
                let value: serde_json::Value =
                    serde_json::from_str(text.as_str()).expect("Frame is not JSON");
                if pred(&value) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("Expected frame did not arrive")
}
