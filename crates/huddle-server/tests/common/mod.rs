//! Shared fixtures for server integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use huddle_core::Router;
use huddle_server::auth::ServiceClaims;
use huddle_server::identity::{HandleResolver, ResolveError};
use huddle_server::{build_app, AppState, Config};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SERVICE_DID: &str = "did:web:router.test";
pub const JWT_SECRET: &str = "integration-secret";
pub const TOKEN_METHOD: &str = "chat.roomy.v0.router.token";

/// Handles known to the test resolver.
pub struct FixedHandles;

#[async_trait]
impl HandleResolver for FixedHandles {
    async fn resolve(&self, handle: &str) -> Result<Option<String>, ResolveError> {
        Ok(match handle {
            "alice.test" => Some("did:plc:alice".to_string()),
            _ => None,
        })
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.service.did = SERVICE_DID.to_string();
    config.service.public_url = None;
    config.auth.jwt_secret = Some(JWT_SECRET.to_string());
    config.auth.unsafe_dev_token = None;
    config.metrics.enabled = false;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    router: Option<Router>,
    server: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(config()).await
    }

    pub async fn start_with(config: Config) -> Self {
        let router = Router::start();
        let state = Arc::new(
            AppState::new(config, router.handle()).with_handle_resolver(Arc::new(FixedHandles)),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_app(Arc::clone(&state));
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            router: Some(router),
            server,
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn connect_url(&self, identity: &str) -> String {
        huddle_client::connect_url(&self.http_url(), identity)
    }

    pub fn issue_token(&self, identity: &str) -> String {
        self.state.tokens.issue(identity)
    }

    pub async fn shutdown(mut self) {
        if let Some(router) = self.router.take() {
            router.shutdown().await.unwrap();
        }
        self.server.abort();
    }
}

/// A signed bearer JWT from `issuer` for `method`.
pub fn bearer(issuer: &str, method: Option<&str>) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let claims = ServiceClaims {
        iss: issuer.to_string(),
        aud: SERVICE_DID.to_string(),
        exp: now + 60,
        iat: Some(now),
        lxm: method.map(str::to_string),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Wait for the next item on `rx`, failing the test after a few seconds.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}
