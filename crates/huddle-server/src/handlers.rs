//! HTTP and WebSocket handlers for the Huddle server.
//!
//! This module wires the routes together and runs one task per peer
//! connection, feeding decoded frames to the router and writing the
//! router's frames back to the socket.

use crate::auth::{AuthedCaller, JwtVerifier, SigningKeyResolver, StaticKeyResolver};
use crate::config::Config;
use crate::error::ApiError;
use crate::identity::{HandleResolver, HttpsHandleResolver};
use crate::metrics::{self, ConnectionMetricsGuard, Direction};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{
        header::{HOST, SEC_WEBSOCKET_PROTOCOL},
        HeaderMap,
    },
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{
    ConnectionId, Router as HuddleRouter, RouterError, RouterHandle, TokenError, TokenStore,
};
use huddle_protocol::{codec, Identity, PeerHeader};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

/// Sub-protocol the server accepts on upgrade.
const AUTH_PROTOCOL: &str = "authorization";

/// Shared server state.
pub struct AppState {
    /// Handle to the router task.
    pub router: RouterHandle,
    /// Outstanding upgrade tokens.
    pub tokens: Arc<TokenStore>,
    /// Bearer verification for XRPC routes.
    pub verifier: JwtVerifier,
    /// Handle resolution for `resolveHandle`.
    pub handles: Arc<dyn HandleResolver>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create state for a server routing through `router`.
    #[must_use]
    pub fn new(config: Config, router: RouterHandle) -> Self {
        let mut tokens = TokenStore::new(config.token_ttl());
        if let Some(dev_token) = &config.auth.unsafe_dev_token {
            tokens = tokens.with_unsafe_dev_token(dev_token.clone());
        }

        let keys: Arc<dyn SigningKeyResolver> = match &config.auth.jwt_secret {
            Some(secret) => Arc::new(StaticKeyResolver::from_secret(secret.as_bytes())),
            None => {
                warn!("auth.jwt_secret is not set; bearer tokens will be rejected");
                Arc::new(StaticKeyResolver::disabled())
            }
        };

        Self {
            router,
            tokens: Arc::new(tokens),
            verifier: JwtVerifier::new(config.service.did.clone(), keys),
            handles: Arc::new(HttpsHandleResolver::new()),
            config,
        }
    }

    /// Use `resolver` to look up bearer signing keys.
    #[must_use]
    pub fn with_key_resolver(mut self, resolver: Arc<dyn SigningKeyResolver>) -> Self {
        self.verifier = JwtVerifier::new(self.config.service.did.clone(), resolver);
        self
    }

    /// Use `resolver` for handle resolution.
    #[must_use]
    pub fn with_handle_resolver(mut self, resolver: Arc<dyn HandleResolver>) -> Self {
        self.handles = resolver;
        self
    }
}

/// Build the HTTP application.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/connect/as/:identity", get(connect_handler))
        .route("/.well-known/did.json", get(did_document_handler))
        .route("/health", get(health_handler))
        .route(
            "/xrpc/com.atproto.identity.resolveHandle",
            get(resolve_handle_handler),
        )
        .route("/xrpc/:method", any(xrpc_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let router = HuddleRouter::start();
    let state = Arc::new(AppState::new(config.clone(), router.handle()));
    let reaper = state.tokens.spawn_reaper(state.tokens.ttl());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Huddle server listening on {}", addr);
    info!("Service DID: {}", config.service.did);
    info!("Upgrade endpoint: ws://{}/connect/as/<did>", addr);

    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    router.shutdown().await?;
    info!("Huddle server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let stats = state
        .router
        .stats()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "documents": stats.document_count,
        "interests": stats.total_interests,
        "tokens": state.tokens.len(),
    })))
}

/// Service DID document.
async fn did_document_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<Value> {
    let service = &state.config.service;
    let endpoint = service
        .public_url
        .clone()
        .or_else(|| request_origin(&headers))
        .unwrap_or_else(|| "/".to_string());

    Json(json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": service.did,
        "service": [{
            "id": service.service_fragment,
            "type": service.service_type,
            "serviceEndpoint": endpoint,
        }],
    }))
}

#[derive(Debug, Deserialize)]
struct ResolveHandleParams {
    handle: Option<String>,
}

/// Public handle resolution.
async fn resolve_handle_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ResolveHandleParams>,
) -> Result<Json<Value>, ApiError> {
    let handle = params
        .handle
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ApiError::BadRequest("handle query parameter required".into()))?;

    match state.handles.resolve(&handle).await {
        Ok(Some(did)) => Ok(Json(json!({ "did": did }))),
        Ok(None) => Err(ApiError::NotFound(format!(
            "Could not resolve handle to DID: {handle}"
        ))),
        Err(e) => {
            warn!(handle = %handle, error = %e, "Handle resolution failed");
            Err(ApiError::NotFound(format!(
                "Could not resolve handle to DID: {handle}"
            )))
        }
    }
}

/// Authenticated XRPC methods.
async fn xrpc_handler(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    caller: AuthedCaller,
) -> Result<Json<Value>, ApiError> {
    if method != state.config.auth.token_method {
        return Err(ApiError::NotFound(format!("Method not implemented: {method}")));
    }

    let token = state.tokens.issue(caller.did.as_str());
    metrics::record_token_issued();
    info!(identity = %caller.did, "Issued router token");

    Ok(Json(json!({ "token": token })))
}

async fn not_found_handler() -> ApiError {
    ApiError::NotFound("Not found".into())
}

/// WebSocket upgrade handler.
///
/// The caller must present a token minted for `identity` in the
/// `Sec-WebSocket-Protocol: authorization, <token>` header.
async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<Identity>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiError> {
    let Some(ws) = ws else {
        metrics::record_rejected_upgrade("not_websocket");
        return Err(ApiError::BadRequest(
            "Must set `upgrade` header to `websocket`.".into(),
        ));
    };

    if let Err(e) = state.tokens.validate(upgrade_token(&headers), &identity) {
        debug!(identity = %identity, error = %e, "Upgrade rejected");
        metrics::record_rejected_upgrade(match e {
            TokenError::Missing => "missing_token",
            TokenError::Invalid | TokenError::IdentityMismatch(_) => "invalid_token",
        });
        return Err(e.into());
    }

    let connection_id = ConnectionId::generate();
    let max_message_size = state.config.limits.max_message_size;

    Ok(ws
        .protocols([AUTH_PROTOCOL])
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, identity, connection_id))
        .into_response())
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    connection_id: ConnectionId,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (outbox, mut inbox) = mpsc::unbounded_channel::<Bytes>();
    if let Err(e) = state
        .router
        .register(identity.clone(), connection_id.clone(), outbox)
        .await
    {
        error!(connection = %connection_id, error = %e, "Failed to register connection");
        return;
    }

    info!(identity = %identity, connection = %connection_id, "Peer connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            // Frames queued by the router
            queued = inbox.recv() => {
                let Some(data) = queued else {
                    debug!(connection = %connection_id, "Router closed outbox");
                    break;
                };
                metrics::record_frame(data.len(), Direction::Outbound);
                if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let result = match msg {
                    Some(Ok(Message::Binary(data))) => {
                        handle_frame(&state, &connection_id, Bytes::from(data))
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        handle_frame(&state, &connection_id, Bytes::from(text))
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => Ok(()),
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };

                if let Err(e) = result {
                    error!(connection = %connection_id, error = %e, "Router unavailable");
                    break;
                }
            }
        }
    }

    if let Err(e) = state.router.disconnect(&connection_id) {
        debug!(connection = %connection_id, error = %e, "Disconnect after router stopped");
    }

    info!(identity = %identity, connection = %connection_id, "Peer disconnected");
}

/// Decode one inbound frame and hand it to the router.
///
/// Frames that do not decode are logged and discarded; the session stays open.
fn handle_frame(
    state: &AppState,
    connection_id: &ConnectionId,
    data: Bytes,
) -> Result<(), RouterError> {
    let start = Instant::now();
    metrics::record_frame(data.len(), Direction::Inbound);

    let frame = match codec::decode_peer(data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Discarding malformed frame");
            metrics::record_decode_error();
            return Ok(());
        }
    };

    match frame.header {
        PeerHeader::Listen { documents } => {
            trace!(connection = %connection_id, documents = documents.len(), "Listen");
            state.router.listen(connection_id, documents)?;
        }
        PeerHeader::Send {
            identity,
            connection_id: target,
            document,
        } => {
            trace!(connection = %connection_id, target = %target, "Send");
            state
                .router
                .send(connection_id, identity, target, document, frame.body)?;
        }
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    Ok(())
}

/// Token from `Sec-WebSocket-Protocol: authorization, <token>`.
fn upgrade_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SEC_WEBSOCKET_PROTOCOL)?
        .to_str()
        .ok()?
        .split_once("authorization,")
        .and_then(|(_, rest)| rest.split(',').next())
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// `scheme://host/` of the request, from `Host` and `X-Forwarded-Proto`.
fn request_origin(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(HOST)?.to_str().ok()?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    Some(format!("{scheme}://{host}/"))
}
