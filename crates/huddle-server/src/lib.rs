//! # huddle-server
//!
//! HTTP and WebSocket front end for the Huddle router.
//!
//! ## Routes
//!
//! - `GET /connect/as/{did}` - WebSocket upgrade, token in `Sec-WebSocket-Protocol`
//! - `GET /.well-known/did.json` - Service DID document
//! - `GET /health` - Liveness and router statistics
//! - `GET /xrpc/com.atproto.identity.resolveHandle` - Public handle lookup
//! - `GET /xrpc/{method}` - Bearer-authenticated methods, including token issuance

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;

pub use config::Config;
pub use error::ApiError;
pub use handlers::{build_app, run_server, AppState};
