//! # huddle-core
//!
//! Core state and routing for the Huddle presence router.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Connection** - A live peer: identity, connection id, outbox and interests
//! - **InterestIndex** - Document id to interested connection ids
//! - **ConnectionRegistry** - Connection id to connection
//! - **Router** - The single task that owns the index and registry
//! - **TokenStore** - Short-lived upgrade tokens
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  Command   ┌─────────────────────────────┐
//! │ Connection  │───────────▶│        Router task          │
//! │    task     │            │  ┌───────────────────────┐  │
//! └─────────────┘            │  │    InterestIndex      │  │
//!        ▲                   │  ├───────────────────────┤  │
//!        │  encoded frames   │  │  ConnectionRegistry   │  │
//!        └───────────────────│  └───────────────────────┘  │
//!                            └─────────────────────────────┘
//! ```
//!
//! All index and registry mutations run inside the router task, one command
//! at a time, so a `listen` diff and its join/leave notifications are never
//! interleaved with another connection's work.

pub mod connection;
pub mod interest;
pub mod registry;
pub mod router;
pub mod token;

pub use connection::{Connection, ConnectionId, Outbox};
pub use interest::InterestIndex;
pub use registry::ConnectionRegistry;
pub use router::{Router, RouterConfig, RouterError, RouterHandle, RouterState, RouterStats};
pub use token::{TokenError, TokenStore, DEFAULT_TOKEN_TTL};
