//! # huddle-client
//!
//! Client for the Huddle presence router.
//!
//! ```no_run
//! use huddle_client::{connect_url, RouterClient, RouterEvent};
//!
//! # async fn run() -> Result<(), huddle_client::ClientError> {
//! let url = connect_url("http://127.0.0.1:8080", "did:plc:alice");
//! let (mut client, mut events) = RouterClient::connect(&url, "upgrade-token").await?;
//!
//! client.add_interests(["doc-a"])?;
//! while let Some(event) = events.recv().await {
//!     if let RouterEvent::Join { identity, connection_id, .. } = event {
//!         client.send(&identity, &connection_id, "doc-a", b"hello")?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::{
    connect_url, request_token, ClientError, Member, RouterClient, RouterEvent,
    DEFAULT_TOKEN_METHOD,
};
