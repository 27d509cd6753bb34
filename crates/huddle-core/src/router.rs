//! Presence and message router for Huddle.
//!
//! [`RouterState`] holds the interest index and connection registry and
//! implements `listen`, `send` and teardown. [`Router`] runs a state inside a
//! single task and serializes every mutation through a command channel.

use crate::connection::{Connection, ConnectionId, Outbox};
use crate::interest::InterestIndex;
use crate::registry::ConnectionRegistry;
use bytes::Bytes;
use huddle_protocol::{DocumentId, Identity, RouterHeader};
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The router task has stopped.
    #[error("Router is not running")]
    Closed,

    /// A connection with this id is already registered.
    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    /// The router task failed.
    #[error("Router task failed: {0}")]
    Task(String),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Whether to drop index entries for documents nobody listens to.
    pub prune_empty_documents: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prune_empty_documents: true,
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Number of registered connections.
    pub connection_count: usize,
    /// Number of documents with at least one index entry.
    pub document_count: usize,
    /// Total number of `(document, connection)` interests.
    pub total_interests: usize,
}

/// Interest index and connection registry, kept mutually consistent.
///
/// A `(document, connection)` pair is in the index exactly when the
/// registered connection lists `document` among its interests.
#[derive(Debug, Default)]
pub struct RouterState {
    index: InterestIndex,
    registry: ConnectionRegistry,
    config: RouterConfig,
}

impl RouterState {
    /// Create an empty state.
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self {
            index: InterestIndex::new(),
            registry: ConnectionRegistry::new(),
            config,
        }
    }

    /// Register a connection with no interests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection id is already registered.
    pub fn register(
        &mut self,
        identity: impl Into<Identity>,
        connection_id: ConnectionId,
        outbox: Outbox,
    ) -> Result<(), RouterError> {
        let connection = Connection::new(identity, connection_id.clone(), outbox);
        if !self.registry.insert(connection) {
            return Err(RouterError::DuplicateConnection(connection_id));
        }
        Ok(())
    }

    /// Replace a connection's interest set.
    ///
    /// Peers sharing a removed document are told the connection left. For
    /// each added document, every peer already listening is told the
    /// connection joined and the connection is told about every such peer.
    /// Listening to the current set again is a no-op.
    pub fn listen<I>(&mut self, connection_id: &str, documents: I)
    where
        I: IntoIterator<Item = DocumentId>,
    {
        let new_interests: HashSet<DocumentId> = documents.into_iter().collect();

        let Some(conn) = self.registry.get(connection_id) else {
            debug!(connection = %connection_id, "Listen from unregistered connection");
            return;
        };

        let removed: Vec<DocumentId> = conn.interests.difference(&new_interests).cloned().collect();
        let added: Vec<DocumentId> = new_interests.difference(&conn.interests).cloned().collect();
        let identity = conn.identity.clone();
        let id = conn.id.clone();

        for document in &removed {
            self.index.remove(document, id.as_str());
            self.notify_leave(&identity, &id, document);
        }

        for document in &added {
            self.introduce(&identity, &id, document);
            self.index.insert(document, id.clone());
        }

        if !removed.is_empty() || !added.is_empty() {
            debug!(
                connection = %id,
                added = added.len(),
                removed = removed.len(),
                interests = new_interests.len(),
                "Interests updated"
            );
        }

        if let Some(conn) = self.registry.get_mut(id.as_str()) {
            conn.interests = new_interests;
        }
    }

    /// Route a payload from one connection to another.
    ///
    /// Returns `true` if the payload was queued for the target. Self-sends,
    /// unknown targets and identity mismatches are dropped silently.
    pub fn send(
        &self,
        from: &str,
        identity: &str,
        connection_id: &str,
        document: &str,
        body: &[u8],
    ) -> bool {
        let Some(sender) = self.registry.get(from) else {
            debug!(connection = %from, "Send from unregistered connection");
            return false;
        };

        if identity == sender.identity && connection_id == sender.id.as_str() {
            trace!(connection = %from, "Dropped self-send");
            return false;
        }

        let Some(target) = self.registry.get(connection_id) else {
            trace!(connection = %from, target = %connection_id, "Dropped send to unknown connection");
            return false;
        };

        if target.identity != identity {
            debug!(
                connection = %from,
                target = %connection_id,
                claimed = %identity,
                "Dropped send with mismatched identity"
            );
            return false;
        }

        let header = RouterHeader::send(sender.identity.as_str(), sender.id.as_str(), document);
        target.deliver(&header, body)
    }

    /// Remove a connection and tell every peer sharing its documents that it left.
    ///
    /// Returns `false` if the connection was not registered.
    pub fn disconnect(&mut self, connection_id: &str) -> bool {
        let Some(conn) = self.registry.remove(connection_id) else {
            return false;
        };

        for document in &conn.interests {
            self.index.remove(document, conn.id.as_str());
            self.notify_leave(&conn.identity, &conn.id, document);
        }

        debug!(
            connection = %conn.id,
            identity = %conn.identity,
            documents = conn.interests.len(),
            "Connection torn down"
        );
        true
    }

    /// Drop every connection and interest.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.index = InterestIndex::new();
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            connection_count: self.registry.len(),
            document_count: self.index.document_count(),
            total_interests: self.index.interest_count(),
        }
    }

    /// Read access to the interest index.
    #[must_use]
    pub fn index(&self) -> &InterestIndex {
        &self.index
    }

    /// Read access to the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Check that the index and the registered interest sets agree.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn verify_consistency(&self) -> Result<(), String> {
        for (document, id) in self.index.pairs() {
            match self.registry.get(id.as_str()) {
                Some(conn) if conn.is_interested(document) => {}
                Some(_) => return Err(format!("{id} indexed under {document} without interest")),
                None => return Err(format!("{id} indexed under {document} but not registered")),
            }
        }

        for conn in self.registry.iter() {
            for document in &conn.interests {
                if !self.index.contains(document, conn.id.as_str()) {
                    return Err(format!("{} interested in {document} but not indexed", conn.id));
                }
            }
        }

        Ok(())
    }

    /// Tell every connection still listening to `document` that `(identity, id)` left.
    fn notify_leave(&mut self, identity: &str, id: &ConnectionId, document: &str) {
        let leave = RouterHeader::leave(identity, id.as_str(), document);

        for other in self.index.interested(document) {
            match self.registry.get(other.as_str()) {
                Some(peer) => {
                    peer.deliver(&leave, &[]);
                }
                None => self.evict(document, &other),
            }
        }

        if self.config.prune_empty_documents {
            self.index.prune(document);
        }
    }

    /// Introduce `(identity, id)` and every connection listening to `document` to each other.
    fn introduce(&mut self, identity: &str, id: &ConnectionId, document: &str) {
        let join = RouterHeader::join(identity, id.as_str(), document);

        for other in self.index.interested(document) {
            if &other == id {
                continue;
            }
            match self.registry.get(other.as_str()) {
                Some(peer) => {
                    peer.deliver(&join, &[]);
                    if let Some(this) = self.registry.get(id.as_str()) {
                        let back = RouterHeader::join(peer.identity.as_str(), peer.id.as_str(), document);
                        this.deliver(&back, &[]);
                    }
                }
                None => self.evict(document, &other),
            }
        }
    }

    fn evict(&mut self, document: &str, stale: &ConnectionId) {
        self.index.remove(document, stale.as_str());
        debug!(document = %document, connection = %stale, "Evicted stale interest");
    }
}

/// Work items processed by the router task.
#[derive(Debug)]
enum Command {
    Register {
        identity: Identity,
        connection_id: ConnectionId,
        outbox: Outbox,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    Listen {
        connection_id: ConnectionId,
        documents: Vec<DocumentId>,
    },
    Send {
        from: ConnectionId,
        identity: Identity,
        connection_id: String,
        document: DocumentId,
        body: Bytes,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
    Shutdown,
}

/// Cloneable handle used to submit work to a running [`Router`].
///
/// Commands from one handle are processed in the order they were submitted.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RouterHandle {
    /// Register a connection and wait for the router to accept it.
    ///
    /// # Errors
    ///
    /// Returns an error if the router has stopped or the connection id is
    /// already registered.
    pub async fn register(
        &self,
        identity: impl Into<Identity>,
        connection_id: ConnectionId,
        outbox: Outbox,
    ) -> Result<(), RouterError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Register {
            identity: identity.into(),
            connection_id,
            outbox,
            reply,
        })?;
        rx.await.map_err(|_| RouterError::Closed)?
    }

    /// Replace a connection's interest set.
    ///
    /// # Errors
    ///
    /// Returns an error if the router has stopped.
    pub fn listen(
        &self,
        connection_id: &ConnectionId,
        documents: Vec<DocumentId>,
    ) -> Result<(), RouterError> {
        self.dispatch(Command::Listen {
            connection_id: connection_id.clone(),
            documents,
        })
    }

    /// Route a payload to `(identity, connection_id)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the router has stopped.
    pub fn send(
        &self,
        from: &ConnectionId,
        identity: impl Into<Identity>,
        connection_id: impl Into<String>,
        document: impl Into<DocumentId>,
        body: Bytes,
    ) -> Result<(), RouterError> {
        self.dispatch(Command::Send {
            from: from.clone(),
            identity: identity.into(),
            connection_id: connection_id.into(),
            document: document.into(),
            body,
        })
    }

    /// Tear down a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the router has stopped.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Result<(), RouterError> {
        self.dispatch(Command::Disconnect {
            connection_id: connection_id.clone(),
        })
    }

    /// Fetch router statistics.
    ///
    /// The reply reflects every command submitted through this handle before
    /// the call.
    ///
    /// # Errors
    ///
    /// Returns an error if the router has stopped.
    pub async fn stats(&self) -> Result<RouterStats, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Stats { reply })?;
        rx.await.map_err(|_| RouterError::Closed)
    }

    /// Ask the router task to stop.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Check if the router task is still accepting commands.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn dispatch(&self, command: Command) -> Result<(), RouterError> {
        self.commands.send(command).map_err(|_| RouterError::Closed)
    }
}

/// The routing task.
///
/// Owns a [`RouterState`] and applies commands one at a time, so a `listen`
/// diff and the notifications it produces form one atomic step.
pub struct Router {
    handle: RouterHandle,
    task: JoinHandle<()>,
}

impl Router {
    /// Start a router with default configuration.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn start() -> Self {
        Self::start_with_config(RouterConfig::default())
    }

    /// Start a router with custom configuration.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn start_with_config(config: RouterConfig) -> Self {
        info!("Starting router with config: {:?}", config);
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(RouterState::new(config), rx));

        Self {
            handle: RouterHandle { commands },
            task,
        }
    }

    /// Get a handle for submitting commands.
    #[must_use]
    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Stop the router and wait for its task to finish.
    ///
    /// Every registered connection's outbox is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the router task panicked.
    pub async fn shutdown(self) -> Result<(), RouterError> {
        self.handle.shutdown();
        self.task
            .await
            .map_err(|e| RouterError::Task(e.to_string()))
    }
}

async fn run(mut state: RouterState, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Register {
                identity,
                connection_id,
                outbox,
                reply,
            } => {
                let result = state.register(identity, connection_id, outbox);
                if let Err(e) = &result {
                    warn!(error = %e, "Register rejected");
                }
                let _ = reply.send(result);
            }
            Command::Listen {
                connection_id,
                documents,
            } => state.listen(connection_id.as_str(), documents),
            Command::Send {
                from,
                identity,
                connection_id,
                document,
                body,
            } => {
                state.send(from.as_str(), &identity, &connection_id, &document, &body);
            }
            Command::Disconnect { connection_id } => {
                state.disconnect(connection_id.as_str());
            }
            Command::Stats { reply } => {
                let _ = reply.send(state.stats());
            }
            Command::Shutdown => break,
        }
    }

    let stats = state.stats();
    state.clear();
    info!(connections = stats.connection_count, "Router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::codec;

    struct Peer {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    impl Peer {
        fn events(&mut self) -> Vec<(RouterHeader, Bytes)> {
            let mut events = Vec::new();
            while let Ok(data) = self.rx.try_recv() {
                let frame = codec::decode_router(data).unwrap();
                events.push((frame.header, frame.body));
            }
            events
        }
    }

    fn connect(state: &mut RouterState, identity: &str, id: &str) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new(id);
        state.register(identity, id.clone(), tx).unwrap();
        Peer { id, rx }
    }

    fn docs(names: &[&str]) -> Vec<DocumentId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_duplicate() {
        let mut state = RouterState::default();
        let _a = connect(&mut state, "did:a", "c1");

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            state.register("did:b", ConnectionId::new("c1"), tx),
            Err(RouterError::DuplicateConnection(_))
        ));
        assert_eq!(state.registry().get("c1").unwrap().identity, "did:a");
    }

    #[test]
    fn test_listen_introduces_both_sides() {
        let mut state = RouterState::default();
        let mut a = connect(&mut state, "did:a", "c1");
        let mut b = connect(&mut state, "did:b", "c2");

        state.listen(a.id.as_str(), docs(&["doc"]));
        assert!(a.events().is_empty());

        state.listen(b.id.as_str(), docs(&["doc"]));
        let a_events = a.events();
        let b_events = b.events();
        assert_eq!(a_events.len(), 1);
        assert_eq!(a_events[0].0, RouterHeader::join("did:b", "c2", "doc"));
        assert_eq!(b_events.len(), 1);
        assert_eq!(b_events[0].0, RouterHeader::join("did:a", "c1", "doc"));

        state.verify_consistency().unwrap();
    }

    #[test]
    fn test_listen_unregistered_is_ignored() {
        let mut state = RouterState::default();
        state.listen("ghost", docs(&["doc"]));

        assert!(state.index().is_empty());
    }

    #[test]
    fn test_stale_index_entry_is_evicted_on_join() {
        let mut state = RouterState::default();
        let mut a = connect(&mut state, "did:a", "c1");
        state.index.insert("doc", ConnectionId::new("ghost"));

        state.listen(a.id.as_str(), docs(&["doc"]));

        assert!(a.events().is_empty());
        assert!(!state.index().contains("doc", "ghost"));
        state.verify_consistency().unwrap();
    }

    #[test]
    fn test_stale_index_entry_is_evicted_on_leave() {
        let mut state = RouterState::default();
        let a = connect(&mut state, "did:a", "c1");
        let mut b = connect(&mut state, "did:b", "c2");
        state.listen(a.id.as_str(), docs(&["doc"]));
        state.listen(b.id.as_str(), docs(&["doc"]));
        b.events();
        state.index.insert("doc", ConnectionId::new("ghost"));

        assert!(state.disconnect(a.id.as_str()));

        assert_eq!(b.events().len(), 1);
        assert!(!state.index().contains("doc", "ghost"));
        state.verify_consistency().unwrap();
    }

    #[test]
    fn test_empty_documents_are_pruned() {
        let mut state = RouterState::default();
        let a = connect(&mut state, "did:a", "c1");

        state.listen(a.id.as_str(), docs(&["x", "y"]));
        assert_eq!(state.stats().document_count, 2);

        state.listen(a.id.as_str(), docs(&[]));
        assert_eq!(state.stats().document_count, 0);
    }

    #[test]
    fn test_pruning_disabled_keeps_entries() {
        let mut state = RouterState::new(RouterConfig {
            prune_empty_documents: false,
        });
        let a = connect(&mut state, "did:a", "c1");

        state.listen(a.id.as_str(), docs(&["x"]));
        state.listen(a.id.as_str(), docs(&[]));

        assert_eq!(state.stats().document_count, 1);
        assert_eq!(state.stats().total_interests, 0);
        state.verify_consistency().unwrap();
    }

    #[test]
    fn test_send_identity_mismatch_dropped() {
        let mut state = RouterState::default();
        let a = connect(&mut state, "did:a", "c1");
        let mut b = connect(&mut state, "did:b", "c2");

        assert!(!state.send(a.id.as_str(), "did:someone-else", "c2", "doc", b"x"));
        assert!(b.events().is_empty());
    }

    #[test]
    fn test_disconnect_unknown() {
        let mut state = RouterState::default();
        assert!(!state.disconnect("nobody"));
    }

    #[test]
    fn test_stats() {
        let mut state = RouterState::default();
        let a = connect(&mut state, "did:a", "c1");
        let b = connect(&mut state, "did:b", "c2");

        state.listen(a.id.as_str(), docs(&["x", "y"]));
        state.listen(b.id.as_str(), docs(&["x"]));

        assert_eq!(
            state.stats(),
            RouterStats {
                connection_count: 2,
                document_count: 2,
                total_interests: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_router_task_routes_commands() {
        let router = Router::start();
        let handle = router.handle();

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = ConnectionId::new("c1");
        let b = ConnectionId::new("c2");

        handle.register("did:a", a.clone(), a_tx).await.unwrap();
        handle.register("did:b", b.clone(), b_tx).await.unwrap();
        handle.listen(&a, docs(&["doc"])).unwrap();
        handle.listen(&b, docs(&["doc"])).unwrap();
        handle
            .send(&a, "did:b", "c2", "doc", Bytes::from_static(&[1, 2, 3]))
            .unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_interests, 2);

        let join = codec::decode_router(a_rx.recv().await.unwrap()).unwrap();
        assert_eq!(join.header, RouterHeader::join("did:b", "c2", "doc"));

        let join = codec::decode_router(b_rx.recv().await.unwrap()).unwrap();
        assert_eq!(join.header, RouterHeader::join("did:a", "c1", "doc"));
        let data = codec::decode_router(b_rx.recv().await.unwrap()).unwrap();
        assert_eq!(data.header, RouterHeader::send("did:a", "c1", "doc"));
        assert_eq!(&data.body[..], &[1, 2, 3]);

        handle.disconnect(&b).unwrap();
        let leave = codec::decode_router(a_rx.recv().await.unwrap()).unwrap();
        assert_eq!(leave.header, RouterHeader::leave("did:b", "c2", "doc"));

        router.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_outboxes() {
        let router = Router::start();
        let handle = router.handle();

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.register("did:a", ConnectionId::new("c1"), tx).await.unwrap();
        handle.stats().await.unwrap();

        router.shutdown().await.unwrap();

        assert!(rx.recv().await.is_none());
        assert!(!handle.is_running());
        assert!(matches!(handle.stats().await, Err(RouterError::Closed)));
    }

    #[tokio::test]
    async fn test_duplicate_register_is_reported() {
        let router = Router::start();
        let handle = router.handle();
        let id = ConnectionId::new("c1");

        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, _second_rx) = mpsc::unbounded_channel();
        handle.register("did:a", id.clone(), first_tx).await.unwrap();

        let result = handle.register("did:b", id.clone(), second_tx).await;
        assert!(matches!(result, Err(RouterError::DuplicateConnection(dup)) if dup == id));

        // The original registration is untouched.
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connection_count, 1);
        assert!(first_rx.try_recv().is_err());

        router.shutdown().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            handle.register("did:a", ConnectionId::new("c2"), tx).await,
            Err(RouterError::Closed)
        ));
    }
}
