//! WebSocket client for the Huddle router.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, Stream, StreamExt};
use huddle_protocol::{codec, DocumentId, Frame, Identity, PeerHeader, ProtocolError, RouterHeader};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

/// XRPC method that mints upgrade tokens.
pub const DEFAULT_TOKEN_METHOD: &str = "chat.roomy.v0.router.token";

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The WebSocket connection failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The router refused the upgrade.
    #[error("Upgrade rejected with status {0}")]
    Rejected(u16),

    /// The token cannot be sent in a header.
    #[error("Token is not a valid header value: {0}")]
    InvalidToken(#[from] InvalidHeaderValue),

    /// A frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The HTTP token request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The connection is closed.
    #[error("Connection closed")]
    Closed,
}

/// Another connection listening to a shared document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    /// Identity behind the connection.
    pub identity: Identity,
    /// Router-assigned connection id.
    pub connection_id: String,
}

/// Something the router told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A peer started listening to a document we listen to.
    Join {
        identity: Identity,
        connection_id: String,
        document: DocumentId,
    },
    /// A peer stopped listening to a document we listen to.
    Leave {
        identity: Identity,
        connection_id: String,
        document: DocumentId,
    },
    /// A peer sent us a payload.
    Data {
        identity: Identity,
        connection_id: String,
        document: DocumentId,
        body: Bytes,
    },
}

type Membership = DashMap<DocumentId, Vec<Member>>;

/// A connection to the router.
///
/// Events arrive on the receiver returned by [`RouterClient::connect`]. The
/// client tracks, per document, which peers are currently listening.
pub struct RouterClient {
    outgoing: mpsc::UnboundedSender<Message>,
    interests: BTreeSet<DocumentId>,
    members: Arc<Membership>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RouterClient {
    /// Open a connection to `url` (a `/connect/as/{did}` URL) with an upgrade token.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the router rejects the token
    /// or the WebSocket handshake fails.
    pub async fn connect(
        url: &str,
        token: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RouterEvent>), ClientError> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&format!("authorization, {token}"))?,
        );

        let (ws, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(WsError::Http(response)) => {
                return Err(ClientError::Rejected(response.status().as_u16()))
            }
            Err(e) => return Err(e.into()),
        };
        debug!(url = %url, "Connected to router");

        let (mut sink, stream) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events) = mpsc::unbounded_channel();
        let members = Arc::new(Membership::new());

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "Router connection write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&members), events_tx));

        Ok((
            Self {
                outgoing,
                interests: BTreeSet::new(),
                members,
                reader,
                writer,
            },
            events,
        ))
    }

    /// Start listening to `documents` in addition to the current set.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn add_interests<I, S>(&mut self, documents: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<DocumentId>,
    {
        self.interests.extend(documents.into_iter().map(Into::into));
        self.send_listen()
    }

    /// Stop listening to `documents`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn remove_interests<I, S>(&mut self, documents: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<DocumentId>,
    {
        for document in documents {
            let document = document.into();
            self.interests.remove(&document);
            self.members.remove(&document);
        }
        self.send_listen()
    }

    /// Listen to exactly `documents`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn listen<I, S>(&mut self, documents: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<DocumentId>,
    {
        self.interests = documents.into_iter().map(Into::into).collect();
        self.members
            .retain(|document, _| self.interests.contains(document));
        self.send_listen()
    }

    /// Send `body` to one peer connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn send(
        &self,
        identity: &str,
        connection_id: &str,
        document: &str,
        body: &[u8],
    ) -> Result<(), ClientError> {
        let header = PeerHeader::send(identity, connection_id, document);
        self.send_frame(&header, body)
    }

    /// Documents currently listened to.
    pub fn interests(&self) -> impl Iterator<Item = &DocumentId> {
        self.interests.iter()
    }

    /// Peers currently listening to `document`.
    #[must_use]
    pub fn members(&self, document: &str) -> Vec<Member> {
        self.members
            .get(document)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every known document's members.
    #[must_use]
    pub fn membership(&self) -> HashMap<DocumentId, Vec<Member>> {
        self.members
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Close the connection.
    pub async fn close(mut self) {
        if self.outgoing.send(Message::Close(None)).is_ok() {
            let _ = (&mut self.writer).await;
        }
    }

    fn send_listen(&self) -> Result<(), ClientError> {
        let header = PeerHeader::listen(self.interests.iter().cloned());
        self.send_frame(&header, &[])
    }

    fn send_frame(&self, header: &PeerHeader, body: &[u8]) -> Result<(), ClientError> {
        let data = codec::encode(header, body)?;
        self.outgoing
            .send(Message::Binary(data.to_vec()))
            .map_err(|_| ClientError::Closed)
    }
}

impl Drop for RouterClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop<S>(
    mut stream: S,
    members: Arc<Membership>,
    events: mpsc::UnboundedSender<RouterEvent>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => Bytes::from(data),
            Ok(Message::Text(text)) => Bytes::from(text),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "Router connection read failed");
                break;
            }
        };

        match codec::decode_router(data) {
            Ok(frame) => {
                let event = apply(&members, frame);
                trace!(?event, "Router event");
                // Membership stays current even when nobody reads events.
                let _ = events.send(event);
            }
            Err(e) => warn!(error = %e, "Error parsing router message"),
        }
    }
    debug!("Router connection closed");
}

/// Update membership for one router frame and turn it into an event.
fn apply(members: &Membership, frame: Frame<RouterHeader>) -> RouterEvent {
    match frame.header {
        RouterHeader::Join {
            identity,
            connection_id,
            document,
        } => {
            let member = Member {
                identity: identity.clone(),
                connection_id: connection_id.clone(),
            };
            let mut entry = members.entry(document.clone()).or_default();
            if !entry.contains(&member) {
                entry.push(member);
            }
            RouterEvent::Join {
                identity,
                connection_id,
                document,
            }
        }
        RouterHeader::Leave {
            identity,
            connection_id,
            document,
        } => {
            if let Some(mut entry) = members.get_mut(&document) {
                entry.retain(|m| m.identity != identity || m.connection_id != connection_id);
            }
            RouterEvent::Leave {
                identity,
                connection_id,
                document,
            }
        }
        RouterHeader::Send {
            identity,
            connection_id,
            document,
        } => RouterEvent::Data {
            identity,
            connection_id,
            document,
            body: frame.body,
        },
    }
}

/// WebSocket URL for connecting to the router at `base_url` as `identity`.
///
/// `http` and `https` base URLs are mapped to `ws` and `wss`.
#[must_use]
pub fn connect_url(base_url: &str, identity: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/connect/as/{identity}")
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Exchange a bearer JWT for an upgrade token.
///
/// # Errors
///
/// Returns an error if the request fails or the router refuses the bearer.
pub async fn request_token(base_url: &str, bearer: &str) -> Result<String, ClientError> {
    let url = format!(
        "{}/xrpc/{DEFAULT_TOKEN_METHOD}",
        base_url.trim_end_matches('/')
    );
    let response = reqwest::Client::new()
        .get(url)
        .bearer_auth(bearer)
        .send()
        .await?
        .error_for_status()?;

    Ok(response.json::<TokenResponse>().await?.token)
}
