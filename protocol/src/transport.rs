//! Transport interface the core depends on.
//!
//! A transport provides connection-oriented request/response in both
//! directions: either end of an established connection may send requests
//! (servers push [`PublishRequest`](crate::PublishRequest)s to clients over
//! the connection the client dialed). Incoming requests arrive on an
//! [`Inbound`] stream carrying a oneshot reply sender, so the owner of the
//! endpoint answers from its own execution context.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::message::{Request, Response};

/// Transport-assigned identifier, shared by both halves of a connection.
pub type ConnectionId = u64;

/// Completion for one inbound request.
pub type ReplySender = oneshot::Sender<Result<Response>>;

/// A request delivered to the owner of a connection endpoint.
pub struct Inbound {
    pub connection: ConnectionId,
    pub request: Request,
    pub reply: ReplySender,
}

/// The sending half of an established connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Sends a request to the peer and awaits its response.
    async fn send(&self, request: Request) -> Result<Response>;
}

/// An established connection: a handle for outbound requests plus the
/// stream of requests the peer initiates.
pub struct Duplex {
    pub connection: Arc<dyn Connection>,
    pub inbound: mpsc::Receiver<Inbound>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Dials a listening endpoint.
    async fn connect(&self, address: &str) -> Result<Duplex>;

    /// Binds `address` and returns the stream of accepted connections.
    async fn listen(&self, address: &str) -> Result<mpsc::Receiver<Duplex>>;
}
