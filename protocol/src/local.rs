//! In-process transport for tests.
//!
//! A [`LocalNetwork`] is a registry of listening addresses backed by
//! channels. Each server (or client) derives a [`LocalTransport`] bound to
//! its own address; connections are pairs of channel-backed halves sharing
//! one connection id. The network can partition address pairs: requests
//! crossing a partition fail with `ConnectionLost`, in both directions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::message::{Request, Response};
use crate::transport::{Connection, ConnectionId, Duplex, Inbound, Transport};

const INBOUND_BUFFER: usize = 256;

#[derive(Default)]
struct NetworkInner {
    listeners: HashMap<String, mpsc::Sender<Duplex>>,
    partitions: HashSet<(String, String)>,
    next_connection_id: ConnectionId,
}

/// Shared registry of in-process endpoints.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport bound to `address`. The address identifies this endpoint
    /// for partitioning; servers use their member address, clients any
    /// unique name.
    pub fn transport(&self, address: impl Into<String>) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            local: address.into(),
        }
    }

    /// Cuts traffic between `a` and `b`, both directions.
    pub fn partition(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.partitions.insert(ordered(a, b));
    }

    /// Restores traffic between `a` and `b`.
    pub fn heal(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.partitions.remove(&ordered(a, b));
    }

    pub fn heal_all(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.partitions.clear();
    }

    fn blocked(&self, a: &str, b: &str) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.partitions.contains(&ordered(a, b))
    }

    fn allocate_connection_id(&self) -> ConnectionId {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.next_connection_id += 1;
        inner.next_connection_id
    }
}

fn ordered(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub struct LocalTransport {
    network: LocalNetwork,
    local: String,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, address: &str) -> Result<Duplex> {
        let accept_tx = {
            let inner = self.network.inner.lock().expect("lock poisoned");
            inner
                .listeners
                .get(address)
                .cloned()
                .ok_or_else(|| Error::ConnectionLost(format!("no listener at {}", address)))?
        };

        let id = self.network.allocate_connection_id();
        let (to_remote_tx, to_remote_rx) = mpsc::channel(INBOUND_BUFFER);
        let (to_local_tx, to_local_rx) = mpsc::channel(INBOUND_BUFFER);

        let dialer_half = Arc::new(LocalConnection {
            id,
            network: self.network.clone(),
            from: self.local.clone(),
            to: address.to_string(),
            peer: to_remote_tx,
        });
        let listener_half = Arc::new(LocalConnection {
            id,
            network: self.network.clone(),
            from: address.to_string(),
            to: self.local.clone(),
            peer: to_local_tx,
        });

        accept_tx
            .send(Duplex {
                connection: listener_half,
                inbound: to_remote_rx,
            })
            .await
            .map_err(|_| Error::ConnectionLost(format!("listener at {} closed", address)))?;

        Ok(Duplex {
            connection: dialer_half,
            inbound: to_local_rx,
        })
    }

    async fn listen(&self, address: &str) -> Result<mpsc::Receiver<Duplex>> {
        let (accept_tx, accept_rx) = mpsc::channel(INBOUND_BUFFER);
        let mut inner = self.network.inner.lock().expect("lock poisoned");
        if inner.listeners.contains_key(address) {
            return Err(Error::IllegalState(format!(
                "address {} already bound",
                address
            )));
        }
        inner.listeners.insert(address.to_string(), accept_tx);
        Ok(accept_rx)
    }
}

struct LocalConnection {
    id: ConnectionId,
    network: LocalNetwork,
    from: String,
    to: String,
    peer: mpsc::Sender<Inbound>,
}

#[async_trait]
impl Connection for LocalConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, request: Request) -> Result<Response> {
        if self.network.blocked(&self.from, &self.to) {
            return Err(Error::ConnectionLost(format!(
                "{} -> {} partitioned",
                self.from, self.to
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.peer
            .send(Inbound {
                connection: self.id,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ConnectionLost(format!("{} disconnected", self.to)))?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost(format!(
                "{} dropped the request",
                self.to
            ))),
        }
    }
}
