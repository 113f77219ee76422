//! Outbound connection pool.
//!
//! Server-to-server requests (replication, votes, forwarded client
//! operations) go through one cached connection per peer address. A lost
//! connection is redialed once with a short backoff before the error
//! surfaces; role logic handles longer-term retry on its own cadence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Connection, Request, Response, Result, Transport};
use tokio::sync::Mutex;

const REDIAL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub(crate) struct ConnectionManager {
    transport: Arc<dyn Transport>,
    connections: Arc<Mutex<HashMap<String, Arc<dyn Connection>>>>,
}

impl ConnectionManager {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sends a request to `address`, reusing the cached connection and
    /// redialing once on transient failure.
    pub(crate) async fn send_to(&self, address: &str, request: Request) -> Result<Response> {
        let mut redialed = false;
        loop {
            let connection = self.connection(address).await?;
            match connection.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && !redialed => {
                    self.invalidate(address).await;
                    tokio::time::sleep(REDIAL_BACKOFF).await;
                    redialed = true;
                }
                Err(e) => {
                    self.invalidate(address).await;
                    return Err(e);
                }
            }
        }
    }

    async fn connection(&self, address: &str) -> Result<Arc<dyn Connection>> {
        {
            let connections = self.connections.lock().await;
            if let Some(connection) = connections.get(address) {
                return Ok(connection.clone());
            }
        }
        let duplex = self.transport.connect(address).await?;
        // Peers never push requests over connections we dialed; the inbound
        // half is dropped. (Clients, which do receive pushes, hold their own
        // duplex.)
        let connection = duplex.connection;
        let mut connections = self.connections.lock().await;
        Ok(connections
            .entry(address.to_string())
            .or_insert(connection)
            .clone())
    }

    async fn invalidate(&self, address: &str) {
        self.connections.lock().await.remove(address);
    }
}
