use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{Member, MemberId};
use protocol::{
    CommandRequest, Connection, Consistency, Error, Inbound, KeepAliveRequest, PublishResponse,
    QueryRequest, RegisterRequest, Request, Response, Result, Transport,
};
use storage::SessionId;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Addresses of cluster members to probe for registration and
    /// rerouting.
    pub members: Vec<String>,
    /// Requested session timeout; keep-alives run at half this interval.
    pub session_timeout: Duration,
    /// How many times an operation is rerouted before a transient error
    /// surfaces to the caller.
    pub retry_attempts: usize,
    /// Pause between rerouting attempts.
    pub retry_backoff: Duration,
    /// Per-request deadline. A server that stops answering (a deposed
    /// leader, a partition) is treated as a transient failure and the
    /// request is rerouted.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            session_timeout: Duration::from_secs(5),
            retry_attempts: 8,
            retry_backoff: Duration::from_millis(25),
            request_timeout: Duration::from_secs(5),
        }
    }
}

struct ClientState {
    connection: Option<Arc<dyn Connection>>,
    leader: Option<MemberId>,
    members: Vec<Member>,
    probe_cursor: usize,
    pump: Option<JoinHandle<()>>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    session: SessionId,
    state: Mutex<ClientState>,
    next_sequence: AtomicU64,
    /// Highest command sequence whose response has been received; sent as
    /// the keep-alive ack so the cluster can drop cached responses.
    acked_sequence: AtomicU64,
    /// Highest event sequence delivered in order.
    event_sequence: AtomicU64,
    events_tx: mpsc::UnboundedSender<Bytes>,
    stop: CancellationToken,
}

/// A registered client session.
pub struct RaftClient {
    inner: Arc<ClientInner>,
    events_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    keep_alive: Option<JoinHandle<()>>,
}

impl RaftClient {
    /// Registers a session, probing the configured members until one
    /// accepts (any member forwards to the leader).
    pub async fn connect(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<RaftClient> {
        if config.members.is_empty() {
            return Err(Error::IllegalArgument("no members configured".into()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let mut last_error = Error::NoLeader;
        for attempt in 0..config.retry_attempts.max(1) {
            let address = &config.members[attempt % config.members.len()];
            let duplex = match transport.connect(address).await {
                Ok(duplex) => duplex,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };
            let request = Request::Register(RegisterRequest {
                connection: duplex.connection.id(),
                timeout_millis: config.session_timeout.as_millis() as u64,
            });
            let registered =
                tokio::time::timeout(config.request_timeout, duplex.connection.send(request))
                    .await
                    .unwrap_or(Err(Error::Timeout));
            match registered {
                Ok(Response::Register(registered)) => {
                    tracing::debug!(
                        "registered session {} via {}",
                        registered.session,
                        address
                    );
                    let inner = Arc::new(ClientInner {
                        transport,
                        session: registered.session,
                        state: Mutex::new(ClientState {
                            connection: Some(duplex.connection.clone()),
                            leader: registered.leader,
                            members: registered.members,
                            probe_cursor: 0,
                            pump: None,
                        }),
                        next_sequence: AtomicU64::new(0),
                        acked_sequence: AtomicU64::new(0),
                        event_sequence: AtomicU64::new(0),
                        events_tx: events_tx.clone(),
                        stop: stop.clone(),
                        config,
                    });
                    let pump = tokio::spawn(pump_inbound(inner.clone(), duplex.inbound));
                    inner.state.lock().await.pump = Some(pump);
                    let keep_alive = tokio::spawn(keep_alive_loop(inner.clone()));
                    return Ok(RaftClient {
                        inner,
                        events_rx: Some(events_rx),
                        keep_alive: Some(keep_alive),
                    });
                }
                Ok(_) => {
                    last_error = Error::Internal("unexpected register response".into());
                }
                Err(e) if e.is_transient() => {
                    last_error = e;
                    tokio::time::sleep(config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    /// Submits a mutating command. The sequence number is assigned here and
    /// reused across retries, so a command applies at most once even when
    /// it is resent to a new leader.
    pub async fn submit(&self, operation: Bytes) -> Result<Bytes> {
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let request = Request::Command(CommandRequest {
            session: self.inner.session,
            sequence,
            operation,
        });
        let response = self.inner.request(request).await?.into_command()?;
        self.inner
            .acked_sequence
            .fetch_max(sequence, Ordering::SeqCst);
        Ok(response.result)
    }

    /// Runs a read. The query carries the client's current command
    /// sequence, so it will observe every command this client submitted
    /// before it.
    pub async fn query(&self, operation: Bytes, consistency: Consistency) -> Result<Bytes> {
        let sequence = self.inner.next_sequence.load(Ordering::SeqCst);
        let request = Request::Query(QueryRequest {
            session: self.inner.session,
            sequence,
            operation,
            consistency,
        });
        let response = self.inner.request(request).await?.into_query()?;
        Ok(response.result)
    }

    /// The ordered stream of session events. Takeable once.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.events_rx.take()
    }

    /// Stops the keep-alive loop and drops the connection. The session is
    /// left to expire on the cluster side.
    pub async fn close(mut self) {
        self.inner.stop.cancel();
        if let Some(keep_alive) = self.keep_alive.take() {
            let _ = keep_alive.await;
        }
        let mut state = self.inner.state.lock().await;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        state.connection = None;
    }
}

impl ClientInner {
    /// Sends a request to the cluster, rerouting on transient failures.
    async fn request(self: &Arc<Self>, request: Request) -> Result<Response> {
        let mut attempts = 0;
        loop {
            let connection = self.current_connection().await?;
            let outcome =
                tokio::time::timeout(self.config.request_timeout, connection.send(request.clone()))
                    .await
                    .unwrap_or(Err(Error::Timeout));
            match outcome {
                Ok(response) => {
                    self.observe(&response).await;
                    return Ok(response);
                }
                Err(e) if e.is_transient() && attempts < self.config.retry_attempts => {
                    attempts += 1;
                    tracing::debug!("request failed ({}), rerouting", e);
                    self.drop_connection().await;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Learns the leader and member list from responses that carry them.
    async fn observe(&self, response: &Response) {
        let (leader, members) = match response {
            Response::Register(r) => (r.leader, Some(&r.members)),
            Response::KeepAlive(r) => (r.leader, Some(&r.members)),
            _ => (None, None),
        };
        if let Some(members) = members {
            let mut state = self.state.lock().await;
            state.leader = leader;
            if !members.is_empty() {
                state.members = members.clone();
            }
        }
    }

    async fn current_connection(self: &Arc<Self>) -> Result<Arc<dyn Connection>> {
        {
            let state = self.state.lock().await;
            if let Some(connection) = &state.connection {
                return Ok(connection.clone());
            }
        }
        self.reconnect().await
    }

    async fn drop_connection(&self) {
        let mut state = self.state.lock().await;
        state.connection = None;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
    }

    /// Dials the known leader first, then the member list, then the seed
    /// addresses. A fresh connection carries no session binding; the next
    /// keep-alive rebinds event delivery to it.
    async fn reconnect(self: &Arc<Self>) -> Result<Arc<dyn Connection>> {
        let candidates = {
            let mut state = self.state.lock().await;
            let mut candidates = Vec::new();
            if let Some(leader) = state.leader {
                if let Some(member) = state.members.iter().find(|m| m.id == leader) {
                    candidates.push(member.address());
                }
            }
            let rotation = state.probe_cursor;
            state.probe_cursor += 1;
            let known: Vec<String> = if state.members.is_empty() {
                self.config.members.clone()
            } else {
                state.members.iter().map(|m| m.address()).collect()
            };
            for i in 0..known.len() {
                let address = known[(rotation + i) % known.len()].clone();
                if !candidates.contains(&address) {
                    candidates.push(address);
                }
            }
            candidates
        };

        let mut last_error = Error::NoLeader;
        for address in candidates {
            match self.transport.connect(&address).await {
                Ok(duplex) => {
                    let connection = duplex.connection.clone();
                    let pump = tokio::spawn(pump_inbound(self.clone(), duplex.inbound));
                    let mut state = self.state.lock().await;
                    if let Some(old) = state.pump.replace(pump) {
                        old.abort();
                    }
                    state.connection = Some(connection.clone());
                    return Ok(connection);
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

/// Handles server-initiated requests (event publishes) on one connection.
async fn pump_inbound(inner: Arc<ClientInner>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(Inbound { request, reply, .. }) = inbound.recv().await {
        match request {
            Request::Publish(publish) if publish.session == inner.session => {
                let delivered = inner.event_sequence.load(Ordering::SeqCst);
                let response = if publish.event_sequence == delivered + 1 {
                    inner
                        .event_sequence
                        .store(publish.event_sequence, Ordering::SeqCst);
                    let _ = inner.events_tx.send(publish.message);
                    PublishResponse {
                        succeeded: true,
                        event_sequence: publish.event_sequence,
                    }
                } else if publish.event_sequence <= delivered {
                    // Duplicate delivery; acknowledge what we have.
                    PublishResponse {
                        succeeded: true,
                        event_sequence: delivered,
                    }
                } else {
                    // Gap: ask the server to resend from our high-water mark.
                    PublishResponse {
                        succeeded: false,
                        event_sequence: delivered,
                    }
                };
                let _ = reply.send(Ok(Response::Publish(response)));
            }
            other => {
                let _ = reply.send(Err(Error::IllegalState(format!(
                    "unexpected {} request on client connection",
                    other.name()
                ))));
            }
        }
    }
}

/// Renews the session at half the session timeout until the client closes.
async fn keep_alive_loop(inner: Arc<ClientInner>) {
    let period = inner.config.session_timeout / 2;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let request = Request::KeepAlive(KeepAliveRequest {
                    session: inner.session,
                    command_sequence: inner.acked_sequence.load(Ordering::SeqCst),
                    event_sequence: inner.event_sequence.load(Ordering::SeqCst),
                });
                match inner.request(request).await {
                    Ok(_) => {}
                    Err(e) if e.is_session_fatal() => {
                        tracing::warn!("session {} is gone: {}", inner.session, e);
                        return;
                    }
                    Err(e) => {
                        tracing::debug!("keep-alive failed: {}", e);
                    }
                }
            }
            _ = inner.stop.cancelled() => return,
        }
    }
}
