//! Server context: the single-threaded consensus loop.
//!
//! Every mutation of the term, log metadata, session table, cluster state,
//! or role happens on this loop. It drains one event stream fed by the
//! transport (inbound requests), by tasks it spawned (replication and vote
//! replies), by the state-machine context (apply outcomes, published
//! events), and by the compactor (filter checks). Handlers run to
//! completion between events; anything that blocks is spawned and reports
//! back as an event.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{Member, MemberId, MemberKind};
use protocol::{
    AppendResponse, CommandResponse, ConfigureResponse, Duplex, Error, Inbound, KeepAliveResponse,
    PollResponse, PublishRequest, PublishResponse, RegisterResponse, ReplySender, Request,
    Response, Result, SyncResponse, Transport, VoteResponse,
};
use storage::{
    Compaction, CompactionKind, Compactor, CompactorHandle, Entry, EntryFilter, Index, Log,
    Record, SessionId, Term,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterState;
use crate::config::ServerConfig;
use crate::connections::ConnectionManager;
use crate::roles::{Role, RoleKind};
use crate::session::{SessionManager, SessionState};
use crate::state_machine::{spawn_applier, ApplyMsg, Commit, SessionHandle, StateMachine};

/// Externally visible server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Inactive,
    Join,
    Leave,
    Passive,
    Follower,
    Candidate,
    Leader,
}

/// Snapshot of a server's consensus state, published over a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub state: State,
    pub leader: Option<MemberId>,
    pub term: Term,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_log_index: Index,
    pub members_version: Index,
    pub active_members: usize,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            state: State::Inactive,
            leader: None,
            term: 0,
            commit_index: 0,
            last_applied: 0,
            last_log_index: 0,
            members_version: 0,
            active_members: 0,
        }
    }
}

/// Membership operations a leader can drive through the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfigOp {
    Join,
    Leave,
    Promote,
    Demote,
}

/// Everything that can wake the consensus loop.
pub(crate) enum Event {
    Accepted(Duplex),
    Inbound {
        connection: u64,
        request: Request,
        reply: ReplySender,
    },
    ConnectionClosed(u64),
    VoteReply {
        peer: MemberId,
        term: Term,
        result: Result<VoteResponse>,
    },
    PollReply {
        peer: MemberId,
        term: Term,
        result: Result<PollResponse>,
    },
    AppendReply {
        peer: MemberId,
        term: Term,
        round: u64,
        up_to: Index,
        result: Result<AppendResponse>,
    },
    SyncReply {
        peer: MemberId,
        up_to: Index,
        result: Result<SyncResponse>,
    },
    ConfigureReply {
        op: ConfigOp,
        result: Result<ConfigureResponse>,
    },
    Applied {
        index: Index,
        session: SessionId,
        sequence: u64,
        result: Option<std::result::Result<Bytes, Error>>,
    },
    Filter {
        entry: Entry,
        compaction: Compaction,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        session: SessionId,
        message: Bytes,
    },
    PublishAck {
        session: SessionId,
        result: Result<PublishResponse>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Replies the leader owes clients once a log index applies.
pub(crate) enum PendingReply {
    Register(ReplySender),
    KeepAlive(ReplySender),
    Command(ReplySender),
    Configure {
        op: ConfigOp,
        reply: Option<ReplySender>,
    },
}

/// Feeds compaction filter checks through the consensus loop so the
/// built-in predicates see a consistent session table and cluster view.
struct ServerFilter {
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait::async_trait]
impl EntryFilter for ServerFilter {
    async fn keep(&self, entry: &Entry, compaction: &Compaction) -> bool {
        let (reply, answer) = oneshot::channel();
        if self
            .events
            .send(Event::Filter {
                entry: entry.clone(),
                compaction: *compaction,
                reply,
            })
            .is_err()
        {
            return true;
        }
        answer.await.unwrap_or(true)
    }
}

pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) member: Member,
    pub(crate) log: Log,
    pub(crate) compactor: Option<CompactorHandle>,
    pub(crate) cluster: ClusterState,
    pub(crate) sessions: SessionManager,
    pub(crate) connections: ConnectionManager,
    pub(crate) term: Term,
    pub(crate) voted_for: Option<MemberId>,
    pub(crate) leader: Option<MemberId>,
    pub(crate) commit_index: Index,
    pub(crate) global_index: Index,
    pub(crate) last_applied: Index,
    /// Highest committed index already handed to the apply pipeline.
    last_enqueued: Index,
    /// Per-index readiness; `last_applied` advances over the ready prefix.
    outcomes: BTreeMap<Index, bool>,
    pub(crate) pending: HashMap<Index, PendingReply>,
    pub(crate) role: Role,
    pub(crate) events_tx: mpsc::UnboundedSender<Event>,
    pub(crate) applier_tx: mpsc::UnboundedSender<ApplyMsg>,
    status_tx: watch::Sender<ServerStatus>,
    pub(crate) closing: bool,
    close_done: Vec<oneshot::Sender<()>>,
    loop_task: Option<tokio::task::Id>,
}

impl ServerContext {
    /// Debug invariant: all consensus state is touched from the loop task.
    pub(crate) fn check_context(&self) {
        debug_assert!(
            self.loop_task.is_none() || tokio::task::try_id() == self.loop_task,
            "consensus state touched off the consensus loop"
        );
    }

    pub(crate) fn set_term(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
            self.leader = None;
            self.voted_for = None;
            tracing::debug!("{} - Set term {}", self.member.id, term);
            self.publish_status();
        }
    }

    pub(crate) fn set_leader(&mut self, leader: Option<MemberId>) {
        if self.leader != leader {
            self.leader = leader;
            if let Some(leader) = leader {
                tracing::debug!("{} - Found leader {}", self.member.id, leader);
            }
            self.publish_status();
        }
    }

    pub(crate) fn set_commit_index(&mut self, index: Index) {
        // A just-elected leader may briefly advertise an older commit index;
        // the committed prefix itself never moves backwards.
        if index > self.commit_index {
            self.commit_index = index;
            if let Some(compactor) = &self.compactor {
                compactor.set_minor_index(index);
            }
            self.apply_committed();
            self.publish_status();
        }
    }

    pub(crate) fn set_global_index(&mut self, index: Index) {
        if index > self.global_index {
            self.global_index = index;
            if let Some(compactor) = &self.compactor {
                compactor.set_major_index(index);
            }
        }
    }

    pub(crate) fn session_timeout_millis(&self) -> i64 {
        self.config.session_timeout.as_millis() as i64
    }

    pub(crate) fn publish_status(&self) {
        let status = ServerStatus {
            state: self.role.state(),
            leader: self.leader,
            term: self.term,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            members_version: self.cluster.version(),
            active_members: self.cluster.active_members().len(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn session_handle(&self, session: SessionId) -> SessionHandle {
        SessionHandle::new(session, self.events_tx.clone())
    }

    pub(crate) fn take_pending(&mut self, index: Index) -> Option<PendingReply> {
        self.pending.remove(&index)
    }

    /// Forwards a client request to the current leader, or fails fast.
    pub(crate) fn forward_to_leader(&mut self, request: Request, reply: ReplySender) {
        let Some(leader) = self.leader.filter(|l| *l != self.member.id) else {
            let _ = reply.send(Err(Error::NoLeader));
            return;
        };
        let Some(address) = self.cluster.address_of(leader) else {
            let _ = reply.send(Err(Error::NoLeader));
            return;
        };
        let connections = self.connections.clone();
        tokio::spawn(async move {
            let _ = reply.send(connections.send_to(&address, request).await);
        });
    }

    // ---- apply pipeline -------------------------------------------------

    /// Hands every newly committed entry to the pipeline, in index order.
    pub(crate) fn apply_committed(&mut self) {
        self.check_context();
        while self.last_enqueued < self.commit_index {
            let index = self.last_enqueued + 1;
            self.last_enqueued = index;
            match self.log.get(index) {
                // Compacted-out entries no longer contribute to state.
                None => self.mark_ready(index),
                Some(entry) => self.enqueue_entry(entry),
            }
        }
    }

    fn enqueue_entry(&mut self, entry: Entry) {
        let index = entry.index;
        match entry.record {
            Record::NoOp => self.mark_ready(index),
            Record::Register {
                connection,
                timestamp,
            } => {
                self.sessions.register_session(index, connection, timestamp);
                let handle = self.session_handle(index);
                self.outcomes.insert(index, false);
                let _ = self.applier_tx.send(ApplyMsg::Register {
                    index,
                    session: handle,
                });
                self.sweep_sessions(timestamp);
            }
            Record::KeepAlive {
                session,
                command_sequence,
                timestamp,
            } => {
                self.apply_keep_alive(index, session, command_sequence, timestamp);
                self.sweep_sessions(timestamp);
            }
            Record::Command {
                session,
                sequence,
                timestamp,
                operation,
            } => {
                self.apply_command(index, session, sequence, timestamp, operation);
                self.sweep_sessions(timestamp);
            }
            Record::Query { .. } => {
                // Queries are never appended; treat a stray one as a no-op.
                self.mark_ready(index);
            }
            Record::Configuration { active, passive } => {
                self.apply_configuration(index, active, passive);
            }
        }
    }

    fn apply_keep_alive(
        &mut self,
        index: Index,
        session_id: SessionId,
        command_sequence: u64,
        timestamp: i64,
    ) {
        let pending = self.take_pending(index);
        let expired = match self.sessions.get(session_id) {
            None => {
                if let Some(PendingReply::KeepAlive(reply)) = pending {
                    let _ = reply.send(Err(Error::UnknownSession(session_id)));
                }
                self.mark_ready(index);
                return;
            }
            Some(session) => timestamp - self.session_timeout_millis() > session.timestamp,
        };
        if expired {
            self.expire_session(session_id);
            if let Some(PendingReply::KeepAlive(reply)) = pending {
                let _ = reply.send(Err(Error::SessionExpired(session_id)));
            }
            self.mark_ready(index);
            return;
        }

        let session = self.sessions.get_mut(session_id).expect("session is live");
        session.index = index;
        session.timestamp = timestamp;
        session.clear_commands(command_sequence);
        if let Some(PendingReply::KeepAlive(reply)) = pending {
            let _ = reply.send(Ok(Response::KeepAlive(KeepAliveResponse {
                leader: self.leader,
                members: self.cluster.all_members(),
            })));
        }
        self.mark_ready(index);
    }

    fn apply_command(
        &mut self,
        index: Index,
        session_id: SessionId,
        sequence: u64,
        timestamp: i64,
        operation: Bytes,
    ) {
        let pending_reply = match self.take_pending(index) {
            Some(PendingReply::Command(reply)) => Some(reply),
            _ => None,
        };

        let Some(session) = self.sessions.get(session_id) else {
            tracing::warn!("{} - Unknown session {}", self.member.id, session_id);
            if let Some(reply) = pending_reply {
                let _ = reply.send(Err(Error::UnknownSession(session_id)));
            }
            self.mark_ready(index);
            return;
        };
        if timestamp - self.session_timeout_millis() > session.timestamp {
            self.expire_session(session_id);
            if let Some(reply) = pending_reply {
                let _ = reply.send(Err(Error::SessionExpired(session_id)));
            }
            self.mark_ready(index);
            return;
        }

        let session = self.sessions.get_mut(session_id).expect("session is live");
        session.index = index;
        session.timestamp = timestamp;

        // At-most-once: replay a cached response, or park behind the
        // original if it is still in flight. Only a genuinely new sequence
        // reaches the state machine.
        if let Some(cached) = session.response(sequence) {
            if let Some(reply) = pending_reply {
                let response = cached
                    .clone()
                    .map(|result| Response::Command(CommandResponse { index, result }));
                let _ = reply.send(response);
            }
            self.mark_ready(index);
            return;
        }
        if sequence <= session.command_version() {
            if let Some(reply) = pending_reply {
                session.park_waiter(sequence, reply);
            }
            self.mark_ready(index);
            return;
        }

        if let Some(reply) = pending_reply {
            self.pending.insert(index, PendingReply::Command(reply));
        }
        let commit = Commit::new(index, timestamp, self.session_handle(session_id), operation);
        self.outcomes.insert(index, false);
        let _ = self.applier_tx.send(ApplyMsg::Command {
            index,
            session: session_id,
            sequence,
            commit,
        });

        // Advancing the version here keeps released queries ordered behind
        // the command in the applier queue.
        let session = self.sessions.get_mut(session_id).expect("session is live");
        let released = session.set_command_version(sequence);
        for query in released {
            let commit = Commit::new(
                self.commit_index,
                query.timestamp,
                self.session_handle(session_id),
                query.operation,
            );
            let _ = self.applier_tx.send(ApplyMsg::Query {
                index: self.commit_index,
                commit,
                reply: query.reply,
            });
        }
    }

    fn apply_configuration(&mut self, index: Index, active: Vec<Member>, passive: Vec<Member>) {
        self.cluster.configure(index, active, passive);
        tracing::info!(
            "{} - Applied configuration {} ({} active, {} passive)",
            self.member.id,
            index,
            self.cluster.active_members().len(),
            self.cluster.passive_members().len()
        );

        if let Some(PendingReply::Configure { op, reply }) = self.take_pending(index) {
            if let Some(reply) = reply {
                let response = ConfigureResponse {
                    version: index,
                    active: self.cluster.active_members(),
                    passive: self.cluster.passive_members(),
                };
                let _ = reply.send(Ok(match op {
                    ConfigOp::Join => Response::Join(response),
                    ConfigOp::Leave => Response::Leave(response),
                    ConfigOp::Promote => Response::Promote(response),
                    ConfigOp::Demote => Response::Demote(response),
                }));
            }
        }
        self.mark_ready(index);

        self.role_follow_configuration();
        self.leader_next_configuration(index);
        self.publish_status();
    }

    pub(crate) fn on_applied(
        &mut self,
        index: Index,
        session_id: SessionId,
        sequence: u64,
        result: Option<std::result::Result<Bytes, Error>>,
    ) {
        if let Some(result) = result {
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.register_response(sequence, result.clone());
                for waiter in session.take_waiters(sequence) {
                    let response = result
                        .clone()
                        .map(|r| Response::Command(CommandResponse { index, result: r }));
                    let _ = waiter.send(response);
                }
            }
            if let Some(PendingReply::Command(reply)) = self.take_pending(index) {
                let response =
                    result.map(|r| Response::Command(CommandResponse { index, result: r }));
                let _ = reply.send(response);
            }
        } else if let Some(PendingReply::Register(reply)) = self.take_pending(index) {
            let _ = reply.send(Ok(Response::Register(RegisterResponse {
                session: index,
                leader: self.leader,
                members: self.cluster.all_members(),
            })));
        }
        self.mark_ready(index);
    }

    fn mark_ready(&mut self, index: Index) {
        self.outcomes.insert(index, true);
        self.advance_last_applied();
    }

    fn advance_last_applied(&mut self) {
        while self.outcomes.get(&(self.last_applied + 1)) == Some(&true) {
            self.outcomes.remove(&(self.last_applied + 1));
            self.last_applied += 1;
        }
        self.publish_status();
    }

    pub(crate) fn expire_session(&mut self, id: SessionId) {
        if self.sessions.remove(id, SessionState::Expired).is_some() {
            tracing::warn!("{} - Expired session {}", self.member.id, id);
            let handle = self.session_handle(id);
            let _ = self.applier_tx.send(ApplyMsg::Expire { session: handle });
        }
    }

    fn sweep_sessions(&mut self, now: i64) {
        let timeout = self.session_timeout_millis();
        for id in self.sessions.stale_sessions(now, timeout) {
            self.expire_session(id);
        }
    }

    // ---- compaction filter ----------------------------------------------

    fn on_filter(
        &mut self,
        entry: Entry,
        compaction: Compaction,
        reply: oneshot::Sender<bool>,
    ) {
        match &entry.record {
            Record::NoOp => {
                let _ = reply.send(compaction.kind == CompactionKind::Minor);
            }
            Record::Register { .. } => {
                let _ = reply.send(self.sessions.contains(entry.index));
            }
            Record::KeepAlive { session, .. } => {
                let keep = self
                    .sessions
                    .get(*session)
                    .is_some_and(|s| s.index == entry.index);
                let _ = reply.send(keep);
            }
            Record::Configuration { .. } => {
                let keep =
                    entry.index >= self.cluster.version() || entry.index >= self.last_applied;
                let _ = reply.send(keep);
            }
            Record::Command {
                session,
                timestamp,
                operation,
                ..
            } => {
                let commit = Commit::new(
                    entry.index,
                    *timestamp,
                    self.session_handle(*session),
                    operation.clone(),
                );
                let _ = self.applier_tx.send(ApplyMsg::Filter {
                    commit,
                    compaction,
                    reply,
                });
            }
            Record::Query { .. } => {
                let _ = reply.send(false);
            }
        }
    }

    // ---- event delivery --------------------------------------------------

    fn on_publish(&mut self, session_id: SessionId, message: Bytes) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if !session.is_open() {
            return;
        }
        let sequence = session.publish(message.clone());
        self.send_events(session_id, vec![(sequence, message)]);
    }

    fn send_events(&mut self, session_id: SessionId, batch: Vec<(u64, Bytes)>) {
        let Some(connection) = self.sessions.connection_for(session_id) else {
            return;
        };
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            for (event_sequence, message) in batch {
                let result = connection
                    .send(Request::Publish(PublishRequest {
                        session: session_id,
                        event_sequence,
                        message,
                    }))
                    .await
                    .and_then(|r| r.into_publish());
                let delivered = result.as_ref().map(|r| r.succeeded).unwrap_or(false);
                let _ = events.send(Event::PublishAck {
                    session: session_id,
                    result,
                });
                if !delivered {
                    break;
                }
            }
        });
    }

    fn on_publish_ack(&mut self, session_id: SessionId, result: Result<PublishResponse>) {
        match result {
            Ok(ack) => {
                let resend = {
                    let Some(session) = self.sessions.get_mut(session_id) else {
                        return;
                    };
                    session.clear_events(ack.event_sequence);
                    if ack.succeeded {
                        Vec::new()
                    } else {
                        session.events_after(ack.event_sequence)
                    }
                };
                if !resend.is_empty() {
                    self.send_events(session_id, resend);
                }
            }
            Err(e) => {
                tracing::debug!(
                    "{} - Publish to session {} failed: {}",
                    self.member.id,
                    session_id,
                    e
                );
            }
        }
    }

    // ---- event dispatch --------------------------------------------------

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Accepted(duplex) => self.on_accepted(duplex),
            Event::Inbound {
                connection,
                request,
                reply,
            } => self.on_inbound(connection, request, reply),
            Event::ConnectionClosed(id) => self.sessions.unregister_connection(id),
            Event::VoteReply { peer, term, result } => self.on_vote_reply(peer, term, result),
            Event::PollReply { peer, term, result } => self.on_poll_reply(peer, term, result),
            Event::AppendReply {
                peer,
                term,
                round,
                up_to,
                result,
            } => self.on_append_reply(peer, term, round, up_to, result),
            Event::SyncReply {
                peer,
                up_to,
                result,
            } => self.on_sync_reply(peer, up_to, result),
            Event::ConfigureReply { op, result } => self.on_configure_reply(op, result),
            Event::Applied {
                index,
                session,
                sequence,
                result,
            } => self.on_applied(index, session, sequence, result),
            Event::Filter {
                entry,
                compaction,
                reply,
            } => self.on_filter(entry, compaction, reply),
            Event::Publish { session, message } => self.on_publish(session, message),
            Event::PublishAck { session, result } => self.on_publish_ack(session, result),
            Event::Close { done } => {
                self.close_done.push(done);
                self.begin_close();
            }
        }
    }

    fn on_accepted(&mut self, duplex: Duplex) {
        let connection = duplex.connection.clone();
        let id = connection.id();
        self.sessions.register_connection(connection);
        let events = self.events_tx.clone();
        let mut inbound = duplex.inbound;
        tokio::spawn(async move {
            while let Some(Inbound {
                connection,
                request,
                reply,
            }) = inbound.recv().await
            {
                if events
                    .send(Event::Inbound {
                        connection,
                        request,
                        reply,
                    })
                    .is_err()
                {
                    return;
                }
            }
            let _ = events.send(Event::ConnectionClosed(id));
        });
    }
}

async fn run(
    mut ctx: ServerContext,
    mut events_rx: mpsc::UnboundedReceiver<Event>,
    stop: CancellationToken,
) {
    ctx.loop_task = tokio::task::try_id();
    ctx.transition(RoleKind::Join);

    loop {
        let deadline = ctx.next_deadline();
        tokio::select! {
            maybe = events_rx.recv() => {
                match maybe {
                    Some(event) => ctx.on_event(event),
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline) => ctx.on_timeout(),
            _ = stop.cancelled() => break,
        }

        if ctx.closing && matches!(ctx.role, Role::Inactive) {
            break;
        }
    }

    // Surviving sessions see a clean close, not an expiration.
    for id in ctx.sessions.session_ids() {
        if ctx.sessions.remove(id, SessionState::Closed).is_some() {
            let handle = ctx.session_handle(id);
            let _ = ctx.applier_tx.send(ApplyMsg::Close { session: handle });
        }
    }

    if let Some(compactor) = ctx.compactor.take() {
        compactor.shutdown().await;
    }
    if let Err(e) = ctx.log.flush() {
        tracing::warn!("{} - Failed to flush log on close: {}", ctx.member.id, e);
    }
    for done in ctx.close_done.drain(..) {
        let _ = done.send(());
    }
    tracing::info!("{} - Server stopped", ctx.member.id);
}

/// A running consensus server.
///
/// Dropping the handle does not stop the server; call [`RaftServer::stop`].
pub struct RaftServer {
    member: Member,
    events_tx: mpsc::UnboundedSender<Event>,
    status_rx: watch::Receiver<ServerStatus>,
    stop: CancellationToken,
    loop_task: Option<JoinHandle<()>>,
    applier_task: Option<JoinHandle<()>>,
    storage_dir: PathBuf,
    stopped: bool,
}

impl RaftServer {
    /// Opens the log, binds the transport, seeds the cluster at version 0,
    /// and starts the consensus and state-machine loops. The server comes up
    /// in the Join state and finds its place in the cluster on its own.
    pub async fn start(
        config: ServerConfig,
        member: Member,
        members: Vec<Member>,
        transport: Arc<dyn Transport>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<RaftServer> {
        if member.host.is_empty() {
            return Err(Error::IllegalArgument("member host not configured".into()));
        }

        let log = Log::open_with_clock(&config.storage, config.clock.clone())?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (applier_tx, applier_rx) = mpsc::unbounded_channel();
        let applier_task = spawn_applier(state_machine, applier_rx, events_tx.clone());

        let filter = Arc::new(ServerFilter {
            events: events_tx.clone(),
        });
        let compactor = Compactor::start(log.clone(), filter, &config.storage);

        let mut listener = transport.listen(&member.address()).await?;
        {
            let events = events_tx.clone();
            tokio::spawn(async move {
                while let Some(duplex) = listener.recv().await {
                    if events.send(Event::Accepted(duplex)).is_err() {
                        return;
                    }
                }
            });
        }

        let mut cluster = ClusterState::new(member.clone());
        let active: Vec<Member> = members
            .iter()
            .filter(|m| m.kind == MemberKind::Active)
            .cloned()
            .collect();
        let passive: Vec<Member> = members
            .iter()
            .filter(|m| m.kind == MemberKind::Passive)
            .cloned()
            .collect();
        cluster.configure(0, active, passive);

        let (status_tx, status_rx) = watch::channel(ServerStatus::default());
        let storage_dir = config.storage.dir.clone();
        let ctx = ServerContext {
            connections: ConnectionManager::new(transport),
            config,
            member: member.clone(),
            log,
            compactor: Some(compactor),
            cluster,
            sessions: SessionManager::new(),
            term: 0,
            voted_for: None,
            leader: None,
            commit_index: 0,
            global_index: 0,
            last_applied: 0,
            last_enqueued: 0,
            outcomes: BTreeMap::new(),
            pending: HashMap::new(),
            role: Role::Inactive,
            events_tx: events_tx.clone(),
            applier_tx,
            status_tx,
            closing: false,
            close_done: Vec::new(),
            loop_task: None,
        };

        let stop = CancellationToken::new();
        let loop_task = tokio::spawn(run(ctx, events_rx, stop.clone()));
        tracing::info!("{} - Server started", member.id);

        Ok(RaftServer {
            member,
            events_tx,
            status_rx,
            stop,
            loop_task: Some(loop_task),
            applier_task: Some(applier_task),
            storage_dir,
            stopped: false,
        })
    }

    pub fn id(&self) -> MemberId {
        self.member.id
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn status(&self) -> ServerStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel carrying consensus state snapshots.
    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.status_rx.clone()
    }

    /// Leaves the cluster and shuts both loops down. Pending client
    /// requests complete with typed failures.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let (done_tx, done_rx) = oneshot::channel();
        if self.events_tx.send(Event::Close { done: done_tx }).is_ok() {
            let graceful = tokio::time::timeout(Duration::from_secs(5), done_rx).await;
            if graceful.is_err() {
                tracing::warn!("{} - Graceful leave timed out, aborting", self.member.id);
            }
        }
        self.stop.cancel();
        if let Some(task) = self.loop_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.applier_task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    /// Removes the server's log from disk. Only legal after [`stop`].
    ///
    /// [`stop`]: RaftServer::stop
    pub async fn delete(self) -> Result<()> {
        if !self.stopped {
            return Err(Error::IllegalState("cannot delete a running server".into()));
        }
        std::fs::remove_dir_all(&self.storage_dir).map_err(|e| Error::Io(e.to_string()))
    }
}
