//! The role state machine.
//!
//! Exactly one role is active at a time; transitions are synchronous on the
//! consensus loop (close the old role, open the new one). Each role module
//! carries the handlers specific to it; behavior shared by every replica
//! (append/sync acceptance, vote and poll rules) lives here.

mod candidate;
mod follower;
mod join;
mod leader;
mod leave;
mod passive;

use std::collections::{HashMap, HashSet, VecDeque};

use common::{Member, MemberId};
use protocol::{
    AppendRequest, AppendResponse, Consistency, Error, PollRequest, PollResponse, ReplySender,
    Request, Response, Result, SyncRequest, SyncResponse, VoteRequest, VoteResponse,
};
use storage::{Entry, Index, Term};
use tokio::time::{Duration, Instant};

use crate::context::{ConfigOp, ServerContext, State};

pub(crate) use leader::LeaderQuery;

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60);

pub(crate) struct FollowerRole {
    pub deadline: Instant,
    /// Accepted pre-vote grants while a poll round is in flight.
    pub poll_votes: Option<HashSet<MemberId>>,
}

pub(crate) struct CandidateRole {
    pub deadline: Instant,
    pub votes: HashSet<MemberId>,
}

pub(crate) struct LeaderRole {
    pub next_heartbeat: Instant,
    /// Heartbeat broadcast counter; quorum acknowledgment of a round proves
    /// leadership at the moment the round started.
    pub round: u64,
    pub round_acks: HashMap<MemberId, u64>,
    /// Peers with an append or sync in flight.
    pub replicating: HashSet<MemberId>,
    /// Index of the uncommitted Configuration entry, if one exists.
    pub pending_config: Option<Index>,
    /// Membership changes waiting for the pending configuration to commit.
    pub queued_configs: VecDeque<(ConfigOp, Member, Option<ReplySender>)>,
    /// Linearizable queries waiting for quorum confirmation of a round.
    pub pending_linear: Vec<(u64, LeaderQuery)>,
}

impl LeaderRole {
    fn new(heartbeat_interval: Duration) -> Self {
        Self {
            next_heartbeat: Instant::now() + heartbeat_interval,
            round: 0,
            round_acks: HashMap::new(),
            replicating: HashSet::new(),
            pending_config: None,
            queued_configs: VecDeque::new(),
            pending_linear: Vec::new(),
        }
    }
}

pub(crate) struct PassiveRole {
    pub promote_deadline: Instant,
}

pub(crate) struct JoinRole {
    pub deadline: Instant,
    pub attempt: usize,
}

pub(crate) struct LeaveRole {
    pub deadline: Instant,
    pub attempt: usize,
}

pub(crate) enum Role {
    Inactive,
    Join(JoinRole),
    Leave(LeaveRole),
    Passive(PassiveRole),
    Follower(FollowerRole),
    Candidate(CandidateRole),
    Leader(LeaderRole),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoleKind {
    Inactive,
    Join,
    Leave,
    Passive,
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub(crate) fn kind(&self) -> RoleKind {
        match self {
            Role::Inactive => RoleKind::Inactive,
            Role::Join(_) => RoleKind::Join,
            Role::Leave(_) => RoleKind::Leave,
            Role::Passive(_) => RoleKind::Passive,
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }

    pub(crate) fn state(&self) -> State {
        match self.kind() {
            RoleKind::Inactive => State::Inactive,
            RoleKind::Join => State::Join,
            RoleKind::Leave => State::Leave,
            RoleKind::Passive => State::Passive,
            RoleKind::Follower => State::Follower,
            RoleKind::Candidate => State::Candidate,
            RoleKind::Leader => State::Leader,
        }
    }
}

impl ServerContext {
    pub(crate) fn transition(&mut self, kind: RoleKind) {
        self.check_context();
        if self.role.kind() == kind {
            return;
        }
        tracing::info!("{} - Transitioning to {:?}", self.member.id, kind);
        self.close_role();

        match kind {
            RoleKind::Inactive => {}
            RoleKind::Join => {
                self.role = Role::Join(JoinRole {
                    deadline: Instant::now(),
                    attempt: 0,
                });
            }
            RoleKind::Leave => {
                self.role = Role::Leave(LeaveRole {
                    deadline: Instant::now(),
                    attempt: 0,
                });
            }
            RoleKind::Passive => {
                self.role = Role::Passive(PassiveRole {
                    promote_deadline: Instant::now() + self.config.heartbeat_interval,
                });
            }
            RoleKind::Follower => {
                self.role = Role::Follower(FollowerRole {
                    deadline: self.random_election_deadline(),
                    poll_votes: None,
                });
            }
            RoleKind::Candidate => {
                self.role = Role::Candidate(CandidateRole {
                    deadline: Instant::now(),
                    votes: HashSet::new(),
                });
                self.start_election();
            }
            RoleKind::Leader => {
                self.role = Role::Leader(LeaderRole::new(self.config.heartbeat_interval));
                self.open_leader();
            }
        }
        self.publish_status();
    }

    /// Tears down the current role, failing work only a leader can finish.
    fn close_role(&mut self) {
        if let Role::Leader(leader) = &mut self.role {
            for (_, query) in leader.pending_linear.drain(..) {
                let _ = query.reply.send(Err(Error::NoLeader));
            }
            for (_, _, reply) in leader.queued_configs.drain(..) {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(Error::NoLeader));
                }
            }
            for (_, pending) in std::mem::take(&mut self.pending) {
                use crate::context::PendingReply::*;
                match pending {
                    Register(reply) | KeepAlive(reply) | Command(reply) => {
                        let _ = reply.send(Err(Error::NoLeader));
                    }
                    Configure { reply, .. } => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(Error::NoLeader));
                        }
                    }
                }
            }
            if self.leader == Some(self.member.id) {
                self.set_leader(None);
            }
        }
        self.role = Role::Inactive;
    }

    pub(crate) fn random_election_deadline(&self) -> Instant {
        let base = self.config.election_timeout;
        let jitter = rand::random::<u64>() % (base.as_millis().max(1) as u64);
        Instant::now() + base + Duration::from_millis(jitter)
    }

    pub(crate) fn next_deadline(&self) -> Instant {
        match &self.role {
            Role::Inactive => Instant::now() + FAR_FUTURE,
            Role::Join(join) => join.deadline,
            Role::Leave(leave) => leave.deadline,
            Role::Passive(passive) => passive.promote_deadline,
            Role::Follower(follower) => follower.deadline,
            Role::Candidate(candidate) => candidate.deadline,
            Role::Leader(leader) => leader.next_heartbeat,
        }
    }

    pub(crate) fn on_timeout(&mut self) {
        match self.role.kind() {
            RoleKind::Inactive => {}
            RoleKind::Join => self.join_timeout(),
            RoleKind::Leave => self.leave_timeout(),
            RoleKind::Passive => self.passive_timeout(),
            RoleKind::Follower => self.follower_timeout(),
            RoleKind::Candidate => self.candidate_timeout(),
            RoleKind::Leader => self.leader_heartbeat_timeout(),
        }
    }

    /// Adjusts the role after a configuration entry applies.
    pub(crate) fn role_follow_configuration(&mut self) {
        if !self.cluster.is_member() {
            match self.role.kind() {
                RoleKind::Inactive | RoleKind::Join => {}
                RoleKind::Leave => self.transition(RoleKind::Inactive),
                _ => {
                    if self.closing {
                        self.transition(RoleKind::Inactive);
                    } else {
                        self.transition(RoleKind::Join);
                    }
                }
            }
            return;
        }

        if self.cluster.is_active() {
            if matches!(self.role.kind(), RoleKind::Passive | RoleKind::Join) {
                self.transition(RoleKind::Follower);
            }
        } else if self.cluster.is_passive()
            && matches!(
                self.role.kind(),
                RoleKind::Follower | RoleKind::Candidate | RoleKind::Leader | RoleKind::Join
            )
        {
            self.transition(RoleKind::Passive);
        }
    }

    /// Starts a graceful shutdown: leaders log themselves out of the
    /// configuration, everyone else asks the leader to remove them.
    pub(crate) fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        tracing::info!("{} - Closing", self.member.id);
        match self.role.kind() {
            RoleKind::Inactive => {}
            RoleKind::Leader => {
                let local = self.member.clone();
                self.leader_configure(ConfigOp::Leave, local, None);
            }
            _ => self.transition(RoleKind::Leave),
        }
    }

    // ---- request dispatch -----------------------------------------------

    pub(crate) fn on_inbound(&mut self, connection: u64, request: Request, reply: ReplySender) {
        tracing::debug!("{} - Received {}", self.member.id, request.name());
        let is_leader = matches!(self.role, Role::Leader(_));
        match request {
            Request::Append(req) => {
                let response = self.handle_append(req);
                let _ = reply.send(Ok(Response::Append(response)));
            }
            Request::Sync(req) => {
                let response = self.handle_sync(req);
                let _ = reply.send(Ok(Response::Sync(response)));
            }
            Request::Vote(req) => {
                let _ = reply.send(self.handle_vote(req).map(Response::Vote));
            }
            Request::Poll(req) => {
                let _ = reply.send(self.handle_poll(req).map(Response::Poll));
            }
            Request::Register(req) if is_leader => self.leader_register(req, reply),
            Request::Register(req) => self.forward_to_leader(Request::Register(req), reply),
            Request::KeepAlive(req) if is_leader => self.leader_keep_alive(connection, req, reply),
            Request::KeepAlive(req) => self.forward_to_leader(Request::KeepAlive(req), reply),
            Request::Command(req) if is_leader => self.leader_command(req, reply),
            Request::Command(req) => self.forward_to_leader(Request::Command(req), reply),
            Request::Query(req) if is_leader => self.leader_query(req, reply),
            Request::Query(req)
                if matches!(self.role, Role::Passive(_))
                    && req.consistency == Consistency::Sequential =>
            {
                self.passive_query(req, reply)
            }
            Request::Query(req) => self.forward_to_leader(Request::Query(req), reply),
            Request::Join(req) if is_leader => {
                self.leader_configure(ConfigOp::Join, req.member, Some(reply))
            }
            Request::Join(req) => self.forward_to_leader(Request::Join(req), reply),
            Request::Leave(req) if is_leader => {
                self.leader_configure(ConfigOp::Leave, req.member, Some(reply))
            }
            Request::Leave(req) => self.forward_to_leader(Request::Leave(req), reply),
            Request::Promote(req) if is_leader => {
                self.leader_configure(ConfigOp::Promote, req.member, Some(reply))
            }
            Request::Promote(req) => self.forward_to_leader(Request::Promote(req), reply),
            Request::Demote(req) if is_leader => {
                self.leader_configure(ConfigOp::Demote, req.member, Some(reply))
            }
            Request::Demote(req) => self.forward_to_leader(Request::Demote(req), reply),
            Request::Publish(_) => {
                let _ = reply.send(Err(Error::IllegalState(
                    "publish requests are client-bound".into(),
                )));
            }
        }
    }

    // ---- shared replica behavior ----------------------------------------

    pub(crate) fn handle_append(&mut self, req: AppendRequest) -> AppendResponse {
        if req.term < self.term {
            return AppendResponse {
                term: self.term,
                succeeded: false,
                log_index: self.log.last_index(),
            };
        }

        self.set_term(req.term);
        self.set_leader(Some(req.leader));
        if matches!(self.role.kind(), RoleKind::Candidate | RoleKind::Leader) {
            self.transition(RoleKind::Follower);
        }
        let deadline = self.random_election_deadline();
        if let Role::Follower(follower) = &mut self.role {
            follower.deadline = deadline;
            follower.poll_votes = None;
        }

        let last = self.log.last_index();
        if req.prev_log_index > 0 {
            if req.prev_log_index > last {
                if req.commit_index >= req.prev_log_index {
                    // The gap below prev is committed everywhere and was
                    // compacted away on the leader; fill it with holes.
                    if let Err(e) = self.log.skip_until(req.prev_log_index + 1) {
                        self.fatal(e.into());
                        return self.append_failure();
                    }
                } else {
                    return self.append_failure();
                }
            } else if self.log.contains(req.prev_log_index)
                && self.log.term_of(req.prev_log_index) != Some(req.prev_log_term)
            {
                tracing::debug!(
                    "{} - Rejected append: prev term mismatch at {}",
                    self.member.id,
                    req.prev_log_index
                );
                return AppendResponse {
                    term: self.term,
                    succeeded: false,
                    log_index: req.prev_log_index.saturating_sub(1),
                };
            }
        }

        if let Err(e) = self.append_entries(req.entries) {
            self.fatal(e);
            return self.append_failure();
        }

        let last = self.log.last_index();
        self.set_commit_index(req.commit_index.min(last));
        self.set_global_index(req.global_index);
        AppendResponse {
            term: self.term,
            succeeded: true,
            log_index: last,
        }
    }

    fn append_failure(&self) -> AppendResponse {
        AppendResponse {
            term: self.term,
            succeeded: false,
            log_index: self.log.last_index(),
        }
    }

    pub(crate) fn handle_sync(&mut self, req: SyncRequest) -> SyncResponse {
        if req.term < self.term {
            return SyncResponse {
                term: self.term,
                succeeded: false,
                log_index: self.log.last_index(),
            };
        }
        self.set_term(req.term);
        self.set_leader(Some(req.leader));

        if let Err(e) = self.append_entries(req.entries) {
            self.fatal(e);
            return SyncResponse {
                term: self.term,
                succeeded: false,
                log_index: self.log.last_index(),
            };
        }
        let last = self.log.last_index();
        self.set_commit_index(req.commit_index.min(last));
        self.set_global_index(req.global_index);

        self.passive_caught_up_check();
        SyncResponse {
            term: self.term,
            succeeded: true,
            log_index: last,
        }
    }

    /// Places a batch of entries, truncating a divergent suffix and filling
    /// compaction gaps with holes.
    fn append_entries(&mut self, entries: Vec<Entry>) -> std::result::Result<(), Error> {
        for entry in entries {
            let next = self.log.next_index();
            if entry.index < next {
                match self.log.term_of(entry.index) {
                    Some(term) if term != entry.term => {
                        if entry.index <= self.commit_index {
                            return Err(Error::Corruption(format!(
                                "divergence at committed index {}",
                                entry.index
                            )));
                        }
                        self.log.truncate(entry.index - 1).map_err(Error::from)?;
                        self.log.append(entry).map_err(Error::from)?;
                    }
                    // Same entry already present, or a compacted hole.
                    Some(_) | None => {}
                }
            } else {
                if entry.index > next {
                    self.log.skip_until(entry.index).map_err(Error::from)?;
                }
                self.log.append(entry).map_err(Error::from)?;
            }
        }
        Ok(())
    }

    // ---- voting ----------------------------------------------------------

    pub(crate) fn handle_vote(&mut self, req: VoteRequest) -> Result<VoteResponse> {
        if req.term > self.term {
            self.set_term(req.term);
            if matches!(self.role.kind(), RoleKind::Candidate | RoleKind::Leader) {
                self.transition(RoleKind::Follower);
            }
        }
        if !self.cluster.is_active() {
            return Err(Error::IllegalState("not a voting member".into()));
        }

        let granted = self.decide_vote(&req);
        if granted {
            self.voted_for = Some(req.candidate);
            tracing::debug!("{} - Voted for {}", self.member.id, req.candidate);
            let deadline = self.random_election_deadline();
            if let Role::Follower(follower) = &mut self.role {
                follower.deadline = deadline;
                follower.poll_votes = None;
            }
        } else {
            tracing::debug!(
                "{} - Rejected vote for {} in term {}",
                self.member.id,
                req.candidate,
                req.term
            );
        }
        Ok(VoteResponse {
            term: self.term,
            granted,
        })
    }

    fn decide_vote(&self, req: &VoteRequest) -> bool {
        if req.term < self.term {
            return false;
        }
        // One vote per term, and never against a known leader.
        if self.leader.is_some() {
            return false;
        }
        if !self
            .cluster
            .active_members()
            .iter()
            .any(|m| m.id == req.candidate)
        {
            return false;
        }
        if let Some(voted_for) = self.voted_for {
            return voted_for == req.candidate;
        }
        self.log_up_to_date(req.last_log_term, req.last_log_index)
    }

    pub(crate) fn handle_poll(&mut self, req: PollRequest) -> Result<PollResponse> {
        if req.term > self.term {
            self.set_term(req.term);
            if matches!(self.role.kind(), RoleKind::Candidate | RoleKind::Leader) {
                self.transition(RoleKind::Follower);
            }
        }
        if !self.cluster.is_active() {
            return Err(Error::IllegalState("not a voting member".into()));
        }
        let accepted =
            req.term >= self.term && self.log_up_to_date(req.last_log_term, req.last_log_index);
        Ok(PollResponse {
            term: self.term,
            accepted,
        })
    }

    pub(crate) fn log_up_to_date(&self, last_term: Term, last_index: Index) -> bool {
        (last_term, last_index) >= (self.log.last_term(), self.log.last_index())
    }

    /// Storage failure: the server goes terminal.
    pub(crate) fn fatal(&mut self, error: Error) {
        tracing::error!("{} - Fatal error: {}", self.member.id, error);
        self.closing = true;
        self.transition(RoleKind::Inactive);
    }

    /// Runs a query against local applied state, for passive members and
    /// parked-query release.
    pub(crate) fn passive_query(&mut self, req: protocol::QueryRequest, reply: ReplySender) {
        let Some(session) = self.sessions.get(req.session) else {
            let _ = reply.send(Err(Error::UnknownSession(req.session)));
            return;
        };
        let query = LeaderQuery {
            session: req.session,
            sequence: req.sequence,
            operation: req.operation,
            timestamp: session.timestamp,
            reply,
        };
        self.run_query(query);
    }

    /// Sequence-gates a query and hands it to the state-machine context.
    pub(crate) fn run_query(&mut self, query: LeaderQuery) {
        let Some(session) = self.sessions.get_mut(query.session) else {
            let _ = query.reply.send(Err(Error::UnknownSession(query.session)));
            return;
        };
        if query.sequence > session.command_version() {
            session.park_query(
                query.sequence,
                crate::session::ParkedQuery {
                    operation: query.operation,
                    timestamp: query.timestamp,
                    reply: query.reply,
                },
            );
            return;
        }
        let index = self.last_applied.max(self.commit_index.min(self.log.last_index()));
        let commit = crate::state_machine::Commit::new(
            index,
            query.timestamp,
            self.session_handle(query.session),
            query.operation,
        );
        let _ = self
            .applier_tx
            .send(crate::state_machine::ApplyMsg::Query {
                index,
                commit,
                reply: query.reply,
            });
    }
}
