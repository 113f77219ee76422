//! Leader: replication, commitment, and the client-facing write path.
//!
//! The leader appends a NoOp on election (the current-term entry that lets
//! prior-term entries commit indirectly), batches appends per peer with one
//! request in flight at a time, and walks `next_index` back on rejection.
//! Passive members are replicated through Sync requests and never counted
//! in the quorum. Heartbeat broadcasts double as leadership proofs: a
//! linearizable query is released once the round started at or after its
//! arrival is acknowledged by a quorum.

use bytes::Bytes;
use common::{Member, MemberId, MemberKind};
use protocol::{
    AppendRequest, AppendResponse, CommandRequest, ConfigureResponse, Consistency, Error,
    KeepAliveRequest, QueryRequest, RegisterRequest, ReplySender, Request, Response, Result,
    SyncRequest, SyncResponse,
};
use storage::{Entry, Index, Record, SessionId, Term};
use tokio::time::Instant;

use crate::context::{ConfigOp, Event, PendingReply, ServerContext};
use crate::roles::{Role, RoleKind};

/// Upper bound on entries per replication batch.
const MAX_BATCH_ENTRIES: usize = 128;

/// A client query making its way through the leader's gates.
pub(crate) struct LeaderQuery {
    pub session: SessionId,
    pub sequence: u64,
    pub operation: Bytes,
    pub timestamp: i64,
    pub reply: ReplySender,
}

impl ServerContext {
    pub(crate) fn open_leader(&mut self) {
        self.set_leader(Some(self.member.id));
        self.cluster.reset_replication(self.log.next_index());

        let noop = Entry::new(self.log.next_index(), self.term, Record::NoOp);
        if let Err(e) = self.log.append(noop) {
            self.fatal(e.into());
            return;
        }
        tracing::info!("{} - Elected leader for term {}", self.member.id, self.term);

        self.leader_broadcast();
        self.leader_advance_commit();
    }

    pub(crate) fn leader_heartbeat_timeout(&mut self) {
        let next = Instant::now() + self.config.heartbeat_interval;
        if let Role::Leader(leader) = &mut self.role {
            leader.next_heartbeat = next;
        } else {
            return;
        }
        self.leader_broadcast();
    }

    /// Starts a new round and pushes state to every peer.
    pub(crate) fn leader_broadcast(&mut self) {
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        leader.round += 1;

        for peer in self.cluster.remote_active_ids() {
            self.replicate_to(peer);
        }
        for peer in self.cluster.remote_passive_ids() {
            self.sync_to(peer);
        }
        // A single-server cluster confirms rounds by itself.
        self.release_linearizable();
    }

    fn replicate_to(&mut self, peer: MemberId) {
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        if !leader.replicating.insert(peer) {
            return;
        }
        let round = leader.round;

        let Some(state) = self.cluster.state(peer) else {
            if let Role::Leader(leader) = &mut self.role {
                leader.replicating.remove(&peer);
            }
            return;
        };
        let next = state.next_index.max(1);
        let prev = next - 1;
        let prev_term = if prev == 0 {
            0
        } else {
            self.log.term_of(prev).unwrap_or(0)
        };
        let entries = self.log.entries_from(next, MAX_BATCH_ENTRIES);
        let up_to = entries.last().map(|e| e.index).unwrap_or(prev);
        let request = AppendRequest {
            term: self.term,
            leader: self.member.id,
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            commit_index: self.commit_index,
            global_index: self.global_index,
        };

        let Some(address) = self.cluster.address_of(peer) else {
            if let Role::Leader(leader) = &mut self.role {
                leader.replicating.remove(&peer);
            }
            return;
        };
        let connections = self.connections.clone();
        let events = self.events_tx.clone();
        let term = self.term;
        tokio::spawn(async move {
            let result = connections
                .send_to(&address, Request::Append(request))
                .await
                .and_then(|r| r.into_append());
            let _ = events.send(Event::AppendReply {
                peer,
                term,
                round,
                up_to,
                result,
            });
        });
    }

    pub(crate) fn on_append_reply(
        &mut self,
        peer: MemberId,
        term: Term,
        round: u64,
        up_to: Index,
        result: Result<AppendResponse>,
    ) {
        if let Role::Leader(leader) = &mut self.role {
            leader.replicating.remove(&peer);
        } else {
            return;
        }
        if term != self.term {
            return;
        }

        match result {
            Ok(response) if response.term > self.term => {
                self.set_term(response.term);
                self.transition(RoleKind::Follower);
            }
            Ok(response) if response.succeeded => {
                if let Some(state) = self.cluster.state_mut(peer) {
                    state.match_index = state.match_index.max(up_to);
                    state.next_index = state.match_index + 1;
                }
                if let Role::Leader(leader) = &mut self.role {
                    let acked = leader.round_acks.entry(peer).or_insert(0);
                    *acked = (*acked).max(round);
                }
                self.leader_advance_commit();
                self.leader_advance_global();
                self.release_linearizable();

                let behind = self
                    .cluster
                    .state(peer)
                    .is_some_and(|s| s.next_index <= self.log.last_index());
                if behind {
                    self.replicate_to(peer);
                }
            }
            Ok(response) => {
                // Consistency check failed: walk next_index back, guided by
                // the replica's hint.
                if let Some(state) = self.cluster.state_mut(peer) {
                    let walk_back = state.next_index.saturating_sub(1).max(1);
                    state.next_index = walk_back.min(response.log_index + 1).max(1);
                }
                self.replicate_to(peer);
            }
            Err(e) => {
                tracing::debug!("{} - Append to {} failed: {}", self.member.id, peer, e);
            }
        }
    }

    fn sync_to(&mut self, peer: MemberId) {
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        if !leader.replicating.insert(peer) {
            return;
        }
        let Some(state) = self.cluster.state(peer) else {
            if let Role::Leader(leader) = &mut self.role {
                leader.replicating.remove(&peer);
            }
            return;
        };
        let next = state.next_index.max(1);
        let entries = self.log.entries_from(next, MAX_BATCH_ENTRIES);
        let up_to = entries.last().map(|e| e.index).unwrap_or(next - 1);
        let request = SyncRequest {
            term: self.term,
            leader: self.member.id,
            entries,
            commit_index: self.commit_index,
            global_index: self.global_index,
        };
        let Some(address) = self.cluster.address_of(peer) else {
            if let Role::Leader(leader) = &mut self.role {
                leader.replicating.remove(&peer);
            }
            return;
        };
        let connections = self.connections.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = connections
                .send_to(&address, Request::Sync(request))
                .await
                .and_then(|r| r.into_sync());
            let _ = events.send(Event::SyncReply {
                peer,
                up_to,
                result,
            });
        });
    }

    pub(crate) fn on_sync_reply(
        &mut self,
        peer: MemberId,
        up_to: Index,
        result: Result<SyncResponse>,
    ) {
        if let Role::Leader(leader) = &mut self.role {
            leader.replicating.remove(&peer);
        } else {
            return;
        }
        match result {
            Ok(response) if response.succeeded => {
                if let Some(state) = self.cluster.state_mut(peer) {
                    state.match_index = state.match_index.max(up_to);
                    state.next_index = state.match_index + 1;
                }
                let behind = self
                    .cluster
                    .state(peer)
                    .is_some_and(|s| s.next_index <= self.log.last_index());
                if behind {
                    self.sync_to(peer);
                }
            }
            Ok(response) => {
                if response.term > self.term {
                    self.set_term(response.term);
                    self.transition(RoleKind::Follower);
                }
            }
            Err(e) => {
                tracing::debug!("{} - Sync to {} failed: {}", self.member.id, peer, e);
            }
        }
    }

    /// Commit rule: the highest index replicated on a quorum of active
    /// members whose entry carries the current term. Prior-term entries
    /// commit indirectly through it.
    pub(crate) fn leader_advance_commit(&mut self) {
        if !matches!(self.role, Role::Leader(_)) {
            return;
        }
        let mut matches = self.cluster.active_match_indexes();
        if self.cluster.is_active() {
            matches.push(self.log.last_index());
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.cluster.quorum();
        if matches.len() < quorum {
            return;
        }
        let candidate = matches[quorum - 1];
        if candidate > self.commit_index && self.log.term_of(candidate) == Some(self.term) {
            self.set_commit_index(candidate);
        }
    }

    /// The global index is the highest index replicated on *every* active
    /// member; it gates major compaction.
    fn leader_advance_global(&mut self) {
        let mut min = self.log.last_index();
        for match_index in self.cluster.active_match_indexes() {
            min = min.min(match_index);
        }
        self.set_global_index(min);
    }

    fn release_linearizable(&mut self) {
        let quorum = self.cluster.quorum();
        let ready = {
            let Role::Leader(leader) = &mut self.role else {
                return;
            };
            let mut rounds: Vec<u64> = leader.round_acks.values().copied().collect();
            rounds.push(leader.round);
            rounds.sort_unstable_by(|a, b| b.cmp(a));
            if rounds.len() < quorum {
                return;
            }
            let confirmed = rounds[quorum - 1];
            let mut ready = Vec::new();
            let mut waiting = Vec::new();
            for (required, query) in leader.pending_linear.drain(..) {
                if required <= confirmed {
                    ready.push(query);
                } else {
                    waiting.push((required, query));
                }
            }
            leader.pending_linear = waiting;
            ready
        };
        for query in ready {
            self.run_query(query);
        }
    }

    // ---- client operations ----------------------------------------------

    pub(crate) fn leader_register(&mut self, req: RegisterRequest, reply: ReplySender) {
        let timestamp = self.config.clock.unix_millis();
        let index = self.log.next_index();
        let entry = Entry::new(
            index,
            self.term,
            Record::Register {
                connection: req.connection,
                timestamp,
            },
        );
        if let Err(e) = self.log.append(entry) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        self.pending.insert(index, PendingReply::Register(reply));
        self.leader_broadcast();
        self.leader_advance_commit();
    }

    pub(crate) fn leader_keep_alive(
        &mut self,
        connection: u64,
        req: KeepAliveRequest,
        reply: ReplySender,
    ) {
        // Event acknowledgment and connection rebinding are local to the
        // server holding the client's connection; only the command ack is
        // replicated.
        self.sessions.rebind(req.session, connection);
        if let Some(session) = self.sessions.get_mut(req.session) {
            session.clear_events(req.event_sequence);
        }

        let timestamp = self.config.clock.unix_millis();
        let index = self.log.next_index();
        let entry = Entry::new(
            index,
            self.term,
            Record::KeepAlive {
                session: req.session,
                command_sequence: req.command_sequence,
                timestamp,
            },
        );
        if let Err(e) = self.log.append(entry) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        self.pending.insert(index, PendingReply::KeepAlive(reply));
        self.leader_broadcast();
        self.leader_advance_commit();
    }

    pub(crate) fn leader_command(&mut self, req: CommandRequest, reply: ReplySender) {
        let timestamp = self.config.clock.unix_millis();
        let index = self.log.next_index();
        let entry = Entry::new(
            index,
            self.term,
            Record::Command {
                session: req.session,
                sequence: req.sequence,
                timestamp,
                operation: req.operation,
            },
        );
        if let Err(e) = self.log.append(entry) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        self.pending.insert(index, PendingReply::Command(reply));
        self.leader_broadcast();
        self.leader_advance_commit();
    }

    pub(crate) fn leader_query(&mut self, req: QueryRequest, reply: ReplySender) {
        let query = LeaderQuery {
            session: req.session,
            sequence: req.sequence,
            operation: req.operation,
            timestamp: self.config.clock.unix_millis(),
            reply,
        };
        match req.consistency {
            Consistency::Sequential => self.run_query(query),
            Consistency::Linearizable => {
                let Role::Leader(leader) = &mut self.role else {
                    let _ = query.reply.send(Err(Error::NoLeader));
                    return;
                };
                // Released once the *next* round is quorum-acknowledged.
                let required = leader.round + 1;
                leader.pending_linear.push((required, query));
                self.leader_broadcast();
            }
        }
    }

    // ---- membership -----------------------------------------------------

    /// Drives a membership change through the log. At most one
    /// configuration may be uncommitted at a time; later changes queue.
    pub(crate) fn leader_configure(
        &mut self,
        op: ConfigOp,
        member: Member,
        reply: Option<ReplySender>,
    ) {
        let Role::Leader(leader) = &mut self.role else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::NoLeader));
            }
            return;
        };
        if leader.pending_config.is_some() {
            leader.queued_configs.push_back((op, member, reply));
            return;
        }

        let mut active = self.cluster.active_members();
        let mut passive = self.cluster.passive_members();
        let in_active = active.iter().any(|m| m.id == member.id);
        let in_passive = passive.iter().any(|m| m.id == member.id);

        let unchanged = match op {
            ConfigOp::Join => {
                if in_active || in_passive {
                    true
                } else {
                    // New servers always join passive and catch up before
                    // they can vote.
                    let mut joining = member.clone();
                    joining.kind = MemberKind::Passive;
                    passive.push(joining);
                    false
                }
            }
            ConfigOp::Leave => {
                if !in_active && !in_passive {
                    true
                } else {
                    active.retain(|m| m.id != member.id);
                    passive.retain(|m| m.id != member.id);
                    false
                }
            }
            ConfigOp::Promote => {
                if in_active {
                    true
                } else if !in_passive {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(Error::IllegalArgument(format!(
                            "member {} is not in the cluster",
                            member.id
                        ))));
                    }
                    return;
                } else {
                    passive.retain(|m| m.id != member.id);
                    let mut promoted = member.clone();
                    promoted.kind = MemberKind::Active;
                    active.push(promoted);
                    false
                }
            }
            ConfigOp::Demote => {
                if in_passive {
                    true
                } else if !in_active {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(Error::IllegalArgument(format!(
                            "member {} is not in the cluster",
                            member.id
                        ))));
                    }
                    return;
                } else {
                    active.retain(|m| m.id != member.id);
                    let mut demoted = member.clone();
                    demoted.kind = MemberKind::Passive;
                    passive.push(demoted);
                    false
                }
            }
        };

        if unchanged {
            if let Some(reply) = reply {
                let response = ConfigureResponse {
                    version: self.cluster.version(),
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
            return;
        }

        let index = self.log.next_index();
        let entry = Entry::new(index, self.term, Record::Configuration { active, passive });
        if let Err(e) = self.log.append(entry) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(e.into()));
            }
            return;
        }
        tracing::info!(
            "{} - Appended configuration change {:?} for member {} at {}",
            self.member.id,
            op,
            member.id,
            index
        );
        if let Role::Leader(leader) = &mut self.role {
            leader.pending_config = Some(index);
        }
        self.pending
            .insert(index, PendingReply::Configure { op, reply });
        self.leader_broadcast();
        self.leader_advance_commit();
    }

    /// Called after a configuration entry applies: releases the pending
    /// slot and starts the next queued change, if any.
    pub(crate) fn leader_next_configuration(&mut self, applied_index: Index) {
        let next = {
            let Role::Leader(leader) = &mut self.role else {
                return;
            };
            if leader.pending_config == Some(applied_index) {
                leader.pending_config = None;
            }
            if leader.pending_config.is_some() {
                None
            } else {
                leader.queued_configs.pop_front()
            }
        };
        if let Some((op, member, reply)) = next {
            self.leader_configure(op, member, reply);
        }
    }
}
