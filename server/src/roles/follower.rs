//! Follower: waits on the leader, pre-votes when it goes quiet.
//!
//! The election timer is randomized in `[election_timeout,
//! 2 * election_timeout)` and reset by every valid append or granted vote.
//! When it fires, the follower does not immediately disrupt the cluster: it
//! first polls the active members (a pre-vote) and only becomes Candidate
//! once a majority indicate they would grant a vote at the next term.

use std::collections::HashSet;

use protocol::{PollRequest, PollResponse, Request, Result};
use common::MemberId;
use storage::Term;

use crate::context::{Event, ServerContext};
use crate::roles::{Role, RoleKind};

impl ServerContext {
    pub(crate) fn follower_timeout(&mut self) {
        if self.cluster.quorum() <= 1 {
            // Nobody to poll; stand for election immediately.
            self.transition(RoleKind::Candidate);
            return;
        }

        let deadline = self.random_election_deadline();
        let local = self.member.id;
        let Role::Follower(follower) = &mut self.role else {
            return;
        };
        follower.deadline = deadline;
        follower.poll_votes = Some(HashSet::from([local]));
        tracing::debug!("{} - Heard from no leader, polling members", local);

        // The leader is gone as far as this server is concerned.
        self.set_leader(None);
        self.send_polls();
    }

    fn send_polls(&mut self) {
        let request = PollRequest {
            term: self.term + 1,
            candidate: self.member.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let term = self.term;
        for peer in self.cluster.remote_active_ids() {
            let Some(address) = self.cluster.address_of(peer) else {
                continue;
            };
            let connections = self.connections.clone();
            let events = self.events_tx.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let result = connections
                    .send_to(&address, Request::Poll(request))
                    .await
                    .and_then(|r| r.into_poll());
                let _ = events.send(Event::PollReply { peer, term, result });
            });
        }
    }

    pub(crate) fn on_poll_reply(
        &mut self,
        peer: MemberId,
        term: Term,
        result: Result<PollResponse>,
    ) {
        // Stale round or the poll already resolved.
        if term != self.term || !matches!(self.role, Role::Follower(_)) {
            return;
        }
        match result {
            Ok(response) if response.accepted => {
                let quorum = self.cluster.quorum();
                let reached = match &mut self.role {
                    Role::Follower(follower) => match &mut follower.poll_votes {
                        Some(votes) => {
                            votes.insert(peer);
                            votes.len() >= quorum
                        }
                        None => false,
                    },
                    _ => false,
                };
                if reached {
                    self.transition(RoleKind::Candidate);
                }
            }
            Ok(response) => {
                if response.term > self.term {
                    self.set_term(response.term);
                }
            }
            Err(e) => {
                tracing::debug!("{} - Poll to {} failed: {}", self.member.id, peer, e);
            }
        }
    }
}
