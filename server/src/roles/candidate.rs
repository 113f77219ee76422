//! Candidate: drives one election round per timeout.

use std::collections::HashSet;

use common::MemberId;
use protocol::{Request, Result, VoteRequest, VoteResponse};
use storage::Term;

use crate::context::{Event, ServerContext};
use crate::roles::{Role, RoleKind};

impl ServerContext {
    /// Increments the term, votes for itself, and solicits the rest of the
    /// active members.
    pub(crate) fn start_election(&mut self) {
        self.set_term(self.term + 1);
        self.voted_for = Some(self.member.id);
        let deadline = self.random_election_deadline();
        let local = self.member.id;

        let Role::Candidate(candidate) = &mut self.role else {
            return;
        };
        candidate.deadline = deadline;
        candidate.votes = HashSet::from([local]);
        tracing::info!("{} - Starting election for term {}", local, self.term);

        if self.cluster.quorum() <= 1 {
            self.transition(RoleKind::Leader);
            return;
        }

        let request = VoteRequest {
            term: self.term,
            candidate: local,
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
                    .send_to(&address, Request::Vote(request))
                    .await
                    .and_then(|r| r.into_vote());
                let _ = events.send(Event::VoteReply { peer, term, result });
            });
        }
    }

    pub(crate) fn candidate_timeout(&mut self) {
        tracing::debug!(
            "{} - Election for term {} timed out, restarting",
            self.member.id,
            self.term
        );
        self.start_election();
    }

    pub(crate) fn on_vote_reply(
        &mut self,
        peer: MemberId,
        term: Term,
        result: Result<VoteResponse>,
    ) {
        if term != self.term || !matches!(self.role, Role::Candidate(_)) {
            return;
        }
        match result {
            Ok(response) if response.term > self.term => {
                self.set_term(response.term);
                self.transition(RoleKind::Follower);
            }
            Ok(response) if response.granted => {
                let quorum = self.cluster.quorum();
                let elected = match &mut self.role {
                    Role::Candidate(candidate) => {
                        candidate.votes.insert(peer);
                        candidate.votes.len() >= quorum
                    }
                    _ => false,
                };
                if elected {
                    self.transition(RoleKind::Leader);
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("{} - Vote request to {} failed: {}", self.member.id, peer, e);
            }
        }
    }
}
