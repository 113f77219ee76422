//! Passive: replicates without voting.
//!
//! Passive members receive Sync batches, apply committed entries, and may
//! answer sequential queries from local state. A server that was configured
//! active but admitted as passive promotes itself once it has applied
//! everything it knows to be committed.

use common::MemberKind;
use protocol::Request;
use tokio::time::Instant;

use crate::context::{ConfigOp, Event, ServerContext};
use crate::roles::Role;

impl ServerContext {
    /// Promote-retry timer.
    pub(crate) fn passive_timeout(&mut self) {
        let deadline = Instant::now() + self.config.election_timeout;
        if let Role::Passive(passive) = &mut self.role {
            passive.promote_deadline = deadline;
        } else {
            return;
        }
        self.passive_caught_up_check();
    }

    /// Sends a promote request when this server wants to vote and has
    /// caught up with the committed log.
    pub(crate) fn passive_caught_up_check(&mut self) {
        if !matches!(self.role, Role::Passive(_)) {
            return;
        }
        if self.member.kind != MemberKind::Active || !self.cluster.is_passive() {
            return;
        }
        let caught_up = self.commit_index > 0 && self.last_applied >= self.commit_index;
        if !caught_up {
            return;
        }

        let Some(leader) = self.leader.filter(|l| *l != self.member.id) else {
            return;
        };
        let Some(address) = self.cluster.address_of(leader) else {
            return;
        };
        tracing::info!(
            "{} - Caught up to {}, requesting promotion",
            self.member.id,
            self.commit_index
        );
        let request = Request::Promote(protocol::ConfigureRequest {
            member: self.member.clone(),
        });
        let connections = self.connections.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = connections
                .send_to(&address, request)
                .await
                .and_then(|r| r.into_configure());
            let _ = events.send(Event::ConfigureReply {
                op: ConfigOp::Promote,
                result,
            });
        });
    }
}
