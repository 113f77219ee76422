//! Join: finds the cluster and gets admitted.
//!
//! A server whose identity already appears in the seeded configuration
//! (cluster bootstrap) transitions straight to its configured role. A new
//! server asks the leader (or any active member, round-robin) to add it;
//! the leader admits it as a passive member and the join response carries
//! the resulting configuration.

use protocol::{ConfigureRequest, ConfigureResponse, Request, Result};
use tokio::time::Instant;

use crate::context::{ConfigOp, Event, ServerContext};
use crate::roles::{Role, RoleKind};

impl ServerContext {
    pub(crate) fn join_timeout(&mut self) {
        if self.cluster.is_active() {
            self.transition(RoleKind::Follower);
            return;
        }
        if self.cluster.is_passive() {
            self.transition(RoleKind::Passive);
            return;
        }

        let retry = Instant::now() + self.config.election_timeout;
        let attempt = {
            let Role::Join(join) = &mut self.role else {
                return;
            };
            join.deadline = retry;
            let attempt = join.attempt;
            join.attempt += 1;
            attempt
        };

        let targets: Vec<String> = self
            .cluster
            .active_members()
            .iter()
            .filter(|m| m.id != self.member.id)
            .map(|m| m.address())
            .collect();
        if targets.is_empty() {
            tracing::warn!("{} - No members to join", self.member.id);
            return;
        }
        let address = self
            .leader
            .and_then(|l| self.cluster.address_of(l))
            .unwrap_or_else(|| targets[attempt % targets.len()].clone());

        tracing::debug!("{} - Sending join request to {}", self.member.id, address);
        let request = Request::Join(ConfigureRequest {
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
                op: ConfigOp::Join,
                result,
            });
        });
    }

    pub(crate) fn on_configure_reply(&mut self, op: ConfigOp, result: Result<ConfigureResponse>) {
        match op {
            ConfigOp::Join => {
                if !matches!(self.role, Role::Join(_)) {
                    return;
                }
                match result {
                    Ok(response) => {
                        self.cluster
                            .configure(response.version, response.active, response.passive);
                        self.role_follow_configuration();
                    }
                    Err(e) => {
                        tracing::debug!("{} - Join attempt failed: {}", self.member.id, e);
                    }
                }
            }
            ConfigOp::Leave => self.on_leave_reply(result),
            ConfigOp::Promote | ConfigOp::Demote => match result {
                Ok(response) => {
                    self.cluster
                        .configure(response.version, response.active, response.passive);
                    self.role_follow_configuration();
                }
                Err(e) => {
                    tracing::debug!("{} - {:?} request failed: {}", self.member.id, op, e);
                }
            },
        }
    }
}
