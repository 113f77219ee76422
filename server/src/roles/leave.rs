//! Leave: removes this server from the configuration before shutdown.

use protocol::{ConfigureRequest, ConfigureResponse, Request, Result};
use tokio::time::Instant;

use crate::context::{ConfigOp, Event, ServerContext};
use crate::roles::{Role, RoleKind};

const MAX_LEAVE_ATTEMPTS: usize = 3;

impl ServerContext {
    pub(crate) fn leave_timeout(&mut self) {
        if !self.cluster.is_member() {
            self.transition(RoleKind::Inactive);
            return;
        }

        if matches!(&self.role, Role::Leave(l) if l.attempt >= MAX_LEAVE_ATTEMPTS) {
            tracing::warn!(
                "{} - Could not leave cleanly after {} attempts, closing anyway",
                self.member.id,
                MAX_LEAVE_ATTEMPTS
            );
            self.transition(RoleKind::Inactive);
            return;
        }
        let retry = Instant::now() + self.config.election_timeout;
        let attempt = {
            let Role::Leave(leave) = &mut self.role else {
                return;
            };
            leave.deadline = retry;
            let attempt = leave.attempt;
            leave.attempt += 1;
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
            // A sole member has no one to ask.
            self.transition(RoleKind::Inactive);
            return;
        }
        let address = self
            .leader
            .filter(|l| *l != self.member.id)
            .and_then(|l| self.cluster.address_of(l))
            .unwrap_or_else(|| targets[attempt % targets.len()].clone());

        tracing::debug!("{} - Sending leave request to {}", self.member.id, address);
        let request = Request::Leave(ConfigureRequest {
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
                op: ConfigOp::Leave,
                result,
            });
        });
    }

    pub(crate) fn on_leave_reply(&mut self, result: Result<ConfigureResponse>) {
        if !matches!(self.role, Role::Leave(_)) {
            return;
        }
        match result {
            Ok(response) => {
                self.cluster
                    .configure(response.version, response.active, response.passive);
                if !self.cluster.is_member() {
                    self.transition(RoleKind::Inactive);
                }
            }
            Err(e) => {
                tracing::debug!("{} - Leave attempt failed: {}", self.member.id, e);
            }
        }
    }
}
