//! The user state machine contract and its execution context.
//!
//! User code never runs on the consensus loop. A dedicated applier task
//! owns the [`StateMachine`] and processes an ordered queue of messages:
//! one apply per committed entry that needs the state machine, plus session
//! lifecycle hooks and compaction filter checks. Outcomes return to the
//! consensus loop as events, so a slow `apply` delays commitment
//! acknowledgment but never heartbeats or elections.

use async_trait::async_trait;
use bytes::Bytes;
use protocol::{Error, QueryResponse, ReplySender, Response};
use storage::{Compaction, Index, SessionId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::context::Event;

/// A committed operation handed to the state machine.
pub struct Commit {
    pub index: Index,
    /// Leader-clock timestamp of the entry; the state machine's only legal
    /// source of time.
    pub timestamp: i64,
    session: SessionHandle,
    pub operation: Bytes,
}

impl Commit {
    pub(crate) fn new(
        index: Index,
        timestamp: i64,
        session: SessionHandle,
        operation: Bytes,
    ) -> Self {
        Self {
            index,
            timestamp,
            session,
            operation,
        }
    }

    /// The session that submitted this operation.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }
}

/// The state machine's view of a session: an id plus the ability to push
/// events to the client. Event sequencing, buffering, and redelivery happen
/// on the consensus loop; publishing never blocks user code.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    events: mpsc::UnboundedSender<Event>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Publishes an event to the session's client, at-least-once, in
    /// publication order.
    pub fn publish(&self, message: Bytes) {
        let _ = self.events.send(Event::Publish {
            session: self.id,
            message,
        });
    }
}

/// The replicated application.
///
/// `apply` receives every committed command and query, in log order for
/// commands. Errors returned from `apply` become the command's result (and
/// are replayed to duplicates); they never disturb consensus. `filter`
/// decides whether a committed command still contributes to current state;
/// entries it rejects disappear at the next compaction pass.
#[async_trait]
pub trait StateMachine: Send + 'static {
    async fn apply(&mut self, commit: Commit) -> Result<Bytes, Error>;

    async fn filter(&self, commit: Commit, compaction: &Compaction) -> bool;

    /// A session was registered.
    fn register(&mut self, _session: &SessionHandle) {}

    /// A session timed out.
    fn expire(&mut self, _session: &SessionHandle) {}

    /// A session was closed by its client.
    fn close(&mut self, _session: &SessionHandle) {}
}

/// Work items for the applier task, processed strictly in order.
pub(crate) enum ApplyMsg {
    Command {
        index: Index,
        session: SessionId,
        sequence: u64,
        commit: Commit,
    },
    Query {
        index: Index,
        commit: Commit,
        reply: ReplySender,
    },
    Register {
        index: Index,
        session: SessionHandle,
    },
    Expire {
        session: SessionHandle,
    },
    Close {
        session: SessionHandle,
    },
    Filter {
        commit: Commit,
        compaction: Compaction,
        reply: oneshot::Sender<bool>,
    },
}

/// Runs the state machine context until the queue closes.
pub(crate) fn spawn_applier(
    mut state_machine: Box<dyn StateMachine>,
    mut queue: mpsc::UnboundedReceiver<ApplyMsg>,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = queue.recv().await {
            match msg {
                ApplyMsg::Command {
                    index,
                    session,
                    sequence,
                    commit,
                } => {
                    let result = state_machine.apply(commit).await;
                    let _ = events.send(Event::Applied {
                        index,
                        session,
                        sequence,
                        result: Some(result),
                    });
                }
                ApplyMsg::Query {
                    index,
                    commit,
                    reply,
                } => {
                    let result = state_machine.apply(commit).await;
                    let _ = reply.send(
                        result.map(|result| Response::Query(QueryResponse { index, result })),
                    );
                }
                ApplyMsg::Register { index, session } => {
                    let id = session.id();
                    state_machine.register(&session);
                    let _ = events.send(Event::Applied {
                        index,
                        session: id,
                        sequence: 0,
                        result: None,
                    });
                }
                ApplyMsg::Expire { session } => state_machine.expire(&session),
                ApplyMsg::Close { session } => state_machine.close(&session),
                ApplyMsg::Filter {
                    commit,
                    compaction,
                    reply,
                } => {
                    let keep = state_machine.filter(commit, &compaction).await;
                    let _ = reply.send(keep);
                }
            }
        }
    })
}
