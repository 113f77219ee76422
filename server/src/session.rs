//! Server-side session state.
//!
//! Sessions give clients at-most-once command semantics and ordered event
//! delivery. Each session is keyed by the index of the Register entry that
//! created it and lives in lockstep with the log: every server applying the
//! same entries derives the same session table. Liveness is judged against
//! entry timestamps (log time), so expiration is deterministic too.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use protocol::{Connection, ConnectionId, Error, ReplySender};
use storage::{Index, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Open,
    Closed,
    Expired,
}

/// A query parked until its session's command sequence catches up.
pub(crate) struct ParkedQuery {
    pub operation: Bytes,
    pub timestamp: i64,
    pub reply: ReplySender,
}

pub(crate) struct Session {
    pub id: SessionId,
    /// Connection the session currently publishes events through.
    pub connection: ConnectionId,
    /// Last log index that touched this session.
    pub index: Index,
    /// Last observed leader-clock timestamp.
    pub timestamp: i64,
    command_version: u64,
    command_low_water: u64,
    event_version: u64,
    event_low_water: u64,
    queries: BTreeMap<u64, Vec<ParkedQuery>>,
    responses: HashMap<u64, Result<Bytes, Error>>,
    /// Replies for duplicate commands whose original is still applying.
    waiters: HashMap<u64, Vec<ReplySender>>,
    events: BTreeMap<u64, Bytes>,
    state: SessionState,
}

impl Session {
    fn new(id: SessionId, connection: ConnectionId, timestamp: i64) -> Self {
        Self {
            id,
            connection,
            index: id,
            timestamp,
            command_version: 0,
            command_low_water: 0,
            event_version: 0,
            event_low_water: 0,
            queries: BTreeMap::new(),
            responses: HashMap::new(),
            waiters: HashMap::new(),
            events: BTreeMap::new(),
            state: SessionState::Open,
        }
    }

    pub(crate) fn command_version(&self) -> u64 {
        self.command_version
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Advances the command version, draining queries that were waiting for
    /// any sequence up to `version`. The caller runs the drained queries.
    pub(crate) fn set_command_version(&mut self, version: u64) -> Vec<ParkedQuery> {
        let mut released = Vec::new();
        while self.command_version < version {
            self.command_version += 1;
            if let Some(queries) = self.queries.remove(&self.command_version) {
                released.extend(queries);
            }
        }
        released
    }

    /// Drops cached responses at or below `sequence`, the client's ack.
    pub(crate) fn clear_commands(&mut self, sequence: u64) {
        while self.command_low_water < sequence {
            self.command_low_water += 1;
            self.responses.remove(&self.command_low_water);
        }
    }

    pub(crate) fn register_response(&mut self, sequence: u64, response: Result<Bytes, Error>) {
        if sequence > self.command_low_water {
            self.responses.insert(sequence, response);
        }
    }

    pub(crate) fn response(&self, sequence: u64) -> Option<&Result<Bytes, Error>> {
        self.responses.get(&sequence)
    }

    pub(crate) fn park_query(&mut self, sequence: u64, query: ParkedQuery) {
        self.queries.entry(sequence).or_default().push(query);
    }

    pub(crate) fn park_waiter(&mut self, sequence: u64, reply: ReplySender) {
        self.waiters.entry(sequence).or_default().push(reply);
    }

    pub(crate) fn take_waiters(&mut self, sequence: u64) -> Vec<ReplySender> {
        self.waiters.remove(&sequence).unwrap_or_default()
    }

    /// Buffers an event and assigns its sequence number.
    pub(crate) fn publish(&mut self, message: Bytes) -> u64 {
        self.event_version += 1;
        self.events.insert(self.event_version, message);
        self.event_version
    }

    /// Drops buffered events at or below the client's ack.
    pub(crate) fn clear_events(&mut self, sequence: u64) {
        while self.event_low_water < sequence.min(self.event_version) {
            self.event_low_water += 1;
            self.events.remove(&self.event_low_water);
        }
    }

    /// Buffered events above `sequence`, in order, for redelivery.
    pub(crate) fn events_after(&self, sequence: u64) -> Vec<(u64, Bytes)> {
        self.events
            .range(sequence + 1..)
            .map(|(seq, message)| (*seq, message.clone()))
            .collect()
    }

    /// Fails everything parked on this session when it dies.
    fn drain(&mut self, error: Error) {
        for (_, queries) in std::mem::take(&mut self.queries) {
            for query in queries {
                let _ = query.reply.send(Err(error.clone()));
            }
        }
        for (_, waiters) in std::mem::take(&mut self.waiters) {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }
}

pub(crate) struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    connections: HashMap<ConnectionId, Arc<dyn Connection>>,
}

impl SessionManager {
    pub(crate) fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    pub(crate) fn register_connection(&mut self, connection: Arc<dyn Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub(crate) fn unregister_connection(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub(crate) fn register_session(
        &mut self,
        id: SessionId,
        connection: ConnectionId,
        timestamp: i64,
    ) -> &mut Session {
        self.sessions
            .entry(id)
            .or_insert_with(|| Session::new(id, connection, timestamp))
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Points the session's event delivery at a (possibly new) connection.
    /// Clients rebind on every Register and KeepAlive so events follow them
    /// across reconnects.
    pub(crate) fn rebind(&mut self, id: SessionId, connection: ConnectionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.connection = connection;
        }
    }

    /// The live connection a session publishes through, if any.
    pub(crate) fn connection_for(&self, id: SessionId) -> Option<Arc<dyn Connection>> {
        let session = self.sessions.get(&id)?;
        self.connections.get(&session.connection).cloned()
    }

    /// Removes and returns a session, failing its parked work.
    pub(crate) fn remove(&mut self, id: SessionId, state: SessionState) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        session.state = state;
        let error = match state {
            SessionState::Expired => Error::SessionExpired(id),
            _ => Error::UnknownSession(id),
        };
        session.drain(error);
        Some(session)
    }

    pub(crate) fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Sessions whose last observed timestamp is too far behind log time.
    /// `now` is the timestamp of the entry being applied.
    pub(crate) fn stale_sessions(&self, now: i64, timeout_millis: i64) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| now - timeout_millis > s.timestamp)
            .map(|s| s.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_session(manager: &mut SessionManager, id: SessionId) -> &mut Session {
        manager.register_session(id, 100 + id, 0)
    }

    #[test]
    fn should_replay_cached_response_without_reapplying() {
        // given
        let mut manager = SessionManager::new();
        let session = open_session(&mut manager, 2);
        session.set_command_version(1);
        session.register_response(1, Ok(Bytes::from_static(b"result")));

        // then
        assert_eq!(
            session.response(1),
            Some(&Ok(Bytes::from_static(b"result")))
        );
    }

    #[test]
    fn should_drop_responses_below_the_low_water_mark() {
        // given
        let mut manager = SessionManager::new();
        let session = open_session(&mut manager, 2);
        for seq in 1..=3 {
            session.set_command_version(seq);
            session.register_response(seq, Ok(Bytes::from_static(b"r")));
        }

        // when: the client acknowledges sequence 2
        session.clear_commands(2);

        // then
        assert!(session.response(1).is_none());
        assert!(session.response(2).is_none());
        assert!(session.response(3).is_some());

        // and late registrations below the mark are ignored
        session.register_response(1, Ok(Bytes::from_static(b"stale")));
        assert!(session.response(1).is_none());
    }

    #[test]
    fn should_release_parked_queries_when_version_advances() {
        // given
        let mut manager = SessionManager::new();
        let session = open_session(&mut manager, 2);
        let (tx, _rx) = tokio::sync::oneshot::channel();
        session.park_query(
            3,
            ParkedQuery {
                operation: Bytes::from_static(b"GET"),
                timestamp: 0,
                reply: tx,
            },
        );

        // when: version advances past the parked sequence
        let released_early = session.set_command_version(2);
        let released = session.set_command_version(3);

        // then
        assert!(released_early.is_empty());
        assert_eq!(released.len(), 1);
    }

    #[test]
    fn should_buffer_events_in_sequence_order() {
        // given
        let mut manager = SessionManager::new();
        let session = open_session(&mut manager, 2);

        // when
        let first = session.publish(Bytes::from_static(b"a"));
        let second = session.publish(Bytes::from_static(b"b"));
        let third = session.publish(Bytes::from_static(b"c"));

        // then
        assert_eq!((first, second, third), (1, 2, 3));
        let pending: Vec<u64> = session.events_after(1).iter().map(|(s, _)| *s).collect();
        assert_eq!(pending, vec![2, 3]);

        // and acknowledged events are dropped
        session.clear_events(2);
        let pending: Vec<u64> = session.events_after(0).iter().map(|(s, _)| *s).collect();
        assert_eq!(pending, vec![3]);
    }

    #[test]
    fn should_find_stale_sessions_by_log_time() {
        // given: sessions registered at t=0 and t=4000
        let mut manager = SessionManager::new();
        open_session(&mut manager, 2);
        manager.register_session(3, 103, 4000);

        // when: an entry with timestamp 5001 applies under a 5s timeout
        let stale = manager.stale_sessions(5001, 5000);

        // then: only the t=0 session is stale
        assert_eq!(stale, vec![2]);
    }

    #[test]
    fn should_fail_parked_work_on_expiration() {
        // given
        let mut manager = SessionManager::new();
        let session = open_session(&mut manager, 2);
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        session.park_waiter(1, tx);

        // when
        let removed = manager.remove(2, SessionState::Expired);

        // then
        assert!(removed.is_some());
        assert!(matches!(rx.try_recv(), Ok(Err(Error::SessionExpired(2)))));
        assert!(!manager.contains(2));
    }
}
