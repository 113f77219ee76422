#![allow(dead_code)]

//! Shared harness for multi-node tests: an in-process cluster over
//! `LocalNetwork` with a key-value state machine that records applies and
//! session lifecycle calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::clock::Clock;
use common::{Member, MemberKind};
use protocol::{Error, LocalNetwork};
use server::{Commit, RaftServer, ServerConfig, ServerStatus, SessionHandle, State, StateMachine};
use storage::{Compaction, SessionId, StorageConfig};
use tempfile::TempDir;

/// Observes what the state machine was asked to do.
#[derive(Clone, Default)]
pub struct Recorder {
    applied: Arc<Mutex<Vec<String>>>,
    expired: Arc<Mutex<Vec<SessionId>>>,
}

impl Recorder {
    pub fn applied_ops(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn applied_count(&self, op: &str) -> usize {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.as_str() == op)
            .count()
    }

    pub fn expired_sessions(&self) -> Vec<SessionId> {
        self.expired.lock().unwrap().clone()
    }
}

/// Text-protocol key-value store:
/// `PUT <key> <value>`, `GET <key>`, `EVENT <payload>`.
pub struct KvStateMachine {
    data: HashMap<String, String>,
    recorder: Recorder,
}

impl KvStateMachine {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            data: HashMap::new(),
            recorder,
        }
    }
}

#[async_trait]
impl StateMachine for KvStateMachine {
    async fn apply(&mut self, commit: Commit) -> Result<Bytes, Error> {
        let op = String::from_utf8(commit.operation.to_vec())
            .map_err(|e| Error::Application(e.to_string()))?;
        let parts: Vec<&str> = op.split_whitespace().collect();
        match parts.as_slice() {
            ["PUT", key, value] => {
                self.recorder.applied.lock().unwrap().push(op.clone());
                self.data.insert(key.to_string(), value.to_string());
                Ok(Bytes::from_static(b"OK"))
            }
            ["GET", key] => Ok(Bytes::from(
                self.data.get(*key).cloned().unwrap_or_default(),
            )),
            ["EVENT", payload] => {
                self.recorder.applied.lock().unwrap().push(op.clone());
                commit.session().publish(Bytes::from(payload.to_string()));
                Ok(Bytes::from_static(b"OK"))
            }
            _ => Err(Error::Application(format!("unknown operation: {}", op))),
        }
    }

    async fn filter(&self, commit: Commit, _compaction: &Compaction) -> bool {
        !commit.operation.as_ref().ends_with(b"noop")
    }

    fn expire(&mut self, session: &SessionHandle) {
        self.recorder.expired.lock().unwrap().push(session.id());
    }
}

pub fn member(id: u64) -> Member {
    Member::new(id, "node", 7000 + id as u16, MemberKind::Active)
}

pub fn address(id: u64) -> String {
    member(id).address()
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub servers: Vec<RaftServer>,
    pub recorders: Vec<Recorder>,
    dir: TempDir,
    config: ServerConfig,
    members: Vec<Member>,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

impl TestCluster {
    pub async fn spawn(n: u64) -> TestCluster {
        Self::spawn_with_clock(n, None).await
    }

    pub async fn spawn_with_clock(n: u64, clock: Option<Arc<dyn Clock>>) -> TestCluster {
        init_tracing();
        let network = LocalNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let members: Vec<Member> = (1..=n).map(member).collect();

        let mut config = ServerConfig {
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            session_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        if let Some(clock) = clock {
            config.clock = clock;
        }

        let mut cluster = TestCluster {
            network,
            servers: Vec::new(),
            recorders: Vec::new(),
            dir,
            config,
            members: members.clone(),
        };
        for m in &members {
            cluster.start_server(m.clone(), members.clone()).await;
        }
        cluster
    }

    /// Starts one more server, seeded with the given member view.
    pub async fn start_server(&mut self, member: Member, seed: Vec<Member>) {
        let recorder = Recorder::default();
        let mut config = self.config.clone();
        config.storage = StorageConfig {
            dir: self.dir.path().join(format!("server-{}", member.id)),
            max_segment_entries: 64,
            ..Default::default()
        };
        let transport = Arc::new(self.network.transport(member.address()));
        let server = RaftServer::start(
            config,
            member,
            seed,
            transport,
            Box::new(KvStateMachine::new(recorder.clone())),
        )
        .await
        .unwrap();
        self.servers.push(server);
        self.recorders.push(recorder);
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.members.iter().map(|m| m.address()).collect()
    }

    pub fn status_of(&self, id: u64) -> ServerStatus {
        self.server(id).status()
    }

    pub fn server(&self, id: u64) -> &RaftServer {
        self.servers
            .iter()
            .find(|s| s.id() == id)
            .expect("unknown server id")
    }

    /// Waits until exactly one server reports itself leader and returns its
    /// id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let leaders: Vec<u64> = self
                .servers
                .iter()
                .filter(|s| s.status().state == State::Leader)
                .map(|s| s.id())
                .collect();
            if leaders.len() == 1 {
                return leaders[0];
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timeout waiting for a single leader, saw {:?}", leaders);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Waits until `predicate` holds for the server's status.
    pub async fn wait_for_status(
        &self,
        id: u64,
        timeout: Duration,
        predicate: impl Fn(&ServerStatus) -> bool,
    ) -> ServerStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status_of(id);
            if predicate(&status) {
                return status;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timeout waiting for status on {}: {:?}", id, status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Cuts server `id` off from every other server.
    pub fn isolate(&self, id: u64) {
        for other in &self.members {
            if other.id != id {
                self.network.partition(&address(id), &other.address());
            }
        }
    }

    pub fn heal_all(&self) {
        self.network.heal_all();
    }

    pub async fn stop_all(&mut self) {
        for server in &mut self.servers {
            let _ = server.stop().await;
        }
    }
}
