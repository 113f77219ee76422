//! Session semantics end to end: command replay, expiration by log time,
//! and event delivery.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use client::{ClientConfig, RaftClient};
use common::clock::{Clock, MockClock};
use protocol::{CommandRequest, Error, Request, Response, Transport};
use support::{address, TestCluster};

fn client_config(addresses: Vec<String>) -> ClientConfig {
    ClientConfig {
        members: addresses,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_replay_duplicate_command_without_reapplying() {
    // given: a cluster with one applied command
    let cluster = TestCluster::spawn(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    let transport = Arc::new(cluster.network.transport("client-a"));
    let raft = RaftClient::connect(client_config(cluster.addresses()), transport)
        .await
        .unwrap();
    let first = raft.submit(Bytes::from_static(b"PUT k v")).await.unwrap();
    assert_eq!(first.as_ref(), b"OK");

    // when: the same (session, sequence) is submitted again, as a client
    // would after reconnecting to a new leader
    let raw = Arc::new(cluster.network.transport("client-raw"));
    let duplex = raw.connect(&address(leader)).await.unwrap();
    let duplicate = duplex
        .connection
        .send(Request::Command(CommandRequest {
            session: raft.session(),
            sequence: 1,
            operation: Bytes::from_static(b"PUT k v"),
        }))
        .await
        .unwrap();

    // then: the cached response is returned
    match duplicate {
        Response::Command(response) => assert_eq!(response.result.as_ref(), b"OK"),
        other => panic!("unexpected response: {:?}", other),
    }

    // and the state machine applied the command exactly once on each server
    let target = cluster.status_of(leader).last_applied;
    for id in 1..=3 {
        cluster
            .wait_for_status(id, Duration::from_secs(5), |s| s.last_applied >= target)
            .await;
    }
    for recorder in &cluster.recorders {
        assert_eq!(recorder.applied_count("PUT k v"), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_expire_session_when_log_time_passes_timeout() {
    // given: a cluster driven by a mock clock
    let clock = Arc::new(MockClock::new());
    let cluster = TestCluster::spawn_with_clock(3, Some(clock.clone() as Arc<dyn Clock>)).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await;

    // and a session that will never send keep-alives in time
    let idle_config = ClientConfig {
        members: cluster.addresses(),
        session_timeout: Duration::from_secs(600),
        ..Default::default()
    };
    let transport = Arc::new(cluster.network.transport("client-idle"));
    let idle = RaftClient::connect(idle_config, transport).await.unwrap();
    let idle_session = idle.session();

    // when: log time moves past the 5s session timeout and another entry
    // applies, carrying the newer timestamp
    clock.advance(Duration::from_secs(6));
    let transport = Arc::new(cluster.network.transport("client-fresh"));
    let fresh = RaftClient::connect(client_config(cluster.addresses()), transport)
        .await
        .unwrap();

    // then: every server expires the idle session exactly once
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let done = cluster
            .recorders
            .iter()
            .all(|r| r.expired_sessions() == vec![idle_session]);
        if done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sessions expired: {:?}",
            cluster
                .recorders
                .iter()
                .map(|r| r.expired_sessions())
                .collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // and the expired session is rejected outright
    let result = idle.submit(Bytes::from_static(b"PUT x y")).await;
    assert!(matches!(
        result,
        Err(Error::SessionExpired(_)) | Err(Error::UnknownSession(_))
    ));

    // while the fresh session keeps working
    let ok = fresh.submit(Bytes::from_static(b"PUT k v")).await.unwrap();
    assert_eq!(ok.as_ref(), b"OK");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_deliver_session_events_in_order() {
    // given: a client connected straight to the leader
    let cluster = TestCluster::spawn(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    let transport = Arc::new(cluster.network.transport("client-events"));
    let mut raft = RaftClient::connect(client_config(vec![address(leader)]), transport)
        .await
        .unwrap();
    let mut events = raft.events().unwrap();

    // when: commands publish events from the state machine
    for payload in ["one", "two", "three"] {
        let op = format!("EVENT {}", payload);
        raft.submit(Bytes::from(op)).await.unwrap();
    }

    // then: the events arrive in publication order
    for expected in ["one", "two", "three"] {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        assert_eq!(event.as_ref(), expected.as_bytes());
    }
}
