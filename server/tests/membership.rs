//! Membership changes: join as passive, catch up, promote to active.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use client::{ClientConfig, RaftClient};
use server::State;
use support::{member, TestCluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_admit_joining_server_as_passive_then_promote() {
    // given: a three-node cluster with some committed state
    let mut cluster = TestCluster::spawn(3).await;
    cluster.wait_for_leader(Duration::from_secs(5)).await;

    let transport = Arc::new(cluster.network.transport("client-m"));
    let config = ClientConfig {
        members: cluster.addresses(),
        ..Default::default()
    };
    let raft = RaftClient::connect(config, transport).await.unwrap();
    for i in 0..5 {
        let op = format!("PUT key{} value{}", i, i);
        raft.submit(Bytes::from(op)).await.unwrap();
    }

    // when: a fourth server joins, seeded with the existing members only
    let seed = cluster.members();
    cluster.start_server(member(4), seed).await;

    // then: it catches up and is promoted to a voting member
    let promoted = cluster
        .wait_for_status(4, Duration::from_secs(15), |s| s.state == State::Follower)
        .await;
    assert!(promoted.last_applied > 0);

    // and every server converges on a four-member active set
    for id in 1..=4 {
        let status = cluster
            .wait_for_status(id, Duration::from_secs(10), |s| s.active_members == 4)
            .await;
        assert_eq!(status.active_members, 4);
    }

    // and no entry was lost on the way in
    let reference = cluster.status_of(1).last_log_index;
    cluster
        .wait_for_status(4, Duration::from_secs(10), |s| {
            s.last_log_index >= reference
        })
        .await;

    // with the quorum now at three, the cluster still commits
    let ok = raft.submit(Bytes::from_static(b"PUT after join")).await;
    assert!(ok.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_stop_and_delete_single_server() {
    // given
    let mut cluster = TestCluster::spawn(1).await;
    cluster.wait_for_leader(Duration::from_secs(3)).await;

    // when
    cluster.stop_all().await;
    let server = cluster.servers.remove(0);
    let status = server.status();
    server.delete().await.unwrap();

    // then
    assert_eq!(status.state, State::Inactive);
}
