//! Leader election and partition behavior across an in-process cluster.

mod support;

use std::time::Duration;

use bytes::Bytes;
use client::{ClientConfig, RaftClient};
use server::State;
use support::{address, TestCluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_elect_exactly_one_leader_in_three_node_cluster() {
    // given
    let cluster = TestCluster::spawn(3).await;

    // when
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    // then: the leader's no-op commits on every server
    for id in 1..=3 {
        let status = cluster
            .wait_for_status(id, Duration::from_secs(5), |s| s.commit_index >= 1)
            .await;
        assert!(status.commit_index >= 1);
        assert_eq!(status.leader, Some(leader));
    }

    // and only one server claims leadership
    let leaders = (1..=3)
        .filter(|id| cluster.status_of(*id).state == State::Leader)
        .count();
    assert_eq!(leaders, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_elect_single_server_cluster_immediately() {
    // given
    let cluster = TestCluster::spawn(1).await;

    // when
    let leader = cluster.wait_for_leader(Duration::from_secs(3)).await;

    // then: it commits its own no-op without peers
    assert_eq!(leader, 1);
    cluster
        .wait_for_status(1, Duration::from_secs(3), |s| {
            s.commit_index >= 1 && s.last_applied >= 1
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_keep_committing_on_majority_side_of_partition() {
    // given: an elected cluster
    let cluster = TestCluster::spawn(3).await;
    let old_leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    // when: the leader is cut off from the other two
    cluster.isolate(old_leader);
    let majority: Vec<u64> = (1..=3).filter(|id| *id != old_leader).collect();

    // then: the majority elects a new leader among themselves
    let new_leader = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let leaders: Vec<u64> = majority
                .iter()
                .filter(|id| cluster.status_of(**id).state == State::Leader)
                .copied()
                .collect();
            if leaders.len() == 1 {
                break leaders[0];
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no new leader elected on the majority side"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    assert_ne!(new_leader, old_leader);

    // and commands submitted to the majority commit
    let config = ClientConfig {
        members: majority.iter().map(|id| address(*id)).collect(),
        ..Default::default()
    };
    let transport = std::sync::Arc::new(cluster.network.transport("client-partition"));
    let raft = RaftClient::connect(config, transport).await.unwrap();
    let result = raft.submit(Bytes::from_static(b"PUT k v")).await.unwrap();
    assert_eq!(result.as_ref(), b"OK");

    // when: the partition heals
    let target = cluster.status_of(new_leader).last_log_index;
    cluster.heal_all();

    // then: the old leader steps down and catches up to the new leader's log
    let caught_up = cluster
        .wait_for_status(old_leader, Duration::from_secs(10), |s| {
            s.state != State::Leader && s.last_log_index >= target && s.leader == Some(new_leader)
        })
        .await;
    assert!(caught_up.last_log_index >= target);
}
