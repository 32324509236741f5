//! Integration tests for client-driven consensus rounds.

mod common;

use std::time::Duration;

use anyhow::{Context, Result};
use common::{CLUSTER_SIZE, TestCluster};
use paxos_cluster::client::{self, ClientConfig};
use paxos_cluster::config::{ClusterLayout, DEFAULT_KNOWN_VALUES};
use paxos_cluster::telemetry::NodeEvent;
use tokio::time::timeout;

fn client_config(base_port: u16, client_port: u16) -> Result<ClientConfig> {
    let mut config = ClientConfig::new(ClusterLayout::local(CLUSTER_SIZE, base_port, client_port)?);
    config.send_delay = Duration::from_millis(200);
    config.ack_timeout = Duration::from_secs(3);
    config.leader_wait = Duration::from_secs(2);
    Ok(config)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_integration_known_values_are_decided_in_order() -> Result<()> {
    let config = client_config(23000, 23900)?;
    let client = tokio::spawn(client::run(config));
    let cluster = TestCluster::spawn(23000, 23900)?;

    let report = timeout(Duration::from_secs(60), client)
        .await
        .context("client did not finish")???;
    assert_eq!(report.acknowledged, DEFAULT_KNOWN_VALUES.to_vec());
    assert!(report.abandoned.is_empty());

    let leader = report.leader.context("client never learned a leader")?;
    assert_eq!(cluster.wait_for_agreed_leader(Duration::from_secs(1))?, leader);

    let decided: Vec<(u32, i32)> = cluster
        .events(leader)
        .into_iter()
        .filter_map(|event| match event {
            NodeEvent::ConsensusReached { proposal, value } => Some((proposal, value)),
            _ => None,
        })
        .collect();
    assert_eq!(decided, vec![(1, 42), (2, 99), (3, 7), (4, 1234), (5, 56)]);

    let status = cluster.node(leader).status();
    assert_eq!(status.highest_proposal, 5);
    assert_eq!(status.accepted, Some((5, 56)));

    // Each decision needed at least two followers to accept it.
    let mut accepts = 0;
    for id in cluster.layout().peers_of(leader) {
        accepts += cluster
            .events(id)
            .iter()
            .filter(|event| matches!(event, NodeEvent::AcceptedSent { to, .. } if *to == leader))
            .count();
    }
    assert!(accepts >= 2 * decided.len(), "only {accepts} ACCEPTED replies");

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_integration_unknown_value_is_never_acknowledged() -> Result<()> {
    let mut config = client_config(24000, 24900)?;
    config.values = vec![9999];
    config.ack_timeout = Duration::from_secs(1);
    config.leader_wait = Duration::from_millis(300);
    config.max_attempts = Some(2);
    let client = tokio::spawn(client::run(config));
    let cluster = TestCluster::spawn(24000, 24900)?;

    let report = timeout(Duration::from_secs(30), client)
        .await
        .context("client did not finish")???;
    assert!(report.acknowledged.is_empty());
    assert_eq!(report.abandoned, vec![9999]);

    let leader = report.leader.context("client never learned a leader")?;
    cluster.wait_for_event(leader, Duration::from_secs(2), |event| {
        *event == NodeEvent::ValueRejected { value: 9999 }
    })?;
    assert_eq!(cluster.node(leader).status().highest_proposal, 0);
    for id in cluster.layout().ids() {
        assert!(
            !cluster
                .events(id)
                .iter()
                .any(|event| matches!(
                        event,
                        NodeEvent::PrepareSent { .. } | NodeEvent::AcceptReceived { .. }
                    )),
            "node {id} started a round for a rejected value"
        );
    }

    cluster.shutdown();
    Ok(())
}
