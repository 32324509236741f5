//! In-process cluster harness shared by the integration tests.
//!
//! Every node runs with real TCP on loopback, each test on its own port
//! range, with timings shortened so elections and failovers settle in a few
//! seconds.

#![allow(dead_code)]

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use crossbeam_channel::Receiver;
use paxos_cluster::config::{ClusterLayout, NodeId, Timing};
use paxos_cluster::runtime::{NodeConfig, NodeHandle, NodeStatus, spawn_node};
use paxos_cluster::telemetry::NodeEvent;

pub const CLUSTER_SIZE: u32 = 5;

pub fn fast_timing() -> Timing {
    Timing {
        startup_grace: Duration::from_millis(300),
        election_timeout: Some(Duration::from_secs(2)),
        settle_delay: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(100),
        liveness_threshold: Duration::from_millis(600),
        liveness_tick: Duration::from_millis(100),
        round_timeout: None,
        connect_timeout: Duration::from_millis(200),
        notify_attempts: 30,
        notify_backoff: Duration::from_millis(100),
        stalled_retry: Duration::from_millis(200),
    }
}

struct NodeSlot {
    handle: NodeHandle,
    events: Receiver<NodeEvent>,
    seen: Mutex<Vec<NodeEvent>>,
}

pub struct TestCluster {
    layout: ClusterLayout,
    nodes: Vec<NodeSlot>,
}

impl TestCluster {
    /// Spawns a five-node cluster on `base_port + 1..=5`, announcing to a
    /// client on `client_port`.
    pub fn spawn(base_port: u16, client_port: u16) -> Result<Self> {
        Self::spawn_with(base_port, client_port, |_| {})
    }

    /// Like [`TestCluster::spawn`], letting `tweak` adjust each node's config.
    pub fn spawn_with(
        base_port: u16,
        client_port: u16,
        tweak: impl Fn(&mut NodeConfig),
    ) -> Result<Self> {
        let layout = ClusterLayout::local(CLUSTER_SIZE, base_port, client_port)?;
        let mut nodes = Vec::new();
        for id in layout.ids() {
            let mut config = NodeConfig::new(id, layout.clone());
            config.timing = fast_timing();
            tweak(&mut config);
            let (handle, events) = spawn_node(config)?;
            nodes.push(NodeSlot {
                handle,
                events,
                seen: Mutex::new(Vec::new()),
            });
        }
        Ok(Self { layout, nodes })
    }

    pub fn layout(&self) -> &ClusterLayout {
        &self.layout
    }

    pub fn node(&self, id: NodeId) -> &NodeHandle {
        &self.nodes[id as usize - 1].handle
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|node| node.handle.status()).collect()
    }

    /// Every event node `id` has emitted so far, in order.
    pub fn events(&self, id: NodeId) -> Vec<NodeEvent> {
        let node = &self.nodes[id as usize - 1];
        let mut seen = node.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.extend(node.events.try_iter());
        seen.clone()
    }

    /// Waits until every running node has finished an election and names
    /// the same leader, then returns it.
    pub fn wait_for_agreed_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            let live: Vec<NodeStatus> = self
                .statuses()
                .into_iter()
                .filter(|status| !status.halted)
                .collect();
            let leader = live.first().and_then(|status| status.leader_id);
            let agreed = live
                .iter()
                .all(|status| status.election_done && status.leader_id == leader);
            if let (true, Some(leader)) = (agreed, leader) {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                bail!("no agreed leader within {timeout:?}: {live:?}");
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Waits until node `id` has emitted an event matching `predicate`.
    pub fn wait_for_event(
        &self,
        id: NodeId,
        timeout: Duration,
        predicate: impl Fn(&NodeEvent) -> bool,
    ) -> Result<NodeEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events(id).into_iter().find(|event| predicate(event)) {
                return Ok(event);
            }
            if Instant::now() >= deadline {
                bail!("node {id} emitted no matching event within {timeout:?}");
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn shutdown(self) {
        for node in &self.nodes {
            node.handle.shutdown();
        }
        // Give the listener threads time to release their ports.
        thread::sleep(Duration::from_millis(100));
    }
}
