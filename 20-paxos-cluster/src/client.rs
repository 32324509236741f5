//! External client: learns the leader, submits values, waits for acks.
//!
//! The client keeps two listeners open for its whole run, one for leader
//! announcements and one for acknowledgements, so nothing the cluster pushes
//! is lost between attempts. Each value is sent to the current leader's
//! proposal port and must be acknowledged within `ack_timeout`. On timeout
//! the client waits up to `leader_wait` for a new leader announcement, then
//! sends the same value again.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{ClusterLayout, DEFAULT_KNOWN_VALUES, NodeId, Value};
use crate::message::{
    ACK, ANNOUNCEMENT_LEN, CLIENT_FRAME_LEN, ClientFrame, decode_announcement,
};
use crate::telemetry::{MonitorRecord, MonitorReporter};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub layout: ClusterLayout,
    /// Values to submit, in order.
    pub values: Vec<Value>,
    /// Pause before each submission.
    pub send_delay: Duration,
    pub ack_timeout: Duration,
    /// How long to wait for a new leader after a missed ack.
    pub leader_wait: Duration,
    /// Give up on a value after this many sends. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ClientConfig {
    pub fn new(layout: ClusterLayout) -> Self {
        Self {
            layout,
            values: DEFAULT_KNOWN_VALUES.to_vec(),
            send_delay: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(8),
            leader_wait: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

/// What happened to each submitted value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientReport {
    /// Leader the client was talking to at the end of the run.
    pub leader: Option<NodeId>,
    pub acknowledged: Vec<Value>,
    pub abandoned: Vec<Value>,
}

pub async fn run(config: ClientConfig) -> Result<ClientReport> {
    let announce_addr = config.layout.client_announce_addr();
    let ack_addr = config.layout.client_ack_addr();
    let announcements = TcpListener::bind(announce_addr)
        .await
        .with_context(|| format!("failed to bind announcement port {announce_addr}"))?;
    let acks = TcpListener::bind(ack_addr)
        .await
        .with_context(|| format!("failed to bind ack port {ack_addr}"))?;
    let monitor = MonitorReporter::new(config.layout.monitor_addr());

    info!(%announce_addr, "waiting for leader announcement");
    let mut leader = receive_leader(&announcements).await?;
    report(&monitor, leader, "RECV_LEADER", None);

    let mut summary = ClientReport::default();
    for &value in &config.values {
        sleep(config.send_delay).await;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let target = config.layout.proposal_addr(leader);
            match send_proposal(target, value).await {
                Ok(()) => {
                    info!(leader, value, attempt = attempts, "sent value");
                    report(&monitor, leader, "SEND_VALUE", Some(value));
                }
                Err(err) => warn!(leader, value, error = %err, "failed to reach leader"),
            }

            match timeout(config.ack_timeout, wait_for_ack(&acks, value)).await {
                Ok(Ok(())) => {
                    info!(leader, value, "value acknowledged");
                    report(&monitor, leader, "RECV_OK", Some(value));
                    summary.acknowledged.push(value);
                    break;
                }
                Ok(Err(err)) => warn!(value, error = %err, "ack listener failed"),
                Err(_) => warn!(leader, value, "no ack, leader presumed failed"),
            }

            if config.max_attempts.is_some_and(|max| attempts >= max) {
                warn!(value, attempts, "giving up on value");
                summary.abandoned.push(value);
                break;
            }

            match timeout(config.leader_wait, receive_leader(&announcements)).await {
                Ok(Ok(new_leader)) => {
                    info!(old = leader, new = new_leader, "switching leader");
                    report(&monitor, new_leader, "RECV_LEADER", None);
                    leader = new_leader;
                }
                Ok(Err(err)) => warn!(error = %err, "announcement listener failed"),
                Err(_) => debug!(leader, "no new leader announced, retrying"),
            }
        }
    }

    summary.leader = Some(leader);
    Ok(summary)
}

/// Accepts announcement connections until one carries a valid leader id.
async fn receive_leader(listener: &TcpListener) -> Result<NodeId> {
    loop {
        let (mut stream, peer) = listener
            .accept()
            .await
            .context("failed to accept leader announcement")?;
        let mut buf = [0u8; ANNOUNCEMENT_LEN];
        match stream.read_exact(&mut buf).await {
            Ok(_) => match decode_announcement(&buf) {
                Ok(leader) => {
                    info!(leader, "leader announced");
                    return Ok(leader);
                }
                Err(err) => warn!(%peer, error = %err, "bad leader announcement"),
            },
            Err(err) => debug!(%peer, error = %err, "short leader announcement"),
        }
    }
}

/// Accepts ack connections until one acknowledges `value`; others are ignored.
async fn wait_for_ack(listener: &TcpListener, value: Value) -> Result<()> {
    loop {
        let (mut stream, peer) = listener.accept().await.context("failed to accept ack")?;
        let mut buf = [0u8; CLIENT_FRAME_LEN];
        if let Err(err) = stream.read_exact(&mut buf).await {
            debug!(%peer, error = %err, "short ack frame");
            continue;
        }
        match ClientFrame::decode_kind(&buf, ACK) {
            Ok(frame) if frame.value == value => return Ok(()),
            Ok(frame) => {
                debug!(expected = value, got = frame.value, "ignoring ack for another value")
            }
            Err(err) => debug!(%peer, error = %err, "bad ack frame"),
        }
    }
}

async fn send_proposal(addr: SocketAddr, value: Value) -> Result<()> {
    let bytes = ClientFrame::propose(value).encode()?;
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

fn report(monitor: &MonitorReporter, leader: NodeId, action: &'static str, value: Option<Value>) {
    monitor.report(&MonitorRecord::new(
        "client".to_string(),
        leader.to_string(),
        action,
        None,
        value.map(Into::into),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::encode_announcement;

    async fn push(addr: SocketAddr, bytes: Vec<u8>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_leader_skips_garbage() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            push(addr, vec![1, 2]).await;
            push(addr, (-3i32).to_le_bytes().to_vec()).await;
            push(addr, encode_announcement(4).unwrap()).await;
        });

        let leader = timeout(Duration::from_secs(2), receive_leader(&listener)).await??;
        assert_eq!(leader, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_ack_for_other_value_is_ignored() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            push(addr, ClientFrame::ack(42).encode().unwrap()).await;
            push(addr, ClientFrame::propose(99).encode().unwrap()).await;
            push(addr, ClientFrame::ack(99).encode().unwrap()).await;
        });

        timeout(Duration::from_secs(2), wait_for_ack(&listener, 99)).await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_proposal_frame_reaches_leader() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        send_proposal(addr, 1234).await?;

        let (mut stream, _) = listener.accept().await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        assert_eq!(ClientFrame::decode(&buf)?, ClientFrame::propose(1234));
        Ok(())
    }
}
