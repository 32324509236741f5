//! Passive event sink: appends every UDP datagram to a CSV log.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::select;
use tracing::{debug, info, warn};

use crate::telemetry::CSV_HEADER;

/// Largest datagram accepted; monitor lines are far shorter.
const MAX_DATAGRAM: usize = 512;

pub struct Monitor {
    socket: UdpSocket,
    log: File,
    log_path: PathBuf,
}

impl Monitor {
    /// Binds `listen` and starts a fresh log at `log_path` holding only the
    /// CSV header.
    pub async fn bind(listen: SocketAddr, log_path: impl AsRef<Path>) -> Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        tokio::fs::write(&log_path, format!("{CSV_HEADER}\n"))
            .await
            .with_context(|| format!("failed to create {}", log_path.display()))?;
        let log = OpenOptions::new()
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("failed to bind monitor socket {listen}"))?;
        Ok(Self {
            socket,
            log,
            log_path,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Monitor {
            socket,
            mut log,
            log_path,
        } = self;
        tokio::pin!(shutdown);
        info!(log = %log_path.display(), "monitor recording events");

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            select! {
                _ = &mut shutdown => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        debug!(%from, len, "event received");
                        if let Err(err) = append(&mut log, &buf[..len]).await {
                            warn!(error = %err, "failed to append event");
                        }
                    }
                    Err(err) => warn!(error = %err, "monitor receive failed"),
                },
            }
        }
        info!("monitor shutting down");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn append(log: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    log.write_all(bytes).await?;
    log.flush().await
}
