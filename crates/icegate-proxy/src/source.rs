// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Source connections and the task that reads them

use crate::compat::CompatStream;
use crate::identifier::Identifier;
use crate::metadata::Metadata;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use icegate_domain_types::{SourceId, User};
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Size of one read from a source connection
pub const CHUNK_SIZE: usize = 4096;

/// A byte stream an encoder is pushing audio over
///
/// The descriptor accessor is what graceful handoff needs; connections that
/// have none (in-memory pipes) simply cannot be handed to another process.
pub trait SourceConnection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn os_handle(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

impl SourceConnection for CompatStream<TcpStream> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer()
    }

    fn os_handle(&self) -> Option<BorrowedFd<'_>> {
        Some(self.get_ref().as_fd())
    }
}

impl SourceConnection for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn os_handle(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl SourceConnection for tokio::io::DuplexStream {}

/// An authenticated encoder connection, ready to be handed to the manager
pub struct SourceClient {
    pub id: SourceId,
    pub start: DateTime<Utc>,
    pub user_agent: String,
    pub content_type: String,
    pub mount: String,
    pub user: User,
    pub identifier: Identifier,
    pub address: String,
    /// Metadata to start with; an orphan waiting for this identifier wins
    pub metadata: Option<Arc<Metadata>>,
    pub conn: Box<dyn SourceConnection>,
}

impl SourceClient {
    pub fn new(
        conn: Box<dyn SourceConnection>,
        user: User,
        mount: impl Into<String>,
        content_type: impl Into<String>,
        user_agent: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let mount = mount.into();
        let address = address.into();
        let identifier = Identifier::for_address(&user.username, &mount, &address);
        Self {
            id: SourceId::new(),
            start: Utc::now(),
            user_agent: user_agent.into(),
            content_type: content_type.into(),
            mount,
            user,
            identifier,
            address,
            metadata: None,
            conn,
        }
    }
}

impl std::fmt::Debug for SourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceClient")
            .field("id", &self.id)
            .field("mount", &self.mount)
            .field("username", &self.user.username)
            .field("address", &self.address)
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

/// Where a live source's chunks go; `None` while standing by
pub(crate) type LiveSink = Option<mpsc::Sender<Bytes>>;

#[derive(Debug)]
pub(crate) enum EndReason {
    Eof,
    IdleTimeout,
    Io(std::io::Error),
}

pub(crate) enum SourceExit {
    /// The connection is gone; the manager must remove the source
    Ended(EndReason),
    /// Closed on request (kick or shutdown)
    Closed,
    /// Handed back intact for graceful handoff
    Detached(Box<dyn SourceConnection>),
}

pub(crate) struct SourceTask {
    pub id: SourceId,
    pub mount: String,
    pub conn: Box<dyn SourceConnection>,
    pub idle_timeout: Duration,
    pub live: watch::Receiver<LiveSink>,
    pub close: CancellationToken,
    pub detach: CancellationToken,
}

impl SourceTask {
    /// Read chunks until the connection ends or the manager intervenes
    ///
    /// Chunks go to the live sink without waiting; when its queue is full the
    /// chunk is dropped. Standby sources keep reading and discard.
    pub async fn run(mut self) -> SourceExit {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut dropped: u64 = 0;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.detach.cancelled() => return SourceExit::Detached(self.conn),
                _ = self.close.cancelled() => return SourceExit::Closed,
                read = tokio::time::timeout(self.idle_timeout, self.conn.read(&mut buf)) => read,
            };

            let n = match read {
                Err(_) => return SourceExit::Ended(EndReason::IdleTimeout),
                Ok(Ok(0)) => return SourceExit::Ended(EndReason::Eof),
                Ok(Err(e)) => return SourceExit::Ended(EndReason::Io(e)),
                Ok(Ok(n)) => n,
            };

            let live = self.live.borrow();
            if let Some(sink) = live.as_ref() {
                match sink.try_send(Bytes::copy_from_slice(&buf[..n])) {
                    Ok(()) => {
                        if dropped > 0 {
                            debug!(mount = %self.mount, source_id = %self.id, dropped, "upstream queue drained");
                            dropped = 0;
                        }
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        trace!(mount = %self.mount, source_id = %self.id, "upstream queue full, dropping chunk");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
    }
}

pub(crate) fn log_exit(mount: &str, id: SourceId, exit: &SourceExit) {
    match exit {
        SourceExit::Ended(EndReason::Eof) => info!(mount, source_id = %id, "source disconnected"),
        SourceExit::Ended(EndReason::IdleTimeout) => {
            info!(mount, source_id = %id, "source timed out")
        }
        SourceExit::Ended(EndReason::Io(e)) => {
            info!(mount, source_id = %id, error = %e, "source connection failed")
        }
        SourceExit::Closed => debug!(mount, source_id = %id, "source closed"),
        SourceExit::Detached(_) => debug!(mount, source_id = %id, "source detached"),
    }
}
