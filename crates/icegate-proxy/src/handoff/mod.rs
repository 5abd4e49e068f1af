// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Graceful handoff to a freshly started copy of the binary
//!
//! On `SIGUSR2` the running process starts its successor with one end of a
//! socketpair, exports every live connection and streams it over as
//! `proxy`, `mount`, `source` and `done` records. The successor restores
//! everything, answers `restored` and the old process exits. If anything
//! goes wrong before that answer, the old process kills the successor and
//! takes its own exported state back through the same restore path.

mod channel;
mod records;

pub use channel::{HandoffChannel, MAX_RECORD};
pub use records::{HandoffRecord, MountRecord, ProxyRecord, RestoredRecord, SourceRecord};

use crate::compat::{CompatListener, CompatStream};
use crate::config::HandoffConfig;
use crate::manager::ProxyManager;
use crate::metadata::Metadata;
use crate::source::{SourceClient, SourceConnection};
use icegate_domain_types::UserStorage;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Environment variable holding the inherited channel descriptor
pub const HANDOFF_FD_ENV: &str = "ICEGATE_HANDOFF_FD";

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("Handoff channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("Malformed handoff record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("Handoff record of {0} bytes is too large")]
    RecordTooLarge(usize),

    #[error("Handoff channel closed by peer")]
    Closed,

    #[error("Unexpected handoff record: expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: &'static str },

    #[error("{0} record arrived without its descriptor")]
    MissingDescriptor(&'static str),

    #[error("Successor did not acknowledge within {0:?}")]
    AckTimeout(Duration),

    #[error("Invalid {HANDOFF_FD_ENV} value: {0}")]
    InvalidEnv(String),
}

impl HandoffError {
    /// The channel itself could not be created, so no restart can be attempted
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandoffError::Sys(_))
    }
}

/// A detached source connection plus what is needed to re-register it
pub struct SourceSnapshot {
    pub record: SourceRecord,
    pub conn: Box<dyn SourceConnection>,
}

pub struct MountSnapshot {
    pub record: MountRecord,
    pub upstream: Option<TcpStream>,
    pub sources: Vec<SourceSnapshot>,
}

/// Everything the manager owned at export time
#[derive(Default)]
pub struct ProxySnapshot {
    pub orphans: Vec<Metadata>,
    pub mounts: Vec<MountSnapshot>,
}

impl ProxySnapshot {
    pub fn source_count(&self) -> usize {
        self.mounts.iter().map(|m| m.sources.len()).sum()
    }
}

/// Stream `snapshot` and the listener to the successor
///
/// Returns how many sources were sent. Sources without a descriptor cannot
/// cross a process boundary and are left out.
pub async fn write_snapshot(
    channel: &HandoffChannel,
    listener: BorrowedFd<'_>,
    snapshot: &ProxySnapshot,
) -> Result<usize, HandoffError> {
    let proxy = ProxyRecord {
        orphans: snapshot.orphans.clone(),
    };
    channel.send(&HandoffRecord::Proxy(proxy), Some(listener)).await?;

    let mut sent = 0;
    for mount in &snapshot.mounts {
        let sendable = mount
            .sources
            .iter()
            .filter(|s| s.conn.os_handle().is_some())
            .count();
        let record = MountRecord {
            source_count: sendable,
            ..mount.record.clone()
        };
        let upstream = mount.upstream.as_ref().map(|conn| conn.as_fd());
        channel.send(&HandoffRecord::Mount(record), upstream).await?;

        for source in &mount.sources {
            let Some(fd) = source.conn.os_handle() else {
                warn!(
                    mount = %mount.record.name,
                    source_id = %source.record.id,
                    "source has no descriptor and cannot be handed over"
                );
                continue;
            };
            channel
                .send(&HandoffRecord::Source(source.record.clone()), Some(fd))
                .await?;
            sent += 1;
        }
    }

    channel.send(&HandoffRecord::Done, None).await?;
    Ok(sent)
}

struct PendingMount {
    record: MountRecord,
    upstream: Option<OwnedFd>,
    sources: Vec<(SourceRecord, OwnedFd)>,
}

/// Read a complete snapshot; nothing is turned into a connection before `done`
pub async fn read_snapshot(channel: &HandoffChannel) -> Result<(OwnedFd, ProxySnapshot), HandoffError> {
    let (first, listener) = channel.recv().await?;
    let HandoffRecord::Proxy(proxy) = first else {
        return Err(HandoffError::Unexpected {
            expected: "proxy",
            got: first.kind(),
        });
    };
    let listener = listener.ok_or(HandoffError::MissingDescriptor("proxy"))?;

    let mut pending: Vec<PendingMount> = Vec::new();
    loop {
        let (record, fd) = channel.recv().await?;
        match record {
            HandoffRecord::Mount(record) => pending.push(PendingMount {
                record,
                upstream: fd,
                sources: Vec::new(),
            }),
            HandoffRecord::Source(record) => {
                let fd = fd.ok_or(HandoffError::MissingDescriptor("source"))?;
                let mount = pending.last_mut().ok_or(HandoffError::Unexpected {
                    expected: "mount",
                    got: "source",
                })?;
                mount.sources.push((record, fd));
            }
            HandoffRecord::Done => break,
            other => {
                return Err(HandoffError::Unexpected {
                    expected: "mount, source or done",
                    got: other.kind(),
                })
            }
        }
    }

    let mut snapshot = ProxySnapshot {
        orphans: proxy.orphans,
        mounts: Vec::with_capacity(pending.len()),
    };
    for mount in pending {
        let upstream = match mount.upstream.map(tcp_stream).transpose() {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(mount = %mount.record.name, error = %e, "dropping unusable upstream descriptor");
                None
            }
        };

        let mut sources = Vec::with_capacity(mount.sources.len());
        for (record, fd) in mount.sources {
            match tcp_stream(fd) {
                Ok(stream) => {
                    let peer = stream.peer_addr().ok();
                    sources.push(SourceSnapshot {
                        record,
                        conn: Box::new(CompatStream::passthrough(stream, peer)),
                    });
                }
                Err(e) => {
                    warn!(mount = %record.mount, source_id = %record.id, error = %e, "dropping unusable source descriptor")
                }
            }
        }

        snapshot.mounts.push(MountSnapshot {
            record: mount.record,
            upstream,
            sources,
        });
    }

    Ok((listener, snapshot))
}

fn tcp_stream(fd: OwnedFd) -> io::Result<TcpStream> {
    let stream = std::net::TcpStream::from(fd);
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}

/// Register a snapshot with `manager`
///
/// Mounts come first, then sources in their old priority order so the
/// same source ends up live. Users are looked up again; a source whose
/// user vanished is closed.
pub async fn restore(
    manager: &ProxyManager,
    storage: &Arc<dyn UserStorage>,
    snapshot: ProxySnapshot,
    cancel: &CancellationToken,
) -> crate::Result<usize> {
    manager.restore_orphans(snapshot.orphans).await?;

    let mut sources = Vec::new();
    for mount in snapshot.mounts {
        manager.restore_mount(mount.record, mount.upstream).await?;
        sources.extend(mount.sources);
    }
    sources.sort_by_key(|s| s.record.priority);

    let mut restored = 0;
    for SourceSnapshot { record, conn } in sources {
        let user = match storage.get(&record.username).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(username = %record.username, source_id = %record.id, "user no longer exists, closing restored source");
                continue;
            }
            Err(e) => {
                warn!(username = %record.username, source_id = %record.id, error = %e, "user lookup failed, closing restored source");
                continue;
            }
        };

        let client = SourceClient {
            id: record.id,
            start: record.start,
            user_agent: record.user_agent,
            content_type: record.content_type,
            mount: record.mount,
            user,
            identifier: record.identifier,
            address: record.address,
            metadata: record.metadata.map(Arc::new),
            conn,
        };
        manager.restore_source_client(client, cancel).await?;
        restored += 1;
    }

    Ok(restored)
}

/// Start a copy of this binary with the child end of a new channel
pub fn spawn_successor() -> Result<(Child, HandoffChannel), HandoffError> {
    let (ours, theirs) = HandoffChannel::socketpair()?;
    channel::set_cloexec(theirs.as_raw_fd(), false)?;

    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(HANDOFF_FD_ENV, theirs.as_raw_fd().to_string())
        .spawn()?;
    drop(theirs);

    Ok((child, HandoffChannel::from_owned(ours)?))
}

/// The channel left by a predecessor, if this process was started by one
pub fn inherited_channel() -> Result<Option<HandoffChannel>, HandoffError> {
    let Some(value) = std::env::var_os(HANDOFF_FD_ENV) else {
        return Ok(None);
    };
    std::env::remove_var(HANDOFF_FD_ENV);

    let raw: RawFd = value
        .to_str()
        .and_then(|s| s.parse().ok())
        .filter(|fd| *fd > 2)
        .ok_or_else(|| HandoffError::InvalidEnv(value.to_string_lossy().into_owned()))?;

    channel::set_cloexec(raw, true)?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    Ok(Some(HandoffChannel::from_owned(fd)?))
}

/// Successor side: take over the predecessor's state and acknowledge it
pub async fn take_over(
    channel: &HandoffChannel,
    manager: &ProxyManager,
    storage: &Arc<dyn UserStorage>,
    cancel: &CancellationToken,
) -> crate::Result<CompatListener> {
    let (listener, snapshot) = read_snapshot(channel).await?;
    info!(
        mounts = snapshot.mounts.len(),
        sources = snapshot.source_count(),
        "received state from previous process"
    );

    let listener = CompatListener::from_std(std::net::TcpListener::from(listener))?;
    let sources = restore(manager, storage, snapshot, cancel).await?;
    channel
        .send(&HandoffRecord::Restored(RestoredRecord { sources }), None)
        .await?;
    info!(sources, "handoff complete, now serving");
    Ok(listener)
}

/// Predecessor side: hand everything to a new process
///
/// On success the caller should exit. On failure the state has already been
/// restored locally and serving can continue.
pub async fn hand_over(
    manager: &ProxyManager,
    storage: &Arc<dyn UserStorage>,
    listener: &CompatListener,
    config: &HandoffConfig,
    cancel: &CancellationToken,
) -> crate::Result<()> {
    hand_over_to(manager, storage, listener, config, cancel, spawn_successor).await
}

/// `hand_over` with the successor started by `launch`
///
/// `launch` returns the successor process and this side of its channel.
pub async fn hand_over_to<F>(
    manager: &ProxyManager,
    storage: &Arc<dyn UserStorage>,
    listener: &CompatListener,
    config: &HandoffConfig,
    cancel: &CancellationToken,
    launch: F,
) -> crate::Result<()>
where
    F: FnOnce() -> Result<(Child, HandoffChannel), HandoffError>,
{
    let (mut child, channel) = launch()?;
    info!(pid = ?child.id(), "started successor process");

    let snapshot = match manager.export().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let _ = child.kill().await;
            return Err(e);
        }
    };
    let outcome = send_and_wait(&channel, listener.as_fd(), &snapshot, config.ack_timeout()).await;

    match outcome {
        Ok((sent, restored)) => {
            info!(sent, restored, "successor took over");
            drop(snapshot);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "handoff failed, taking connections back");
            if let Err(kill) = child.kill().await {
                warn!(error = %kill, "failed to stop successor");
            }
            restore(manager, storage, snapshot, cancel).await?;
            manager.resume().await?;
            Err(e.into())
        }
    }
}

async fn send_and_wait(
    channel: &HandoffChannel,
    listener: BorrowedFd<'_>,
    snapshot: &ProxySnapshot,
    ack_timeout: Duration,
) -> Result<(usize, usize), HandoffError> {
    let sent = write_snapshot(channel, listener, snapshot).await?;
    let (ack, _) = tokio::time::timeout(ack_timeout, channel.recv())
        .await
        .map_err(|_| HandoffError::AckTimeout(ack_timeout))??;
    match ack {
        HandoffRecord::Restored(RestoredRecord { sources }) => Ok((sent, sources)),
        other => Err(HandoffError::Unexpected {
            expected: "restored",
            got: other.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::events::EventHandler;
    use crate::identifier::Identifier;
    use crate::manager::ManagerSettings;
    use crate::storage::{LoggingStatusManager, StaticUserStorage};
    use crate::upstream::MasterServer;
    use chrono::Utc;
    use icegate_domain_types::{Permission, User};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const MOUNT: &str = "/main.mp3";

    /// Master that acknowledges every source and forwards its audio
    async fn master() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut head = Vec::new();
                    let body = loop {
                        let Ok(n) = stream.read(&mut buf).await else { return };
                        if n == 0 {
                            return;
                        }
                        head.extend_from_slice(&buf[..n]);
                        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
                            break head.split_off(pos + 4);
                        }
                    };
                    let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
                    if head.starts_with(b"GET") {
                        return;
                    }
                    let _ = tx.send(body);
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let _ = tx.send(buf[..n].to_vec());
                    }
                });
            }
        });
        (format!("http://source:hackme@{}", addr), rx)
    }

    async fn saw(audio: &mut mpsc::UnboundedReceiver<Vec<u8>>, needle: &[u8]) {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.windows(needle.len()).any(|w| w == needle) {
                seen.extend(audio.recv().await.expect("master running"));
            }
        })
        .await
        .expect("audio in time");
    }

    fn dj(name: &str) -> User {
        User::new(name, "", &[Permission::Active, Permission::Dj])
    }

    fn spawn_manager(config: &ProxyConfig, shutdown: &CancellationToken) -> ProxyManager {
        let events = EventHandler::new(MOUNT, Arc::new(LoggingStatusManager));
        let master = MasterServer::new(config.proxy.master_url().unwrap());
        ProxyManager::spawn(ManagerSettings::new(master, config), events, shutdown.clone())
    }

    /// A real TCP source; the encoder end keeps sending `payload`
    async fn tcp_source(user: &str, payload: &'static [u8]) -> SourceClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut encoder = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (conn, peer) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            while encoder.write_all(payload).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        SourceClient::new(
            Box::new(CompatStream::passthrough(conn, Some(peer))),
            dj(user),
            MOUNT,
            "audio/mpeg",
            "test-encoder/1.0",
            peer.to_string(),
        )
    }

    fn metadata(user: &str, address: &str, value: &str) -> Metadata {
        Metadata {
            mount: MOUNT.to_string(),
            value: value.to_string(),
            username: user.to_string(),
            identifier: Identifier::for_address(user, MOUNT, address),
            address: address.to_string(),
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn live_connections_survive_a_handoff() {
        let (master_url, mut audio) = master().await;
        let mut config = ProxyConfig::default();
        config.proxy.master_server = master_url;
        config.proxy.primary_mount = MOUNT.to_string();
        config.server.source_idle_timeout_ms = 30_000;

        let old_shutdown = CancellationToken::new();
        let old = spawn_manager(&config, &old_shutdown);

        let alice = tcp_source("alice", b"alice-audio").await;
        let bob = tcp_source("bob", b"bob-audio").await;
        let (alice_id, bob_id, bob_address) = (alice.id, bob.id, bob.address.clone());
        old.add_source_client(alice, &old_shutdown).await.unwrap();
        old.add_source_client(bob, &old_shutdown).await.unwrap();
        old.send_metadata(metadata("bob", &bob_address, "Bob - Standby"), &old_shutdown)
            .await
            .unwrap();
        old.send_metadata(metadata("carol", "10.0.0.3:1", "Carol - Early"), &old_shutdown)
            .await
            .unwrap();
        saw(&mut audio, b"alice-audio").await;

        let snapshot = old.export().await.unwrap();
        assert_eq!(snapshot.source_count(), 2);
        assert!(old.list_sources().await.unwrap().is_empty());

        let (ours, theirs) = HandoffChannel::pair().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (sent, received) = tokio::join!(
            write_snapshot(&ours, listener.as_fd(), &snapshot),
            read_snapshot(&theirs)
        );
        assert_eq!(sent.unwrap(), 2);
        let (passed_listener, received) = received.unwrap();
        drop(snapshot);

        let passed_listener = std::net::TcpListener::from(passed_listener);
        assert_eq!(passed_listener.local_addr().unwrap(), listener.local_addr().unwrap());
        assert_eq!(received.orphans.len(), 1);

        let new_shutdown = CancellationToken::new();
        let new = spawn_manager(&config, &new_shutdown);
        let storage: Arc<dyn UserStorage> =
            Arc::new(StaticUserStorage::new([dj("alice"), dj("bob"), dj("carol")]));
        let restored = restore(&new, &storage, received, &new_shutdown).await.unwrap();
        assert_eq!(restored, 2);

        let sources = new.list_sources().await.unwrap();
        let summary: Vec<_> = sources
            .iter()
            .map(|s| (s.id, s.priority, s.is_live, s.metadata.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (alice_id, 0, true, None),
                (bob_id, 1, false, Some("Bob - Standby".to_string())),
            ]
        );

        // audio written after the handoff still reaches the master
        while audio.try_recv().is_ok() {}
        saw(&mut audio, b"alice-audio").await;

        new.kick_source(alice_id).await.unwrap();
        saw(&mut audio, b"bob-audio").await;

        // the parked title survived too
        let (conn, _encoder) = tokio::io::duplex(1024);
        let carol = SourceClient::new(Box::new(conn), dj("carol"), MOUNT, "audio/mpeg", "enc", "10.0.0.3:2");
        let carol_id = carol.id;
        new.add_source_client(carol, &new_shutdown).await.unwrap();
        let sources = new.list_sources().await.unwrap();
        let carol = sources.iter().find(|s| s.id == carol_id).unwrap();
        assert_eq!(carol.metadata.as_deref(), Some("Carol - Early"));

        old_shutdown.cancel();
        new_shutdown.cancel();
    }

    #[tokio::test]
    async fn sources_without_descriptors_are_left_out() {
        let (master_url, _audio) = master().await;
        let mut config = ProxyConfig::default();
        config.proxy.master_server = master_url;

        let shutdown = CancellationToken::new();
        let manager = spawn_manager(&config, &shutdown);
        let (conn, _encoder) = tokio::io::duplex(1024);
        let client = SourceClient::new(Box::new(conn), dj("alice"), MOUNT, "audio/mpeg", "enc", "10.0.0.1:1");
        manager.add_source_client(client, &shutdown).await.unwrap();

        let snapshot = manager.export().await.unwrap();
        assert_eq!(snapshot.source_count(), 1);

        let (ours, theirs) = HandoffChannel::pair().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (sent, received) = tokio::join!(
            write_snapshot(&ours, listener.as_fd(), &snapshot),
            read_snapshot(&theirs)
        );
        assert_eq!(sent.unwrap(), 0);
        let (_, received) = received.unwrap();
        assert_eq!(received.mounts.len(), 1);
        assert_eq!(received.mounts[0].record.source_count, 0);
        assert_eq!(received.source_count(), 0);

        shutdown.cancel();
    }

    /// Master that accepts a source and then stops reading from it
    async fn stalled_master() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
                held.push(stream);
            }
        });
        format!("http://source:hackme@{}", addr)
    }

    #[tokio::test]
    async fn export_finishes_while_the_master_is_not_reading() {
        let mut config = ProxyConfig::default();
        config.proxy.master_server = stalled_master().await;
        config.server.source_idle_timeout_ms = 30_000;

        let shutdown = CancellationToken::new();
        let manager = spawn_manager(&config, &shutdown);
        let (conn, mut encoder) = tokio::io::duplex(64 * 1024);
        let client = SourceClient::new(Box::new(conn), dj("alice"), MOUNT, "audio/mpeg", "enc", "10.0.0.1:1");
        manager.add_source_client(client, &shutdown).await.unwrap();

        let chunk = vec![0x55u8; 64 * 1024];
        let flood = tokio::spawn(async move { while encoder.write_all(&chunk).await.is_ok() {} });
        // long enough for the upstream socket buffers to fill up
        tokio::time::sleep(Duration::from_millis(500)).await;

        let snapshot = tokio::time::timeout(Duration::from_secs(5), manager.export())
            .await
            .expect("export finished")
            .unwrap();
        assert_eq!(snapshot.source_count(), 1);

        let sources = tokio::time::timeout(Duration::from_secs(1), manager.list_sources())
            .await
            .expect("manager still answering")
            .unwrap();
        assert!(sources.is_empty());

        flood.abort();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn out_of_order_records_are_rejected() {
        let (ours, theirs) = HandoffChannel::pair().unwrap();
        ours.send(&HandoffRecord::Done, None).await.unwrap();
        let result = read_snapshot(&theirs).await;
        assert!(matches!(
            result,
            Err(HandoffError::Unexpected { expected: "proxy", got: "done" })
        ));
    }
}
