// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The proxy manager: one task that owns every mount, source and orphan
//!
//! Callers talk to it through `ProxyManager`, a cheap handle over a bounded
//! request channel. Source tasks and grace timers report back on a separate
//! unbounded channel so they never wait on the manager.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::events::{EventHandler, SourceInfo};
use crate::handoff::{MountRecord, MountSnapshot, ProxySnapshot, SourceRecord, SourceSnapshot};
use crate::identifier::Identifier;
use crate::metadata::Metadata;
use crate::mount::{LiveChange, Mount, MountSource};
use crate::source::{log_exit, SourceClient, SourceExit, SourceTask};
use crate::upstream::{spawn_upstream, MasterServer, UpstreamSettings};
use icegate_domain_types::{ProxySource, SourceId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_QUEUE: usize = 64;
/// Longest export waits on one source or upstream task before giving up on it
const EXPORT_WAIT: Duration = Duration::from_secs(2);

/// Timing and upstream settings for the manager
pub struct ManagerSettings {
    pub idle_timeout: Duration,
    pub mount_grace: Duration,
    upstream: UpstreamSettings,
}

impl ManagerSettings {
    pub fn new(master: MasterServer, config: &ProxyConfig) -> Self {
        Self {
            idle_timeout: config.server.source_idle_timeout(),
            mount_grace: config.proxy.mount_grace(),
            upstream: UpstreamSettings {
                master: Arc::new(master),
                backoff: config.backoff.clone(),
                queue: config.proxy.upstream_queue_chunks,
                write_timeout: config.proxy.upstream_write_timeout(),
            },
        }
    }
}

enum Request {
    AddSource {
        client: SourceClient,
        /// Restored sources bypass the handoff freeze
        restored: bool,
        reply: oneshot::Sender<()>,
    },
    SendMetadata {
        metadata: Metadata,
        reply: oneshot::Sender<()>,
    },
    ListSources {
        reply: oneshot::Sender<Vec<ProxySource>>,
    },
    KickSource {
        id: SourceId,
        reply: oneshot::Sender<Result<()>>,
    },
    RestoreMount {
        record: MountRecord,
        upstream: Option<TcpStream>,
        reply: oneshot::Sender<()>,
    },
    RestoreOrphans {
        orphans: Vec<Metadata>,
        reply: oneshot::Sender<()>,
    },
    Export {
        reply: oneshot::Sender<ProxySnapshot>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    SourceEnded { mount: String, id: SourceId },
    MountExpired { name: String, generation: u64 },
}

/// Handle to the manager task
#[derive(Clone)]
pub struct ProxyManager {
    requests: mpsc::Sender<Request>,
    events: EventHandler,
}

impl ProxyManager {
    /// Start the manager; it stops and closes everything when `shutdown` fires
    pub fn spawn(settings: ManagerSettings, events: EventHandler, shutdown: CancellationToken) -> Self {
        let (requests, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (internal, internal_rx) = mpsc::unbounded_channel();

        let manager = Manager {
            settings,
            events: events.clone(),
            mounts: HashMap::new(),
            orphans: HashMap::new(),
            internal,
            shutdown,
            generation: 0,
            frozen: false,
            deferred: Vec::new(),
        };
        tokio::spawn(manager.run(requests_rx, internal_rx));

        Self { requests, events }
    }

    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    /// Hand a new source to the manager
    ///
    /// Returns once the manager has taken the source, or with
    /// `Error::Cancelled` if `cancel` fires first.
    pub async fn add_source_client(&self, client: SourceClient, cancel: &CancellationToken) -> Result<()> {
        self.call(
            |reply| Request::AddSource {
                client,
                restored: false,
                reply,
            },
            Some(cancel),
        )
        .await
    }

    pub(crate) async fn restore_source_client(&self, client: SourceClient, cancel: &CancellationToken) -> Result<()> {
        self.call(
            |reply| Request::AddSource {
                client,
                restored: true,
                reply,
            },
            Some(cancel),
        )
        .await
    }

    /// Attach metadata to the source it belongs to, or park it as an orphan
    pub async fn send_metadata(&self, metadata: Metadata, cancel: &CancellationToken) -> Result<()> {
        self.call(|reply| Request::SendMetadata { metadata, reply }, Some(cancel))
            .await
    }

    pub async fn list_sources(&self) -> Result<Vec<ProxySource>> {
        self.call(|reply| Request::ListSources { reply }, None).await
    }

    /// Disconnect a source, then elect a new live source as usual
    pub async fn kick_source(&self, id: SourceId) -> Result<()> {
        self.call(|reply| Request::KickSource { id, reply }, None)
            .await?
    }

    pub(crate) async fn restore_mount(&self, record: MountRecord, upstream: Option<TcpStream>) -> Result<()> {
        self.call(
            |reply| Request::RestoreMount {
                record,
                upstream,
                reply,
            },
            None,
        )
        .await
    }

    pub(crate) async fn restore_orphans(&self, orphans: Vec<Metadata>) -> Result<()> {
        self.call(|reply| Request::RestoreOrphans { orphans, reply }, None)
            .await
    }

    /// Detach every connection and hand over all state
    ///
    /// New sources are held back until `resume` is called.
    pub(crate) async fn export(&self) -> Result<ProxySnapshot> {
        self.call(|reply| Request::Export { reply }, None).await
    }

    pub(crate) async fn resume(&self) -> Result<()> {
        self.call(|reply| Request::Resume { reply }, None).await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
        cancel: Option<&CancellationToken>,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        let request = request(reply);
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            sent = self.requests.send(request) => sent.map_err(|_| Error::Shutdown)?,
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            response = response => response.map_err(|_| Error::Shutdown),
        }
    }
}

struct Manager {
    settings: ManagerSettings,
    events: EventHandler,
    mounts: HashMap<String, Mount>,
    orphans: HashMap<Identifier, Arc<Metadata>>,
    internal: mpsc::UnboundedSender<Internal>,
    shutdown: CancellationToken,
    generation: u64,
    /// Set while a handoff is in flight
    frozen: bool,
    deferred: Vec<SourceClient>,
}

impl Manager {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(event) = internal.recv() => self.handle_internal(event),
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }

        self.close_all();
        self.events.close();
        debug!("proxy manager stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::AddSource {
                client,
                restored,
                reply,
            } => {
                self.add_source(client, restored);
                let _ = reply.send(());
            }
            Request::SendMetadata { metadata, reply } => {
                self.send_metadata(metadata);
                let _ = reply.send(());
            }
            Request::ListSources { reply } => {
                let _ = reply.send(self.list_sources());
            }
            Request::KickSource { id, reply } => {
                let _ = reply.send(self.kick_source(id));
            }
            Request::RestoreMount {
                record,
                upstream,
                reply,
            } => {
                self.restore_mount(record, upstream);
                let _ = reply.send(());
            }
            Request::RestoreOrphans { orphans, reply } => {
                self.restore_orphans(orphans);
                let _ = reply.send(());
            }
            Request::Export { reply } => {
                let snapshot = self.export().await;
                let _ = reply.send(snapshot);
            }
            Request::Resume { reply } => {
                self.resume();
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::SourceEnded { mount, id } => {
                self.remove_source(&mount, id);
            }
            Internal::MountExpired { name, generation } => {
                let expired = self
                    .mounts
                    .get(&name)
                    .is_some_and(|m| m.cleanup == Some(generation) && m.sources.is_empty());
                if expired {
                    if let Some(mount) = self.mounts.remove(&name) {
                        info!(mount = %name, "removing empty mount");
                        mount.upstream.close();
                    }
                }
            }
        }
    }

    fn add_source(&mut self, client: SourceClient, restored: bool) {
        if self.frozen && !restored {
            info!(mount = %client.mount, source_id = %client.id, "holding source until handoff finishes");
            self.deferred.push(client);
            return;
        }

        let SourceClient {
            id,
            start,
            user_agent,
            content_type,
            mount: mount_name,
            user,
            identifier,
            address,
            metadata,
            conn,
        } = client;

        let metadata = match self.orphans.remove(&identifier) {
            Some(orphan) => {
                debug!(mount = %mount_name, %identifier, "attaching stored metadata to new source");
                Some(orphan)
            }
            None => metadata,
        };

        let mount = match self.mounts.entry(mount_name.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                info!(mount = %mount_name, content_type = %content_type, "creating mount");
                let upstream = spawn_upstream(
                    mount_name.clone(),
                    content_type.clone(),
                    &self.settings.upstream,
                    None,
                    self.shutdown.child_token(),
                );
                entry.insert(Mount::new(mount_name.clone(), content_type.clone(), upstream))
            }
        };

        if mount.content_type != content_type {
            warn!(
                mount = %mount_name,
                mount_content_type = %mount.content_type,
                source_content_type = %content_type,
                "source content type does not match mount"
            );
        }
        mount.cleanup = None;

        let (live, live_rx) = watch::channel(None);
        let close = self.shutdown.child_token();
        let detach = CancellationToken::new();
        let task = SourceTask {
            id,
            mount: mount_name.clone(),
            conn,
            idle_timeout: self.settings.idle_timeout,
            live: live_rx,
            close: close.clone(),
            detach: detach.clone(),
        };

        let internal = self.internal.clone();
        let task_mount = mount_name.clone();
        let task = tokio::spawn(async move {
            let exit = task.run().await;
            log_exit(&task_mount, id, &exit);
            match exit {
                SourceExit::Detached(conn) => Some(conn),
                SourceExit::Ended(_) => {
                    let _ = internal.send(Internal::SourceEnded {
                        mount: task_mount,
                        id,
                    });
                    None
                }
                SourceExit::Closed => None,
            }
        });

        let info = SourceInfo {
            id,
            mount: mount_name.clone(),
            user,
            user_agent,
            address,
            start,
            priority: 0,
        };
        let priority = mount.add(MountSource {
            info,
            content_type,
            identifier,
            metadata,
            live,
            close,
            detach,
            task,
        });

        if let Some(source) = mount.get(id) {
            info!(
                mount = %mount_name,
                source_id = %id,
                %identifier,
                username = %source.info.user.username,
                address = %source.info.address,
                priority,
                "adding source client"
            );
            self.events.source_connected(source.info.clone());
        }

        self.reelect(&mount_name);
    }

    fn remove_source(&mut self, mount_name: &str, id: SourceId) -> bool {
        let Some(mount) = self.mounts.get_mut(mount_name) else {
            return false;
        };
        let Some(source) = mount.remove(id) else {
            return false;
        };

        source.close.cancel();
        source.live.send_replace(None);
        info!(
            mount = %mount_name,
            source_id = %id,
            identifier = %source.identifier,
            username = %source.info.user.username,
            "removing source client"
        );
        self.events.source_disconnected(source.info);

        self.reelect(mount_name);
        true
    }

    fn reelect(&mut self, mount_name: &str) {
        let Some(mount) = self.mounts.get_mut(mount_name) else {
            return;
        };

        match mount.elect() {
            LiveChange::Unchanged => {}
            LiveChange::Live(id) => {
                if let Some(source) = mount.get(id) {
                    self.events.live_changed(mount_name, Some(source.info.clone()));
                    if let Some(metadata) = &source.metadata {
                        mount.upstream.push_metadata(metadata.value.clone());
                        self.events.metadata_changed(id, Metadata::clone(metadata), true);
                    }
                }
            }
            LiveChange::Empty => {
                info!(mount = %mount_name, "no sources left on mount");
                self.events.live_changed(mount_name, None);
                self.schedule_cleanup(mount_name);
            }
        }
    }

    /// Delete the mount after the grace period unless a source shows up
    fn schedule_cleanup(&mut self, mount_name: &str) {
        self.generation += 1;
        let generation = self.generation;
        let Some(mount) = self.mounts.get_mut(mount_name) else {
            return;
        };
        mount.cleanup = Some(generation);

        let internal = self.internal.clone();
        let shutdown = self.shutdown.clone();
        let grace = self.settings.mount_grace;
        let name = mount_name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let _ = internal.send(Internal::MountExpired { name, generation });
                }
            }
        });
    }

    fn kick_source(&mut self, id: SourceId) -> Result<()> {
        let mount_name = self
            .mounts
            .values()
            .find(|m| m.contains(id))
            .map(|m| m.name.clone())
            .ok_or(Error::SourceNotFound(id))?;

        info!(mount = %mount_name, source_id = %id, "kicking source");
        self.remove_source(&mount_name, id);
        Ok(())
    }

    fn send_metadata(&mut self, metadata: Metadata) {
        let metadata = Arc::new(metadata);

        if let Some(mount) = self.mounts.get_mut(&metadata.mount) {
            let attached = mount.attach_metadata(&metadata);
            if !attached.is_empty() {
                for (id, is_live) in attached {
                    if is_live {
                        mount.upstream.push_metadata(metadata.value.clone());
                    }
                    self.events.metadata_changed(id, Metadata::clone(&metadata), is_live);
                }
                return;
            }
        }

        info!(
            mount = %metadata.mount,
            identifier = %metadata.identifier,
            username = %metadata.username,
            "storing metadata because no source matches"
        );
        self.orphans.insert(metadata.identifier, metadata);
    }

    fn list_sources(&self) -> Vec<ProxySource> {
        let mut sources: Vec<ProxySource> = self.mounts.values().flat_map(Mount::listing).collect();
        sources.sort_by(|a, b| a.mount.cmp(&b.mount).then(a.priority.cmp(&b.priority)));
        sources
    }

    fn restore_mount(&mut self, record: MountRecord, upstream: Option<TcpStream>) {
        if self.mounts.contains_key(&record.name) {
            warn!(mount = %record.name, "mount already exists, dropping restored upstream connection");
            return;
        }

        info!(
            mount = %record.name,
            sources = record.source_count,
            has_upstream = upstream.is_some(),
            "restoring mount"
        );
        let handle = spawn_upstream(
            record.name.clone(),
            record.content_type.clone(),
            &self.settings.upstream,
            upstream,
            self.shutdown.child_token(),
        );
        self.mounts.insert(
            record.name.clone(),
            Mount::new(record.name.clone(), record.content_type, handle),
        );
        // the first restored source cancels this
        self.schedule_cleanup(&record.name);
    }

    fn restore_orphans(&mut self, orphans: Vec<Metadata>) {
        for orphan in orphans {
            let newer = self
                .orphans
                .get(&orphan.identifier)
                .map_or(true, |existing| orphan.time >= existing.time);
            if newer {
                self.orphans.insert(orphan.identifier, Arc::new(orphan));
            }
        }
    }

    async fn export(&mut self) -> ProxySnapshot {
        self.frozen = true;
        let mounts = std::mem::take(&mut self.mounts);
        let mut snapshot = ProxySnapshot::default();

        for (name, mount) in mounts {
            let Mount {
                content_type,
                sources,
                upstream,
                ..
            } = mount;

            for source in &sources {
                source.detach.cancel();
            }

            let mut exported = Vec::with_capacity(sources.len());
            for source in sources {
                let MountSource {
                    info,
                    content_type,
                    identifier,
                    metadata,
                    mut task,
                    ..
                } = source;

                let finished = match tokio::time::timeout(EXPORT_WAIT, &mut task).await {
                    Ok(finished) => finished,
                    Err(_) => {
                        warn!(mount = %name, source_id = %info.id, "source did not detach in time, closing it");
                        task.abort();
                        continue;
                    }
                };
                match finished {
                    Ok(Some(conn)) => exported.push(SourceSnapshot {
                        record: SourceRecord {
                            id: info.id,
                            priority: info.priority,
                            user_agent: info.user_agent,
                            content_type,
                            mount: info.mount,
                            username: info.user.username,
                            identifier,
                            address: info.address,
                            metadata: metadata.map(Arc::unwrap_or_clone),
                            start: info.start,
                        },
                        conn,
                    }),
                    _ => debug!(mount = %name, source_id = %info.id, "source ended before export"),
                }
            }

            let upstream = upstream.detach(EXPORT_WAIT).await;
            info!(mount = %name, sources = exported.len(), "exported mount");
            snapshot.mounts.push(MountSnapshot {
                record: MountRecord {
                    name,
                    content_type,
                    source_count: exported.len(),
                },
                upstream,
                sources: exported,
            });
        }

        snapshot.orphans = self
            .orphans
            .drain()
            .map(|(_, metadata)| Arc::unwrap_or_clone(metadata))
            .collect();
        snapshot
    }

    fn resume(&mut self) {
        self.frozen = false;
        for client in std::mem::take(&mut self.deferred) {
            self.add_source(client, false);
        }
    }

    fn close_all(&mut self) {
        for (_, mount) in self.mounts.drain() {
            for source in &mount.sources {
                source.close.cancel();
            }
            mount.upstream.close();
        }
        self.deferred.clear();
    }
}
