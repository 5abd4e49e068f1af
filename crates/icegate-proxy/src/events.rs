// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Source and metadata events, and the sync towards the status manager
//!
//! Events are published on broadcast streams, which never block the sender.
//! The status manager is called from a task spawned per event. Each event
//! captures an `Instant` when it is raised, and a per-mount record makes sure
//! a delayed task cannot overwrite a newer state.

use crate::metadata::Metadata;
use chrono::{DateTime, Utc};
use icegate_domain_types::{SongUpdate, SourceId, StatusManager, User};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error};

const STREAM_CAPACITY: usize = 256;

/// Broadcast stream that can be closed for good
pub struct EventStream<T> {
    sender: StdMutex<Option<broadcast::Sender<T>>>,
}

impl<T: Clone> EventStream<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            sender: StdMutex::new(Some(sender)),
        }
    }

    /// Publish to current subscribers; events without subscribers are dropped
    pub fn send(&self, event: T) {
        if let Some(sender) = self.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    /// Subscribe to future events; after `close` the receiver ends immediately
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        match self.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn close(&self) {
        self.lock().take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<broadcast::Sender<T>>> {
        self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Default for EventStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Public view of a source attached to a mount
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceInfo {
    pub id: SourceId,
    pub mount: String,
    pub user: User,
    pub user_agent: String,
    pub address: String,
    pub start: DateTime<Utc>,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEvent {
    Connect(SourceInfo),
    Disconnect(SourceInfo),
    LiveChanged {
        mount: String,
        source: Option<SourceInfo>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataEvent {
    pub mount: String,
    pub source_id: SourceId,
    pub metadata: Metadata,
    pub is_live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    LiveSource,
    LiveMetadata,
}

/// Last applied instant per event kind, for one mount
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EventRecord {
    live_source: Option<Instant>,
    live_metadata: Option<Instant>,
}

impl EventRecord {
    fn slot(&mut self, kind: RecordKind) -> &mut Option<Instant> {
        match kind {
            RecordKind::LiveSource => &mut self.live_source,
            RecordKind::LiveMetadata => &mut self.live_metadata,
        }
    }

    /// Only events strictly newer than the last applied one may proceed
    pub(crate) fn is_fresh(&mut self, kind: RecordKind, instant: Instant) -> bool {
        match *self.slot(kind) {
            Some(recorded) => instant > recorded,
            None => true,
        }
    }

    pub(crate) fn record(&mut self, kind: RecordKind, instant: Instant) {
        *self.slot(kind) = Some(instant);
    }
}

/// Publishes events and keeps the status manager in step with the primary mount
#[derive(Clone)]
pub struct EventHandler {
    inner: Arc<Inner>,
}

struct Inner {
    primary_mount: String,
    status: Arc<dyn StatusManager>,
    records: Mutex<HashMap<String, EventRecord>>,
    sources: EventStream<SourceEvent>,
    metadata: EventStream<MetadataEvent>,
}

impl EventHandler {
    pub fn new(primary_mount: impl Into<String>, status: Arc<dyn StatusManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                primary_mount: primary_mount.into(),
                status,
                records: Mutex::new(HashMap::new()),
                sources: EventStream::new(),
                metadata: EventStream::new(),
            }),
        }
    }

    pub fn source_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.inner.sources.subscribe()
    }

    pub fn metadata_events(&self) -> broadcast::Receiver<MetadataEvent> {
        self.inner.metadata.subscribe()
    }

    pub fn close(&self) {
        self.inner.sources.close();
        self.inner.metadata.close();
    }

    pub(crate) fn source_connected(&self, source: SourceInfo) {
        self.inner.sources.send(SourceEvent::Connect(source));
    }

    pub(crate) fn source_disconnected(&self, source: SourceInfo) {
        self.inner.sources.send(SourceEvent::Disconnect(source));
    }

    pub(crate) fn live_changed(&self, mount: &str, source: Option<SourceInfo>) {
        let instant = Instant::now();
        self.inner.sources.send(SourceEvent::LiveChanged {
            mount: mount.to_string(),
            source: source.clone(),
        });

        let inner = self.inner.clone();
        let mount = mount.to_string();
        tokio::spawn(async move {
            let user = source.map(|s| s.user);
            inner
                .sync(&mount, RecordKind::LiveSource, instant, |status| async move {
                    status.update_user(user).await
                })
                .await;
        });
    }

    pub(crate) fn metadata_changed(&self, source_id: SourceId, metadata: Metadata, is_live: bool) {
        let instant = Instant::now();
        let mount = metadata.mount.clone();
        self.inner.metadata.send(MetadataEvent {
            mount: mount.clone(),
            source_id,
            metadata: metadata.clone(),
            is_live,
        });

        if !is_live {
            return;
        }

        let song = SongUpdate {
            metadata: metadata.value,
            start: Utc::now(),
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .sync(&mount, RecordKind::LiveMetadata, instant, |status| async move {
                    status.update_song(song).await
                })
                .await;
        });
    }
}

impl Inner {
    async fn sync<F, Fut>(&self, mount: &str, kind: RecordKind, instant: Instant, call: F)
    where
        F: FnOnce(Arc<dyn StatusManager>) -> Fut,
        Fut: std::future::Future<Output = Result<(), icegate_domain_types::StatusError>>,
    {
        let mut records = self.records.lock().await;
        let record = records.entry(mount.to_string()).or_default();
        if !record.is_fresh(kind, instant) {
            debug!(mount, ?kind, "dropping outdated event");
            return;
        }

        if mount == self.primary_mount {
            if let Err(e) = call(self.status.clone()).await {
                error!(mount, ?kind, error = %e, "failed to update status manager");
                return;
            }
        }

        record.record(kind, instant);
    }
}
