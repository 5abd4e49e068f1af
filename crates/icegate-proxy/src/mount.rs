// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mounts and the priority rules that pick their live source
//!
//! Lower priority values win. A new source always gets one more than the
//! current maximum, so it queues behind everybody already connected.

use crate::events::SourceInfo;
use crate::identifier::Identifier;
use crate::metadata::Metadata;
use crate::source::{LiveSink, SourceConnection};
use crate::upstream::UpstreamHandle;
use icegate_domain_types::{ProxySource, SourceId};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub(crate) trait Prioritized {
    fn priority(&self) -> u32;
}

/// Priority that queues a newcomer behind every current source
pub(crate) fn least_priority<T: Prioritized>(sources: &[T]) -> u32 {
    sources
        .iter()
        .map(Prioritized::priority)
        .max()
        .map_or(0, |max| max + 1)
}

/// The source that should be live: the lowest priority value
pub(crate) fn most_priority<T: Prioritized>(sources: &[T]) -> Option<&T> {
    sources.iter().min_by_key(|s| s.priority())
}

/// A source attached to a mount, as tracked by the manager
pub(crate) struct MountSource {
    pub info: SourceInfo,
    pub content_type: String,
    pub identifier: Identifier,
    pub metadata: Option<Arc<Metadata>>,
    pub live: watch::Sender<LiveSink>,
    pub close: CancellationToken,
    pub detach: CancellationToken,
    /// Yields the connection back when the task was detached
    pub task: JoinHandle<Option<Box<dyn SourceConnection>>>,
}

impl Prioritized for MountSource {
    fn priority(&self) -> u32 {
        self.info.priority
    }
}

impl MountSource {
    pub fn id(&self) -> SourceId {
        self.info.id
    }

    pub fn listing(&self, is_live: bool) -> ProxySource {
        ProxySource {
            mount: self.info.mount.clone(),
            id: self.info.id,
            username: self.info.user.username.clone(),
            user_agent: self.info.user_agent.clone(),
            address: self.info.address.clone(),
            start: self.info.start,
            metadata: self.metadata.as_ref().map(|m| m.value.clone()),
            priority: self.info.priority,
            is_live,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LiveChange {
    Unchanged,
    Live(SourceId),
    Empty,
}

pub(crate) struct Mount {
    pub name: String,
    pub content_type: String,
    pub sources: Vec<MountSource>,
    pub live: Option<SourceId>,
    pub upstream: UpstreamHandle,
    /// Generation of the pending grace-period deletion, if any
    pub cleanup: Option<u64>,
}

impl Mount {
    pub fn new(name: String, content_type: String, upstream: UpstreamHandle) -> Self {
        Self {
            name,
            content_type,
            sources: Vec::new(),
            live: None,
            upstream,
            cleanup: None,
        }
    }

    /// Attach a source behind all current ones and return its priority
    pub fn add(&mut self, mut source: MountSource) -> u32 {
        let priority = least_priority(&self.sources);
        source.info.priority = priority;
        self.sources.push(source);
        priority
    }

    pub fn remove(&mut self, id: SourceId) -> Option<MountSource> {
        let index = self.sources.iter().position(|s| s.id() == id)?;
        Some(self.sources.remove(index))
    }

    pub fn get(&self, id: SourceId) -> Option<&MountSource> {
        self.sources.iter().find(|s| s.id() == id)
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.get(id).is_some()
    }

    /// Move the live flag to the most important source
    ///
    /// The previous live source stops forwarding before the next one starts.
    pub fn elect(&mut self) -> LiveChange {
        let next = most_priority(&self.sources).map(MountSource::id);
        if next == self.live {
            return LiveChange::Unchanged;
        }

        if let Some(previous) = self.live.and_then(|id| self.get(id)) {
            previous.live.send_replace(None);
        }
        self.live = next;

        match next.and_then(|id| self.get(id)) {
            Some(source) => {
                source.live.send_replace(Some(self.upstream.sink()));
                info!(
                    mount = %self.name,
                    source_id = %source.id(),
                    identifier = %source.identifier,
                    username = %source.info.user.username,
                    "switching to live"
                );
                LiveChange::Live(source.id())
            }
            None => LiveChange::Empty,
        }
    }

    /// Store `metadata` on every source sharing its identifier
    pub fn attach_metadata(&mut self, metadata: &Arc<Metadata>) -> Vec<(SourceId, bool)> {
        let live = self.live;
        self.sources
            .iter_mut()
            .filter(|s| s.identifier == metadata.identifier)
            .map(|s| {
                s.metadata = Some(metadata.clone());
                (s.id(), live == Some(s.id()))
            })
            .collect()
    }

    pub fn listing(&self) -> impl Iterator<Item = ProxySource> + '_ {
        self.sources
            .iter()
            .map(move |s| s.listing(self.live == Some(s.id())))
    }
}
