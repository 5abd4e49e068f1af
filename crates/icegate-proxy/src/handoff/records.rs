// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Records exchanged over the handoff channel, one JSON object per message

use crate::identifier::Identifier;
use crate::metadata::Metadata;
use chrono::{DateTime, Utc};
use icegate_domain_types::SourceId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandoffRecord {
    /// Proxy-wide state; carries the listener descriptor
    Proxy(ProxyRecord),
    /// Carries the upstream descriptor when the mount was connected
    Mount(MountRecord),
    /// Carries the source connection descriptor; belongs to the preceding mount
    Source(SourceRecord),
    Done,
    /// Successor's acknowledgement
    Restored(RestoredRecord),
}

impl HandoffRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            HandoffRecord::Proxy(_) => "proxy",
            HandoffRecord::Mount(_) => "mount",
            HandoffRecord::Source(_) => "source",
            HandoffRecord::Done => "done",
            HandoffRecord::Restored(_) => "restored",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub orphans: Vec<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRecord {
    pub name: String,
    pub content_type: String,
    pub source_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: SourceId,
    pub priority: u32,
    pub user_agent: String,
    pub content_type: String,
    pub mount: String,
    pub username: String,
    pub identifier: Identifier,
    pub address: String,
    pub metadata: Option<Metadata>,
    pub start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoredRecord {
    pub sources: usize,
}
