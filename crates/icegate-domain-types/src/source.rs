// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Source identity and the listing entry returned for connected sources

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of one source connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub Uuid);

impl SourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Snapshot of one connected source, as returned by the proxy listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySource {
    pub mount: String,
    pub id: SourceId,
    pub username: String,
    pub user_agent: String,
    pub address: String,
    pub start: DateTime<Utc>,
    /// Latest metadata text attached to the source
    pub metadata: Option<String>,
    pub priority: u32,
    pub is_live: bool,
}
