// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Status reporting towards the control plane

use crate::user::User;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Song information pushed when the live source's metadata changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongUpdate {
    pub metadata: String,
    pub start: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Status update rejected: {message}")]
    Rejected { message: String },

    #[error("Status endpoint unreachable: {message}")]
    Unreachable { message: String },
}

/// Receiver of "who is live" and "what is playing" updates for the primary mount
#[async_trait]
pub trait StatusManager: Send + Sync {
    /// `None` means nobody is live anymore
    async fn update_user(&self, user: Option<User>) -> Result<(), StatusError>;

    async fn update_song(&self, song: SongUpdate) -> Result<(), StatusError>;
}
