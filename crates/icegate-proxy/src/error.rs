// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the ingest proxy

use crate::handoff::HandoffError;
use icegate_domain_types::{SourceId, StorageError};

/// Result type alias for operations that can fail
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the ingest proxy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Source not found: {0}")]
    SourceNotFound(SourceId),

    #[error("Proxy manager has shut down")]
    Shutdown,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("HTTP client error: {source}")]
    HttpClient {
        #[from]
        source: reqwest::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("YAML serialization error: {source}")]
    YamlSerialization {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("User storage error: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },

    #[error("Handoff error: {source}")]
    Handoff {
        #[from]
        source: HandoffError,
    },
}

impl Error {
    pub(crate) fn upstream(message: impl Into<String>) -> Self {
        Error::Upstream {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}
