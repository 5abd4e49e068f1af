// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ingest proxy for Icecast-style radio sources
//!
//! Encoders connect here instead of to the master server. Several sources
//! may stream to one mount; the earliest connected one is live and forwarded
//! upstream, later ones stand by and take over when it leaves. Metadata
//! updates are matched to their source by an identifier derived from user,
//! mount and host. A running proxy can hand every live connection to a
//! freshly started copy of itself on `SIGUSR2`.

pub mod app;
pub mod auth;
pub mod compat;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod handoff;
pub mod identifier;
pub mod manager;
pub mod metadata;
mod mount;
pub mod server;
pub mod source;
pub mod storage;
pub mod upstream;

pub use app::run;
pub use compat::{CompatListener, CompatStream};
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use events::{EventHandler, MetadataEvent, SourceEvent, SourceInfo};
pub use identifier::Identifier;
pub use manager::{ManagerSettings, ProxyManager};
pub use metadata::Metadata;
pub use server::{AppState, IngestServer};
pub use source::{SourceClient, SourceConnection};
pub use upstream::MasterServer;
