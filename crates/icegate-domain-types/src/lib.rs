// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Domain types for the icegate ingest proxy
//!
//! This crate holds the values that cross component boundaries: users and
//! their permissions, source identities and listings, song updates, and the
//! two collaborator traits the proxy consumes (`UserStorage` and
//! `StatusManager`). Implementations of those traits live with the binary.

pub mod source;
pub mod status;
pub mod user;

// Re-export commonly used types
pub use source::*;
pub use status::*;
pub use user::*;
