// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Users, permissions and the storage trait used to resolve them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single capability granted to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Account is enabled; required for any login
    Active,
    /// May stream and send metadata
    Dj,
    /// Developer access, implies DJ rights
    Dev,
    /// Administrator access, implies DJ rights
    Admin,
}

/// A user as known to the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// bcrypt hash of the password (`$2b$...`)
    #[serde(default, skip_serializing)]
    pub password_hash: String,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
}

impl User {
    /// Build a user from an already hashed password
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>, permissions: &[Permission]) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            permissions: permissions.iter().copied().collect(),
        }
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn is_active(&self) -> bool {
        self.has(Permission::Active)
    }

    /// DJ rights are also held by developers and administrators
    pub fn is_dj(&self) -> bool {
        self.has(Permission::Dj) || self.has(Permission::Dev) || self.has(Permission::Admin)
    }

    /// A malformed or empty stored hash never verifies
    pub fn verify_password(&self, password: &str) -> bool {
        !self.password_hash.is_empty() && bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }
}

/// Work factor for hashes produced by `hash_password`
pub const PASSWORD_COST: u32 = bcrypt::DEFAULT_COST;

/// Lowest work factor bcrypt accepts
pub const MIN_PASSWORD_COST: u32 = 4;

/// bcrypt hash in the form stored in `User::password_hash`
pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    hash_password_with_cost(password, PASSWORD_COST)
}

pub fn hash_password_with_cost(password: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, cost)
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("User storage unavailable: {message}")]
    Unavailable { message: String },
}

/// Lookup of users by name
#[async_trait]
pub trait UserStorage: Send + Sync {
    /// Returns `Ok(None)` when the user does not exist
    async fn get(&self, username: &str) -> Result<Option<User>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, password: &str, permissions: &[Permission]) -> User {
        User::new(name, hash_password_with_cost(password, MIN_PASSWORD_COST).unwrap(), permissions)
    }

    #[test]
    fn dj_rights_are_implied_by_dev_and_admin() {
        let dj = user("a", "pw", &[Permission::Active, Permission::Dj]);
        let dev = user("b", "pw", &[Permission::Active, Permission::Dev]);
        let admin = user("c", "pw", &[Permission::Admin]);
        let listener = user("d", "pw", &[Permission::Active]);

        assert!(dj.is_dj());
        assert!(dev.is_dj());
        assert!(admin.is_dj());
        assert!(!listener.is_dj());
        assert!(!admin.is_active());
    }

    #[test]
    fn password_verification() {
        let dj = user("dj", "hackme", &[Permission::Active]);
        assert!(dj.password_hash.starts_with("$2b$04$"));
        assert!(dj.verify_password("hackme"));
        assert!(!dj.verify_password("hackm"));

        // hashes written by other bcrypt implementations
        let legacy = bcrypt::hash_with_result("hackme", MIN_PASSWORD_COST)
            .unwrap()
            .format_for_version(bcrypt::Version::TwoA);
        assert!(legacy.starts_with("$2a$"));
        assert!(User::new("old", legacy, &[]).verify_password("hackme"));

        let mut garbage = dj.clone();
        garbage.password_hash = "not a hash".into();
        assert!(!garbage.verify_password("hackme"));

        let mut empty = dj;
        empty.password_hash.clear();
        assert!(!empty.verify_password(""));
    }

    #[test]
    fn permissions_deserialize_lowercase() {
        let user: User = serde_json::from_str(
            r#"{"username":"dj","password_hash":"$2b$04$x","permissions":["active","dj"]}"#,
        )
        .unwrap();
        assert!(user.is_active());
        assert!(user.has(Permission::Dj));
    }
}
