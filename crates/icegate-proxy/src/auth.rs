// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP Basic authentication against the user storage

use crate::server::AppState;
use axum::{
    extract::{Extension, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use icegate_domain_types::{StorageError, User, UserStorage};
use icegate_logging::redact;
use tracing::{debug, error};

/// Shared login name that may carry `actualUser|password` in its password
pub const SHARED_SOURCE_USER: &str = "source";

const REALM: &str = "Basic realm=\"icegate\"";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Malformed authorization header")]
    Malformed,

    #[error("Invalid credentials for '{username}'")]
    InvalidCredentials { username: String },

    #[error("User '{username}' may not stream")]
    Forbidden { username: String },

    #[error("User lookup failed: {0}")]
    Storage(#[from] StorageError),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingCredentials
            | AuthError::Malformed
            | AuthError::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AuthError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn challenges(&self) -> bool {
        self.status() == StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, self.to_string()).into_response();
        if self.challenges() {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
        }
        response
    }
}

/// Username and password as submitted, after the shared-login override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Parse an `Authorization: Basic ...` value
    pub fn from_basic(value: &str) -> Result<Self, AuthError> {
        let (scheme, token) = value.trim().split_once(' ').ok_or(AuthError::Malformed)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::Malformed);
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|_| AuthError::Malformed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
        let (username, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;

        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
        }
        .resolve_shared_login())
    }

    fn resolve_shared_login(self) -> Self {
        if self.username != SHARED_SOURCE_USER {
            return self;
        }
        match self.password.split_once('|') {
            Some((user, password)) if !user.is_empty() => Self {
                username: user.to_string(),
                password: password.to_string(),
            },
            _ => self,
        }
    }
}

/// Resolve the user behind an `Authorization` header value
///
/// The user must exist, be active and know its password.
pub async fn authenticate(storage: &dyn UserStorage, authorization: Option<&str>) -> Result<User, AuthError> {
    let credentials = Credentials::from_basic(authorization.ok_or(AuthError::MissingCredentials)?)?;

    let user = storage.get(&credentials.username).await?;
    match user {
        Some(user) if user.is_active() && user.verify_password(&credentials.password) => Ok(user),
        _ => {
            debug!(
                username = %credentials.username,
                password = %redact(&credentials.password),
                "rejecting credentials"
            );
            Err(AuthError::InvalidCredentials {
                username: credentials.username,
            })
        }
    }
}

pub fn require_dj(user: &User) -> Result<(), AuthError> {
    if user.is_dj() {
        Ok(())
    } else {
        Err(AuthError::Forbidden {
            username: user.username.clone(),
        })
    }
}

/// Middleware for the admin router: authenticates and stores the `User` in extensions
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    match authenticate(state.storage.as_ref(), authorization).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(e) => {
            if let AuthError::Storage(err) = &e {
                error!(error = %err, "user storage failed during authentication");
            }
            e.into_response()
        }
    }
}

/// Route layer for DJ-only admin routes; expects `auth_middleware` to have run
pub async fn dj_middleware(Extension(user): Extension<User>, req: Request, next: Next) -> Response {
    match require_dj(&user) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StaticUserStorage;
    use icegate_domain_types::{hash_password_with_cost, Permission, MIN_PASSWORD_COST};

    fn basic(user: &str, password: &str) -> String {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
        format!("Basic {}", token)
    }

    fn user(name: &str, password: &str, permissions: &[Permission]) -> User {
        User::new(name, hash_password_with_cost(password, MIN_PASSWORD_COST).unwrap(), permissions)
    }

    fn storage() -> StaticUserStorage {
        StaticUserStorage::new([
            user("dj", "pw", &[Permission::Active, Permission::Dj]),
            user("listener", "pw", &[Permission::Active]),
            user("retired", "pw", &[Permission::Dj]),
            user("source", "hackme", &[Permission::Active, Permission::Dj]),
        ])
    }

    #[test]
    fn parses_basic_credentials() {
        let creds = Credentials::from_basic(&basic("dj", "a:b")).unwrap();
        assert_eq!(creds.username, "dj");
        assert_eq!(creds.password, "a:b");

        assert!(matches!(Credentials::from_basic("Bearer abc"), Err(AuthError::Malformed)));
        assert!(matches!(Credentials::from_basic("Basic !!!"), Err(AuthError::Malformed)));
        assert!(matches!(
            Credentials::from_basic(&basic("dj", "")),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn shared_login_names_the_real_user() {
        let creds = Credentials::from_basic(&basic("source", "dj|pw")).unwrap();
        assert_eq!(creds.username, "dj");
        assert_eq!(creds.password, "pw");

        // only the shared name is rewritten
        let creds = Credentials::from_basic(&basic("dj", "other|pw")).unwrap();
        assert_eq!(creds.username, "dj");
        assert_eq!(creds.password, "other|pw");

        let creds = Credentials::from_basic(&basic("source", "hackme")).unwrap();
        assert_eq!(creds.username, "source");
    }

    #[tokio::test]
    async fn authenticate_checks_password_and_activity() {
        let storage = storage();

        let user = authenticate(&storage, Some(basic("dj", "pw").as_str())).await.unwrap();
        assert_eq!(user.username, "dj");
        let user = authenticate(&storage, Some(basic("source", "dj|pw").as_str())).await.unwrap();
        assert_eq!(user.username, "dj");

        for (name, password) in [("dj", "wrong"), ("retired", "pw"), ("ghost", "pw")] {
            let err = authenticate(&storage, Some(basic(name, password).as_str())).await.unwrap_err();
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED, "{name}");
        }
        let err = authenticate(&storage, None).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials));
    }

    #[tokio::test]
    async fn dj_permission_is_required() {
        let storage = storage();
        let user = authenticate(&storage, Some(basic("listener", "pw").as_str())).await.unwrap();
        let err = require_dj(&user).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let response = err.into_response();
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());

        let response = AuthError::MissingCredentials.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], REALM);
    }
}
