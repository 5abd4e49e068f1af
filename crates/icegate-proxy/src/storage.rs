// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Built-in collaborators: a static user table and two status managers

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::upstream::user_agent;
use async_trait::async_trait;
use icegate_domain_types::{SongUpdate, StatusError, StatusManager, StorageError, User, UserStorage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Users loaded from the configuration file
#[derive(Debug, Default)]
pub struct StaticUserStorage {
    users: HashMap<String, User>,
}

impl StaticUserStorage {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.username.clone(), u)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserStorage for StaticUserStorage {
    async fn get(&self, username: &str) -> std::result::Result<Option<User>, StorageError> {
        Ok(self.users.get(username).cloned())
    }
}

/// Status manager that only logs; used when no endpoint is configured
#[derive(Debug, Default)]
pub struct LoggingStatusManager;

#[async_trait]
impl StatusManager for LoggingStatusManager {
    async fn update_user(&self, user: Option<User>) -> std::result::Result<(), StatusError> {
        match user {
            Some(user) => info!(username = %user.username, "live user changed"),
            None => info!("nobody is live"),
        }
        Ok(())
    }

    async fn update_song(&self, song: SongUpdate) -> std::result::Result<(), StatusError> {
        info!(metadata = %song.metadata, start = %song.start, "song changed");
        Ok(())
    }
}

/// Posts JSON updates to `{endpoint}/user` and `{endpoint}/song`
#[derive(Debug, Clone)]
pub struct HttpStatusManager {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpStatusManager {
    pub fn new(endpoint: &str) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint)
            .map_err(|e| Error::config(format!("Invalid status endpoint '{}': {}", endpoint, e)))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .timeout(STATUS_TIMEOUT)
            .build()?;
        Ok(Self { endpoint, client })
    }

    async fn post<B: serde::Serialize>(&self, path: &str, body: &B) -> std::result::Result<(), StatusError> {
        let url = self.endpoint.join(path).map_err(|e| StatusError::Rejected {
            message: e.to_string(),
        })?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| StatusError::Unreachable {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StatusError::Rejected {
                message: format!("{}: {}", status, text),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StatusManager for HttpStatusManager {
    async fn update_user(&self, user: Option<User>) -> std::result::Result<(), StatusError> {
        self.post("user", &user).await
    }

    async fn update_song(&self, song: SongUpdate) -> std::result::Result<(), StatusError> {
        self.post("song", &song).await
    }
}

/// Pick the status manager the configuration asks for
pub fn status_manager(config: &ProxyConfig) -> Result<Arc<dyn StatusManager>> {
    Ok(match &config.status.endpoint {
        Some(endpoint) => Arc::new(HttpStatusManager::new(endpoint)?),
        None => Arc::new(LoggingStatusManager),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use icegate_domain_types::{hash_password_with_cost, Permission, MIN_PASSWORD_COST};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn static_storage_finds_configured_users() {
        let storage = StaticUserStorage::new([User::new(
            "dj",
            hash_password_with_cost("pw", MIN_PASSWORD_COST).unwrap(),
            &[Permission::Active, Permission::Dj],
        )]);
        assert_eq!(storage.len(), 1);

        let user = storage.get("dj").await.unwrap().unwrap();
        assert!(user.verify_password("pw"));
        assert!(storage.get("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn http_manager_posts_song_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    if text[end + 4..].contains('}') {
                        break;
                    }
                }
            }
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        let manager = HttpStatusManager::new(&format!("http://{}/status", addr)).unwrap();
        manager
            .update_song(SongUpdate {
                metadata: "Artist - Title".into(),
                start: Utc::now(),
            })
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /status/song HTTP/1.1"));
        assert!(request.contains(r#""metadata":"Artist - Title""#));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = HttpStatusManager::new(&format!("http://{}", addr)).unwrap();
        let result = manager.update_user(None).await;
        assert!(matches!(result, Err(StatusError::Unreachable { .. })));
    }
}
