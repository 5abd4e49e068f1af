// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(dead_code)]

use async_trait::async_trait;
use icegate_domain_types::{
    hash_password_with_cost, Permission, SongUpdate, StatusError, StatusManager, User, MIN_PASSWORD_COST,
};
use icegate_proxy::{EventHandler, ManagerSettings, MasterServer, ProxyConfig, ProxyManager};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);
pub const PRIMARY: &str = "/main.mp3";

/// What the fake master server saw
#[derive(Debug, Clone, PartialEq)]
pub enum MasterEvent {
    Source { mount: String, authorization: Option<String> },
    Audio { mount: String, bytes: Vec<u8> },
    Metadata { target: String },
    /// A source connection ended, from either side
    Closed { mount: String },
    /// A source connection was refused with 403
    Rejected { mount: String },
}

/// How the fake master treats one source connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// 200, then read until the proxy hangs up
    Read,
    /// 200, then hang up after the first audio
    DropAfterAudio,
    /// 403 without reading any audio
    Reject,
    /// 200, then never read again
    Stall,
}

/// Loopback stand-in for the upstream distribution server
pub struct FakeMaster {
    pub url: String,
    pub events: mpsc::UnboundedReceiver<MasterEvent>,
    plan: Arc<Mutex<VecDeque<Answer>>>,
}

impl FakeMaster {
    pub async fn start() -> Self {
        Self::start_with(Answer::Read).await
    }

    /// `default` answers every source connection not covered by `answer_next`
    pub async fn start_with(default: Answer) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind master");
        let addr = listener.local_addr().unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let plan = Arc::new(Mutex::new(VecDeque::new()));

        let accept_plan = plan.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_master_conn(stream, tx.clone(), accept_plan.clone(), default));
            }
        });

        Self {
            url: format!("http://source:hackme@{}", addr),
            events,
            plan,
        }
    }

    /// Queue answers for the next source connections, in order
    pub fn answer_next(&self, answers: impl IntoIterator<Item = Answer>) {
        self.plan.lock().unwrap().extend(answers);
    }

    /// Events already received, without waiting
    pub fn drain(&mut self) -> Vec<MasterEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }

    pub async fn next(&mut self) -> MasterEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("master event in time")
            .expect("master still running")
    }

    /// Skip events until one matches
    pub async fn until(&mut self, mut matches: impl FnMut(&MasterEvent) -> bool) -> MasterEvent {
        loop {
            let event = self.next().await;
            if matches(&event) {
                return event;
            }
        }
    }

    /// Audio forwarded for `mount` until `needle` has been seen
    pub async fn audio_containing(&mut self, mount: &str, needle: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        loop {
            if let MasterEvent::Audio { mount: m, bytes } = self.next().await {
                if m == mount {
                    seen.extend_from_slice(&bytes);
                    if seen.windows(needle.len()).any(|w| w == needle) {
                        return seen;
                    }
                }
            }
        }
    }
}

async fn serve_master_conn(
    mut stream: TcpStream,
    tx: mpsc::UnboundedSender<MasterEvent>,
    plan: Arc<Mutex<VecDeque<Answer>>>,
    default: Answer,
) {
    let mut head = Vec::new();
    let mut buf = [0u8; 4096];
    let body_start = loop {
        let Ok(n) = stream.read(&mut buf).await else { return };
        if n == 0 {
            return;
        }
        head.extend_from_slice(&buf[..n]);
        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let text = String::from_utf8_lossy(&head[..body_start]).into_owned();
    let mut words = text.split_whitespace();
    let method = words.next().unwrap_or_default().to_string();
    let target = words.next().unwrap_or_default().to_string();
    let authorization = text
        .lines()
        .find_map(|l| l.strip_prefix("Authorization: "))
        .map(str::to_string);

    if method == "GET" {
        let _ = tx.send(MasterEvent::Metadata { target });
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await;
        return;
    }

    let answer = plan.lock().unwrap().pop_front().unwrap_or(default);
    if answer == Answer::Reject {
        let _ = tx.send(MasterEvent::Rejected { mount: target });
        let _ = stream.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
        return;
    }

    let _ = tx.send(MasterEvent::Source {
        mount: target.clone(),
        authorization,
    });
    if stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
        return;
    }
    if answer == Answer::Stall {
        // keep the socket open so the proxy's writes pile up
        std::future::pending::<()>().await;
    }

    let mut audio = head[body_start..].to_vec();
    loop {
        if !audio.is_empty() {
            let _ = tx.send(MasterEvent::Audio {
                mount: target.clone(),
                bytes: std::mem::take(&mut audio),
            });
            if answer == Answer::DropAfterAudio {
                break;
            }
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => audio.extend_from_slice(&buf[..n]),
        }
    }
    drop(stream);
    let _ = tx.send(MasterEvent::Closed { mount: target });
}

/// Keeps writing `payload` like an encoder would; stopping drops the connection
pub struct Pump {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Pump {
    pub fn start<W>(encoder: W, payload: &'static [u8]) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(encoder, payload.to_vec(), Duration::from_millis(20))
    }

    /// Write 64 KiB chunks as fast as the connection takes them
    pub fn flood<W>(encoder: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(encoder, vec![0x55; 64 * 1024], Duration::ZERO)
    }

    fn spawn<W>(mut encoder: W, payload: Vec<u8>, every: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        if encoder.write_all(&payload).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self { stop, task }
    }

    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

/// Status manager that remembers every call
#[derive(Default)]
pub struct RecordingStatus {
    pub users: Mutex<Vec<Option<String>>>,
    pub songs: Mutex<Vec<String>>,
}

#[async_trait]
impl StatusManager for RecordingStatus {
    async fn update_user(&self, user: Option<User>) -> Result<(), StatusError> {
        self.users.lock().unwrap().push(user.map(|u| u.username));
        Ok(())
    }

    async fn update_song(&self, song: SongUpdate) -> Result<(), StatusError> {
        self.songs.lock().unwrap().push(song.metadata);
        Ok(())
    }
}

/// Every test user's password is "pw"
pub fn user(name: &str, permissions: &[Permission]) -> User {
    let hash = hash_password_with_cost("pw", MIN_PASSWORD_COST).unwrap();
    User::new(name, hash, permissions)
}

pub fn dj(name: &str) -> User {
    user(name, &[Permission::Active, Permission::Dj])
}

pub fn config(master_url: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.proxy.master_server = master_url.to_string();
    config.proxy.primary_mount = PRIMARY.to_string();
    config.proxy.mount_grace_ms = 200;
    config.server.source_idle_timeout_ms = 30_000;
    config
}

pub struct TestProxy {
    pub manager: ProxyManager,
    pub status: Arc<RecordingStatus>,
    pub shutdown: CancellationToken,
}

pub fn spawn_manager(config: &ProxyConfig) -> TestProxy {
    let status = Arc::new(RecordingStatus::default());
    let events = EventHandler::new(config.proxy.primary_mount.clone(), status.clone());
    let master = MasterServer::new(config.proxy.master_url().unwrap());
    let shutdown = CancellationToken::new();
    let manager = ProxyManager::spawn(
        ManagerSettings::new(master, config),
        events,
        shutdown.clone(),
    );
    TestProxy {
        manager,
        status,
        shutdown,
    }
}

pub async fn recv<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("event in time")
        .expect("event stream open")
}

/// Poll `check` until it holds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
