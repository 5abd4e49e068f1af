// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Connections to the master server
//!
//! Each mount owns one upstream task. The task holds the `PUT` connection,
//! writes whatever the live source produces and reconnects with exponential
//! backoff when a write fails or the master stops reading. Metadata goes over
//! separate admin requests, sent one at a time in arrival order.

use crate::config::BackoffConfig;
use crate::error::{Error, Result};
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use percent_encoding::percent_decode_str;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

pub fn user_agent() -> String {
    format!("icegate/{}", env!("CARGO_PKG_VERSION"))
}

/// The upstream distribution server sources are forwarded to
#[derive(Debug, Clone)]
pub struct MasterServer {
    url: Url,
    client: reqwest::Client,
}

impl MasterServer {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    /// URL with the password masked, for logs
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("xxxxx"));
        }
        url.to_string()
    }

    fn credentials(&self) -> Option<(String, String)> {
        if self.url.username().is_empty() && self.url.password().is_none() {
            return None;
        }
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        Some((
            decode(self.url.username()),
            decode(self.url.password().unwrap_or_default()),
        ))
    }

    /// Open a source connection for `mount`, ready to receive audio
    pub async fn dial(&self, mount: &str, content_type: &str) -> Result<TcpStream> {
        tokio::time::timeout(DIAL_TIMEOUT, self.dial_inner(mount, content_type))
            .await
            .map_err(|_| Error::upstream(format!("timed out dialing master for {}", mount)))?
    }

    async fn dial_inner(&self, mount: &str, content_type: &str) -> Result<TcpStream> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| Error::upstream("master URL has no host"))?;
        let port = self.url.port_or_known_default().unwrap_or(80);

        let mut stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let mut request = format!(
            "PUT {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: {}\r\nContent-Type: {}\r\nIce-Public: 0\r\n",
            mount,
            host,
            port,
            user_agent(),
            content_type
        );
        if let Some((username, password)) = self.credentials() {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            request.push_str(&format!("Authorization: Basic {}\r\n", token));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let status = read_response_status(&mut stream).await?;
        if status != 200 {
            return Err(Error::upstream(format!(
                "master answered {} for {}",
                status, mount
            )));
        }
        Ok(stream)
    }

    /// Update the song title shown for `mount`
    pub async fn send_metadata(&self, mount: &str, song: &str) -> Result<()> {
        let mut url = self.url.clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_path("/admin/metadata");
        url.query_pairs_mut()
            .clear()
            .append_pair("mode", "updinfo")
            .append_pair("mount", mount)
            .append_pair("charset", "UTF-8")
            .append_pair("song", song);

        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent());
        if let Some((username, password)) = self.credentials() {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::upstream(format!(
                "metadata update for {} rejected: {}",
                mount,
                response.status()
            )));
        }
        Ok(())
    }
}

async fn read_response_status(stream: &mut TcpStream) -> Result<u16> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::upstream("master closed the connection during the handshake"));
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                return response
                    .code
                    .ok_or_else(|| Error::upstream("master response has no status"));
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_RESPONSE_HEAD => {}
            Ok(httparse::Status::Partial) => {
                return Err(Error::upstream("master response head too large"));
            }
            Err(e) => {
                return Err(Error::upstream(format!("malformed master response: {}", e)));
            }
        }
    }
}

/// Exponential backoff without an elapsed-time limit
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_interval_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_interval_ms),
            multiplier: config.multiplier,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub(crate) enum UpstreamCommand {
    /// Stop and hand back the current connection, if any
    Detach(oneshot::Sender<Option<TcpStream>>),
}

/// Manager-side handle of a mount's upstream task
pub(crate) struct UpstreamHandle {
    data: mpsc::Sender<Bytes>,
    control: mpsc::UnboundedSender<UpstreamCommand>,
    metadata: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UpstreamHandle {
    /// Queue that the live source writes into
    pub fn sink(&self) -> mpsc::Sender<Bytes> {
        self.data.clone()
    }

    pub fn push_metadata(&self, song: String) {
        let _ = self.metadata.send(song);
    }

    /// Stop the task and take its connection for handoff
    ///
    /// A task that has not answered within `wait` is aborted and its
    /// connection dropped.
    pub async fn detach(self, wait: Duration) -> Option<TcpStream> {
        let (tx, rx) = oneshot::channel();
        if self.control.send(UpstreamCommand::Detach(tx)).is_err() {
            return None;
        }
        match tokio::time::timeout(wait, rx).await {
            Ok(reply) => {
                let conn = reply.ok().flatten();
                let _ = self.task.await;
                conn
            }
            Err(_) => {
                warn!(wait_ms = wait.as_millis() as u64, "upstream task did not detach in time, aborting it");
                self.task.abort();
                None
            }
        }
    }

    pub fn close(self) {
        self.cancel.cancel();
    }
}

pub(crate) struct UpstreamSettings {
    pub master: Arc<MasterServer>,
    pub backoff: BackoffConfig,
    pub queue: usize,
    pub write_timeout: Duration,
}

pub(crate) fn spawn_upstream(
    mount: String,
    content_type: String,
    settings: &UpstreamSettings,
    conn: Option<TcpStream>,
    cancel: CancellationToken,
) -> UpstreamHandle {
    let (data, data_rx) = mpsc::channel(settings.queue);
    let (control, control_rx) = mpsc::unbounded_channel();
    let (metadata, metadata_rx) = mpsc::unbounded_channel();

    tokio::spawn(send_metadata_in_order(
        settings.master.clone(),
        mount.clone(),
        metadata_rx,
        cancel.clone(),
    ));

    let worker = UpstreamWorker {
        mount,
        content_type,
        master: settings.master.clone(),
        backoff: Backoff::new(&settings.backoff),
        write_timeout: settings.write_timeout,
        data: data_rx,
        control: control_rx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(worker.run(conn));

    UpstreamHandle {
        data,
        control,
        metadata,
        cancel,
        task,
    }
}

/// Push titles for one mount, each after the previous one finished
///
/// Runs until the handle is dropped or `cancel` fires. Titles queued before a
/// handoff detach are still delivered.
async fn send_metadata_in_order(
    master: Arc<MasterServer>,
    mount: String,
    mut songs: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let song = tokio::select! {
            _ = cancel.cancelled() => return,
            song = songs.recv() => match song {
                Some(song) => song,
                None => return,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = master.send_metadata(&mount, &song) => {
                if let Err(e) = result {
                    error!(mount = %mount, error = %e, "failed to send metadata");
                }
            }
        }
    }
}

struct UpstreamWorker {
    mount: String,
    content_type: String,
    master: Arc<MasterServer>,
    backoff: Backoff,
    write_timeout: Duration,
    data: mpsc::Receiver<Bytes>,
    control: mpsc::UnboundedReceiver<UpstreamCommand>,
    cancel: CancellationToken,
}

/// Outcome of waiting on something while still serving the channels
enum Serviced<T> {
    Done(T),
    Stop,
}

/// Outcome of writing one chunk to the master
enum Forwarded {
    Sent,
    /// The connection is unusable and must be replaced
    Failed,
    Stop,
    /// A detach arrived during the write, which completed intact
    Detach(oneshot::Sender<Option<TcpStream>>),
}

impl UpstreamWorker {
    async fn run(mut self, mut conn: Option<TcpStream>) {
        loop {
            let Some(stream) = conn.as_mut() else {
                match self.connect().await {
                    Some(stream) => conn = Some(stream),
                    None => return,
                }
                continue;
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                command = self.control.recv() => match command {
                    None => return,
                    Some(UpstreamCommand::Detach(reply)) => {
                        debug!(mount = %self.mount, "detaching upstream connection");
                        let _ = reply.send(conn.take());
                        return;
                    }
                },
                chunk = self.data.recv() => match chunk {
                    None => return,
                    Some(chunk) => match self.forward(stream, &chunk).await {
                        Forwarded::Sent => {}
                        Forwarded::Failed => conn = None,
                        Forwarded::Stop => return,
                        Forwarded::Detach(reply) => {
                            debug!(mount = %self.mount, "detaching upstream connection");
                            let _ = reply.send(conn.take());
                            return;
                        }
                    },
                },
            }
        }
    }

    /// Write one chunk within the write timeout
    ///
    /// Cancellation interrupts the write. A detach waits for it so that only
    /// a connection on a chunk boundary is handed over.
    async fn forward(&mut self, stream: &mut TcpStream, chunk: &[u8]) -> Forwarded {
        let write = tokio::time::timeout(self.write_timeout, stream.write_all(chunk));
        tokio::pin!(write);
        let mut detach = None;

        let result = loop {
            tokio::select! {
                biased;
                result = &mut write => break result,
                _ = self.cancel.cancelled() => return Forwarded::Stop,
                command = self.control.recv(), if detach.is_none() => match command {
                    None => return Forwarded::Stop,
                    Some(UpstreamCommand::Detach(reply)) => detach = Some(reply),
                },
            }
        };

        let sent = match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(mount = %self.mount, error = %e, "failed to write to master");
                false
            }
            Err(_) => {
                error!(
                    mount = %self.mount,
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "master stopped reading, dropping connection"
                );
                false
            }
        };

        match (sent, detach) {
            (true, None) => Forwarded::Sent,
            (false, None) => Forwarded::Failed,
            (true, Some(reply)) => Forwarded::Detach(reply),
            (false, Some(reply)) => {
                let _ = reply.send(None);
                Forwarded::Stop
            }
        }
    }

    /// Dial until it works; `None` when the task should stop instead
    async fn connect(&mut self) -> Option<TcpStream> {
        self.backoff.reset();
        loop {
            info!(mount = %self.mount, url = %self.master.redacted(), "dialing master server");
            let master = self.master.clone();
            let (mount, content_type) = (self.mount.clone(), self.content_type.clone());
            let attempt = async move { master.dial(&mount, &content_type).await };

            match self.serviced(attempt).await {
                Serviced::Stop => return None,
                Serviced::Done(Ok(stream)) => {
                    info!(mount = %self.mount, "connected to master server");
                    return Some(stream);
                }
                Serviced::Done(Err(e)) => {
                    warn!(mount = %self.mount, error = %e, "failed connecting to master server");
                }
            }

            let delay = self.backoff.next_delay();
            if let Serviced::Stop = self.serviced(tokio::time::sleep(delay)).await {
                return None;
            }
        }
    }

    /// Drive `fut` while answering commands and draining the data queue
    async fn serviced<F: Future>(&mut self, fut: F) -> Serviced<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Serviced::Stop,
                command = self.control.recv() => match command {
                    None => return Serviced::Stop,
                    Some(UpstreamCommand::Detach(reply)) => {
                        let _ = reply.send(None);
                        return Serviced::Stop;
                    }
                },
                chunk = self.data.recv() => {
                    if chunk.is_none() {
                        return Serviced::Stop;
                    }
                }
                output = &mut fut => return Serviced::Done(output),
            }
        }
    }
}
