// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Listener and stream wrappers that accept legacy `ICE/1.0` request lines
//!
//! Old Icecast encoders open with `SOURCE /mount ICE/1.0`, which no HTTP
//! parser accepts. The first read on every accepted connection is scanned and
//! the first `ICE/1.0` before the first newline is rewritten to `HTTP/1.0`
//! (one byte longer, the request line keeps its offsets). Later reads pass through.

use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Bytes inspected on the first read
pub const MAX_LOOKAHEAD: usize = 1024;

const LEGACY_VERSION: &[u8] = b"ICE/1.0";
const HTTP_VERSION: &[u8] = b"HTTP/1.0";

/// TCP listener whose connections come out wrapped in `CompatStream`
#[derive(Debug)]
pub struct CompatListener {
    inner: TcpListener,
}

impl CompatListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
        })
    }

    /// Adopt an already bound std listener, e.g. one inherited over handoff
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            inner: TcpListener::from_std(listener)?,
        })
    }

    pub async fn accept(&self) -> io::Result<(CompatStream<TcpStream>, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        Ok((CompatStream::new(stream, Some(peer)), peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsFd for CompatListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Pending,
    Done,
}

/// Stream that fixes up the request line on its first read
#[derive(Debug)]
pub struct CompatStream<S> {
    inner: S,
    peer: Option<SocketAddr>,
    /// Bytes served before reading from `inner` again
    buffered: BytesMut,
    scan: Scan,
}

impl<S> CompatStream<S> {
    pub fn new(inner: S, peer: Option<SocketAddr>) -> Self {
        Self {
            inner,
            peer,
            buffered: BytesMut::new(),
            scan: Scan::Pending,
        }
    }

    /// Wrap a stream whose request line was already handled elsewhere
    pub fn passthrough(inner: S, peer: Option<SocketAddr>) -> Self {
        Self {
            scan: Scan::Done,
            ..Self::new(inner, peer)
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Put `bytes` back in front of anything not yet read
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut spliced = BytesMut::with_capacity(bytes.len() + self.buffered.len());
        spliced.extend_from_slice(bytes);
        spliced.extend_from_slice(&self.buffered);
        self.buffered = spliced;
    }

    fn drain_buffered(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.buffered.len());
        buf.put_slice(&self.buffered[..n]);
        self.buffered.advance(n);
    }
}

/// Rewrite the first `ICE/1.0` before the first newline, if any
pub fn rewrite_status_line(head: &[u8]) -> Option<Vec<u8>> {
    let line_end = head.iter().position(|&b| b == b'\n')?;
    let at = head[..line_end]
        .windows(LEGACY_VERSION.len())
        .position(|w| w == LEGACY_VERSION)?;

    let mut out = Vec::with_capacity(head.len() + 1);
    out.extend_from_slice(&head[..at]);
    out.extend_from_slice(HTTP_VERSION);
    out.extend_from_slice(&head[at + LEGACY_VERSION.len()..]);
    Some(out)
}

impl<S: AsyncRead + Unpin> AsyncRead for CompatStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.buffered.is_empty() {
            this.drain_buffered(buf);
            return Poll::Ready(Ok(()));
        }

        if this.scan == Scan::Done {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        let mut lookahead = [0u8; MAX_LOOKAHEAD];
        let mut head = ReadBuf::new(&mut lookahead);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut head))?;
        this.scan = Scan::Done;

        let head = head.filled();
        if head.is_empty() {
            return Poll::Ready(Ok(()));
        }

        match rewrite_status_line(head) {
            Some(rewritten) => {
                info!(address = ?this.peer, "rewriting legacy ICE/1.0 request line");
                this.buffered.extend_from_slice(&rewritten);
            }
            None => {
                if !head.contains(&b'\n') {
                    debug!(address = ?this.peer, "first read holds no newline, skipping ICE/1.0 check");
                }
                this.buffered.extend_from_slice(head);
            }
        }

        this.drain_buffered(buf);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CompatStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
