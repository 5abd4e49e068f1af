// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `SOCK_SEQPACKET` channel carrying one record and at most one descriptor per message

use super::records::HandoffRecord;
use super::HandoffError;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use tokio::io::unix::AsyncFd;

/// Largest encoded record accepted on either side
pub const MAX_RECORD: usize = 128 * 1024;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

#[derive(Debug)]
pub struct HandoffChannel {
    fd: AsyncFd<OwnedFd>,
}

impl HandoffChannel {
    /// Two connected, close-on-exec socket ends
    pub fn socketpair() -> Result<(OwnedFd, OwnedFd), HandoffError> {
        Ok(socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?)
    }

    /// Both ends of a fresh pair, ready for async use
    pub fn pair() -> Result<(HandoffChannel, HandoffChannel), HandoffError> {
        let (a, b) = Self::socketpair()?;
        Ok((Self::from_owned(a)?, Self::from_owned(b)?))
    }

    pub fn from_owned(fd: OwnedFd) -> Result<Self, HandoffError> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    pub async fn send(
        &self,
        record: &HandoffRecord,
        fd: Option<BorrowedFd<'_>>,
    ) -> Result<(), HandoffError> {
        let payload = serde_json::to_vec(record)?;
        if payload.len() > MAX_RECORD {
            return Err(HandoffError::RecordTooLarge(payload.len()));
        }
        let fd = fd.map(|fd| fd.as_raw_fd());

        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|sock| send_with_fd(sock.as_raw_fd(), &payload, fd)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn recv(&self) -> Result<(HandoffRecord, Option<OwnedFd>), HandoffError> {
        let mut buf = vec![0u8; MAX_RECORD];
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|sock| recv_with_fd(sock.as_raw_fd(), &mut buf)) {
                Ok(Ok((0, None))) => return Err(HandoffError::Closed),
                Ok(Ok((n, fd))) => {
                    let record = serde_json::from_slice(&buf[..n])?;
                    return Ok((record, fd));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Toggle `FD_CLOEXEC`; cleared only on the end a successor must inherit
pub(crate) fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn cmsg_space() -> usize {
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) as usize }
}

fn send_with_fd(sock: RawFd, payload: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // u64 backing keeps the control buffer aligned for cmsghdr
    let space = cmsg_space();
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    if let Some(fd) = fd {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "no room for the control message header",
            ));
        }
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
        }
    }

    let sent = unsafe { libc::sendmsg(sock, &msg, SEND_FLAGS) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    if sent as usize != payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "record was only partially sent",
        ));
    }
    Ok(())
}

fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let space = cmsg_space();
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let received = unsafe { libc::recvmsg(sock, &mut msg, RECV_FLAGS) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fd = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        unsafe {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                fd = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "handoff record truncated",
        ));
    }

    Ok((received as usize, fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::records::{MountRecord, RestoredRecord};
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn records_and_descriptors_cross_the_channel() {
        let (parent, child) = HandoffChannel::pair().unwrap();
        let (mut ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();

        let record = HandoffRecord::Mount(MountRecord {
            name: "/main.mp3".into(),
            content_type: "audio/mpeg".into(),
            source_count: 0,
        });
        parent.send(&record, Some(theirs.as_fd())).await.unwrap();
        parent.send(&HandoffRecord::Done, None).await.unwrap();
        drop(theirs);

        let (received, fd) = child.recv().await.unwrap();
        assert_eq!(received, record);
        let mut passed = std::os::unix::net::UnixStream::from(fd.unwrap());

        ours.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        passed.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        let (done, fd) = child.recv().await.unwrap();
        assert_eq!(done, HandoffRecord::Done);
        assert!(fd.is_none());
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (parent, child) = HandoffChannel::pair().unwrap();
        child
            .send(&HandoffRecord::Restored(RestoredRecord { sources: 1 }), None)
            .await
            .unwrap();
        drop(child);

        assert!(matches!(
            parent.recv().await.unwrap(),
            (HandoffRecord::Restored(RestoredRecord { sources: 1 }), None)
        ));
        assert!(matches!(parent.recv().await, Err(HandoffError::Closed)));
    }
}
