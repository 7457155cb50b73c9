// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

use crate::channel::ChannelMapping;
use crate::error::{FastIpcError, Result};
use crate::wire::ClientRequest;
use nix::sys::socket::{
    connect, recvmsg, send, sendmsg, socket, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;

/// Well-known path the broker binds. A filesystem socket, resolved relative
/// to the broker's working directory like any other path.
pub const BROKER_SOCKET_PATH: &str = "fastipcd";

/// One handshake connection to the broker. Each direction exchanges exactly
/// one packet, so the transport is SOCK_SEQPACKET: packet boundaries are
/// preserved and a single recv sees the whole message.
pub struct SocketConnection {
    fd: OwnedFd,
}

impl SocketConnection {
    pub fn connect(broker_socket: &str) -> Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;

        let addr = UnixAddr::new(broker_socket)?;
        connect(fd.as_raw_fd(), &addr)?;

        Ok(Self { fd })
    }

    pub fn send_request(&self, request: &ClientRequest) -> Result<()> {
        let buf = request.encode()?;
        let sent = send(self.fd.as_raw_fd(), &buf, MsgFlags::empty())?;
        if sent != buf.len() {
            return Err(FastIpcError::Internal(format!(
                "short send on handshake: {} of {} bytes",
                sent,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Receives the broker's reply: the segment's total size in the packet
    /// body and its file descriptor in an SCM_RIGHTS control message.
    pub fn receive_reply(&self) -> Result<(usize, OwnedFd)> {
        let mut size_buf = [0u8; std::mem::size_of::<usize>()];
        let cmsg_size = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) as usize };
        let mut cmsg_buf = vec![0u8; cmsg_size];

        let (bytes, fd) = {
            let mut iov = [IoSliceMut::new(&mut size_buf)];
            let msg = recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )?;

            let mut fd: Option<RawFd> = None;
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    fd = fds.first().copied();
                }
            }
            (msg.bytes, fd)
        };

        if bytes == 0 {
            return Err(FastIpcError::Internal(
                "broker closed the connection without replying".into(),
            ));
        }
        if bytes != size_buf.len() {
            return Err(FastIpcError::Internal(format!(
                "handshake reply body is {bytes} bytes, expected {}",
                size_buf.len()
            )));
        }

        let fd = fd.ok_or_else(|| {
            FastIpcError::Internal("handshake reply carried no file descriptor".into())
        })?;
        let total_size = usize::from_ne_bytes(size_buf);

        Ok((total_size, unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}

/// Broker-side reply: one packet whose body is the segment's total size and
/// whose ancillary data carries the segment descriptor.
pub fn send_reply(fd: RawFd, total_size: usize, segment_fd: RawFd) -> Result<()> {
    let body = total_size.to_ne_bytes();
    let iov = [IoSlice::new(&body)];
    let fds = [segment_fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    sendmsg::<()>(fd, &iov, &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

/// Performs the full client side of the handshake: connect, request, map the
/// received segment, and validate the agreed payload size.
///
/// The handshake socket and the received descriptor are both closed on
/// return; the mapping alone keeps the segment alive for the endpoint.
pub(crate) fn attach(broker_socket: &str, request: &ClientRequest) -> Result<ChannelMapping> {
    let connection = SocketConnection::connect(broker_socket)?;
    connection.send_request(request)?;
    let (total_size, segment_fd) = connection.receive_reply()?;

    let mapping = ChannelMapping::map(segment_fd.as_raw_fd(), total_size)?;

    // All endpoints of a topic must agree on the payload size; the first
    // connector fixed it.
    let channel_size = mapping.page().max_payload_size as usize;
    if channel_size != request.max_payload_size {
        return Err(FastIpcError::PayloadSizeMismatch {
            channel: request.topic_name.clone(),
            channel_size,
            requested: request.max_payload_size,
        });
    }

    Ok(mapping)
}
