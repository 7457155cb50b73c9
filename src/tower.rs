// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

use crate::channel::{self, ChannelPage};
use crate::error::{FastIpcError, Result};
use crate::socket;
use crate::wire::{ClientRequest, RequesterType, MAX_REQUEST_SIZE};
use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{munmap, ProtFlags};
use nix::sys::socket::{
    accept, bind, listen, recv, shutdown, socket, AddressFamily, Backlog, MsgFlags, Shutdown,
    SockFlag, SockType, UnixAddr,
};
use nix::unistd::ftruncate;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Mutex;

/// The broker. Owns the listening socket and the authoritative descriptor
/// for every topic's shared memory segment. It arbitrates segment creation
/// during the handshake and is never on the data path.
pub struct Tower {
    sockfd: OwnedFd,
    channels: Mutex<HashMap<String, ChannelDescriptor>>,
}

/// Failure while serving one client. Malformed or half-finished handshakes
/// cost only their connection; a segment creation failure (memfd, ftruncate,
/// mmap) breaks the broker's global invariants and ends it.
enum ServeError {
    Connection(FastIpcError),
    Fatal(FastIpcError),
}

struct ChannelDescriptor {
    memfd: OwnedFd,
    total_size: usize,
    page: NonNull<ChannelPage>,
}

unsafe impl Send for ChannelDescriptor {}

impl ChannelDescriptor {
    /// Creates and initialises a fresh segment for a topic.
    fn create(request: &ClientRequest) -> Result<Self> {
        // The memfd name is only a debugging aid; keep it short and NUL free.
        let tag: String = request
            .topic_name
            .chars()
            .filter(|c| *c != '\0')
            .take(64)
            .collect();
        let name = CString::new(tag).unwrap_or_default();
        let memfd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)?;

        let total_size = channel::total_size(request.max_payload_size);
        ftruncate(&memfd, total_size as libc::off_t)?;

        let ptr = channel::map_memory(
            memfd.as_raw_fd(),
            total_size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        )?;
        let page = unsafe { ChannelPage::init_in_place(ptr, request.max_payload_size) };

        Ok(Self {
            memfd,
            total_size,
            // init_in_place returns the pointer it was given, never null.
            page: unsafe { NonNull::new_unchecked(page) },
        })
    }
}

impl Drop for ChannelDescriptor {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.page.cast(), self.total_size);
        }
    }
}

impl Tower {
    /// Binds and listens on `path`, replacing any stale socket file.
    pub fn create(path: &str) -> Result<Tower> {
        let sockfd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;

        let addr = UnixAddr::new(path)?;
        let _ = std::fs::remove_file(path);
        bind(sockfd.as_raw_fd(), &addr)?;
        listen(&sockfd, Backlog::new(128)?)?;

        Ok(Tower {
            sockfd,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Accepts and serves handshakes until `shutdown` is called.
    ///
    /// A failed handshake drops that connection and keeps serving. Fatal
    /// failures end the broker: accept errors other than an aborted
    /// connection, and segment creation failures.
    pub fn run(&self) -> Result<()> {
        loop {
            let clientfd = match accept(self.sockfd.as_raw_fd()) {
                Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
                // The listening socket was shut down.
                Err(Errno::EINVAL) => break,
                Err(Errno::ECONNABORTED) => continue,
                Err(err) => return Err(err.into()),
            };

            match self.serve(clientfd) {
                Ok(()) => {}
                Err(ServeError::Connection(err)) => log::warn!("handshake failed: {err}"),
                Err(ServeError::Fatal(err)) => return Err(err),
            }
        }
        Ok(())
    }

    /// Half-closes the listening socket, unblocking a concurrent `run`.
    pub fn shutdown(&self) -> Result<()> {
        shutdown(self.sockfd.as_raw_fd(), Shutdown::Read)?;
        Ok(())
    }

    fn serve(&self, clientfd: OwnedFd) -> std::result::Result<(), ServeError> {
        let mut buf = [0u8; MAX_REQUEST_SIZE];
        let bytes_read = recv(clientfd.as_raw_fd(), &mut buf, MsgFlags::empty())
            .map_err(|err| ServeError::Connection(err.into()))?;
        let request =
            ClientRequest::decode(&buf[..bytes_read]).map_err(ServeError::Connection)?;

        log::info!(
            "{} request for topic '{}' with max payload size of {} bytes",
            match request.requester_type {
                RequesterType::Reader => "reader",
                RequesterType::Writer => "writer",
            },
            request.topic_name,
            request.max_payload_size
        );

        // Create-or-lookup is serialised on the topic table; the first
        // requester for a topic fixes its payload size.
        let mut channels = self.channels.lock().unwrap();
        let descriptor = match channels.entry(request.topic_name.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(ChannelDescriptor::create(&request).map_err(ServeError::Fatal)?)
            }
        };

        socket::send_reply(
            clientfd.as_raw_fd(),
            descriptor.total_size,
            descriptor.memfd.as_raw_fd(),
        )
        .map_err(ServeError::Connection)
    }
}
