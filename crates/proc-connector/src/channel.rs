use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

use nix::{
    errno::Errno,
    sys::socket::{MsgFlags, NetlinkAddr, bind, recvfrom, send, setsockopt, sockopt},
    unistd::getpid,
};
use tokio::io::unix::AsyncFd;

use crate::{
    error::ChannelError,
    wire::{CN_IDX_PROC, McastOp, NETLINK_CONNECTOR, NLMSG_HDRLEN, mcast_message},
};

pub const DEFAULT_RECV_BUFFER: usize = 4096;
const MIN_RECV_BUFFER: usize = 64;

/// Tunables of the connector socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Size of the buffer a single batch is received into.
    pub recv_buffer: usize,
    /// Kernel side receive queue size to request (`SO_RCVBUFFORCE`).
    pub socket_rcvbuf: Option<usize>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            recv_buffer: DEFAULT_RECV_BUFFER,
            socket_rcvbuf: None,
        }
    }
}

/// One datagram as delivered by the kernel.
#[derive(Debug)]
pub struct Batch<'a> {
    pub bytes: &'a [u8],
    /// Netlink port id of the sender, 0 for the kernel.
    pub sender: Option<u32>,
}

impl Batch<'_> {
    pub fn from_kernel(&self) -> bool {
        self.sender.is_none_or(|port_id| port_id == 0)
    }
}

/// Why a receive produced no batch but the channel is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The kernel dropped messages because our queue was full (`ENOBUFS`).
    BufferOverrun,
    Interrupted,
    WouldBlock,
    /// Fewer bytes than a netlink header.
    Short(usize),
}

/// Classification of a single `recvfrom` result.
#[derive(Debug)]
pub enum RecvOutcome {
    Batch { len: usize, sender: Option<u32> },
    Retry(RetryReason),
    Fatal(io::Error),
}

/// Decides what a raw receive result means for the channel.
pub fn classify_recv(result: io::Result<(usize, Option<NetlinkAddr>)>) -> RecvOutcome {
    match result {
        Ok((len, _)) if len < NLMSG_HDRLEN => RecvOutcome::Retry(RetryReason::Short(len)),
        Ok((len, addr)) => RecvOutcome::Batch {
            len,
            sender: addr.map(|addr| addr.pid()),
        },
        Err(err) => match err.raw_os_error().map(Errno::from_i32) {
            Some(Errno::ENOBUFS) => RecvOutcome::Retry(RetryReason::BufferOverrun),
            Some(Errno::EINTR) => RecvOutcome::Retry(RetryReason::Interrupted),
            Some(Errno::EAGAIN) => RecvOutcome::Retry(RetryReason::WouldBlock),
            _ => RecvOutcome::Fatal(err),
        },
    }
}

/// Subscription to the kernel process events multicast group.
///
/// The socket is non-blocking and registered with the tokio reactor, so a
/// pending [`ProcConnector::receive_batch`] can be raced against other
/// futures (signals) without losing data.
pub struct ProcConnector {
    fd: Option<AsyncFd<OwnedFd>>,
    port_id: u32,
    buf: Vec<u8>,
    overruns: u64,
}

impl ProcConnector {
    /// Creates the connector socket, binds it to our pid and asks the kernel
    /// to start multicasting process events to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(options: ChannelOptions) -> Result<Self, ChannelError> {
        // SAFETY: plain socket(2) call, the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                NETLINK_CONNECTOR,
            )
        };
        if raw < 0 {
            return Err(ChannelError::Unavailable {
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: `raw` is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let port_id = getpid().as_raw() as u32;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(port_id, CN_IDX_PROC)).map_err(|errno| {
            ChannelError::Unavailable {
                source: errno.into(),
            }
        })?;

        if let Some(size) = options.socket_rcvbuf {
            if let Err(errno) = setsockopt(&fd, sockopt::RcvBufForce, &size) {
                log::warn!("Could not set socket receive buffer to {size} bytes: {errno}");
            }
        }

        let msg = mcast_message(McastOp::Listen, port_id);
        log::debug!(
            "Sending proc connector PROC_CN_MCAST_LISTEN, netlink message len={}",
            msg.len()
        );
        match send(fd.as_raw_fd(), &msg, MsgFlags::empty()) {
            Ok(sent) if sent == msg.len() => {}
            Ok(sent) => {
                return Err(ChannelError::SubscribeFailed {
                    reason: format!("short send of {sent}/{} bytes", msg.len()),
                    source: None,
                });
            }
            Err(errno) => {
                return Err(ChannelError::SubscribeFailed {
                    reason: "control message rejected".to_string(),
                    source: Some(errno.into()),
                });
            }
        }

        let fd = AsyncFd::new(fd).map_err(|source| ChannelError::Unavailable { source })?;

        log::info!("Listening for process events on netlink port {port_id}");

        Ok(Self {
            fd: Some(fd),
            port_id,
            buf: vec![0; options.recv_buffer.max(MIN_RECV_BUFFER)],
            overruns: 0,
        })
    }

    /// Waits for the next datagram carrying at least one netlink header.
    ///
    /// Buffer overruns are logged and counted, then the receive is retried:
    /// the dropped events are lost but the channel stays usable. Only a
    /// failure of the receive call itself is returned as an error.
    pub async fn receive_batch(&mut self) -> Result<Batch<'_>, ChannelError> {
        let Self {
            fd, buf, overruns, ..
        } = self;
        let fd = fd.as_ref().ok_or(ChannelError::Closed)?;

        loop {
            let mut guard = fd.readable().await.map_err(ChannelError::Receive)?;
            let result = match guard.try_io(|inner| {
                recvfrom::<NetlinkAddr>(inner.as_raw_fd(), &mut buf[..]).map_err(io::Error::from)
            }) {
                Ok(result) => result,
                Err(_would_block) => continue,
            };

            match classify_recv(result) {
                RecvOutcome::Batch { len, sender } => {
                    return Ok(Batch {
                        bytes: &buf[..len],
                        sender,
                    });
                }
                RecvOutcome::Retry(RetryReason::BufferOverrun) => {
                    *overruns += 1;
                    log::warn!(
                        "Netlink buffer full, process events dropped ({overruns} overruns so far)"
                    );
                }
                RecvOutcome::Retry(reason) => log::trace!("Retrying receive: {reason:?}"),
                RecvOutcome::Fatal(err) => return Err(ChannelError::Receive(err)),
            }
        }
    }

    /// Number of kernel side buffer overruns seen so far.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Unsubscribes and releases the socket. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            let msg = mcast_message(McastOp::Ignore, self.port_id);
            if let Err(errno) = send(fd.as_raw_fd(), &msg, MsgFlags::empty()) {
                log::debug!("Sending PROC_CN_MCAST_IGNORE failed: {errno}");
            }
            drop(fd);
            log::debug!("Process events connector closed");
        }
    }
}

impl Drop for ProcConnector {
    fn drop(&mut self) {
        self.close();
    }
}
