use std::{io, time::Duration};

use thiserror::Error;

pub const AUDIT_GET: u16 = 1000;
pub const AUDIT_SET: u16 = 1001;
pub const AUDIT_NETFILTER_CFG: u16 = 1325;

const NLMSG_ERROR: u16 = 2;
const NLMSG_HDR_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit netlink I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed audit message: {0}")]
    Malformed(String),
    #[error("audit request rejected by the kernel: {0}")]
    Rejected(io::Error),
    #[error("audit channel closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditMessage {
    pub kind: u16,
    pub payload: Vec<u8>,
}

impl AuditMessage {
    pub fn new(kind: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn is_netfilter_change(&self) -> bool {
        self.kind == AUDIT_NETFILTER_CFG
    }
}

/// Subscription to the kernel's audit notification stream.
pub trait AuditChannel: Send + 'static {
    fn is_enabled(&mut self) -> Result<bool, AuditError>;

    fn enable(&mut self) -> Result<(), AuditError>;

    /// Waits up to `timeout` for the next record. `Ok(None)` means nothing
    /// arrived in time.
    fn receive(&mut self, timeout: Duration) -> Result<Option<AuditMessage>, AuditError>;
}

/// Switches auditing on when it is currently off.
pub fn ensure_enabled(channel: &mut dyn AuditChannel) -> Result<(), AuditError> {
    if channel.is_enabled()? {
        return Ok(());
    }
    tracing::info!("audit subsystem disabled; enabling");
    channel.enable()
}

fn encode_message(kind: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let len = (NLMSG_HDR_LEN + payload.len()) as u32;
    let mut buf = Vec::with_capacity(len as usize);
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode_messages(mut buf: &[u8]) -> Result<Vec<AuditMessage>, AuditError> {
    let mut messages = Vec::new();
    while buf.len() >= NLMSG_HDR_LEN {
        let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let kind = u16::from_ne_bytes([buf[4], buf[5]]);
        if len < NLMSG_HDR_LEN || len > buf.len() {
            return Err(AuditError::Malformed(format!(
                "netlink length {len} with {} bytes available",
                buf.len()
            )));
        }
        messages.push(AuditMessage::new(kind, &buf[NLMSG_HDR_LEN..len]));
        let aligned = (len + 3) & !3;
        buf = &buf[aligned.min(buf.len())..];
    }
    if !buf.is_empty() {
        return Err(AuditError::Malformed(format!(
            "{} trailing bytes after netlink messages",
            buf.len()
        )));
    }
    Ok(messages)
}

/// Returns the errno carried by an `NLMSG_ERROR` payload (0 is an ack).
fn ack_errno(message: &AuditMessage) -> Result<i32, AuditError> {
    let bytes: [u8; 4] = message
        .payload
        .get(..4)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| AuditError::Malformed("short netlink error payload".to_string()))?;
    Ok(-i32::from_ne_bytes(bytes))
}

#[cfg(target_os = "linux")]
pub use netlink::NetlinkAudit;

#[cfg(target_os = "linux")]
mod netlink {
    use std::{
        io,
        os::fd::{AsRawFd, FromRawFd, OwnedFd},
        time::Duration,
    };

    use super::{
        AUDIT_GET, AUDIT_SET, AuditChannel, AuditError, AuditMessage, NLMSG_ERROR, ack_errno,
        decode_messages, encode_message,
    };

    const AUDIT_NLGRP_READLOG: u32 = 1;
    const AUDIT_STATUS_ENABLED: u32 = 0x0001;
    const NLM_F_REQUEST: u16 = 0x01;
    const NLM_F_ACK: u16 = 0x04;
    const RECV_BUF_LEN: usize = 16 * 1024;
    const STATUS_WORDS: usize = 10;
    const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

    /// One socket for status requests, one on the log multicast group.
    pub struct NetlinkAudit {
        control: OwnedFd,
        multicast: OwnedFd,
        seq: u32,
    }

    impl NetlinkAudit {
        pub fn subscribe() -> Result<Self, AuditError> {
            let control = open_socket(0)?;
            let multicast = open_socket(1 << (AUDIT_NLGRP_READLOG - 1))?;
            tracing::debug!("subscribed to audit multicast group");
            Ok(Self {
                control,
                multicast,
                seq: 0,
            })
        }

        fn request(&mut self, kind: u16, flags: u16, payload: &[u8]) -> Result<u32, AuditError> {
            self.seq = self.seq.wrapping_add(1);
            let buf = encode_message(kind, flags, self.seq, payload);
            let sent = unsafe {
                libc::send(
                    self.control.as_raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    0,
                )
            };
            if sent < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(self.seq)
        }

        /// Reads control replies until `accept` yields a value.
        fn await_reply<T>(
            &mut self,
            mut accept: impl FnMut(&AuditMessage) -> Result<Option<T>, AuditError>,
        ) -> Result<T, AuditError> {
            loop {
                let Some(datagram) = recv_datagram(&self.control, REPLY_TIMEOUT)? else {
                    return Err(AuditError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no reply from audit subsystem",
                    )));
                };
                for message in decode_messages(&datagram)? {
                    if let Some(value) = accept(&message)? {
                        return Ok(value);
                    }
                }
            }
        }
    }

    impl AuditChannel for NetlinkAudit {
        fn is_enabled(&mut self) -> Result<bool, AuditError> {
            self.request(AUDIT_GET, NLM_F_REQUEST, &[])?;
            self.await_reply(|message| match message.kind {
                AUDIT_GET => {
                    let enabled = message
                        .payload
                        .get(4..8)
                        .and_then(|slice| slice.try_into().ok())
                        .map(u32::from_ne_bytes)
                        .ok_or_else(|| {
                            AuditError::Malformed("short audit status payload".to_string())
                        })?;
                    Ok(Some(enabled != 0))
                }
                NLMSG_ERROR => match ack_errno(message)? {
                    0 => Ok(None),
                    errno => Err(AuditError::Rejected(io::Error::from_raw_os_error(errno))),
                },
                _ => Ok(None),
            })
        }

        fn enable(&mut self) -> Result<(), AuditError> {
            let mut status = [0u32; STATUS_WORDS];
            status[0] = AUDIT_STATUS_ENABLED;
            status[1] = 1;
            let payload: Vec<u8> = status.iter().flat_map(|word| word.to_ne_bytes()).collect();
            self.request(AUDIT_SET, NLM_F_REQUEST | NLM_F_ACK, &payload)?;
            self.await_reply(|message| match message.kind {
                NLMSG_ERROR => match ack_errno(message)? {
                    0 => Ok(Some(())),
                    errno => Err(AuditError::Rejected(io::Error::from_raw_os_error(errno))),
                },
                _ => Ok(None),
            })
        }

        fn receive(&mut self, timeout: Duration) -> Result<Option<AuditMessage>, AuditError> {
            let Some(datagram) = recv_datagram(&self.multicast, timeout)? else {
                return Ok(None);
            };
            let mut messages = decode_messages(&datagram)?;
            if messages.is_empty() {
                return Err(AuditError::Malformed("empty datagram".to_string()));
            }
            Ok(Some(messages.swap_remove(0)))
        }
    }

    fn open_socket(groups: u32) -> Result<OwnedFd, AuditError> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_AUDIT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_nl).cast(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }

    fn recv_datagram(fd: &OwnedFd, timeout: Duration) -> Result<Option<Vec<u8>>, AuditError> {
        let mut pollfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err.into());
        }
        if ready == 0 {
            return Ok(None);
        }

        let mut buf = vec![0u8; RECV_BUF_LEN];
        let n = unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if n == 0 {
            return Err(AuditError::Closed);
        }
        buf.truncate(n as usize);
        Ok(Some(buf))
    }
}
