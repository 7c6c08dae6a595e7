//! Socket and packet-layer collaborators.
//!
//! The transport only needs `send_to`, `recv_from` and `local_addr`; anything
//! implementing [`DatagramSocket`] can stand in for the OS socket (tests wrap
//! one to inject loss).

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// How long a blocking receive waits before re-checking for shutdown.
pub const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Largest datagram the receive path accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram. `WouldBlock`/`TimedOut` mean nothing arrived.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Byte transform applied outside the codec (encryption, compression).
///
/// Outbound: called after encoding (and checksum) with `buf` holding
/// `len` bytes plus [`extra_size`](Self::extra_size) bytes of room; returns
/// the new length. Inbound: called before decoding; `None` drops the datagram.
pub trait PacketLayer: Send + Sync {
    fn extra_size(&self) -> usize;

    fn process_outbound(&self, buf: &mut [u8], len: usize) -> usize;

    fn process_inbound(&self, buf: &mut [u8], len: usize) -> Option<usize>;
}

/// Socket options applied at bind time.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub broadcast: bool,
    pub buffer_size: usize,
    /// Non-blocking for manual pumping, otherwise receive blocks for
    /// [`RECEIVE_POLL_TIMEOUT`].
    pub nonblocking: bool,
}

/// OS UDP socket configured through `socket2`.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
}

impl UdpDatagramSocket {
    pub fn bind(addr: SocketAddr, options: &SocketOptions) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            // Dual-stack where the platform allows it.
            let _ = socket.set_only_v6(false);
        }
        socket.set_broadcast(options.broadcast)?;
        // Buffer sizes are hints; the OS may clamp them.
        let _ = socket.set_send_buffer_size(options.buffer_size);
        let _ = socket.set_recv_buffer_size(options.buffer_size);
        if options.nonblocking {
            socket.set_nonblocking(true)?;
        } else {
            socket.set_read_timeout(Some(RECEIVE_POLL_TIMEOUT))?;
        }
        socket.bind(&addr.into())?;
        Ok(Self {
            socket: socket.into(),
        })
    }
}

impl DatagramSocket for UdpDatagramSocket {
    #[inline]
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    #[inline]
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// What a socket error means for the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketErrorClass {
    /// Swallowed: would-block, timeout, interrupted, ICMP reset.
    Transient,
    /// Datagram above the path limit.
    MessageTooLong,
    HostUnreachable,
    NetworkUnreachable,
    Fatal,
}

#[cfg(unix)]
const EMSGSIZE: i32 = libc::EMSGSIZE;
#[cfg(windows)]
const EMSGSIZE: i32 = 10040;
#[cfg(unix)]
const EHOSTUNREACH: i32 = libc::EHOSTUNREACH;
#[cfg(windows)]
const EHOSTUNREACH: i32 = 10065;
#[cfg(unix)]
const ENETUNREACH: i32 = libc::ENETUNREACH;
#[cfg(windows)]
const ENETUNREACH: i32 = 10051;

pub(crate) fn classify(error: &io::Error) -> SocketErrorClass {
    match error.raw_os_error() {
        Some(code) if code == EMSGSIZE => return SocketErrorClass::MessageTooLong,
        Some(code) if code == EHOSTUNREACH => return SocketErrorClass::HostUnreachable,
        Some(code) if code == ENETUNREACH => return SocketErrorClass::NetworkUnreachable,
        _ => {}
    }
    match error.kind() {
        io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused => SocketErrorClass::Transient,
        _ => SocketErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::WouldBlock)),
            SocketErrorClass::Transient
        );
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::ConnectionReset)),
            SocketErrorClass::Transient
        );
        assert_eq!(
            classify(&io::Error::from_raw_os_error(EMSGSIZE)),
            SocketErrorClass::MessageTooLong
        );
        assert_eq!(
            classify(&io::Error::from_raw_os_error(EHOSTUNREACH)),
            SocketErrorClass::HostUnreachable
        );
        assert_eq!(
            classify(&io::Error::from(io::ErrorKind::PermissionDenied)),
            SocketErrorClass::Fatal
        );
    }

    #[test]
    fn test_bind_loopback() {
        let options = SocketOptions {
            broadcast: false,
            buffer_size: 64 * 1024,
            nonblocking: true,
        };
        let a = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap(), &options).unwrap();
        let b = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap(), &options).unwrap();
        let to = b.local_addr().unwrap();
        a.send_to(b"ping", to).unwrap();

        let mut buf = [0u8; 16];
        let mut got = None;
        for _ in 0..100 {
            match b.recv_from(&mut buf) {
                Ok(r) => {
                    got = Some(r);
                    break;
                }
                Err(e) if classify(&e) == SocketErrorClass::Transient => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("{e}"),
            }
        }
        let (len, from) = got.expect("datagram");
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
