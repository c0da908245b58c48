use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use super::protocol::{PROBE_REQUEST, PROBE_RESPONSE};

/// Binds a UDP socket and switches it to non-blocking mode.
pub fn bind_nonblocking<A: ToSocketAddrs>(addr: A) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Socket errors that only mean "try again next tick".
///
/// Connection reset/refused show up on some platforms when an ICMP
/// unreachable arrives for an earlier datagram; they say nothing about the
/// socket itself.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
    )
}

/// Checks whether an Mx dispatcher is listening at `addr`.
///
/// Sends the probe request from an ephemeral socket and waits up to
/// `timeout` for the probe response. Returns the round-trip time.
pub fn probe(addr: SocketAddr, timeout: Duration) -> io::Result<Option<Duration>> {
    let local: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = bind_nonblocking(local)?;
    probe_with(&socket, addr, timeout)
}

pub fn probe_with(
    socket: &UdpSocket,
    addr: SocketAddr,
    timeout: Duration,
) -> io::Result<Option<Duration>> {
    let start = Instant::now();
    socket.send_to(&PROBE_REQUEST, addr)?;

    let mut buffer = [0u8; 16];
    while start.elapsed() < timeout {
        match socket.recv_from(&mut buffer) {
            Ok((size, from)) if from == addr && buffer[..size] == PROBE_RESPONSE => {
                return Ok(Some(start.elapsed()));
            }
            Ok(_) => continue,
            Err(ref e) if is_transient(e) => thread::sleep(Duration::from_millis(1)),
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}
