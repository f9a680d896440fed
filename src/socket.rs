#[cfg(test)] use mockall::automock;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use anyhow::bail;
use tracing::{debug, info, warn};

/// The datagram transport below a peer. All operations are non-blocking: `poll` checks if a
///  datagram is available, and `send` is best effort like UDP itself.
#[cfg_attr(test, automock)]
pub trait Socket {
    /// start listening on a local address, for server peers
    fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<()>;

    /// Prepares for talking to a remote address, for client peers. Returns the end point that
    ///  packets from the remote peer will come from.
    fn connect(&mut self, remote: SocketAddr) -> anyhow::Result<SocketAddr>;

    fn poll(&mut self) -> bool;

    /// Copies the next datagram into `buf`, returning its length and sender. Only call this after
    ///  `poll` returned `true`.
    fn receive(&mut self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn send(&mut self, to: SocketAddr, packet: &[u8]);

    fn close(&mut self);
}

/// [Socket] implementation on top of a non-blocking `std::net::UdpSocket`. The [Socket] API is
///  synchronous and polled once per tick, so there is no need for a reactor: `recv_from` and
///  `send_to` either complete right away or report `WouldBlock`.
///
/// Datagrams bigger than `max_datagram_size` are discarded when they are polled.
pub struct UdpSocketAdapter {
    socket: Option<UdpSocket>,
    max_datagram_size: usize,
    receive_buf: Vec<u8>,
    pending: Option<(usize, SocketAddr)>,
}

impl UdpSocketAdapter {
    pub fn new(max_datagram_size: usize) -> UdpSocketAdapter {
        UdpSocketAdapter {
            socket: None,
            max_datagram_size,
            // one extra byte to detect datagrams that are too big
            receive_buf: vec![0; max_datagram_size + 1],
            pending: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn open(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.socket.is_some() {
            bail!("socket is already open");
        }

        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        self.socket = Some(socket);
        Ok(())
    }
}

impl Socket for UdpSocketAdapter {
    fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        self.open(addr)
    }

    fn connect(&mut self, remote: SocketAddr) -> anyhow::Result<SocketAddr> {
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        }
        else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        self.open(local)?;
        Ok(remote)
    }

    fn poll(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        let Some(socket) = &self.socket else {
            return false;
        };

        loop {
            match socket.recv_from(&mut self.receive_buf) {
                Ok((len, from)) if len > self.max_datagram_size => {
                    debug!("discarding datagram from {:?} exceeding {} bytes", from, self.max_datagram_size);
                }
                Ok((len, from)) => {
                    self.pending = Some((len, from));
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                // e.g. ICMP 'port unreachable' reported for an earlier send: the datagrams
                //  behind it are still there
                Err(e) => debug!("socket error: {}", e),
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let Some((len, from)) = self.pending.take() else {
            bail!("no datagram available - receive called without successful poll");
        };
        if len > buf.len() {
            bail!("receive buffer of {} bytes is too small for a datagram of {} bytes", buf.len(), len);
        }

        buf[..len].copy_from_slice(&self.receive_buf[..len]);
        Ok((len, from))
    }

    fn send(&mut self, to: SocketAddr, packet: &[u8]) {
        let Some(socket) = &self.socket else {
            warn!("sending on a closed socket - dropping packet to {:?}", to);
            return;
        };

        match socket.send_to(packet, to) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => debug!("socket send buffer is full - dropping packet to {:?}", to),
            Err(e) => warn!("error sending packet to {:?}: {}", to, e),
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            info!("closed UDP socket");
        }
        self.pending = None;
    }
}
