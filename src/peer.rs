use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::buffers::buffer_pool::BufferPool;
use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionIo, ConnectionState};
use crate::error::TransportError;
use crate::handler::{DataHandler, PeerListener};
use crate::metrics::Metrics;
use crate::notify_token::{NotifyCallback, NotifyToken};
use crate::packet::{ser_command, Command, DisconnectReason, PacketType, RejectReason, MIN_COMMAND_SIZE};
use crate::rate_limit_bucket::RateLimitBucket;
use crate::socket::Socket;

/// Peer is where everything comes together: it owns the socket and a connection per remote end
///  point, and it is driven by calling `update()` periodically. All network traffic is handled
///  inside `update()`, which receives and dispatches all available datagrams before letting
///  connections send.
///
/// A peer acts as a server after `bind()`, accepting connections, or as a client after
///  `connect()`.
pub struct Peer {
    config: Rc<PeerConfig>,
    pool: Rc<BufferPool>,
    connections: FxHashMap<SocketAddr, Connection>,
    io: ConnectionIo,
    connect_rate_limit: Option<RateLimitBucket>,
    metrics: Option<Rc<RefCell<Metrics>>>,
    receive_buf: Vec<u8>,
    active: bool,
}

impl Peer {
    pub fn new(config: PeerConfig, socket: Box<dyn Socket>, data_handler: Box<dyn DataHandler>, listener: Box<dyn PeerListener>) -> anyhow::Result<Peer> {
        config.validate()?;

        let pool = Rc::new(BufferPool::new(config.mtu, config.buffer_pool_start_size, config.buffer_pool_max_size)?);
        let metrics = match config.metrics_frames_bits {
            Some(bits) => Some(Rc::new(RefCell::new(Metrics::new(bits)?))),
            None => None,
        };
        let connect_rate_limit = match config.connect_rate_limit {
            Some(refill) => Some(RateLimitBucket::new(Instant::now(), refill)?),
            None => None,
        };

        Ok(Peer {
            receive_buf: vec![0; config.mtu],
            config: Rc::new(config),
            pool,
            connections: FxHashMap::default(),
            io: ConnectionIo {
                socket,
                data_handler,
                listener,
                metrics: metrics.clone(),
                to_remove: Vec::new(),
            },
            connect_rate_limit,
            metrics,
            active: false,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn metrics(&self) -> Option<Rc<RefCell<Metrics>>> {
        self.metrics.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_state(&self, endpoint: SocketAddr) -> Option<ConnectionState> {
        self.connections.get(&endpoint)
            .map(|c| c.state())
    }

    /// start accepting connections on a local address
    pub fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.active {
            bail!("peer is already active");
        }

        self.io.socket.bind(addr)?;
        info!("peer listening on {:?}", addr);
        self.active = true;
        Ok(())
    }

    /// Starts connecting to a remote peer, sending the first connect request right away. Returns
    ///  the end point for talking to the remote peer.
    pub fn connect(&mut self, remote: SocketAddr) -> anyhow::Result<SocketAddr> {
        if self.active {
            bail!("peer is already active");
        }

        let endpoint = self.io.socket.connect(remote)?;

        let now = Instant::now();
        let mut connection = match Connection::new(endpoint, self.config.clone(), self.pool.clone(), self.metrics.clone(), now) {
            Ok(connection) => connection,
            Err(e) => {
                self.io.socket.close();
                return Err(e.into());
            }
        };
        connection.start_connecting();
        connection.update(&mut self.io, now);
        self.connections.insert(endpoint, connection);
        self.active = true;
        Ok(endpoint)
    }

    /// Disconnects all connections, notifying the remote peers, and closes the socket
    pub fn close(&mut self) {
        if !self.active {
            warn!("closing a peer that is not active - ignoring");
            return;
        }

        info!("closing peer with {} connections", self.connections.len());
        let now = Instant::now();
        for (_, mut connection) in self.connections.drain() {
            connection.disconnect(&mut self.io, DisconnectReason::RequestedByLocalPeer, true, now);
            connection.release();
        }
        self.io.to_remove.clear();
        self.io.socket.close();
        self.active = false;
    }

    fn connection_mut(connections: &mut FxHashMap<SocketAddr, Connection>, active: bool, endpoint: SocketAddr) -> Result<&mut Connection, TransportError> {
        if !active {
            return Err(TransportError::PeerNotActive);
        }
        connections.get_mut(&endpoint)
            .ok_or(TransportError::UnknownConnection)
    }

    pub fn disconnect(&mut self, endpoint: SocketAddr) -> Result<(), TransportError> {
        Self::connection_mut(&mut self.connections, self.active, endpoint)?
            .disconnect(&mut self.io, DisconnectReason::RequestedByLocalPeer, true, Instant::now());
        Ok(())
    }

    pub fn send_unreliable(&mut self, endpoint: SocketAddr, message: &[u8]) -> Result<(), TransportError> {
        Self::connection_mut(&mut self.connections, self.active, endpoint)?
            .send_unreliable(&mut self.io, message, Instant::now())
    }

    /// Sends a message that is delivered exactly once and in order. Small messages are batched and
    ///  go out with the next `update()`.
    pub fn send_reliable(&mut self, endpoint: SocketAddr, message: &[u8]) -> Result<(), TransportError> {
        Self::connection_mut(&mut self.connections, self.active, endpoint)?
            .send_reliable(&mut self.io, message, Instant::now())
    }

    pub fn send_notify(&mut self, endpoint: SocketAddr, message: &[u8]) -> Result<NotifyToken, TransportError> {
        Self::connection_mut(&mut self.connections, self.active, endpoint)?
            .send_notify(&mut self.io, message, Instant::now())
    }

    pub fn send_notify_with(&mut self, endpoint: SocketAddr, message: &[u8], callback: Box<dyn NotifyCallback>) -> Result<(), TransportError> {
        Self::connection_mut(&mut self.connections, self.active, endpoint)?
            .send_notify_with(&mut self.io, message, callback, Instant::now())
    }

    /// one tick: receive and dispatch everything that is available, then let connections send
    pub fn update(&mut self) -> anyhow::Result<()> {
        if let Some(metrics) = &self.metrics {
            metrics.borrow_mut().on_tick(self.connections.len());
        }

        self.update_receive()?;
        self.update_sent();
        Ok(())
    }

    /// Drains the socket. An error means the socket is broken, everything that goes wrong with
    ///  individual packets is handled here.
    pub fn update_receive(&mut self) -> anyhow::Result<()> {
        if !self.active {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(bucket) = &mut self.connect_rate_limit {
            bucket.check_refill(now);
        }

        let mut buf = std::mem::take(&mut self.receive_buf);
        let result = self.receive_all(&mut buf, now);
        self.receive_buf = buf;
        result
    }

    fn receive_all(&mut self, buf: &mut [u8], now: Instant) -> anyhow::Result<()> {
        while self.io.socket.poll() {
            let (len, from) = self.io.socket.receive(buf)?;
            if len > self.config.mtu {
                bail!("socket returned a datagram of {} bytes, exceeding the MTU of {} bytes", len, self.config.mtu);
            }

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            let _entered = span.enter();

            let packet = &buf[..len];
            trace!("received packet from {:?}: {:?}", from, packet);

            if packet.is_empty() {
                debug!("empty packet from {:?} - dropping", from);
                continue;
            }

            if self.connections.contains_key(&from) {
                self.on_connection_packet(from, packet, now);
            }
            else {
                self.on_unconnected_packet(from, packet, now);
            }
        }
        Ok(())
    }

    fn on_connection_packet(&mut self, from: SocketAddr, packet: &[u8], now: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.borrow_mut().on_receive(packet.len());
        }

        let packet_type = match PacketType::try_from(packet[0]) {
            Ok(packet_type) => packet_type,
            Err(_) => {
                debug!("packet of unknown type {} from {:?} - dropping", packet[0], from);
                return;
            }
        };
        if !packet_type.is_valid_size(packet.len()) {
            debug!("{:?} packet from {:?} is too short with {} bytes - dropping", packet_type, from, packet.len());
            return;
        }

        if let Some(connection) = self.connections.get_mut(&from) {
            connection.receive_packet(&mut self.io, packet_type, packet, now);
        }
    }

    /// Only connect requests are accepted from end points without a connection, everything else
    ///  is dropped silently
    fn on_unconnected_packet(&mut self, from: SocketAddr, packet: &[u8], now: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.borrow_mut().on_receive_unconnected(packet.len());
        }

        let is_connect_request = packet.len() >= MIN_COMMAND_SIZE
            && packet[0] == u8::from(PacketType::Command)
            && packet[1] == u8::from(Command::ConnectRequest);
        if !is_connect_request {
            trace!("packet from unknown end point {:?} - dropping", from);
            return;
        }

        if let Some(bucket) = &mut self.connect_rate_limit {
            if bucket.use_tokens(1) {
                debug!("connect request from {:?} exceeds rate limit - dropping", from);
                return;
            }
        }

        if &packet[MIN_COMMAND_SIZE..] != self.config.connect_key.as_bytes() {
            debug!("connect request from {:?} with invalid key", from);
            self.reject(from, RejectReason::KeyInvalid);
            return;
        }
        if self.connections.len() >= self.config.max_connections {
            debug!("connect request from {:?}, but the peer is full", from);
            self.reject(from, RejectReason::ServerFull);
            return;
        }

        let mut connection = match Connection::new(from, self.config.clone(), self.pool.clone(), self.metrics.clone(), now) {
            Ok(connection) => connection,
            Err(e) => {
                error!("cannot create connection for {:?}: {}", from, e);
                return;
            }
        };
        connection.accept(&mut self.io, now);
        self.connections.insert(from, connection);
    }

    fn reject(&mut self, to: SocketAddr, reason: RejectReason) {
        let mut buffer = self.pool.take();
        ser_command(&mut buffer, Command::ConnectionRejected, &[reason.into()]);
        self.io.send_unconnected(to, buffer.as_ref());
        self.pool.put(buffer);
    }

    /// advances all connections' state machines, then drops connections that are done
    pub fn update_sent(&mut self) {
        if !self.active {
            return;
        }

        let now = Instant::now();
        for connection in self.connections.values_mut() {
            connection.update(&mut self.io, now);
        }

        for endpoint in std::mem::take(&mut self.io.to_remove) {
            if let Some(mut connection) = self.connections.remove(&endpoint) {
                debug!("removed connection to {:?}", endpoint);
                connection.release();
            }
        }
    }
}
