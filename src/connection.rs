use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::BufMut;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::ack_system::{fragment_data, split_reliable_messages, AckSystem, PacketSink, ReliableReceived};
use crate::buffers::buffer_pool::BufferPool;
use crate::config::PeerConfig;
use crate::error::TransportError;
use crate::handler::{DataHandler, PeerListener};
use crate::metrics::{MessageKind, Metrics};
use crate::notify_token::{NotifyCallback, NotifyToken};
use crate::packet::{ser_command, Command, DisconnectReason, PacketType, RejectReason, MIN_MESSAGE_SIZE};
use crate::socket::Socket;
use crate::trackers::{ConnectingTracker, DisconnectedTracker, KeepAliveTracker, TimeoutTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// server side, before the connect request is accepted
    Created,
    Connecting,
    Connected,
    /// closed, but kept around for a while to absorb packets still in flight
    Disconnected,
    /// waiting to be dropped by the peer at the end of the tick
    Removing,
}

/// The parts of a peer that connections talk to. Connections that reach `Removing` register
///  their end point in `to_remove`, and the peer drops them after the tick.
pub struct ConnectionIo {
    pub socket: Box<dyn Socket>,
    pub data_handler: Box<dyn DataHandler>,
    pub listener: Box<dyn PeerListener>,
    pub metrics: Option<Rc<RefCell<Metrics>>>,
    pub to_remove: Vec<SocketAddr>,
}

impl ConnectionIo {
    /// sends a packet to an end point that has no connection
    pub fn send_unconnected(&mut self, to: SocketAddr, packet: &[u8]) {
        self.socket.send(to, packet);
        if let Some(metrics) = &self.metrics {
            metrics.borrow_mut().on_send_unconnected(packet.len());
        }
    }

    fn on_message_received(&mut self, endpoint: SocketAddr, kind: MessageKind, message: &[u8]) {
        if let Some(metrics) = &self.metrics {
            metrics.borrow_mut().on_receive_message(kind, message.len());
        }
        self.data_handler.receive_message(endpoint, message);
    }

    fn on_message_sent(&self, kind: MessageKind, len: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.borrow_mut().on_send_message(kind, len);
        }
    }
}

/// Sends through the peer's socket on behalf of a connection, keeping its keep-alive timer fresh
struct SocketSink<'a> {
    io: &'a mut ConnectionIo,
    endpoint: SocketAddr,
    keep_alive: &'a mut KeepAliveTracker,
    now: Instant,
}

impl PacketSink for SocketSink<'_> {
    fn send_raw(&mut self, packet: &[u8]) {
        self.io.socket.send(self.endpoint, packet);
        if let Some(metrics) = &self.io.metrics {
            metrics.borrow_mut().on_send(packet.len());
        }
        self.keep_alive.on_send(self.now);
    }
}

/// A connection to a single remote end point: handshake, liveness, teardown, and the send and
///  receive paths for the three delivery kinds.
pub struct Connection {
    endpoint: SocketAddr,
    state: ConnectionState,
    config: Rc<PeerConfig>,
    pool: Rc<BufferPool>,
    ack_system: AckSystem,
    connecting: ConnectingTracker,
    timeout: TimeoutTracker,
    keep_alive: KeepAliveTracker,
    disconnected: DisconnectedTracker,
}

impl Connection {
    pub fn new(endpoint: SocketAddr, config: Rc<PeerConfig>, pool: Rc<BufferPool>, metrics: Option<Rc<RefCell<Metrics>>>, now: Instant) -> Result<Connection, TransportError> {
        let ack_system = AckSystem::new(&config, config.mtu, pool.clone(), metrics, now)?;

        Ok(Connection {
            endpoint,
            state: ConnectionState::Created,
            connecting: ConnectingTracker::new(config.connect_attempt_interval, config.max_connect_attempts),
            timeout: TimeoutTracker::new(config.timeout_duration, now),
            keep_alive: KeepAliveTracker::new(config.keep_alive_interval, now),
            disconnected: DisconnectedTracker::new(config.disconnect_duration),
            ack_system,
            config,
            pool,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// client side: connect requests go out with the following updates
    pub fn start_connecting(&mut self) {
        debug!("connecting to {:?}", self.endpoint);
        self.set_state(ConnectionState::Connecting);
    }

    /// server side: accepts a validated connect request
    pub fn accept(&mut self, io: &mut ConnectionIo, now: Instant) {
        assert_eq!(self.state, ConnectionState::Created, "only new connections can be accepted");
        self.send_command(io, Command::ConnectionAccepted, &[], now);
        self.set_connected(io);
    }

    /// All state changes go through here. Anything but the transitions listed below is a bug.
    fn set_state(&mut self, to: ConnectionState) {
        use ConnectionState::*;

        let valid = matches!((self.state, to),
            (Created, Connecting)
            | (Created, Connected)
            | (Connecting, Connected)
            // a failed connection attempt lingers like a closed connection
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
            | (Created | Connecting | Connected | Disconnected, Removing)
        );
        assert!(valid, "invalid state transition for connection to {:?}: {:?} -> {:?}", self.endpoint, self.state, to);

        trace!("connection to {:?}: {:?} -> {:?}", self.endpoint, self.state, to);
        self.state = to;
    }

    fn set_connected(&mut self, io: &mut ConnectionIo) {
        info!("connected to {:?}", self.endpoint);
        self.set_state(ConnectionState::Connected);
        io.listener.on_connected(self.endpoint);
    }

    fn set_disconnected(&mut self, now: Instant) {
        self.set_state(ConnectionState::Disconnected);
        self.disconnected.on_disconnect(now);
        self.ack_system.clear_and_release();
    }

    fn fail_to_connect(&mut self, io: &mut ConnectionIo, reason: RejectReason, now: Instant) {
        assert_eq!(self.state, ConnectionState::Connecting);
        info!("connection to {:?} failed: {:?}", self.endpoint, reason);
        self.set_disconnected(now);
        io.listener.on_connection_failed(self.endpoint, reason);
    }

    /// Closes the connection. A connection that is still connecting fails with
    ///  `RejectReason::ClosedByPeer`, closing any other connection than a connected one has no
    ///  effect.
    pub fn disconnect(&mut self, io: &mut ConnectionIo, reason: DisconnectReason, send_to_remote: bool, now: Instant) {
        match self.state {
            ConnectionState::Connecting => self.fail_to_connect(io, RejectReason::ClosedByPeer, now),
            ConnectionState::Connected => {
                info!("disconnecting from {:?}: {:?}", self.endpoint, reason);
                if send_to_remote {
                    self.send_command(io, Command::Disconnect, &[reason.into()], now);
                }
                self.set_disconnected(now);
                io.listener.on_disconnected(self.endpoint, reason);
            }
            state => debug!("disconnect of {:?} in state {:?} - ignoring", self.endpoint, state),
        }
    }

    /// returns all buffers to the pool before the connection is dropped
    pub fn release(&mut self) {
        self.ack_system.clear_and_release();
    }

    pub fn update(&mut self, io: &mut ConnectionIo, now: Instant) {
        match self.state {
            ConnectionState::Created | ConnectionState::Removing => {}
            ConnectionState::Connecting => self.update_connecting(io, now),
            ConnectionState::Connected => self.update_connected(io, now),
            ConnectionState::Disconnected => {
                if self.disconnected.should_remove(now) {
                    trace!("removing connection to {:?}", self.endpoint);
                    self.set_state(ConnectionState::Removing);
                    io.to_remove.push(self.endpoint);
                }
            }
        }
    }

    fn update_connecting(&mut self, io: &mut ConnectionIo, now: Instant) {
        if !self.connecting.time_attempt(now) {
            return;
        }
        if self.connecting.max_attempts() {
            self.fail_to_connect(io, RejectReason::Timeout, now);
            return;
        }

        self.connecting.on_attempt(now);
        debug!("sending connect request to {:?}", self.endpoint);
        let key = self.config.clone();
        self.send_command(io, Command::ConnectRequest, key.connect_key.as_bytes(), now);
    }

    fn update_connected(&mut self, io: &mut ConnectionIo, now: Instant) {
        if self.timeout.timed_out(now) {
            // the remote peer is gone, so there is no point in telling it
            self.disconnect(io, DisconnectReason::Timeout, false, now);
            return;
        }

        let mut sink = SocketSink { io: &mut *io, endpoint: self.endpoint, keep_alive: &mut self.keep_alive, now };
        self.ack_system.update(&mut sink, now);

        if self.keep_alive.should_send_keep_alive(now) {
            trace!("sending keep alive to {:?}", self.endpoint);
            self.send_raw(io, &[PacketType::KeepAlive.into()], now);
        }
    }

    fn send_raw(&mut self, io: &mut ConnectionIo, packet: &[u8], now: Instant) {
        SocketSink { io: &mut *io, endpoint: self.endpoint, keep_alive: &mut self.keep_alive, now }
            .send_raw(packet);
    }

    fn send_command(&mut self, io: &mut ConnectionIo, command: Command, payload: &[u8], now: Instant) {
        let mut buffer = self.pool.take();
        ser_command(&mut buffer, command, payload);
        self.send_raw(io, buffer.as_ref(), now);
        self.pool.put(buffer);
    }

    fn check_can_send(&self, message: &[u8]) -> Result<(), TransportError> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        if message.len() < MIN_MESSAGE_SIZE {
            return Err(TransportError::invalid_argument("message", format!("must have at least {} bytes, was {}", MIN_MESSAGE_SIZE, message.len())));
        }
        Ok(())
    }

    pub fn send_unreliable(&mut self, io: &mut ConnectionIo, message: &[u8], now: Instant) -> Result<(), TransportError> {
        self.check_can_send(message)?;
        if 1 + message.len() > self.config.mtu {
            return Err(TransportError::MessageTooLarge { size: message.len(), max: self.config.mtu - 1 });
        }

        let mut buffer = self.pool.take();
        buffer.put_u8(PacketType::Unreliable.into());
        buffer.put_slice(message);
        self.send_raw(io, buffer.as_ref(), now);
        self.pool.put(buffer);

        io.on_message_sent(MessageKind::Unreliable, message.len());
        Ok(())
    }

    pub fn send_reliable(&mut self, io: &mut ConnectionIo, message: &[u8], now: Instant) -> Result<(), TransportError> {
        self.check_can_send(message)?;

        let mut sink = SocketSink { io: &mut *io, endpoint: self.endpoint, keep_alive: &mut self.keep_alive, now };
        self.ack_system.send_reliable(message, &mut sink, now)?;

        io.on_message_sent(MessageKind::Reliable, message.len());
        Ok(())
    }

    pub fn send_notify(&mut self, io: &mut ConnectionIo, message: &[u8], now: Instant) -> Result<NotifyToken, TransportError> {
        self.check_can_send(message)?;

        let mut sink = SocketSink { io: &mut *io, endpoint: self.endpoint, keep_alive: &mut self.keep_alive, now };
        let token = self.ack_system.send_notify(message, &mut sink, now)?;

        io.on_message_sent(MessageKind::Notify, message.len());
        Ok(token)
    }

    pub fn send_notify_with(&mut self, io: &mut ConnectionIo, message: &[u8], callback: Box<dyn NotifyCallback>, now: Instant) -> Result<(), TransportError> {
        self.check_can_send(message)?;

        let mut sink = SocketSink { io: &mut *io, endpoint: self.endpoint, keep_alive: &mut self.keep_alive, now };
        self.ack_system.send_notify_with(message, callback, &mut sink, now)?;

        io.on_message_sent(MessageKind::Notify, message.len());
        Ok(())
    }

    /// Handles a packet from this connection's end point. The caller checked the packet's minimum
    ///  size for its type.
    pub fn receive_packet(&mut self, io: &mut ConnectionIo, packet_type: PacketType, packet: &[u8], now: Instant) {
        self.timeout.on_receive(now);

        if packet_type == PacketType::Command {
            self.receive_command(io, packet, now);
            return;
        }
        if self.state != ConnectionState::Connected {
            debug!("received {:?} packet from {:?} in state {:?} - dropping", packet_type, self.endpoint, self.state);
            return;
        }

        match packet_type {
            PacketType::Unreliable => io.on_message_received(self.endpoint, MessageKind::Unreliable, &packet[1..]),
            PacketType::Notify => {
                let mut sink = SocketSink { io: &mut *io, endpoint: self.endpoint, keep_alive: &mut self.keep_alive, now };
                if let Some(message) = self.ack_system.receive_notify(packet, &mut sink, now) {
                    io.on_message_received(self.endpoint, MessageKind::Notify, message);
                }
            }
            PacketType::Reliable | PacketType::ReliableFragment => {
                let is_fragment = packet_type == PacketType::ReliableFragment;
                if is_fragment && self.ack_system.invalid_fragment(packet) {
                    warn!("received fragment with invalid index from {:?}", self.endpoint);
                    self.disconnect(io, DisconnectReason::InvalidPacket, true, now);
                    return;
                }

                let mut sink = SocketSink { io: &mut *io, endpoint: self.endpoint, keep_alive: &mut self.keep_alive, now };
                self.ack_system.receive_reliable(packet, is_fragment, &mut sink, now);
                self.deliver_reliable(io, now);
            }
            PacketType::Ack => {
                let mut sink = SocketSink { io: &mut *io, endpoint: self.endpoint, keep_alive: &mut self.keep_alive, now };
                self.ack_system.receive_ack(packet, &mut sink, now);
            }
            PacketType::KeepAlive => {}
            PacketType::Command => unreachable!(),
        }
    }

    fn receive_command(&mut self, io: &mut ConnectionIo, packet: &[u8], now: Instant) {
        let command = match Command::try_from(packet[1]) {
            Ok(command) => command,
            Err(_) => {
                debug!("unknown command {} from {:?} - dropping", packet[1], self.endpoint);
                return;
            }
        };

        match (command, self.state) {
            (Command::ConnectRequest, ConnectionState::Connected) => {
                // our accept message got lost
                debug!("repeated connect request from {:?} - resending accept", self.endpoint);
                self.send_command(io, Command::ConnectionAccepted, &[], now);
            }
            (Command::ConnectionAccepted, ConnectionState::Connecting) => self.set_connected(io),
            (Command::ConnectionRejected, ConnectionState::Connecting) => {
                let reason = packet.get(2)
                    .and_then(|&b| RejectReason::try_from(b).ok())
                    .unwrap_or(RejectReason::None);
                self.fail_to_connect(io, reason, now);
            }
            (Command::Disconnect, _) => {
                let reason = match packet.get(2).and_then(|&b| DisconnectReason::try_from(b).ok()) {
                    None | Some(DisconnectReason::RequestedByLocalPeer) => DisconnectReason::RequestedByRemotePeer,
                    Some(reason) => reason,
                };
                self.disconnect(io, reason, false, now);
            }
            (command, state) => debug!("command {:?} from {:?} in state {:?} - ignoring", command, self.endpoint, state),
        }
    }

    /// Hands all reliable messages that are available in order to the data handler. Broken framing
    ///  disconnects, since the sender's ack system accepted it as valid.
    fn deliver_reliable(&mut self, io: &mut ConnectionIo, now: Instant) {
        while let Some(received) = self.ack_system.next_reliable_packet() {
            let valid = if received.is_fragment {
                self.deliver_fragmented(io, received)
            }
            else {
                self.deliver_batch(io, received)
            };

            if !valid {
                warn!("received malformed reliable packet from {:?}", self.endpoint);
                self.disconnect(io, DisconnectReason::InvalidPacket, true, now);
                return;
            }
        }
    }

    fn deliver_batch(&mut self, io: &mut ConnectionIo, received: ReliableReceived) -> bool {
        let valid = match split_reliable_messages(received.buffer.as_ref()) {
            Some(messages) => {
                for message in messages {
                    io.on_message_received(self.endpoint, MessageKind::Reliable, message);
                }
                true
            }
            None => false,
        };
        self.ack_system.release(received);
        valid
    }

    /// Reassembles a message from a first fragment and the fragments following it. Fragment indices
    ///  must count down to zero, and all fragments but the last must be full size.
    fn deliver_fragmented(&mut self, io: &mut ConnectionIo, first: ReliableReceived) -> bool {
        let size_per_fragment = self.ack_system.size_per_fragment();
        let mut expected_index = first.buffer.as_ref()[0];

        let mut message = Vec::with_capacity((expected_index as usize + 1) * size_per_fragment);
        let mut fragment = first;
        loop {
            let data = fragment_data(&fragment);
            let valid = fragment.is_fragment
                && fragment.buffer.as_ref()[0] == expected_index
                && (expected_index == 0 || data.len() == size_per_fragment);
            if valid {
                message.extend_from_slice(data);
            }
            self.ack_system.release(fragment);

            if !valid {
                return false;
            }
            if expected_index == 0 {
                break;
            }
            expected_index -= 1;

            fragment = match self.ack_system.get_next_fragment() {
                Some(f) => f,
                None => return false,
            };
        }

        trace!("reassembled reliable message of {} bytes", message.len());
        io.on_message_received(self.endpoint, MessageKind::Reliable, &message);
        true
    }
}
