use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;

use anyhow::bail;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::handler::{DataHandler, PeerListener};
use crate::packet::{DisconnectReason, RejectReason};
use crate::socket::Socket;

pub fn addr(port: u16) -> SocketAddr {
    (Ipv4Addr::LOCALHOST, port).into()
}

struct NetworkState {
    queues: FxHashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    rng: StdRng,
    loss: f64,
}

/// An in-memory datagram network connecting [MemorySocket]s. Packets are dropped at random with
///  a configurable probability, using a seeded RNG to keep tests deterministic.
#[derive(Clone)]
pub struct TestNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl TestNetwork {
    pub fn new(seed: u64) -> TestNetwork {
        TestNetwork {
            state: Rc::new(RefCell::new(NetworkState {
                queues: FxHashMap::default(),
                rng: StdRng::seed_from_u64(seed),
                loss: 0.0,
            })),
        }
    }

    pub fn set_loss(&self, loss: f64) {
        self.state.borrow_mut().loss = loss;
    }

    pub fn socket(&self, local: SocketAddr) -> MemorySocket {
        MemorySocket {
            network: self.state.clone(),
            local,
            open: false,
            sent: Default::default(),
        }
    }

    /// places a packet in an end point's receive queue, bypassing loss
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, packet: &[u8]) {
        self.state.borrow_mut().queues
            .entry(to)
            .or_default()
            .push_back((from, packet.to_vec()));
    }

    /// removes and returns all packets waiting to be received at an end point
    pub fn drain(&self, at: SocketAddr) -> Vec<(SocketAddr, Vec<u8>)> {
        self.state.borrow_mut().queues
            .get_mut(&at)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

pub struct MemorySocket {
    network: Rc<RefCell<NetworkState>>,
    local: SocketAddr,
    open: bool,
    /// every packet passed to `send`, including the ones the network dropped
    pub sent: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
}

impl MemorySocket {
    fn open(&mut self) {
        self.network.borrow_mut().queues
            .entry(self.local)
            .or_default();
        self.open = true;
    }
}

impl Socket for MemorySocket {
    fn bind(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        if addr != self.local {
            bail!("memory socket for {:?} cannot bind to {:?}", self.local, addr);
        }
        self.open();
        Ok(())
    }

    fn connect(&mut self, remote: SocketAddr) -> anyhow::Result<SocketAddr> {
        self.open();
        Ok(remote)
    }

    fn poll(&mut self) -> bool {
        self.open && self.network.borrow().queues
            .get(&self.local)
            .is_some_and(|q| !q.is_empty())
    }

    fn receive(&mut self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let Some((from, packet)) = self.network.borrow_mut().queues
            .get_mut(&self.local)
            .and_then(|q| q.pop_front())
        else {
            bail!("no packet available");
        };

        if packet.len() > buf.len() {
            bail!("packet of {} bytes does not fit into buffer of {} bytes", packet.len(), buf.len());
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok((packet.len(), from))
    }

    fn send(&mut self, to: SocketAddr, packet: &[u8]) {
        self.sent.borrow_mut().push((to, packet.to_vec()));
        if !self.open {
            return;
        }

        let mut network = self.network.borrow_mut();
        let loss = network.loss;
        if loss > 0.0 && network.rng.gen_bool(loss) {
            trace!("network dropped packet from {:?} to {:?}", self.local, to);
            return;
        }
        if let Some(queue) = network.queues.get_mut(&to) {
            queue.push_back((self.local, packet.to_vec()));
        }
    }

    fn close(&mut self) {
        self.network.borrow_mut().queues.remove(&self.local);
        self.open = false;
    }
}

#[derive(Clone, Default)]
pub struct CollectingHandler {
    pub received: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
}

impl CollectingHandler {
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.received.borrow().iter()
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl DataHandler for CollectingHandler {
    fn receive_message(&mut self, endpoint: SocketAddr, message: &[u8]) {
        self.received.borrow_mut().push((endpoint, message.to_vec()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Connected(SocketAddr),
    Disconnected(SocketAddr, DisconnectReason),
    ConnectionFailed(SocketAddr, RejectReason),
}

#[derive(Clone, Default)]
pub struct RecordingListener {
    pub events: Rc<RefCell<Vec<ListenerEvent>>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.borrow().clone()
    }
}

impl PeerListener for RecordingListener {
    fn on_connected(&mut self, endpoint: SocketAddr) {
        self.events.borrow_mut().push(ListenerEvent::Connected(endpoint));
    }

    fn on_disconnected(&mut self, endpoint: SocketAddr, reason: DisconnectReason) {
        self.events.borrow_mut().push(ListenerEvent::Disconnected(endpoint, reason));
    }

    fn on_connection_failed(&mut self, endpoint: SocketAddr, reason: RejectReason) {
        self.events.borrow_mut().push(ListenerEvent::ConnectionFailed(endpoint, reason));
    }
}
