#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use crate::packet::{DisconnectReason, RejectReason};

/// Application callback for received messages, regardless of how they were sent
#[cfg_attr(test, automock)]
pub trait DataHandler {
    fn receive_message(&mut self, endpoint: SocketAddr, message: &[u8]);
}

/// Connection lifecycle events. All methods default to doing nothing.
#[cfg_attr(test, automock)]
pub trait PeerListener {
    fn on_connected(&mut self, _endpoint: SocketAddr) {}

    fn on_disconnected(&mut self, _endpoint: SocketAddr, _reason: DisconnectReason) {}

    /// an outgoing connection attempt failed, or the connection was closed before it was
    ///  established
    fn on_connection_failed(&mut self, _endpoint: SocketAddr, _reason: RejectReason) {}
}

pub struct NoopListener;

impl PeerListener for NoopListener {}
