//! A reliable transport on top of UDP, for real-time applications like games.
//!
//! A [peer::Peer] owns a socket and a connection per remote end point. Connections are set up
//!  with a handshake (connect request carrying a key, answered with accept or reject), and kept
//!  alive by keep-alive packets. Applications send messages over a connection in one of three
//!  ways:
//!
//! * *unreliable*: sent as is, it may get lost, duplicated or reordered
//! * *notify*: delivered at most once, and the sender learns if it was delivered or lost
//! * *reliable*: delivered exactly once and in order, with messages batched into packets and
//!    large messages fragmented
//!
//! All packets that are acknowledged share a sequence space: each of them carries the latest
//!  received sequence number and a bit mask of the 32 sequence numbers before that.
//!
//! Everything is driven by calling `Peer::update()` periodically, either directly or by a
//!  [driver::PeerDriver]. The peer is single-threaded and never blocks.

pub mod ack_system;
pub mod buffers;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod notify_token;
pub mod packet;
pub mod peer;
pub mod rate_limit_bucket;
pub mod ring_buffer;
pub mod sequencer;
pub mod socket;
pub mod trackers;

#[cfg(test)] mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
