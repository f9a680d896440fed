use std::future::Future;
use std::time::Duration;

use tokio::select;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::peer::Peer;

/// Drives a [Peer] from a tokio task by calling `update()` at a fixed interval. The peer is
///  single threaded, so the driver must run on a local task (e.g. inside a `LocalSet` or directly
///  in `block_on`).
pub struct PeerDriver {
    peer: Peer,
    tick: Duration,
}

impl PeerDriver {
    pub fn new(peer: Peer, tick: Duration) -> PeerDriver {
        PeerDriver {
            peer,
            tick,
        }
    }

    pub fn peer(&mut self) -> &mut Peer {
        &mut self.peer
    }

    pub fn into_peer(self) -> Peer {
        self.peer
    }

    /// Updates the peer until `shutdown` completes, and closes it afterwards. Socket errors are
    ///  logged and the loop keeps going.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) {
        let mut ticks = time::interval(self.tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("starting peer loop with a tick of {:?}", self.tick);
        loop {
            select! {
                _ = &mut shutdown => break,
                _ = ticks.tick() => {
                    if let Err(e) = self.peer.update() {
                        error!("error updating peer: {}", e);
                    }
                }
            }
        }

        info!("shutting down peer loop");
        self.peer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::connection::ConnectionState;
    use crate::test_util::{addr, CollectingHandler, ListenerEvent, RecordingListener, TestNetwork};

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let network = TestNetwork::new(1);

        let server_listener = RecordingListener::default();
        let mut server = Peer::new(PeerConfig::default(), Box::new(network.socket(addr(1))), Box::new(CollectingHandler::default()), Box::new(server_listener.clone())).unwrap();
        server.bind(addr(1)).unwrap();

        let client_listener = RecordingListener::default();
        let mut client = Peer::new(PeerConfig::default(), Box::new(network.socket(addr(2))), Box::new(CollectingHandler::default()), Box::new(client_listener.clone())).unwrap();
        client.connect(addr(1)).unwrap();

        let mut server = PeerDriver::new(server, Duration::from_millis(10));
        let mut client = PeerDriver::new(client, Duration::from_millis(10));

        tokio::join!(
            server.run_until(time::sleep(Duration::from_secs(1))),
            client.run_until(async {
                time::sleep(Duration::from_millis(500)).await;
            }),
        );

        assert_eq!(client_listener.events(), vec![
            ListenerEvent::Connected(addr(1)),
            ListenerEvent::Disconnected(addr(1), crate::packet::DisconnectReason::RequestedByLocalPeer),
        ]);
        assert_eq!(server_listener.events(), vec![
            ListenerEvent::Connected(addr(2)),
            ListenerEvent::Disconnected(addr(2), crate::packet::DisconnectReason::RequestedByRemotePeer),
        ]);

        let server = server.into_peer();
        let client = client.into_peer();
        assert!(!server.is_active());
        assert!(!client.is_active());
        assert_eq!(server.connection_state(addr(2)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_accessible_between_runs() {
        let network = TestNetwork::new(1);
        let mut peer = Peer::new(PeerConfig::default(), Box::new(network.socket(addr(1))), Box::new(CollectingHandler::default()), Box::new(RecordingListener::default())).unwrap();
        peer.bind(addr(1)).unwrap();

        let mut driver = PeerDriver::new(peer, Duration::from_millis(10));
        assert!(driver.peer().is_active());
        assert_eq!(driver.peer().connection_state(addr(2)), Option::<ConnectionState>::None);

        driver.run_until(time::sleep(Duration::from_millis(50))).await;
        assert!(!driver.peer().is_active());
    }
}
