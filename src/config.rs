use std::time::Duration;
use anyhow::bail;
use crate::packet::MIN_RELIABLE_HEADER_SIZE;
use crate::rate_limit_bucket::RefillConfig;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// The maximum number of connections a peer accepts. Connect requests beyond this number are
    ///  rejected with `RejectReason::ServerFull`.
    pub max_connections: usize,

    /// Time between two connect requests of a connecting client
    pub connect_attempt_interval: Duration,
    /// Number of connect requests sent before giving up with `RejectReason::Timeout`
    pub max_connect_attempts: u32,

    /// A keep-alive packet is sent if nothing else was sent for this long. This must be
    ///  significantly shorter than `timeout_duration`, since keep-alive packets can get lost.
    pub keep_alive_interval: Duration,
    /// A connection is disconnected if nothing was received for this long
    pub timeout_duration: Duration,
    /// Time a disconnected connection lingers before it is removed, absorbing packets that are
    ///  still in flight
    pub disconnect_duration: Duration,

    pub buffer_pool_start_size: usize,
    /// Number of buffers kept by the pool. More buffers can be in use at a given time, but they
    ///  are discarded rather than returned to the pool.
    pub buffer_pool_max_size: usize,

    /// An empty ack is sent if nothing was sent for this long and there is something to ack
    pub time_before_empty_ack: Duration,
    /// An ack is sent immediately once this many sequences arrived without being acked
    pub receives_before_empty_ack: u32,
    /// The maximum number of empty acks sent in a row without receiving anything
    pub empty_ack_limit: u32,

    /// The maximum number of reliable packets awaiting ack per connection. Reliable sends fail
    ///  with `TransportError::QueueFull` when this is reached.
    pub max_reliable_packets_in_send_buffer: usize,
    /// Number of bits in sequence numbers, i.e. the size of the ack and reorder windows (max 16)
    pub sequence_size: u32,
    /// Reliable messages bigger than one packet are split into at most this many fragments. 0
    ///  disables fragmentation.
    pub max_reliable_fragments: usize,

    /// This is the maximum UDP payload size. All packets are created with this size, and
    ///  anything bigger received from the socket is considered a socket bug.
    ///
    /// NB: This must be supported by all network routes between peers since packets must
    ///      not be fragmented at the IP level. The default leaves room for optional IP headers
    ///      and tunnels.
    pub mtu: usize,

    /// Clients send this key with their connect request, and servers reject requests with a
    ///  different key. Defaults to the crate name and version, so incompatible versions don't
    ///  connect to each other.
    pub connect_key: String,

    /// Throttles connect requests from unknown end points, if set
    pub connect_rate_limit: Option<RefillConfig>,

    /// Number of bits for the metrics frame ring, or `None` to disable metrics
    pub metrics_frames_bits: Option<u32>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            max_connections: 100,
            connect_attempt_interval: Duration::from_millis(250),
            max_connect_attempts: 10,
            keep_alive_interval: Duration::from_secs(2),
            timeout_duration: Duration::from_secs(10),
            disconnect_duration: Duration::from_secs(1),
            buffer_pool_start_size: 100,
            buffer_pool_max_size: 5000,
            time_before_empty_ack: Duration::from_millis(110),
            receives_before_empty_ack: 8,
            empty_ack_limit: 8,
            max_reliable_packets_in_send_buffer: 2000,
            sequence_size: 12,
            max_reliable_fragments: 5,
            mtu: 1200,
            connect_key: Self::default_connect_key(),
            connect_rate_limit: None,
            metrics_frames_bits: None,
        }
    }
}

impl PeerConfig {
    pub fn default_connect_key() -> String {
        format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 100 {
            bail!("MTU {} is too small", self.mtu);
        }
        if self.mtu > u16::MAX as usize {
            bail!("MTU {} does not fit into a length prefix", self.mtu);
        }
        if !(1..=16).contains(&self.sequence_size) {
            bail!("sequence size must be between 1 and 16 bits, was {}", self.sequence_size);
        }
        if self.max_reliable_fragments > u8::MAX as usize {
            bail!("max reliable fragments must not exceed {}, was {}", u8::MAX, self.max_reliable_fragments);
        }
        if self.max_reliable_packets_in_send_buffer == 0 {
            bail!("max reliable packets in send buffer must be positive");
        }
        if self.max_reliable_packets_in_send_buffer >= 1 << (self.sequence_size - 1) {
            bail!("max reliable packets in send buffer must be less than half the sequence space of 2^{}, was {}", self.sequence_size, self.max_reliable_packets_in_send_buffer);
        }
        if self.buffer_pool_start_size > self.buffer_pool_max_size {
            bail!("buffer pool start size {} exceeds max size {}", self.buffer_pool_start_size, self.buffer_pool_max_size);
        }
        if self.keep_alive_interval >= self.timeout_duration {
            bail!("keep alive interval {:?} must be shorter than timeout duration {:?}", self.keep_alive_interval, self.timeout_duration);
        }
        if self.max_connect_attempts == 0 {
            bail!("max connect attempts must be positive");
        }
        if !self.connect_key.is_ascii() {
            bail!("connect key must be ASCII");
        }
        if self.connect_key.len() + 2 > self.mtu - MIN_RELIABLE_HEADER_SIZE {
            bail!("connect key of {} bytes does not fit into a packet", self.connect_key.len());
        }
        if let Some(bits) = self.metrics_frames_bits {
            if !(1..=16).contains(&bits) {
                bail!("metrics frame bits must be between 1 and 16, was {}", bits);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        PeerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_default_key() {
        assert!(PeerConfig::default().connect_key.starts_with("rudp_core "));
    }

    #[rstest]
    #[case::mtu_too_small(|c: &mut PeerConfig| c.mtu = 50)]
    #[case::mtu_too_big(|c: &mut PeerConfig| c.mtu = 100_000)]
    #[case::sequence_size_zero(|c: &mut PeerConfig| c.sequence_size = 0)]
    #[case::sequence_size_too_big(|c: &mut PeerConfig| c.sequence_size = 17)]
    #[case::too_many_fragments(|c: &mut PeerConfig| c.max_reliable_fragments = 256)]
    #[case::empty_send_buffer(|c: &mut PeerConfig| c.max_reliable_packets_in_send_buffer = 0)]
    #[case::send_buffer_exceeds_window(|c: &mut PeerConfig| c.max_reliable_packets_in_send_buffer = 2048)]
    #[case::pool_start_over_max(|c: &mut PeerConfig| c.buffer_pool_start_size = c.buffer_pool_max_size + 1)]
    #[case::keep_alive_too_long(|c: &mut PeerConfig| c.keep_alive_interval = c.timeout_duration)]
    #[case::no_connect_attempts(|c: &mut PeerConfig| c.max_connect_attempts = 0)]
    #[case::non_ascii_key(|c: &mut PeerConfig| c.connect_key = "schlüssel".to_string())]
    #[case::key_too_long(|c: &mut PeerConfig| c.connect_key = "x".repeat(2000))]
    #[case::metrics_bits(|c: &mut PeerConfig| c.metrics_frames_bits = Some(20))]
    fn test_validate_invalid(#[case] modify: fn(&mut PeerConfig)) {
        let mut config = PeerConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
