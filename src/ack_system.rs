use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Buf, BufMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::config::PeerConfig;
use crate::error::TransportError;
use crate::metrics::Metrics;
use crate::notify_token::{NotifyCallback, NotifyToken};
use crate::packet::{AckHeader, PacketType, SequenceHeader, ACK_HEADER_SIZE, FRAGMENT_INDEX_SIZE, MIN_RELIABLE_FRAGMENT_HEADER_SIZE, MIN_RELIABLE_HEADER_SIZE, NOTIFY_HEADER_SIZE, RELIABLE_HEADER_SIZE, RELIABLE_MESSAGE_LENGTH_SIZE, SEQUENCE_HEADER_SIZE};
use crate::ring_buffer::RingBuffer;
use crate::sequencer::Sequencer;

/// Number of sequences covered by the ack mask, including the latest sequence itself
pub const MASK_SIZE: i64 = 32;

/// Where the ack system writes finished packets to. The ack system does not know about sockets or
///  end points, the connection plugs those in.
#[cfg_attr(test, mockall::automock)]
pub trait PacketSink {
    fn send_raw(&mut self, packet: &[u8]);
}

/// A received reliable packet, held in order until all packets before it have arrived.
///
/// `buffer` contains the packet's payload without header: length-prefixed messages for regular
///  reliable packets, the fragment index followed by a chunk of the message for fragments.
#[derive(Debug)]
pub struct ReliableReceived {
    pub buffer: FixedBuf,
    pub is_fragment: bool,
}

/// What a sequence in the sent ring stands for
enum Ackable {
    Notify(Box<dyn NotifyCallback>),
    /// a transmission of the reliable packet with this order
    Reliable(u16),
}

struct ReliablePacket {
    order: u16,
    /// the complete packet; the sequence header is rewritten for every transmission
    buffer: FixedBuf,
    /// sequences of all transmissions, oldest first
    sequences: Vec<u16>,
}

/// Per-connection sequencing and acknowledgement, both for sending and for receiving.
///
/// Every packet that takes part in acking (notify, reliable, reliable fragment) gets a sequence
///  from the same sequence space, and carries the local ack state: the latest sequence received from
///  the remote peer plus a mask of the `MASK_SIZE` sequences before it. When the remote ack state
///  arrives, pending notify callbacks are resolved and lost reliable packets are resent under a new
///  sequence.
///
/// Reliable packets additionally carry an `order` from their own sequence space. It survives
///  retransmission, and the receiver uses it to hand out reliable packets in order and exactly once.
pub struct AckSystem {
    sequencer: Sequencer,
    sent_ackables: RingBuffer<Ackable>,
    in_flight: FxHashMap<u16, ReliablePacket>,
    to_resend: Vec<u16>,
    next_batch: Option<ReliablePacket>,
    reliable_order: Sequencer,
    reliable_receive: RingBuffer<ReliableReceived>,

    latest_ack_sequence: u64,
    ack_mask: u32,
    last_sent_time: Instant,
    last_sent_ack: u64,
    empty_ack_count: u32,

    max_packet_size: usize,
    max_packets_in_send_buffer: usize,
    max_fragments: usize,
    ack_timeout: Duration,
    receives_before_empty_ack: u32,
    empty_ack_limit: u32,

    pool: Rc<BufferPool>,
    metrics: Option<Rc<RefCell<Metrics>>>,
}

impl AckSystem {
    pub fn new(config: &PeerConfig, max_packet_size: usize, pool: Rc<BufferPool>, metrics: Option<Rc<RefCell<Metrics>>>, now: Instant) -> Result<AckSystem, TransportError> {
        if config.sequence_size > 16 {
            return Err(TransportError::invalid_argument("sequence_size", format!("sequences are sent as u16, {} bits do not fit", config.sequence_size)));
        }
        if max_packet_size < MIN_RELIABLE_HEADER_SIZE + 1 {
            return Err(TransportError::invalid_argument("max_packet_size", format!("{} is too small for a reliable packet", max_packet_size)));
        }
        if max_packet_size > pool.buffer_size() {
            return Err(TransportError::invalid_argument("max_packet_size", format!("{} exceeds the pool's buffer size of {}", max_packet_size, pool.buffer_size())));
        }

        let sequencer = Sequencer::new(config.sequence_size)?;
        let latest_ack_sequence = sequencer.move_in_bounds(u64::MAX);

        let mut result = AckSystem {
            sent_ackables: RingBuffer::new(config.sequence_size)?,
            in_flight: FxHashMap::default(),
            to_resend: Vec::new(),
            next_batch: None,
            reliable_order: Sequencer::new(config.sequence_size)?,
            reliable_receive: RingBuffer::new(config.sequence_size)?,
            latest_ack_sequence,
            ack_mask: 0,
            last_sent_time: now,
            last_sent_ack: latest_ack_sequence,
            empty_ack_count: 0,
            max_packet_size,
            max_packets_in_send_buffer: config.max_reliable_packets_in_send_buffer,
            max_fragments: config.max_reliable_fragments,
            ack_timeout: config.time_before_empty_ack,
            receives_before_empty_ack: config.receives_before_empty_ack,
            empty_ack_limit: config.empty_ack_limit,
            sequencer,
            pool,
            metrics,
        };
        result.on_send(now);
        Ok(result)
    }

    /// the latest sequence received from the remote peer
    pub fn received_sequence(&self) -> u16 {
        self.latest_ack_sequence as u16
    }

    pub fn received_mask(&self) -> u32 {
        self.ack_mask
    }

    /// number of sent sequences that were neither acked nor dropped yet
    pub fn sent_count(&self) -> usize {
        self.sent_ackables.count()
    }

    pub fn size_per_fragment(&self) -> usize {
        self.max_packet_size - MIN_RELIABLE_FRAGMENT_HEADER_SIZE
    }

    /// the biggest message that fits into a single reliable packet
    pub fn max_reliable_message_size(&self) -> usize {
        self.max_packet_size - MIN_RELIABLE_HEADER_SIZE
    }

    fn ack_header(&self) -> AckHeader {
        AckHeader {
            received_sequence: self.latest_ack_sequence as u16,
            received_mask: self.ack_mask,
        }
    }

    fn on_send(&mut self, now: Instant) {
        self.empty_ack_count += 1;
        self.last_sent_ack = self.latest_ack_sequence;
        self.last_sent_time = now;
    }

    pub fn send_notify(&mut self, message: &[u8], sink: &mut dyn PacketSink, now: Instant) -> Result<NotifyToken, TransportError> {
        let token = NotifyToken::new();
        self.send_notify_with(message, Box::new(token.clone()), sink, now)?;
        Ok(token)
    }

    /// Sends a notify packet. `callback` is called once the packet is known to be delivered or
    ///  lost, which is when an ack header covering its sequence arrives.
    pub fn send_notify_with(&mut self, message: &[u8], callback: Box<dyn NotifyCallback>, sink: &mut dyn PacketSink, now: Instant) -> Result<(), TransportError> {
        if NOTIFY_HEADER_SIZE + message.len() > self.max_packet_size {
            return Err(TransportError::MessageTooLarge { size: message.len(), max: self.max_packet_size - NOTIFY_HEADER_SIZE });
        }

        self.check_window_capacity(1)?;
        let sequence = self.sent_ackables.enqueue(Ackable::Notify(callback))?;
        trace!(sequence, "sending notify packet");

        let mut buffer = self.pool.take();
        SequenceHeader {
            packet_type: PacketType::Notify,
            sequence: sequence as u16,
            ack: self.ack_header(),
        }.ser(&mut buffer);
        buffer.put_slice(message);

        sink.send_raw(buffer.as_ref());
        self.on_send(now);
        self.pool.put(buffer);
        Ok(())
    }

    /// Unresolved sequences must stay within half the sequence space. Beyond that, the remote's
    ///  ack sequence looks like it is behind `read`, and acks would never resolve anything.
    fn check_window_capacity(&self, num_packets: usize) -> Result<(), TransportError> {
        let used = self.sequencer.distance(self.sent_ackables.write(), self.sent_ackables.read());
        if used < 0 || used as usize + num_packets > self.sent_ackables.capacity() / 2 {
            return Err(TransportError::BufferFull);
        }
        Ok(())
    }

    /// Fails if sending `num_packets` more reliable packets would exceed the send buffer
    fn check_send_capacity(&self, num_packets: usize) -> Result<(), TransportError> {
        if self.sent_ackables.count() + num_packets > self.max_packets_in_send_buffer {
            return Err(TransportError::QueueFull);
        }
        self.check_window_capacity(num_packets)
    }

    /// Sends a message reliably and in order. Small messages are batched into a shared packet that
    ///  goes out with the next `update` (or when it is full), bigger messages are split into
    ///  fragments if fragmentation is enabled.
    pub fn send_reliable(&mut self, message: &[u8], sink: &mut dyn PacketSink, now: Instant) -> Result<(), TransportError> {
        let pending_batch = usize::from(self.next_batch.is_some());

        if MIN_RELIABLE_HEADER_SIZE + message.len() > self.max_packet_size {
            if self.max_fragments == 0 {
                return Err(TransportError::MessageTooLarge { size: message.len(), max: self.max_reliable_message_size() });
            }

            let max_size = self.max_fragments * self.size_per_fragment();
            if message.len() > max_size {
                return Err(TransportError::MessageTooLarge { size: message.len(), max: max_size });
            }

            let num_fragments = message.len().div_ceil(self.size_per_fragment());
            self.check_send_capacity(num_fragments + pending_batch)?;

            self.flush_batch(sink, now);
            self.send_fragmented(message, num_fragments, sink, now);
            return Ok(());
        }

        self.check_send_capacity(1 + pending_batch)?;

        let required = RELIABLE_MESSAGE_LENGTH_SIZE + message.len();
        if let Some(batch) = &self.next_batch {
            if batch.buffer.len() + required > self.max_packet_size {
                self.flush_batch(sink, now);
            }
        }

        let mut batch = match self.next_batch.take() {
            Some(batch) => batch,
            None => self.create_reliable_packet(PacketType::Reliable),
        };
        batch.buffer.put_u16_le(message.len() as u16);
        batch.buffer.put_slice(message);
        self.next_batch = Some(batch);
        Ok(())
    }

    fn send_fragmented(&mut self, message: &[u8], num_fragments: usize, sink: &mut dyn PacketSink, now: Instant) {
        debug!("sending reliable message of {} bytes as {} fragments", message.len(), num_fragments);

        for (i, chunk) in message.chunks(self.size_per_fragment()).enumerate() {
            let mut packet = self.create_reliable_packet(PacketType::ReliableFragment);
            // the index counts down, so the receiver knows how many fragments follow
            packet.buffer.put_u8((num_fragments - i - 1) as u8);
            packet.buffer.put_slice(chunk);
            self.send_new_reliable_packet(packet, sink, now);
        }
    }

    fn create_reliable_packet(&mut self, packet_type: PacketType) -> ReliablePacket {
        let order = self.reliable_order.next() as u16;

        let mut buffer = self.pool.take();
        SequenceHeader {
            packet_type,
            sequence: 0,
            ack: AckHeader { received_sequence: 0, received_mask: 0 },
        }.ser(&mut buffer);
        buffer.put_u16_le(order);

        ReliablePacket {
            order,
            buffer,
            sequences: Vec::new(),
        }
    }

    fn flush_batch(&mut self, sink: &mut dyn PacketSink, now: Instant) {
        if let Some(batch) = self.next_batch.take() {
            self.send_new_reliable_packet(batch, sink, now);
        }
    }

    fn send_new_reliable_packet(&mut self, packet: ReliablePacket, sink: &mut dyn PacketSink, now: Instant) {
        let order = packet.order;
        if let Some(previous) = self.in_flight.insert(order, packet) {
            panic!("reliable order {} is still in flight", previous.order);
        }
        self.send_reliable_packet(order, sink, now);
    }

    /// (Re)sends an in-flight reliable packet under a new sequence. Callers check the send capacity
    ///  beforehand.
    fn send_reliable_packet(&mut self, order: u16, sink: &mut dyn PacketSink, now: Instant) {
        let sequence = match self.sent_ackables.enqueue(Ackable::Reliable(order)) {
            Ok(sequence) => sequence as u16,
            Err(e) => {
                warn!("cannot send reliable packet with order {}: {}", order, e);
                return;
            }
        };

        let ack = self.ack_header();
        let packet = self.in_flight.get_mut(&order)
            .unwrap_or_else(|| panic!("reliable order {} is not in flight", order));
        packet.sequences.push(sequence);

        let mut header = &mut packet.buffer.as_mut()[1..SEQUENCE_HEADER_SIZE];
        header.put_u16_le(sequence);
        ack.ser(&mut header);

        trace!(sequence, order, "sending reliable packet");
        sink.send_raw(packet.buffer.as_ref());
        self.on_send(now);
    }

    fn send_ack(&mut self, sink: &mut dyn PacketSink, now: Instant) {
        let mut buffer = self.pool.take();
        buffer.put_u8(PacketType::Ack.into());
        self.ack_header().ser(&mut buffer);
        debug_assert_eq!(buffer.len(), ACK_HEADER_SIZE);

        trace!(received_sequence = self.latest_ack_sequence, "sending ack");
        sink.send_raw(buffer.as_ref());
        self.on_send(now);
        self.pool.put(buffer);
    }

    /// Periodic work: sends the pending reliable batch, and an empty ack if nothing was sent for a
    ///  while
    pub fn update(&mut self, sink: &mut dyn PacketSink, now: Instant) {
        if self.next_batch.is_some() {
            match self.check_send_capacity(1) {
                Ok(()) => self.flush_batch(sink, now),
                Err(e) => debug!("postponing reliable batch: {}", e),
            }
        }

        if self.empty_ack_count < self.empty_ack_limit && self.last_sent_time + self.ack_timeout < now {
            self.send_ack(sink, now);
        }
    }

    /// Processes a notify packet, returning its payload unless it is late or a duplicate
    pub fn receive_notify<'a>(&mut self, packet: &'a [u8], sink: &mut dyn PacketSink, now: Instant) -> Option<&'a [u8]> {
        let header = match SequenceHeader::deser(&mut &packet[..]) {
            Ok(header) => header,
            Err(e) => {
                debug!("invalid notify packet: {}", e);
                return None;
            }
        };

        let sequence = header.sequence as u64;
        let distance = self.sequencer.distance(sequence, self.latest_ack_sequence);
        let is_new = distance > 0;
        if is_new {
            self.set_ack_values(sequence, distance, sink, now);
        }
        else {
            trace!(sequence, "dropping late or duplicate notify packet");
        }

        self.check_sent_queue(header.ack, sink, now);

        if is_new {
            Some(&packet[NOTIFY_HEADER_SIZE..])
        }
        else {
            None
        }
    }

    /// Processes a reliable packet or fragment: it is acked in any case, and stored for in-order
    ///  retrieval if its order was not received before.
    pub fn receive_reliable(&mut self, packet: &[u8], is_fragment: bool, sink: &mut dyn PacketSink, now: Instant) {
        let mut buf = packet;
        let header = match SequenceHeader::deser(&mut buf) {
            Ok(header) if buf.remaining() >= 2 => header,
            Ok(_) => {
                debug!("reliable packet without order");
                return;
            }
            Err(e) => {
                debug!("invalid reliable packet: {}", e);
                return;
            }
        };
        let order = buf.get_u16_le() as u64;

        let sequence = header.sequence as u64;
        let distance = self.sequencer.distance(sequence, self.latest_ack_sequence);
        self.set_ack_values(sequence, distance, sink, now);
        self.check_sent_queue(header.ack, sink, now);

        if self.reliable_receive.distance_to_read(order) < 0 {
            trace!(order, "dropping reliable packet that was already delivered");
            return;
        }
        if self.reliable_receive.exists(order) {
            trace!(order, "dropping duplicate reliable packet");
            return;
        }

        let mut buffer = self.pool.take();
        buffer.put_slice(&packet[RELIABLE_HEADER_SIZE..]);
        self.reliable_receive.insert_at(order, ReliableReceived { buffer, is_fragment });
    }

    pub fn receive_ack(&mut self, packet: &[u8], sink: &mut dyn PacketSink, now: Instant) {
        if packet.len() < ACK_HEADER_SIZE {
            debug!("ack packet of {} bytes is too short", packet.len());
            return;
        }
        match AckHeader::deser(&mut &packet[1..]) {
            Ok(ack) => self.check_sent_queue(ack, sink, now),
            Err(e) => debug!("invalid ack packet: {}", e),
        }
    }

    /// checks a fragment's index byte against the configured number of fragments
    pub fn invalid_fragment(&self, packet: &[u8]) -> bool {
        match packet.get(RELIABLE_HEADER_SIZE) {
            Some(&index) => index as usize >= self.max_fragments,
            None => true,
        }
    }

    /// Returns the next reliable packet in order, if it was received. A fragment is only returned
    ///  together with all fragments that follow it, which are then available through
    ///  `get_next_fragment`.
    pub fn next_reliable_packet(&mut self) -> Option<ReliableReceived> {
        let packet = self.reliable_receive.try_peek()?;

        if packet.is_fragment {
            let remaining_fragments = packet.buffer.as_ref().first().copied().unwrap_or(0) as u64;
            let read = self.reliable_receive.read();
            if (1..=remaining_fragments).any(|i| !self.reliable_receive.exists(read + i)) {
                return None;
            }
        }

        self.reliable_receive.try_dequeue()
    }

    /// the fragment following a fragment returned by `next_reliable_packet`
    pub fn get_next_fragment(&mut self) -> Option<ReliableReceived> {
        self.reliable_receive.try_dequeue()
    }

    /// hands a buffer received from `next_reliable_packet` or `get_next_fragment` back to the pool
    pub fn release(&self, received: ReliableReceived) {
        self.pool.put(received.buffer);
    }

    fn set_ack_values(&mut self, sequence: u64, distance: i64, sink: &mut dyn PacketSink, now: Instant) {
        if distance > 0 {
            self.ack_mask = if distance >= MASK_SIZE {
                1
            }
            else {
                (self.ack_mask << distance) | 1
            };
            self.latest_ack_sequence = sequence;
        }
        else {
            let behind = -distance;
            if behind >= MASK_SIZE {
                return;
            }
            self.ack_mask |= 1 << behind;
        }

        self.empty_ack_count = 0;
        if self.sequencer.distance(self.latest_ack_sequence, self.last_sent_ack) > self.receives_before_empty_ack as i64 {
            self.send_ack(sink, now);
        }
    }

    /// Resolves everything in the sent ring that is covered by the remote ack state: notify callbacks
    ///  are called, acked reliable packets are released, and lost reliable packets are resent.
    fn check_sent_queue(&mut self, ack: AckHeader, sink: &mut dyn PacketSink, now: Instant) {
        let ack_sequence = ack.received_sequence as u64;
        if self.sent_ackables.distance_to_read(ack_sequence) < 0 {
            return;
        }

        let start = self.sent_ackables.read();
        let num_sequences = self.sequencer.distance(self.sent_ackables.write(), start);
        for i in 0..num_sequences {
            let sequence = self.sequencer.move_in_bounds(start + i as u64);
            let reliable_order = match self.sent_ackables.try_get(sequence) {
                None => continue,
                Some(Ackable::Notify(_)) => None,
                Some(Ackable::Reliable(order)) => Some(*order),
            };

            let distance = self.sequencer.distance(ack_sequence, sequence);
            if distance < 0 {
                continue;
            }
            let lost = distance >= MASK_SIZE || ack.received_mask & (1 << distance) == 0;

            match reliable_order {
                None => {
                    if let Ackable::Notify(mut callback) = self.sent_ackables.remove_at(sequence) {
                        trace!(sequence, lost, "notify packet resolved");
                        callback.notify(!lost);
                    }
                }
                Some(order) if lost => self.on_reliable_lost(ack_sequence, order),
                Some(order) => self.on_reliable_acked(order),
            }
        }

        self.sent_ackables.move_read_to_next_non_empty();
        self.resend_lost(sink, now);
    }

    fn on_reliable_acked(&mut self, order: u16) {
        if let Some(packet) = self.in_flight.remove(&order) {
            trace!(order, "reliable packet acked");
            for &sequence in &packet.sequences {
                self.sent_ackables.remove_at(sequence as u64);
            }
            self.to_resend.retain(|o| *o != order);
            self.pool.put(packet.buffer);
        }
    }

    fn on_reliable_lost(&mut self, ack_sequence: u64, order: u16) {
        let Some(packet) = self.in_flight.get(&order) else {
            return;
        };
        let Some(&last_sequence) = packet.sequences.last() else {
            return;
        };

        // only the most recent transmission decides about resending
        if self.sequencer.distance(ack_sequence, last_sequence as u64) > 0 && !self.to_resend.contains(&order) {
            self.to_resend.push(order);
        }
    }

    fn resend_lost(&mut self, sink: &mut dyn PacketSink, now: Instant) {
        if self.to_resend.is_empty() {
            return;
        }

        let mut to_resend = std::mem::take(&mut self.to_resend);
        for &order in &to_resend {
            if let Err(e) = self.check_send_capacity(1) {
                warn!("cannot resend reliable packet with order {}: {}", order, e);
                continue;
            }

            debug!(order, "resending lost reliable packet");
            if let (Some(metrics), Some(packet)) = (&self.metrics, self.in_flight.get(&order)) {
                metrics.borrow_mut().on_resend(packet.buffer.len());
            }
            self.send_reliable_packet(order, sink, now);
        }
        to_resend.clear();
        self.to_resend = to_resend;
    }

    /// Returns all buffers to the pool and forgets all state. Pending notify callbacks are dropped
    ///  without being called.
    pub fn clear_and_release(&mut self) {
        if let Some(batch) = self.next_batch.take() {
            self.pool.put(batch.buffer);
        }
        for (_, packet) in self.in_flight.drain() {
            self.pool.put(packet.buffer);
        }
        self.to_resend.clear();
        self.sent_ackables.clear_and_release(drop);

        let pool = &self.pool;
        self.reliable_receive.clear_and_release(|received| pool.put(received.buffer));
    }
}

/// Splits the payload of a regular reliable packet into its length-prefixed messages. Returns
///  `None` if the framing is broken.
pub fn split_reliable_messages(mut payload: &[u8]) -> Option<Vec<&[u8]>> {
    let mut result = Vec::new();
    while payload.has_remaining() {
        if payload.remaining() < RELIABLE_MESSAGE_LENGTH_SIZE {
            return None;
        }
        let len = payload.get_u16_le() as usize;
        if len == 0 || len > payload.remaining() {
            return None;
        }
        result.push(&payload[..len]);
        payload.advance(len);
    }
    Some(result)
}

/// the chunk of message data in a received fragment, i.e. without the index byte
pub fn fragment_data(fragment: &ReliableReceived) -> &[u8] {
    &fragment.buffer.as_ref()[FRAGMENT_INDEX_SIZE..]
}
