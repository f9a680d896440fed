use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The first byte of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    /// see [Command]
    Command = 1,
    Unreliable = 2,
    Reliable = 3,
    Notify = 4,
    Ack = 5,
    ReliableFragment = 6,
    /// sent when nothing else was sent for a while, to keep the remote peer's timeout at bay
    KeepAlive = 10,
}

/// Connection control messages, sent unreliably after a `PacketType::Command` byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    /// client to server, carrying the connect key
    ConnectRequest = 1,
    ConnectionAccepted = 2,
    /// server to client, carrying a [RejectReason]
    ConnectionRejected = 3,
    /// either direction, carrying a [DisconnectReason]
    Disconnect = 4,
}

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RejectReason {
    None = 0,
    ServerFull = 1,
    /// no reply from the server after the maximum number of attempts
    Timeout = 2,
    /// the connection was closed locally while it was still connecting
    ClosedByPeer = 3,
    KeyInvalid = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DisconnectReason {
    None = 0,
    /// nothing received within the timeout window
    Timeout = 1,
    RequestedByRemotePeer = 2,
    RequestedByLocalPeer = 3,
    /// the remote peer sent data violating the protocol
    InvalidPacket = 4,
}

/// Smallest message handed over by the application. Unreliable, notify and reliable packets
///  carrying less than this are invalid.
pub const MIN_MESSAGE_SIZE: usize = 2;
pub const MIN_COMMAND_SIZE: usize = 2;
pub const MIN_UNRELIABLE_SIZE: usize = 1 + MIN_MESSAGE_SIZE;

/// Packet type, sequence, received sequence, received mask
pub const SEQUENCE_HEADER_SIZE: usize = 1 + 2 + 2 + 4;
pub const NOTIFY_HEADER_SIZE: usize = SEQUENCE_HEADER_SIZE;
/// Packet type, received sequence, received mask
pub const ACK_HEADER_SIZE: usize = 1 + 2 + 4;
/// Sequence header, reliable order
pub const RELIABLE_HEADER_SIZE: usize = SEQUENCE_HEADER_SIZE + 2;
pub const RELIABLE_MESSAGE_LENGTH_SIZE: usize = 2;
pub const FRAGMENT_INDEX_SIZE: usize = 1;
/// A reliable packet carries at least one length-prefixed message
pub const MIN_RELIABLE_HEADER_SIZE: usize = RELIABLE_HEADER_SIZE + RELIABLE_MESSAGE_LENGTH_SIZE;
pub const MIN_RELIABLE_FRAGMENT_HEADER_SIZE: usize = RELIABLE_HEADER_SIZE + FRAGMENT_INDEX_SIZE;

impl PacketType {
    /// checks the minimum length for a packet of this type
    pub fn is_valid_size(&self, len: usize) -> bool {
        match self {
            PacketType::Command => len >= MIN_COMMAND_SIZE,
            PacketType::Unreliable => len >= MIN_UNRELIABLE_SIZE,
            PacketType::Notify => len >= NOTIFY_HEADER_SIZE + MIN_MESSAGE_SIZE,
            PacketType::Reliable => len >= MIN_RELIABLE_HEADER_SIZE + MIN_MESSAGE_SIZE,
            PacketType::ReliableFragment => len >= MIN_RELIABLE_FRAGMENT_HEADER_SIZE + 1,
            PacketType::Ack => len >= ACK_HEADER_SIZE,
            PacketType::KeepAlive => len >= 1,
        }
    }
}

/// The piggybacked acknowledgement state: the most recent sequence received and a bit mask of
///  the sequences before it (bit `k` for `sequence - k`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    pub received_sequence: u16,
    pub received_mask: u32,
}

impl AckHeader {
    pub const SERIALIZED_LEN: usize = 2 + 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.received_sequence);
        buf.put_u32_le(self.received_mask);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("ack header requires {} bytes, was {}", Self::SERIALIZED_LEN, buf.remaining());
        }
        Ok(AckHeader {
            received_sequence: buf.get_u16_le(),
            received_mask: buf.get_u32_le(),
        })
    }
}

/// Header shared by all packets that are tracked by the ack system: the packet's own sequence plus
///  the sender's ack state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub packet_type: PacketType,
    pub sequence: u16,
    pub ack: AckHeader,
}

impl SequenceHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_type.into());
        buf.put_u16_le(self.sequence);
        self.ack.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SequenceHeader> {
        if buf.remaining() < SEQUENCE_HEADER_SIZE {
            bail!("sequence header requires {} bytes, was {}", SEQUENCE_HEADER_SIZE, buf.remaining());
        }
        let packet_type = PacketType::try_from(buf.get_u8())?;
        let sequence = buf.get_u16_le();
        let ack = AckHeader::deser(buf)?;
        Ok(SequenceHeader {
            packet_type,
            sequence,
            ack,
        })
    }
}

/// Writes a command packet, i.e. the packet type, the command and the command's payload.
pub fn ser_command(buf: &mut impl BufMut, command: Command, payload: &[u8]) {
    buf.put_u8(PacketType::Command.into());
    buf.put_u8(command.into());
    buf.put_slice(payload);
}
