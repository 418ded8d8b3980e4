//! Packet encoding and decoding.
//!
//! Every datagram exchanged between sockets is one packet:
//!
//! ```text
//! +-------+---------+-------+----------+----------------+----------------+----------------+---------+
//! | Magic | Version | Flags | Reserved | Destination id | Sequence       | Ack            | Payload |
//! | 0xFF  | 0x01    | 1 byte| 0x00     | 4 bytes (LE32) | 4 bytes (LE32) | 4 bytes (LE32) | rest    |
//! +-------+---------+-------+----------+----------------+----------------+----------------+---------+
//! ```
//!
//! `ack` is always the sender's cumulative acknowledgment of the reverse
//! ordered stream, i.e. the next ordered sequence it expects.

use super::constants::{
    FLAG_DATA, FLAG_DESTROY, FLAG_END, FLAG_MESSAGE, FLAG_MESSAGE_ACK, HEADER_SIZE, MAGIC,
    PROTOCOL_VERSION,
};
use super::error::DecodeError;

/// What a packet carries, derived from its flag byte.
///
/// At most one flag bit may be set; no bits at all is a pure acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Pure cumulative acknowledgment.
    Ack = 0x00,
    /// Ordered stream data at `seq`.
    Data = FLAG_DATA,
    /// End of the ordered stream at `seq`.
    End = FLAG_END,
    /// Unordered message at `seq` (message sequence space).
    Message = FLAG_MESSAGE,
    /// The sending stream was destroyed.
    Destroy = FLAG_DESTROY,
    /// Acknowledges message `seq`.
    MessageAck = FLAG_MESSAGE_ACK,
}

impl PacketKind {
    /// Parse a packet kind from the flag byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Ack),
            FLAG_DATA => Some(Self::Data),
            FLAG_END => Some(Self::End),
            FLAG_MESSAGE => Some(Self::Message),
            FLAG_DESTROY => Some(Self::Destroy),
            FLAG_MESSAGE_ACK => Some(Self::MessageAck),
            _ => None,
        }
    }

    /// Flag byte for this kind.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether packets of this kind may carry a payload.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Data | Self::Message)
    }

    /// Whether this kind consumes an ordered sequence number and is
    /// retransmitted until cumulatively acknowledged.
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Data | Self::End)
    }

    /// Whether a packet of this kind may open a connection on the receiver.
    pub fn is_opening(self) -> bool {
        matches!(self, Self::Data | Self::End | Self::Message)
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// What the packet carries.
    pub kind: PacketKind,
    /// Routing id of the destination stream on the receiving socket.
    pub id: u32,
    /// Ordered sequence (DATA/END), message sequence (MESSAGE/MESSAGE_ACK),
    /// zero otherwise.
    pub seq: u32,
    /// Cumulative ack of the reverse ordered stream.
    pub ack: u32,
    /// Payload, empty for control packets.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Ordered data segment.
    pub fn data(id: u32, seq: u32, ack: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Data,
            id,
            seq,
            ack,
            payload,
        }
    }

    /// End-of-stream marker.
    pub fn end(id: u32, seq: u32, ack: u32) -> Self {
        Self::control(PacketKind::End, id, seq, ack)
    }

    /// Unordered message.
    pub fn message(id: u32, seq: u32, ack: u32, payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Message,
            id,
            seq,
            ack,
            payload,
        }
    }

    /// Acknowledgment of one message.
    pub fn message_ack(id: u32, seq: u32, ack: u32) -> Self {
        Self::control(PacketKind::MessageAck, id, seq, ack)
    }

    /// Pure cumulative acknowledgment.
    pub fn ack(id: u32, ack: u32) -> Self {
        Self::control(PacketKind::Ack, id, 0, ack)
    }

    /// Destroy notification.
    pub fn destroy(id: u32, ack: u32) -> Self {
        Self::control(PacketKind::Destroy, id, 0, ack)
    }

    fn control(kind: PacketKind, id: u32, seq: u32, ack: u32) -> Self {
        Self {
            kind,
            id,
            seq,
            ack,
            payload: Vec::new(),
        }
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the packet.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(MAGIC);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.kind.as_byte());
        buf.push(0);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.ack.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a packet from a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        if bytes[0] != MAGIC {
            return Err(DecodeError::BadMagic(bytes[0]));
        }
        if bytes[1] != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(bytes[1]));
        }

        let kind = PacketKind::from_byte(bytes[2]).ok_or(DecodeError::InvalidFlags(bytes[2]))?;

        if bytes[3] != 0 {
            return Err(DecodeError::Reserved(bytes[3]));
        }

        let id = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let seq = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let ack = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        let payload = &bytes[HEADER_SIZE..];
        if !payload.is_empty() && !kind.carries_payload() {
            return Err(DecodeError::UnexpectedPayload(payload.len()));
        }

        Ok(Self {
            kind,
            id,
            seq,
            ack,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kind_from_byte() {
        for kind in [
            PacketKind::Ack,
            PacketKind::Data,
            PacketKind::End,
            PacketKind::Message,
            PacketKind::Destroy,
            PacketKind::MessageAck,
        ] {
            assert_eq!(PacketKind::from_byte(kind.as_byte()), Some(kind));
        }

        // Combined or unknown bits are rejected
        assert_eq!(PacketKind::from_byte(FLAG_DATA | FLAG_END), None);
        assert_eq!(PacketKind::from_byte(0x20), None);
        assert_eq!(PacketKind::from_byte(0xFF), None);
    }

    #[test]
    fn test_data_packet_wire_format() {
        let packet = Packet::data(1, 2, 3, b"hi".to_vec());
        let bytes = packet.encode();

        assert_eq!(hex::encode(&bytes), "ff0101000100000002000000030000006869");
        assert_eq!(bytes.len(), packet.encoded_len());
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_empty_data_packet() {
        let packet = Packet::data(7, 0, 0, Vec::new());
        let decoded = Packet::decode(&packet.encode()).unwrap();

        assert_eq!(decoded.kind, PacketKind::Data);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_control_packets() {
        let end = Packet::decode(&Packet::end(9, 4, 1).encode()).unwrap();
        assert_eq!(end.kind, PacketKind::End);
        assert_eq!(end.seq, 4);

        let ack = Packet::decode(&Packet::message_ack(9, 12, 5).encode()).unwrap();
        assert_eq!(ack.kind, PacketKind::MessageAck);
        assert_eq!(ack.seq, 12);
        assert_eq!(ack.ack, 5);

        let destroy = Packet::decode(&Packet::destroy(3, 0).encode()).unwrap();
        assert_eq!(destroy.kind, PacketKind::Destroy);
        assert_eq!(destroy.id, 3);
    }

    #[test]
    fn test_decode_too_short() {
        let bytes = hex::decode("ff0101000100").unwrap();
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::TooShort {
                expected: HEADER_SIZE,
                actual: 6
            })
        );
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        let mut bytes = Packet::ack(1, 0).encode();
        bytes[0] = 0x00;
        assert_eq!(Packet::decode(&bytes), Err(DecodeError::BadMagic(0x00)));

        let mut bytes = Packet::ack(1, 0).encode();
        bytes[1] = 0x02;
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::UnsupportedVersion(0x02))
        );

        let mut bytes = Packet::ack(1, 0).encode();
        bytes[2] = FLAG_DATA | FLAG_DESTROY;
        assert_eq!(Packet::decode(&bytes), Err(DecodeError::InvalidFlags(0x09)));

        let mut bytes = Packet::ack(1, 0).encode();
        bytes[3] = 0x01;
        assert_eq!(Packet::decode(&bytes), Err(DecodeError::Reserved(0x01)));
    }

    #[test]
    fn test_decode_rejects_payload_on_control() {
        let mut bytes = Packet::end(1, 0, 0).encode();
        bytes.extend_from_slice(b"xyz");
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::UnexpectedPayload(3))
        );
    }

    #[test]
    fn test_kind_classification() {
        assert!(PacketKind::Data.is_ordered());
        assert!(PacketKind::End.is_ordered());
        assert!(!PacketKind::Message.is_ordered());

        assert!(PacketKind::Message.is_opening());
        assert!(!PacketKind::Destroy.is_opening());
        assert!(!PacketKind::Ack.is_opening());
    }
}
