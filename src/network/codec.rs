//! Frame codec
//!
//! Every packet travels as `[type: u32 BE][length: u32 BE][payload]`.
//! The decoder works on a reassembly buffer: it leaves partial frames in
//! place and reports oversized headers as [`NetError::BadPacket`] without
//! consuming anything, so the caller can discard the desynchronized stream.

use crate::network::message::{MessageType, Packet};
use crate::network::net_core::NetError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const PACKET_TYPE_SIZE: usize = 4;
pub const PACKET_LEN_SIZE: usize = 4;
pub const PACKET_HEAD_SIZE: usize = PACKET_TYPE_SIZE + PACKET_LEN_SIZE;

/// Upper bound on a whole frame, header included
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// A decoded frame together with its raw bytes, kept for verbatim relaying
#[derive(Debug)]
pub struct Frame {
    pub packet: Packet,
    pub raw: BytesMut,
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        self.packet.message_type()
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

/// Codec for the P2P frame format
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    /// Parse the header without consuming it
    pub fn peek_header(src: &[u8]) -> Option<(u32, usize)> {
        if src.len() < PACKET_HEAD_SIZE {
            return None;
        }
        let ptype = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        Some((ptype, len))
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = NetError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload()?;
        if payload.len() + PACKET_HEAD_SIZE > MAX_PACKET_SIZE {
            return Err(NetError::BadPacket);
        }

        dst.reserve(PACKET_HEAD_SIZE + payload.len());
        dst.put_u32(item.message_type() as u32);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((ptype, len)) = Self::peek_header(src) else {
            return Ok(None);
        };

        let packet_size = len + PACKET_HEAD_SIZE;
        if packet_size > MAX_PACKET_SIZE {
            return Err(NetError::BadPacket);
        }
        if src.len() < packet_size {
            src.reserve(packet_size - src.len());
            return Ok(None);
        }

        let raw = src.split_to(packet_size);
        let ptype = MessageType::from_u32(ptype).ok_or(NetError::UnknownType(ptype))?;
        let mut payload = &raw[..];
        payload.advance(PACKET_HEAD_SIZE);

        match Packet::from_payload(ptype, payload)? {
            Some(packet) => Ok(Some(Frame { packet, raw })),
            None => Err(NetError::UnknownType(ptype as u32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{expiration_after, MsgFindNode, MESSAGE_EXPIRATION};
    use crate::network::node::NodeId;

    fn find_node_packet() -> Packet {
        Packet::FindNode(MsgFindNode {
            target: NodeId::random(),
            expiration: expiration_after(MESSAGE_EXPIRATION),
        })
    }

    #[test]
    fn test_packet_codec() {
        let mut codec = PacketCodec;
        let packet = find_node_packet();

        let mut buf = BytesMut::new();
        codec.encode(&packet, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 2]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.packet, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = PacketCodec;
        let mut full = BytesMut::new();
        codec.encode(&find_node_packet(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 3);

        let mut header_only = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut header_only).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut codec = PacketCodec;
        let first = find_node_packet();
        let second = find_node_packet();
        let mut buf = BytesMut::new();
        codec.encode(&first, &mut buf).unwrap();
        codec.encode(&second, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().packet, first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().packet, second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_header_is_bad_packet() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(MessageType::Data as u32);
        buf.put_u32(u32::MAX);
        buf.put_slice(b"junk");

        assert!(matches!(codec.decode(&mut buf), Err(NetError::BadPacket)));
        // nothing consumed, the caller decides what to drop
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn test_unknown_type_consumes_frame() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(77);
        buf.put_u32(2);
        buf.put_slice(b"{}");

        assert!(matches!(codec.decode(&mut buf), Err(NetError::UnknownType(77))));
        assert!(buf.is_empty());
    }
}
