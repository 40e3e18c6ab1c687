use crate::packet::{Packet, PacketType};
use bytes::{BufMut, Bytes, BytesMut};
use wrn_core::{Encoder, Result, WrenError};

/// Length prefix (u32) + packet type + flags.
pub const FRAME_HEADER_SIZE: usize = 6;

/// Hard cap on a single client frame; anything larger is a protocol error.
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Encode one packet into a framed byte buffer ready for the socket.
#[must_use]
pub fn encode_packet(packet: &Packet) -> Bytes {
    let mut body = Encoder::with_capacity(64);
    packet.encode_body(&mut body);
    let body = body.freeze();

    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.put_u32_le((body.len() + 2) as u32);
    out.put_u8(packet.packet_type().as_u8());
    out.put_u8(packet.flags());
    out.extend_from_slice(&body);
    out.freeze()
}

/// Try to parse one packet from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a partial frame; the
/// caller keeps reading. On success the second tuple element is the number
/// of bytes consumed.
pub fn parse_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let frame_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if frame_len < 2 || frame_len > MAX_FRAME_SIZE {
        return Err(WrenError::Protocol(format!(
            "frame length {frame_len} out of range"
        )));
    }
    let total = 4 + frame_len;
    if buf.len() < total {
        return Ok(None);
    }

    let packet_type = PacketType::from_u8(buf[4])?;
    let flags = buf[5];
    let body = &buf[FRAME_HEADER_SIZE..total];
    let packet = Packet::decode_body(packet_type, flags, body)?;
    Ok(Some((packet, total)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::packet::*;
    use wrn_core::Framer;

    fn roundtrip(packet: Packet) {
        let encoded = encode_packet(&packet);
        let (parsed, consumed) = parse_packet(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_connect_roundtrip() {
        roundtrip(Packet::Connect(ConnectPacket {
            proto_version: 4,
            device_id: "d-1".into(),
            device_flag: 0,
            uid: "u1".into(),
            token: "tok".into(),
        }));
    }

    #[test]
    fn test_connack_roundtrip() {
        roundtrip(Packet::Connack(ConnackPacket {
            server_version: 4,
            reason_code: 1,
            server_key: "sk".into(),
            salt: "iv".into(),
            node_id: 1,
        }));
    }

    #[test]
    fn test_send_roundtrip_with_framer() {
        roundtrip(Packet::Send(SendPacket {
            framer: Framer {
                no_persist: true,
                red_dot: true,
                sync_once: false,
            },
            client_seq: 9,
            client_msg_no: "no-1".into(),
            stream_no: String::new(),
            channel_id: "g1".into(),
            channel_type: 2,
            topic: String::new(),
            payload: Bytes::from_static(b"hello"),
        }));
    }

    #[test]
    fn test_recv_roundtrip() {
        roundtrip(Packet::Recv(RecvPacket {
            framer: Framer::default(),
            message_id: 77,
            message_seq: 3,
            timestamp: 1_700_000_000,
            channel_id: "g1".into(),
            channel_type: 2,
            from_uid: "u1".into(),
            stream_no: String::new(),
            stream_seq: 0,
            stream_flag: 0,
            topic: String::new(),
            payload: Bytes::from_static(b"hi"),
        }));
    }

    #[test]
    fn test_control_packets_roundtrip() {
        roundtrip(Packet::Ping);
        roundtrip(Packet::Pong);
        roundtrip(Packet::Recvack(RecvackPacket {
            message_id: 5,
            message_seq: 2,
        }));
        roundtrip(Packet::Sendack(SendackPacket {
            client_seq: 1,
            client_msg_no: "n".into(),
            message_id: 10,
            message_seq: 1,
            reason_code: 1,
        }));
        roundtrip(Packet::Sub(SubPacket {
            channel_id: "g1".into(),
            channel_type: 2,
            action: 0,
        }));
        roundtrip(Packet::Suback(SubackPacket {
            channel_id: "g1".into(),
            channel_type: 2,
            reason_code: 1,
        }));
        roundtrip(Packet::Disconnect(DisconnectPacket {
            reason_code: 1,
            reason: "bye".into(),
        }));
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let encoded = encode_packet(&Packet::Ping);
        assert!(parse_packet(&encoded[..3]).unwrap().is_none());
        assert!(parse_packet(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_packet(&Packet::Ping));
        buf.extend_from_slice(&encode_packet(&Packet::Pong));

        let (first, used) = parse_packet(&buf).unwrap().unwrap();
        assert_eq!(first, Packet::Ping);
        let (second, used2) = parse_packet(&buf[used..]).unwrap().unwrap();
        assert_eq!(second, Packet::Pong);
        assert_eq!(used + used2, buf.len());
    }
}
