use bytes::Bytes;
use wrn_core::{Decoder, Encoder, Framer, Result, WrenError};

/// Wire discriminant for client packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Send = 3,
    Sendack = 4,
    Recv = 5,
    Recvack = 6,
    Ping = 7,
    Pong = 8,
    Sub = 9,
    Suback = 10,
    Disconnect = 11,
}

impl PacketType {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Connect,
            2 => Self::Connack,
            3 => Self::Send,
            4 => Self::Sendack,
            5 => Self::Recv,
            6 => Self::Recvack,
            7 => Self::Ping,
            8 => Self::Pong,
            9 => Self::Sub,
            10 => Self::Suback,
            11 => Self::Disconnect,
            other => return Err(WrenError::Protocol(format!("unknown packet type {other}"))),
        })
    }
}

/// First packet on every connection; carries identity and the auth token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectPacket {
    pub proto_version: u8,
    pub device_id: String,
    pub device_flag: u8,
    pub uid: String,
    pub token: String,
}

/// Auth outcome. `salt` doubles as the AES IV handed to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnackPacket {
    pub server_version: u8,
    pub reason_code: u8,
    pub server_key: String,
    pub salt: String,
    pub node_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendPacket {
    pub framer: Framer,
    pub client_seq: u32,
    pub client_msg_no: String,
    pub stream_no: String,
    pub channel_id: String,
    pub channel_type: u8,
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendackPacket {
    pub client_seq: u32,
    pub client_msg_no: String,
    pub message_id: i64,
    pub message_seq: u64,
    pub reason_code: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecvPacket {
    pub framer: Framer,
    pub message_id: i64,
    pub message_seq: u64,
    pub timestamp: u64,
    pub channel_id: String,
    pub channel_type: u8,
    pub from_uid: String,
    pub stream_no: String,
    pub stream_seq: u64,
    pub stream_flag: u8,
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvackPacket {
    pub message_id: i64,
    pub message_seq: u64,
}

/// Subscribe (`action` 0) or unsubscribe (`action` 1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubPacket {
    pub channel_id: String,
    pub channel_type: u8,
    pub action: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubackPacket {
    pub channel_id: String,
    pub channel_type: u8,
    pub reason_code: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason_code: u8,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Send(SendPacket),
    Sendack(SendackPacket),
    Recv(RecvPacket),
    Recvack(RecvackPacket),
    Ping,
    Pong,
    Sub(SubPacket),
    Suback(SubackPacket),
    Disconnect(DisconnectPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Send(_) => PacketType::Send,
            Packet::Sendack(_) => PacketType::Sendack,
            Packet::Recv(_) => PacketType::Recv,
            Packet::Recvack(_) => PacketType::Recvack,
            Packet::Ping => PacketType::Ping,
            Packet::Pong => PacketType::Pong,
            Packet::Sub(_) => PacketType::Sub,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// Framer flags byte for the frame header (zero unless Send/Recv).
    #[must_use]
    pub fn flags(&self) -> u8 {
        match self {
            Packet::Send(p) => p.framer.as_u8(),
            Packet::Recv(p) => p.framer.as_u8(),
            _ => 0,
        }
    }

    pub(crate) fn encode_body(&self, enc: &mut Encoder) {
        match self {
            Packet::Connect(p) => {
                enc.put_u8(p.proto_version);
                enc.put_str(&p.device_id);
                enc.put_u8(p.device_flag);
                enc.put_str(&p.uid);
                enc.put_str(&p.token);
            },
            Packet::Connack(p) => {
                enc.put_u8(p.server_version);
                enc.put_u8(p.reason_code);
                enc.put_str(&p.server_key);
                enc.put_str(&p.salt);
                enc.put_u64(p.node_id);
            },
            Packet::Send(p) => {
                enc.put_u32(p.client_seq);
                enc.put_str(&p.client_msg_no);
                enc.put_str(&p.stream_no);
                enc.put_str(&p.channel_id);
                enc.put_u8(p.channel_type);
                enc.put_str(&p.topic);
                enc.put_bytes(&p.payload);
            },
            Packet::Sendack(p) => {
                enc.put_u32(p.client_seq);
                enc.put_str(&p.client_msg_no);
                enc.put_i64(p.message_id);
                enc.put_u64(p.message_seq);
                enc.put_u8(p.reason_code);
            },
            Packet::Recv(p) => {
                enc.put_i64(p.message_id);
                enc.put_u64(p.message_seq);
                enc.put_u64(p.timestamp);
                enc.put_str(&p.channel_id);
                enc.put_u8(p.channel_type);
                enc.put_str(&p.from_uid);
                enc.put_str(&p.stream_no);
                enc.put_u64(p.stream_seq);
                enc.put_u8(p.stream_flag);
                enc.put_str(&p.topic);
                enc.put_bytes(&p.payload);
            },
            Packet::Recvack(p) => {
                enc.put_i64(p.message_id);
                enc.put_u64(p.message_seq);
            },
            Packet::Ping | Packet::Pong => {},
            Packet::Sub(p) => {
                enc.put_str(&p.channel_id);
                enc.put_u8(p.channel_type);
                enc.put_u8(p.action);
            },
            Packet::Suback(p) => {
                enc.put_str(&p.channel_id);
                enc.put_u8(p.channel_type);
                enc.put_u8(p.reason_code);
            },
            Packet::Disconnect(p) => {
                enc.put_u8(p.reason_code);
                enc.put_str(&p.reason);
            },
        }
    }

    pub(crate) fn decode_body(packet_type: PacketType, flags: u8, body: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(body);
        let framer = Framer::from_u8(flags);
        Ok(match packet_type {
            PacketType::Connect => Packet::Connect(ConnectPacket {
                proto_version: dec.u8()?,
                device_id: dec.str()?,
                device_flag: dec.u8()?,
                uid: dec.str()?,
                token: dec.str()?,
            }),
            PacketType::Connack => Packet::Connack(ConnackPacket {
                server_version: dec.u8()?,
                reason_code: dec.u8()?,
                server_key: dec.str()?,
                salt: dec.str()?,
                node_id: dec.u64()?,
            }),
            PacketType::Send => Packet::Send(SendPacket {
                framer,
                client_seq: dec.u32()?,
                client_msg_no: dec.str()?,
                stream_no: dec.str()?,
                channel_id: dec.str()?,
                channel_type: dec.u8()?,
                topic: dec.str()?,
                payload: dec.bytes()?,
            }),
            PacketType::Sendack => Packet::Sendack(SendackPacket {
                client_seq: dec.u32()?,
                client_msg_no: dec.str()?,
                message_id: dec.i64()?,
                message_seq: dec.u64()?,
                reason_code: dec.u8()?,
            }),
            PacketType::Recv => Packet::Recv(RecvPacket {
                framer,
                message_id: dec.i64()?,
                message_seq: dec.u64()?,
                timestamp: dec.u64()?,
                channel_id: dec.str()?,
                channel_type: dec.u8()?,
                from_uid: dec.str()?,
                stream_no: dec.str()?,
                stream_seq: dec.u64()?,
                stream_flag: dec.u8()?,
                topic: dec.str()?,
                payload: dec.bytes()?,
            }),
            PacketType::Recvack => Packet::Recvack(RecvackPacket {
                message_id: dec.i64()?,
                message_seq: dec.u64()?,
            }),
            PacketType::Ping => Packet::Ping,
            PacketType::Pong => Packet::Pong,
            PacketType::Sub => Packet::Sub(SubPacket {
                channel_id: dec.str()?,
                channel_type: dec.u8()?,
                action: dec.u8()?,
            }),
            PacketType::Suback => Packet::Suback(SubackPacket {
                channel_id: dec.str()?,
                channel_type: dec.u8()?,
                reason_code: dec.u8()?,
            }),
            PacketType::Disconnect => Packet::Disconnect(DisconnectPacket {
                reason_code: dec.u8()?,
                reason: dec.str()?,
            }),
        })
    }
}
