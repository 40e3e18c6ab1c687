//! Cross-node payloads and their marshal/unmarshal pairs.
//!
//! Every type here crosses the wire on one of the `/wk/*` routes, so the
//! field order is a compatibility contract. `decode(encode(x)) == x`
//! holds for all of them.

use bytes::Bytes;
use wrn_core::{Decoder, Encoder, Result, WrenError};
use wrn_proto::{encode_packet, parse_packet, Packet, SendPacket, SendackPacket};

/// Kinds of user actions. A subset (Connect, Send, Recv and the Forward
/// wrapper) crosses the wire; the rest are local pipeline stages that
/// share the numbering for uniform logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UserActionKind {
    Init = 1,
    Auth = 2,
    Ping = 3,
    Recvack = 4,
    Recv = 5,
    Send = 6,
    Connect = 7,
    Forward = 8,
    NodePing = 9,
    NodePong = 10,
    ProxyNodeTimeout = 11,
    CheckLeader = 12,
    Close = 13,
}

impl UserActionKind {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Init,
            2 => Self::Auth,
            3 => Self::Ping,
            4 => Self::Recvack,
            5 => Self::Recv,
            6 => Self::Send,
            7 => Self::Connect,
            8 => Self::Forward,
            9 => Self::NodePing,
            10 => Self::NodePong,
            11 => Self::ProxyNodeTimeout,
            12 => Self::CheckLeader,
            13 => Self::Close,
            other => {
                return Err(WrenError::Codec(format!("unknown user action kind {other}")))
            },
        })
    }
}

/// One unit of user work: which connection it concerns and the raw client
/// packet bytes it carries (empty for control-only actions).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserMessage {
    pub from_node_id: u64,
    pub conn_id: u64,
    pub device_id: String,
    pub seq: u64,
    pub payload: Bytes,
}

impl UserMessage {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.from_node_id);
        enc.put_u64(self.conn_id);
        enc.put_str(&self.device_id);
        enc.put_u64(self.seq);
        enc.put_bytes(&self.payload);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            from_node_id: dec.u64()?,
            conn_id: dec.u64()?,
            device_id: dec.str()?,
            seq: dec.u64()?,
            payload: dec.bytes()?,
        })
    }
}

/// A user action, possibly wrapping a forwarded sub-action (proxy → user
/// leader).
#[derive(Debug, Clone, PartialEq)]
pub struct UserAction {
    pub kind: UserActionKind,
    pub uid: String,
    pub leader_id: u64,
    pub index: u64,
    pub messages: Vec<UserMessage>,
    pub forward: Option<Box<UserAction>>,
}

impl UserAction {
    #[must_use]
    pub fn new(kind: UserActionKind, uid: impl Into<String>) -> Self {
        Self {
            kind,
            uid: uid.into(),
            leader_id: 0,
            index: 0,
            messages: Vec::new(),
            forward: None,
        }
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.kind.as_u8());
        enc.put_str(&self.uid);
        enc.put_u64(self.leader_id);
        enc.put_u64(self.index);
        enc.put_u32(self.messages.len() as u32);
        for msg in &self.messages {
            msg.encode(enc);
        }
        match &self.forward {
            Some(inner) => {
                enc.put_u8(1);
                inner.encode(enc);
            },
            None => enc.put_u8(0),
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let kind = UserActionKind::from_u8(dec.u8()?)?;
        let uid = dec.str()?;
        let leader_id = dec.u64()?;
        let index = dec.u64()?;
        let count = dec.u32()?;
        let mut messages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            messages.push(UserMessage::decode(dec)?);
        }
        let forward = if dec.u8()? == 1 {
            Some(Box::new(UserAction::decode(dec)?))
        } else {
            None
        };
        Ok(Self {
            kind,
            uid,
            leader_id,
            index,
            messages,
            forward,
        })
    }
}

/// Batch of actions for one uid, as carried by `/wk/userAction`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserActionSet(pub Vec<UserAction>);

impl UserActionSet {
    #[must_use]
    pub fn marshal(&self) -> Bytes {
        let mut enc = Encoder::with_capacity(128);
        enc.put_u32(self.0.len() as u32);
        for action in &self.0 {
            action.encode(&mut enc);
        }
        enc.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let count = dec.u32()?;
        let mut actions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            actions.push(UserAction::decode(&mut dec)?);
        }
        Ok(Self(actions))
    }
}

/// A send proposal on its way to the channel leader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReactorChannelMessage {
    pub from_uid: String,
    pub from_device_id: String,
    pub from_conn_id: u64,
    pub from_node_id: u64,
    pub message_id: i64,
    pub message_seq: u64,
    pub send_packet: SendPacket,
}

impl ReactorChannelMessage {
    /// Standalone encoding, used for replicated log entry payloads.
    #[must_use]
    pub fn marshal(&self) -> Bytes {
        let mut enc = Encoder::with_capacity(128);
        self.encode(&mut enc);
        enc.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        Self::decode(&mut dec)
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.put_str(&self.from_uid);
        enc.put_str(&self.from_device_id);
        enc.put_u64(self.from_conn_id);
        enc.put_u64(self.from_node_id);
        enc.put_i64(self.message_id);
        enc.put_u64(self.message_seq);
        let packet = encode_packet(&Packet::Send(self.send_packet.clone()));
        enc.put_bytes(&packet);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let from_uid = dec.str()?;
        let from_device_id = dec.str()?;
        let from_conn_id = dec.u64()?;
        let from_node_id = dec.u64()?;
        let message_id = dec.i64()?;
        let message_seq = dec.u64()?;
        let raw = dec.bytes()?;
        let send_packet = match parse_packet(&raw)? {
            Some((Packet::Send(p), _)) => p,
            _ => return Err(WrenError::Codec("embedded packet is not a send".into())),
        };
        Ok(Self {
            from_uid,
            from_device_id,
            from_conn_id,
            from_node_id,
            message_id,
            message_seq,
            send_packet,
        })
    }
}

/// Batch for `/wk/channelFoward`; all entries target the same channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReactorChannelMessageSet(pub Vec<ReactorChannelMessage>);

impl ReactorChannelMessageSet {
    #[must_use]
    pub fn marshal(&self) -> Bytes {
        let mut enc = Encoder::with_capacity(256);
        enc.put_u32(self.0.len() as u32);
        for msg in &self.0 {
            msg.encode(&mut enc);
        }
        enc.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let count = dec.u32()?;
        let mut messages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            messages.push(ReactorChannelMessage::decode(&mut dec)?);
        }
        Ok(Self(messages))
    }
}

/// A sendack travelling back to the node that owns the sender's socket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardSendackPacket {
    pub uid: String,
    pub conn_id: u64,
    pub sendack: SendackPacket,
}

impl ForwardSendackPacket {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_str(&self.uid);
        enc.put_u64(self.conn_id);
        let packet = encode_packet(&Packet::Sendack(self.sendack.clone()));
        enc.put_bytes(&packet);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let uid = dec.str()?;
        let conn_id = dec.u64()?;
        let raw = dec.bytes()?;
        let sendack = match parse_packet(&raw)? {
            Some((Packet::Sendack(p), _)) => p,
            _ => return Err(WrenError::Codec("embedded packet is not a sendack".into())),
        };
        Ok(Self {
            uid,
            conn_id,
            sendack,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardSendackPacketSet(pub Vec<ForwardSendackPacket>);

impl ForwardSendackPacketSet {
    #[must_use]
    pub fn marshal(&self) -> Bytes {
        let mut enc = Encoder::with_capacity(128);
        enc.put_u32(self.0.len() as u32);
        for packet in &self.0 {
            packet.encode(&mut enc);
        }
        enc.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let count = dec.u32()?;
        let mut packets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            packets.push(ForwardSendackPacket::decode(&mut dec)?);
        }
        Ok(Self(packets))
    }
}

/// Raw bytes for a specific connection on the destination node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardWriteReq {
    pub uid: String,
    pub conn_id: u64,
    pub data: Bytes,
}

impl ForwardWriteReq {
    #[must_use]
    pub fn marshal(&self) -> Bytes {
        let mut enc = Encoder::with_capacity(32 + self.data.len());
        enc.put_str(&self.uid);
        enc.put_u64(self.conn_id);
        enc.put_bytes(&self.data);
        enc.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        Ok(Self {
            uid: dec.str()?,
            conn_id: dec.u64()?,
            data: dec.bytes()?,
        })
    }
}

/// Outcome of authentication, travelling from the user leader back to the
/// node that holds the socket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserAuthResult {
    pub uid: String,
    pub conn_id: u64,
    pub device_id: String,
    pub reason_code: u8,
    pub aes_iv: String,
    pub aes_key: String,
    pub proto_version: u8,
    pub device_level: u8,
    pub server_key: String,
}

impl UserAuthResult {
    #[must_use]
    pub fn marshal(&self) -> Bytes {
        let mut enc = Encoder::with_capacity(96);
        enc.put_str(&self.uid);
        enc.put_u64(self.conn_id);
        enc.put_str(&self.device_id);
        enc.put_u8(self.reason_code);
        enc.put_str(&self.aes_iv);
        enc.put_str(&self.aes_key);
        enc.put_u8(self.proto_version);
        enc.put_u8(self.device_level);
        enc.put_str(&self.server_key);
        enc.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        Ok(Self {
            uid: dec.str()?,
            conn_id: dec.u64()?,
            device_id: dec.str()?,
            reason_code: dec.u8()?,
            aes_iv: dec.str()?,
            aes_key: dec.str()?,
            proto_version: dec.u8()?,
            device_level: dec.u8()?,
            server_key: dec.str()?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_action_set_roundtrip_all_kinds() {
        let kinds = [
            UserActionKind::Init,
            UserActionKind::Auth,
            UserActionKind::Ping,
            UserActionKind::Recvack,
            UserActionKind::Recv,
            UserActionKind::Send,
            UserActionKind::Connect,
            UserActionKind::NodePing,
            UserActionKind::NodePong,
            UserActionKind::ProxyNodeTimeout,
            UserActionKind::CheckLeader,
            UserActionKind::Close,
        ];
        let actions: Vec<UserAction> = kinds
            .iter()
            .map(|kind| UserAction {
                kind: *kind,
                uid: "u1".into(),
                leader_id: 3,
                index: 7,
                messages: vec![UserMessage {
                    from_node_id: 2,
                    conn_id: 11,
                    device_id: "d1".into(),
                    seq: 1,
                    payload: Bytes::from_static(b"pkt"),
                }],
                forward: None,
            })
            .collect();
        let set = UserActionSet(actions);
        let decoded = UserActionSet::unmarshal(&set.marshal()).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_forward_action_nests() {
        let inner = UserAction {
            kind: UserActionKind::Connect,
            uid: "u1".into(),
            leader_id: 0,
            index: 0,
            messages: vec![UserMessage {
                from_node_id: 2,
                conn_id: 5,
                device_id: "d".into(),
                seq: 0,
                payload: Bytes::from_static(b"connect"),
            }],
            forward: None,
        };
        let action = UserAction {
            kind: UserActionKind::Forward,
            uid: "u1".into(),
            leader_id: 3,
            index: 0,
            messages: Vec::new(),
            forward: Some(Box::new(inner)),
        };
        let set = UserActionSet(vec![action]);
        let decoded = UserActionSet::unmarshal(&set.marshal()).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(
            decoded.0[0].forward.as_ref().unwrap().kind,
            UserActionKind::Connect
        );
    }

    #[test]
    fn test_reactor_channel_message_set_roundtrip() {
        let set = ReactorChannelMessageSet(vec![ReactorChannelMessage {
            from_uid: "u1".into(),
            from_device_id: "d1".into(),
            from_conn_id: 4,
            from_node_id: 2,
            message_id: 991,
            message_seq: 12,
            send_packet: SendPacket {
                client_seq: 1,
                client_msg_no: "no1".into(),
                channel_id: "g1".into(),
                channel_type: 2,
                payload: Bytes::from_static(b"hello"),
                ..Default::default()
            },
        }]);
        let decoded = ReactorChannelMessageSet::unmarshal(&set.marshal()).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_forward_sendack_set_roundtrip() {
        let set = ForwardSendackPacketSet(vec![ForwardSendackPacket {
            uid: "u1".into(),
            conn_id: 8,
            sendack: SendackPacket {
                client_seq: 1,
                client_msg_no: "no1".into(),
                message_id: 12,
                message_seq: 3,
                reason_code: 1,
            },
        }]);
        let decoded = ForwardSendackPacketSet::unmarshal(&set.marshal()).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_forward_write_req_roundtrip() {
        let req = ForwardWriteReq {
            uid: "u2".into(),
            conn_id: 3,
            data: Bytes::from_static(b"framed recv packet"),
        };
        assert_eq!(ForwardWriteReq::unmarshal(&req.marshal()).unwrap(), req);
    }

    #[test]
    fn test_user_auth_result_roundtrip() {
        let res = UserAuthResult {
            uid: "u1".into(),
            conn_id: 7,
            device_id: "d1".into(),
            reason_code: 1,
            aes_iv: "0123456789abcdef".into(),
            aes_key: "fedcba9876543210".into(),
            proto_version: 4,
            device_level: 1,
            server_key: "srv".into(),
        };
        assert_eq!(UserAuthResult::unmarshal(&res.marshal()).unwrap(), res);
    }
}
