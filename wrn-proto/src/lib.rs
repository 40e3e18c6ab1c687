//! Client wire protocol: packet types and framing.
//!
//! Frames are `u32 length | u8 packet type | u8 flags | body`, little
//! endian throughout. The flags byte carries the framer bits (no-persist,
//! red-dot, sync-once) for Send/Recv packets and is zero elsewhere.

mod frame;
mod packet;

pub use frame::{encode_packet, parse_packet, FRAME_HEADER_SIZE};
pub use packet::{
    ConnackPacket, ConnectPacket, DisconnectPacket, Packet, PacketType, RecvPacket, RecvackPacket,
    SendPacket, SendackPacket, SubPacket, SubackPacket,
};
