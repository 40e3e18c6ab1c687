//! Shared foundation for the WREN messaging cluster.
//!
//! Everything here is dependency-light on purpose: the error enum, the id
//! and enum types that cross crate boundaries, the stable slot hash, and
//! the little-endian binary encoder/decoder every cross-node payload is
//! built on.

pub mod codec;
pub mod error;
pub mod slot;
pub mod types;

pub use codec::{Decoder, Encoder};
pub use error::{Result, WrenError};
pub use slot::{fake_channel_id, fnv1a, from_cmd_channel, is_cmd_channel, slot_of, to_cmd_channel, CMD_SUFFIX};
pub use types::{
    Channel, ChannelType, Conversation, DeviceFlag, DeviceLevel, Framer, Message, NodeId,
    NodeRole, ReasonCode, MAX_NODE_ID,
};
