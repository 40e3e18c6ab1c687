use bytes::Bytes;

/// Cluster node identifier. Valid ids are `1..=MAX_NODE_ID`; 0 means "none".
pub type NodeId = u64;

/// Node ids are packed into routing keys elsewhere, so the space is capped.
pub const MAX_NODE_ID: NodeId = 1023;

/// Role a node plays in the cluster topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Holds slot replicas and participates in elections.
    Replica,
    /// Terminates client sockets only; forwards everything.
    Proxy,
}

/// Channel kind. Command traffic is expressed through the id suffix, not a
/// separate kind (see [`crate::slot::is_cmd_channel`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelType {
    Person = 1,
    Group = 2,
}

impl ChannelType {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Person,
            _ => Self::Group,
        }
    }
}

/// A channel key: id plus kind. Person channels are stored under their
/// canonical fake id, so the key is unique per conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub id: String,
    pub kind: ChannelType,
}

impl Channel {
    pub fn new(id: impl Into<String>, kind: ChannelType) -> Self {
        Self { id: id.into(), kind }
    }

    /// Stable string form used for hashing and group naming.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.id, self.kind.as_u8())
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.kind.as_u8())
    }
}

/// Device level: a master device owns the session, slaves ride along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceLevel {
    Slave = 0,
    Master = 1,
}

impl DeviceLevel {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Master,
            _ => Self::Slave,
        }
    }
}

/// Client platform flag carried in the connect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceFlag {
    App = 0,
    Web = 1,
    Desktop = 2,
}

impl DeviceFlag {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Web,
            2 => Self::Desktop,
            _ => Self::App,
        }
    }
}

/// Reason codes reported back to clients in acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReasonCode {
    Success = 1,
    AuthFail = 2,
    SystemError = 3,
    NotInChannel = 4,
}

impl ReasonCode {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Success,
            2 => Self::AuthFail,
            4 => Self::NotInChannel,
            _ => Self::SystemError,
        }
    }
}

/// Per-message framer flags, carried end to end from the send packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Framer {
    /// Skip persistence for this message.
    pub no_persist: bool,
    /// Show an unread marker on the receiving side.
    pub red_dot: bool,
    /// Deliver to at most one device per user.
    pub sync_once: bool,
}

impl Framer {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        let mut v = 0u8;
        if self.no_persist {
            v |= 0x01;
        }
        if self.red_dot {
            v |= 0x02;
        }
        if self.sync_once {
            v |= 0x04;
        }
        v
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        Self {
            no_persist: value & 0x01 != 0,
            red_dot: value & 0x02 != 0,
            sync_once: value & 0x04 != 0,
        }
    }
}

/// A routable, persistable message. `message_seq` is dense and strictly
/// increasing within its channel; `message_id` is globally unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub message_id: i64,
    pub message_seq: u64,
    pub channel_id: String,
    pub channel_type: u8,
    pub from_uid: String,
    pub timestamp: u64,
    pub framer: Framer,
    pub stream_no: String,
    pub stream_seq: u64,
    pub stream_flag: u8,
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    /// Approximate wire size, used for quota accounting.
    #[must_use]
    pub fn size(&self) -> u64 {
        (8 + 8
            + self.channel_id.len()
            + 1
            + self.from_uid.len()
            + 8
            + 1
            + self.stream_no.len()
            + 8
            + 1
            + self.topic.len()
            + self.payload.len()) as u64
    }
}

/// Per-user conversation row, keyed by (uid, channel).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub channel_id: String,
    pub channel_type: u8,
    pub unread_count: u32,
    pub readed_to_msg_seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}
