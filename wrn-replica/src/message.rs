use bytes::Bytes;
use wrn_core::{Decoder, Encoder, Result, WrenError};

/// "No node" marker for leader/vote fields.
pub const NO_NODE: u64 = 0;

/// Conflict-check answer meaning the follower log needs no truncation.
pub const NO_CONFLICT: u64 = u64::MAX;

/// Role of a replica within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Role {
    #[default]
    Follower = 0,
    Candidate = 1,
    Leader = 2,
    /// Receives the log but does not vote or count toward quorum.
    Learner = 3,
}

impl Role {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Candidate,
            2 => Self::Leader,
            3 => Self::Learner,
            _ => Self::Follower,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Learner => "learner",
        };
        f.write_str(s)
    }
}

/// Acknowledgement mode for commit advancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Quorum of non-learner replicas must have synced past an index.
    #[default]
    Majority,
    /// Commit on local append. Only honoured for single-node groups.
    None,
}

/// Leader-assigned sync pacing, propagated to followers in pings and sync
/// responses. Higher levels stretch the follower's sync request interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SpeedLevel {
    Fast = 0,
    #[default]
    Normal = 1,
    Slow = 2,
    Slowest = 3,
    /// Follower stops pulling entirely (used while migrating data away).
    Stop = 4,
}

impl SpeedLevel {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Fast,
            2 => Self::Slow,
            3 => Self::Slowest,
            4 => Self::Stop,
            _ => Self::Normal,
        }
    }

    /// Multiplier applied to the base sync interval.
    #[must_use]
    pub const fn interval_factor(self) -> u64 {
        match self {
            Self::Fast => 1,
            Self::Normal => 2,
            Self::Slow => 8,
            Self::Slowest => 32,
            Self::Stop => 0,
        }
    }
}

/// Replication message discriminant.
///
/// Local messages (term 0, exchanged between a replica and its owner) are
/// Propose, Hup, Beat, StoreAppend/Resp, ApplyLogs/Resp, SyncGet/Resp,
/// SpeedLevelSet, ChangeRole and InitResp; the rest cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Unknown = 0,
    InitResp = 1,
    Hup = 2,
    Beat = 3,
    Ping = 4,
    Pong = 5,
    VoteReq = 6,
    VoteResp = 7,
    Propose = 8,
    SyncReq = 9,
    SyncResp = 10,
    SyncGet = 11,
    SyncGetResp = 12,
    LogConflictCheck = 13,
    LogConflictCheckResp = 14,
    StoreAppend = 15,
    StoreAppendResp = 16,
    ApplyLogs = 17,
    ApplyLogsResp = 18,
    ConfigReq = 19,
    ConfigResp = 20,
    SpeedLevelSet = 21,
    ChangeRole = 22,
}

impl MsgType {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InitResp,
            2 => Self::Hup,
            3 => Self::Beat,
            4 => Self::Ping,
            5 => Self::Pong,
            6 => Self::VoteReq,
            7 => Self::VoteResp,
            8 => Self::Propose,
            9 => Self::SyncReq,
            10 => Self::SyncResp,
            11 => Self::SyncGet,
            12 => Self::SyncGetResp,
            13 => Self::LogConflictCheck,
            14 => Self::LogConflictCheckResp,
            15 => Self::StoreAppend,
            16 => Self::StoreAppendResp,
            17 => Self::ApplyLogs,
            18 => Self::ApplyLogsResp,
            19 => Self::ConfigReq,
            20 => Self::ConfigResp,
            21 => Self::SpeedLevelSet,
            22 => Self::ChangeRole,
            _ => Self::Unknown,
        }
    }

    /// True for message kinds that never leave the node.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(
            self,
            Self::Hup
                | Self::Beat
                | Self::Propose
                | Self::SyncGet
                | Self::SyncGetResp
                | Self::StoreAppend
                | Self::StoreAppendResp
                | Self::ApplyLogs
                | Self::ApplyLogsResp
                | Self::SpeedLevelSet
                | Self::InitResp
        )
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One replicated log entry. Indices are dense and start at 1;
/// `(index, term)` uniquely identifies an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: u32,
    pub data: Bytes,
}

impl Entry {
    #[must_use]
    pub fn new(index: u64, term: u32, data: Bytes) -> Self {
        Self { index, term, data }
    }

    /// Encoding size used for uncommitted-quota accounting.
    #[must_use]
    pub fn size(&self) -> u64 {
        (8 + 4 + 4 + self.data.len()) as u64
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.index);
        enc.put_u32(self.term);
        enc.put_bytes(&self.data);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            index: dec.u64()?,
            term: dec.u32()?,
            data: dec.bytes()?,
        })
    }
}

/// Total encoding size of a batch of entries.
#[must_use]
pub fn entries_size(entries: &[Entry]) -> u64 {
    entries.iter().map(Entry::size).sum()
}

/// Group membership and migration state, versioned so followers can pull
/// newer configs from the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupConfig {
    pub version: u64,
    pub term: u32,
    pub leader: u64,
    pub replicas: Vec<u64>,
    pub learners: Vec<u64>,
    pub migrate_from: u64,
    pub migrate_to: u64,
}

impl GroupConfig {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.version == 0 && self.replicas.is_empty() && self.learners.is_empty()
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.version);
        enc.put_u32(self.term);
        enc.put_u64(self.leader);
        enc.put_u16(self.replicas.len() as u16);
        for r in &self.replicas {
            enc.put_u64(*r);
        }
        enc.put_u16(self.learners.len() as u16);
        for l in &self.learners {
            enc.put_u64(*l);
        }
        enc.put_u64(self.migrate_from);
        enc.put_u64(self.migrate_to);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let version = dec.u64()?;
        let term = dec.u32()?;
        let leader = dec.u64()?;
        let replica_count = dec.u16()?;
        let mut replicas = Vec::with_capacity(replica_count as usize);
        for _ in 0..replica_count {
            replicas.push(dec.u64()?);
        }
        let learner_count = dec.u16()?;
        let mut learners = Vec::with_capacity(learner_count as usize);
        for _ in 0..learner_count {
            learners.push(dec.u64()?);
        }
        Ok(Self {
            version,
            term,
            leader,
            replicas,
            learners,
            migrate_from: dec.u64()?,
            migrate_to: dec.u64()?,
        })
    }
}

/// A replication message. A single struct rather than per-kind types so
/// `step` can dispatch uniformly; unused fields stay at their defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub msg_type: MsgType,
    pub from: u64,
    pub to: u64,
    pub term: u32,
    /// Index meaning depends on kind: next wanted index for SyncReq,
    /// last log index for votes and conflict checks, applied/storaged
    /// index for resp kinds.
    pub index: u64,
    pub committed_index: u64,
    pub speed_level: SpeedLevel,
    pub reject: bool,
    pub conf_version: u64,
    pub applied_size: u64,
    /// Term of the sender's last log entry (conflict checks).
    pub log_term: u32,
    pub role: Role,
    pub config: Option<GroupConfig>,
    pub entries: Vec<Entry>,
}

impl Default for MsgType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Message {
    #[must_use]
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            ..Default::default()
        }
    }

    /// Marshal for the cluster transport.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::with_capacity(64);
        enc.put_u8(self.msg_type.as_u8());
        enc.put_u64(self.from);
        enc.put_u64(self.to);
        enc.put_u32(self.term);
        enc.put_u64(self.index);
        enc.put_u64(self.committed_index);
        enc.put_u8(self.speed_level.as_u8());
        enc.put_u8(u8::from(self.reject));
        enc.put_u64(self.conf_version);
        enc.put_u64(self.applied_size);
        enc.put_u32(self.log_term);
        enc.put_u8(self.role.as_u8());
        match &self.config {
            Some(cfg) => {
                enc.put_u8(1);
                cfg.encode(&mut enc);
            },
            None => enc.put_u8(0),
        }
        enc.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            entry.encode(&mut enc);
        }
        enc.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let msg_type = MsgType::from_u8(dec.u8()?);
        if msg_type == MsgType::Unknown {
            return Err(WrenError::Codec("unknown replica message type".into()));
        }
        let from = dec.u64()?;
        let to = dec.u64()?;
        let term = dec.u32()?;
        let index = dec.u64()?;
        let committed_index = dec.u64()?;
        let speed_level = SpeedLevel::from_u8(dec.u8()?);
        let reject = dec.u8()? != 0;
        let conf_version = dec.u64()?;
        let applied_size = dec.u64()?;
        let log_term = dec.u32()?;
        let role = Role::from_u8(dec.u8()?);
        let config = if dec.u8()? == 1 {
            Some(GroupConfig::decode(&mut dec)?)
        } else {
            None
        };
        let entry_count = dec.u32()?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            entries.push(Entry::decode(&mut dec)?);
        }
        Ok(Self {
            msg_type,
            from,
            to,
            term,
            index,
            committed_index,
            speed_level,
            reject,
            conf_version,
            applied_size,
            log_term,
            role,
            config,
            entries,
        })
    }
}
