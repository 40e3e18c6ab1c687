//! Per-group log replication: leader election, pull-based log sync,
//! quorum commit and learner migration.
//!
//! One [`Replica`] instance exists per replication group (one group per
//! slot, one per active channel). The instance is a pure state machine:
//! [`Replica::step`] is the only mutator, [`Replica::tick`] advances
//! timers, and [`Replica::ready`] harvests the messages the owner must
//! dispatch: network messages to peers, plus local storage-append and
//! apply work addressed to the owner itself.

mod log;
mod message;
mod replica;

pub use log::ReplicaLog;
pub use message::{
    AckMode, Entry, GroupConfig, Message, MsgType, Role, SpeedLevel, NO_CONFLICT, NO_NODE,
};
pub use replica::{Replica, ReplicaOptions, Status};
