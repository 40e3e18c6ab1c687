//! Cluster plumbing: slot partitioning, node membership, the node-to-node
//! RPC transport, and the payload codecs that ride it.
//!
//! Route strings are part of the wire compatibility contract and never
//! change spelling, including the historical `/wk/channelFoward`.

mod node;
mod rpc;
mod slots;
mod transport;

pub use node::{NodeDescriptor, NodeManager};
pub use rpc::{
    ForwardSendackPacket, ForwardSendackPacketSet, ForwardWriteReq, ReactorChannelMessage,
    ReactorChannelMessageSet, UserAction, UserActionKind, UserActionSet, UserAuthResult,
    UserMessage,
};
pub use slots::SlotManager;
pub use transport::{RouteHandler, Router, RpcServer, Status};

pub const ROUTE_CHANNEL_FORWARD: &str = "/wk/channelFoward";
pub const ROUTE_FORWARD_SENDACK: &str = "/wk/forwardSendack";
pub const ROUTE_CONN_WRITE: &str = "/wk/connWrite";
pub const ROUTE_USER_ACTION: &str = "/wk/userAction";
pub const ROUTE_USER_AUTH_RESULT: &str = "/wk/userAuthResult";
pub const ROUTE_REPLICA: &str = "/wk/replica";
pub const ROUTE_NODE_PING: &str = "/wk/nodePing";
