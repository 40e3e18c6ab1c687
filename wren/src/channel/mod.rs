//! Channel reactor: send-proposal ordering, commit application, fanout.

pub mod handler;
pub mod tag;

pub use handler::{ChannelEvent, ChannelHandler};
pub use tag::Tag;

use crate::delivery::DeliveryTask;
use crate::server::{unix_ts, Ctx};
use std::sync::Arc;
use wrn_cluster::{
    ForwardSendackPacket, ForwardSendackPacketSet, ReactorChannelMessage, ROUTE_FORWARD_SENDACK,
    ROUTE_REPLICA,
};
use wrn_core::{Channel, ChannelType, Message, ReasonCode};
use wrn_proto::{encode_packet, Packet, SendackPacket};
use wrn_reactor::{ActionProcessor, Reactor, ReactorOptions};
use wrn_replica::{Entry, GroupConfig, Message as ReplicaMsg, MsgType};

pub fn start_reactor(ctx: Arc<Ctx>) -> Arc<Reactor<ChannelHandler>> {
    let opts = ReactorOptions {
        name: "channel".into(),
        sub_count: ctx.opts.channel_sub_count,
        tick_interval: ctx.opts.tick_interval(),
        inbox_capacity: 8192,
        deadline_tick: ctx.opts.channel_deadline_tick,
    };
    let factory_ctx = Arc::clone(&ctx);
    let node_id = ctx.opts.node_id;
    Reactor::new(
        opts,
        Arc::new(move |key: &str| {
            ChannelHandler::new(parse_channel_key(key), node_id, Arc::clone(&factory_ctx.opts))
        }),
        Arc::new(ChannelProcessor { ctx }),
    )
}

/// Reactor key ↔ channel. Keys are `channel_id:channel_type`.
#[must_use]
pub fn parse_channel_key(key: &str) -> Channel {
    match key.rsplit_once(':') {
        Some((id, kind)) => Channel::new(id, ChannelType::from_u8(kind.parse().unwrap_or(2))),
        None => Channel::new(key, ChannelType::Group),
    }
}

fn group_name(channel_key: &str) -> String {
    format!("ch-{channel_key}")
}

/// Materialise the subscriber tag for a channel: explicit subscribers for
/// groups, the two participants for person channels, partitioned by each
/// member's user-leader node.
pub fn build_tag(ctx: &Arc<Ctx>, channel: &Channel) -> Tag {
    let mut members = match channel.kind {
        // The canonical person id is `a@b`; both sides subscribe.
        ChannelType::Person => channel
            .id
            .split('@')
            .map(str::to_string)
            .collect::<Vec<String>>(),
        ChannelType::Group => ctx.store.subscribers(&channel.key()).unwrap_or_default(),
    };
    members.sort_unstable();
    members.dedup();
    let slots = Arc::clone(&ctx.slots);
    Tag::build(members, move |uid| slots.slot_leader_of_key(uid))
}

pub struct ChannelProcessor {
    ctx: Arc<Ctx>,
}

impl ChannelProcessor {
    /// Load group position, membership and the subscriber tag.
    fn init(&self, key: &str) {
        let channel = parse_channel_key(key);
        let group = group_name(key);
        let (last_index, last_term, applied_index) =
            self.ctx.store.replica_meta(&group).unwrap_or((0, 0, 0));

        let leader = self.ctx.slots.channel_leader(&channel);
        // Channel groups live on the channel's slot replicas, leader
        // first, capped at their own replica count.
        let mut replicas = self.ctx.slots.channel_replicas(&channel);
        if let Some(pos) = replicas.iter().position(|id| *id == leader) {
            replicas.swap(0, pos);
        }
        replicas.truncate(self.ctx.opts.channel_replica_count.max(1));
        let cfg = GroupConfig {
            version: 1,
            term: 1,
            leader,
            replicas,
            ..Default::default()
        };

        let tag = build_tag(&self.ctx, &channel);
        self.ctx.channel_step(
            key,
            ChannelEvent::InitResult {
                last_index,
                last_term,
                applied_index,
                cfg,
                tag,
            },
        );
    }

    fn store_append(&self, key: &str, entries: Vec<Entry>, last_index: u64) {
        let group = group_name(key);
        let reject = self.ctx.store.append_replica_logs(&group, &entries).is_err();
        if reject {
            tracing::error!(
                target: "wren::channel",
                channel = key,
                last_index,
                "log append failed"
            );
        }
        self.ctx.channel_step(
            key,
            ChannelEvent::Replica(ReplicaMsg {
                msg_type: MsgType::StoreAppendResp,
                index: last_index,
                reject,
                ..Default::default()
            }),
        );
    }

    /// Apply committed entries: persist messages, fan out to recipient
    /// partitions, and ack the senders.
    fn apply(&self, key: &str, lo: u64, hi: u64, entries: Vec<Entry>, tag: Tag) {
        let channel = parse_channel_key(key);
        let group = group_name(key);
        let applied_size: u64 = entries.iter().map(Entry::size).sum();
        let cmd_channel = wrn_core::is_cmd_channel(&channel.id);
        let now = unix_ts();

        let mut to_persist: Vec<Message> = Vec::new();
        let mut to_deliver: Vec<Message> = Vec::new();
        let mut acks: Vec<(u64, ForwardSendackPacket)> = Vec::new();

        for entry in &entries {
            let rcm = match ReactorChannelMessage::unmarshal(&entry.data) {
                Ok(rcm) => rcm,
                Err(e) => {
                    tracing::error!(
                        target: "wren::channel",
                        channel = key,
                        index = entry.index,
                        error = %e,
                        "undecodable log entry"
                    );
                    continue;
                },
            };
            let message = Message {
                message_id: rcm.message_id,
                message_seq: rcm.message_seq,
                channel_id: channel.id.clone(),
                channel_type: channel.kind.as_u8(),
                from_uid: rcm.from_uid.clone(),
                timestamp: now,
                framer: rcm.send_packet.framer,
                stream_no: rcm.send_packet.stream_no.clone(),
                stream_seq: 0,
                stream_flag: 0,
                topic: rcm.send_packet.topic.clone(),
                payload: rcm.send_packet.payload.clone(),
            };
            if !rcm.send_packet.framer.no_persist && !cmd_channel {
                to_persist.push(message.clone());
            }
            to_deliver.push(message);
            acks.push((
                rcm.from_node_id,
                ForwardSendackPacket {
                    uid: rcm.from_uid,
                    conn_id: rcm.from_conn_id,
                    sendack: SendackPacket {
                        client_seq: rcm.send_packet.client_seq,
                        client_msg_no: rcm.send_packet.client_msg_no,
                        message_id: rcm.message_id,
                        message_seq: rcm.message_seq,
                        reason_code: ReasonCode::Success.as_u8(),
                    },
                },
            ));
        }

        if !to_persist.is_empty() {
            if let Err(e) = self.ctx.store.append_messages(&to_persist) {
                tracing::error!(
                    target: "wren::channel",
                    channel = key,
                    error = %e,
                    "message persistence failed"
                );
            }
        }

        // Fanout only happens on the leader; followers just apply.
        if self.ctx.slots.channel_leader(&channel) == self.ctx.self_id() && !to_deliver.is_empty()
        {
            for partition in &tag.partitions {
                self.ctx.deliver(DeliveryTask {
                    channel: channel.clone(),
                    messages: to_deliver.clone(),
                    node_id: partition.node_id,
                    uids: partition.uids.clone(),
                });
            }
        }

        self.send_acks(acks);

        if let Err(e) = self.ctx.store.set_applied_index(&group, hi) {
            tracing::warn!(
                target: "wren::channel",
                channel = key,
                error = %e,
                "applied index persistence failed"
            );
        }
        tracing::debug!(
            target: "wren::channel",
            channel = key,
            lo,
            hi,
            "applied committed entries"
        );
        self.ctx.channel_step(
            key,
            ChannelEvent::Replica(ReplicaMsg {
                msg_type: MsgType::ApplyLogsResp,
                index: hi,
                applied_size,
                ..Default::default()
            }),
        );
    }

    fn send_acks(&self, acks: Vec<(u64, ForwardSendackPacket)>) {
        let self_id = self.ctx.self_id();
        let mut remote: std::collections::HashMap<u64, Vec<ForwardSendackPacket>> =
            std::collections::HashMap::new();
        for (origin, ack) in acks {
            if origin == self_id || origin == 0 {
                if let Some(conn) = self.ctx.conns.get(ack.conn_id) {
                    conn.write(encode_packet(&Packet::Sendack(ack.sendack)));
                }
            } else {
                remote.entry(origin).or_default().push(ack);
            }
        }
        for (node, acks) in remote {
            let body = ForwardSendackPacketSet(acks).marshal();
            self.ctx.rpc_ff(node, ROUTE_FORWARD_SENDACK, body);
        }
    }

    fn sync_get(&self, key: &str, to: u64, index: u64) {
        let group = group_name(key);
        let entries = self
            .ctx
            .store
            .replica_logs(&group, index, u64::MAX, self.ctx.opts.sync_limit_size)
            .unwrap_or_default();
        self.ctx.channel_step(
            key,
            ChannelEvent::Replica(ReplicaMsg {
                msg_type: MsgType::SyncGetResp,
                to,
                index,
                entries,
                ..Default::default()
            }),
        );
    }

    fn replica_out(&self, key: &str, msg: ReplicaMsg) {
        let to = msg.to;
        if to == 0 || to == self.ctx.self_id() {
            return;
        }
        let body = crate::server::encode_replica_envelope(2, key, &msg);
        self.ctx.rpc_ff(to, ROUTE_REPLICA, body);
    }
}

impl ActionProcessor<ChannelHandler> for ChannelProcessor {
    fn process(&self, key: &str, events: Vec<ChannelEvent>) {
        for event in events {
            match event {
                ChannelEvent::Init => self.init(key),
                ChannelEvent::StoreAppend {
                    entries,
                    last_index,
                } => self.store_append(key, entries, last_index),
                ChannelEvent::Apply {
                    lo,
                    hi,
                    entries,
                    tag,
                } => self.apply(key, lo, hi, entries, tag),
                ChannelEvent::SyncGet { to, index } => self.sync_get(key, to, index),
                ChannelEvent::StoreTruncate { index } => {
                    if let Err(e) = self
                        .ctx
                        .store
                        .truncate_replica_logs_from(&group_name(key), index)
                    {
                        tracing::warn!(
                            target: "wren::channel",
                            channel = key,
                            error = %e,
                            "log truncation failed"
                        );
                    }
                },
                ChannelEvent::ReplicaOut(msg) => self.replica_out(key, msg),
                ChannelEvent::SendRejected { messages } => {
                    let acks = messages
                        .into_iter()
                        .map(|rcm| {
                            (
                                rcm.from_node_id,
                                ForwardSendackPacket {
                                    uid: rcm.from_uid,
                                    conn_id: rcm.from_conn_id,
                                    sendack: SendackPacket {
                                        client_seq: rcm.send_packet.client_seq,
                                        client_msg_no: rcm.send_packet.client_msg_no,
                                        message_id: 0,
                                        message_seq: 0,
                                        reason_code: ReasonCode::SystemError.as_u8(),
                                    },
                                },
                            )
                        })
                        .collect();
                    self.send_acks(acks);
                },
                _ => {},
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channel_key() {
        let ch = parse_channel_key("g1:2");
        assert_eq!(ch.id, "g1");
        assert_eq!(ch.kind, ChannelType::Group);
        let ch = parse_channel_key("u1@u2:1");
        assert_eq!(ch.id, "u1@u2");
        assert_eq!(ch.kind, ChannelType::Person);
        // Round trip through the key form.
        assert_eq!(parse_channel_key(&ch.key()), ch);
    }
}
