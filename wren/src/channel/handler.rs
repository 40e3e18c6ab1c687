use crate::channel::tag::Tag;
use crate::config::Config;
use std::sync::Arc;
use wrn_cluster::ReactorChannelMessage;
use wrn_core::{is_cmd_channel, Channel, Result};
use wrn_reactor::Handler;
use wrn_replica::{
    AckMode, Entry, GroupConfig, Message as ReplicaMsg, MsgType, Replica, ReplicaOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelStatus {
    Uninitialized,
    Initializing,
    Ready,
}

/// Channel pipeline events.
pub enum ChannelEvent {
    // ── inbound ────────────────────────────────────────────────────────
    /// A send proposal (local client or `/wk/channelFoward`).
    Send(ReactorChannelMessage),
    /// Replication traffic for this channel's group.
    Replica(ReplicaMsg),
    InitResult {
        last_index: u64,
        last_term: u32,
        applied_index: u64,
        cfg: GroupConfig,
        tag: Tag,
    },
    TagUpdated(Tag),
    // ── harvested ──────────────────────────────────────────────────────
    /// Ask the processor to load group state and the subscriber tag.
    Init,
    /// Entries to append to the group's log column.
    StoreAppend {
        entries: Vec<Entry>,
        last_index: u64,
    },
    /// Committed entries to apply: persist, fan out, ack origin.
    Apply {
        lo: u64,
        hi: u64,
        entries: Vec<Entry>,
        tag: Tag,
    },
    /// Storage read on behalf of a lagging follower.
    SyncGet {
        to: u64,
        index: u64,
    },
    /// Conflict resolution truncated the in-memory log; the durable
    /// column must follow.
    StoreTruncate {
        index: u64,
    },
    /// Replication message for another node.
    ReplicaOut(ReplicaMsg),
    /// Proposals the group refused (quota, read-only); the senders get an
    /// error ack instead of silence.
    SendRejected {
        messages: Vec<ReactorChannelMessage>,
    },
}

/// Authority over one channel's ordered message log. Embeds the
/// replication group; `message_seq` is the replicated log index.
pub struct ChannelHandler {
    channel: Channel,
    node_id: u64,
    opts: Arc<Config>,
    status: ChannelStatus,
    replica: Option<Replica>,
    tag: Tag,
    /// Buffered until the group is initialised.
    pending_sends: Vec<ReactorChannelMessage>,
    pending_replica: Vec<ReplicaMsg>,
    actions: Vec<ChannelEvent>,
}

impl ChannelHandler {
    pub fn new(channel: Channel, node_id: u64, opts: Arc<Config>) -> Self {
        Self {
            channel,
            node_id,
            opts,
            status: ChannelStatus::Uninitialized,
            replica: None,
            tag: Tag::default(),
            pending_sends: Vec::new(),
            pending_replica: Vec::new(),
            actions: Vec::new(),
        }
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.replica.as_ref().map(Replica::is_leader).unwrap_or(false)
    }

    /// Messages on command channels skip persistence unless flagged
    /// otherwise; regular messages persist unless flagged off.
    pub fn should_persist(&self, msg: &ReactorChannelMessage) -> bool {
        if msg.send_packet.framer.no_persist {
            return false;
        }
        !is_cmd_channel(&self.channel.id)
    }

    fn propose_sends(&mut self) {
        let Some(replica) = self.replica.as_mut() else {
            return;
        };
        if self.pending_sends.is_empty() {
            return;
        }
        if !replica.is_leader() {
            // Stale routing got a proposal here; the sender will refresh
            // its leader map off the RPC status and retry.
            tracing::warn!(
                target: "wren::channel",
                channel = %self.channel,
                count = self.pending_sends.len(),
                "dropping sends proposed on non-leader"
            );
            self.pending_sends.clear();
            return;
        }
        let mut next_seq = replica.log.last_log_index + 1;
        let mut pending = std::mem::take(&mut self.pending_sends);
        let mut batch = Vec::with_capacity(pending.len());
        for msg in pending.iter_mut() {
            msg.message_seq = next_seq;
            next_seq += 1;
            batch.push(msg.marshal());
        }
        if let Err(e) = replica.propose(batch) {
            tracing::warn!(
                target: "wren::channel",
                channel = %self.channel,
                error = %e,
                "send proposal dropped"
            );
            self.actions
                .push(ChannelEvent::SendRejected { messages: pending });
        }
    }

    fn harvest_replica(&mut self) {
        let Some(replica) = self.replica.as_mut() else {
            return;
        };
        if !replica.has_ready() {
            return;
        }
        for msg in replica.ready() {
            match msg.msg_type {
                MsgType::StoreAppend => self.actions.push(ChannelEvent::StoreAppend {
                    last_index: msg.index,
                    entries: msg.entries,
                }),
                MsgType::ApplyLogs => self.actions.push(ChannelEvent::Apply {
                    lo: msg.index,
                    hi: msg.committed_index,
                    entries: msg.entries,
                    tag: self.tag.clone(),
                }),
                MsgType::SyncGet => self.actions.push(ChannelEvent::SyncGet {
                    to: msg.to,
                    index: msg.index,
                }),
                _ => self.actions.push(ChannelEvent::ReplicaOut(msg)),
            }
        }
    }
}

impl Handler for ChannelHandler {
    type Action = ChannelEvent;

    fn tick(&mut self) {
        if let Some(replica) = self.replica.as_mut() {
            replica.tick();
        }
    }

    fn has_ready(&self) -> bool {
        if !self.actions.is_empty() || self.status == ChannelStatus::Uninitialized {
            return true;
        }
        self.replica
            .as_ref()
            .map(Replica::has_ready)
            .unwrap_or(false)
    }

    fn ready(&mut self) -> Vec<ChannelEvent> {
        if self.status == ChannelStatus::Uninitialized {
            self.status = ChannelStatus::Initializing;
            self.actions.push(ChannelEvent::Init);
        }
        self.harvest_replica();
        std::mem::take(&mut self.actions)
    }

    fn step(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Send(msg) => {
                self.pending_sends.push(msg);
                if self.status == ChannelStatus::Ready {
                    self.propose_sends();
                }
            },
            ChannelEvent::Replica(msg) => match self.replica.as_mut() {
                Some(replica) => {
                    let truncates_at = (msg.msg_type == MsgType::LogConflictCheckResp
                        && !msg.reject
                        && msg.index != wrn_replica::NO_CONFLICT
                        && msg.index > 0)
                        .then_some(msg.index);
                    if let Err(e) = replica.step(msg) {
                        tracing::warn!(
                            target: "wren::channel",
                            channel = %self.channel,
                            error = %e,
                            "replica step failed"
                        );
                    } else if let Some(index) = truncates_at {
                        self.actions.push(ChannelEvent::StoreTruncate { index });
                    }
                },
                None => self.pending_replica.push(msg),
            },
            ChannelEvent::InitResult {
                last_index,
                last_term,
                applied_index,
                cfg,
                tag,
            } => {
                let learners = cfg.learners.clone();
                let mut replica = Replica::new(ReplicaOptions {
                    node_id: self.node_id,
                    group: format!("ch-{}", self.channel.key()),
                    replicas: cfg.replicas.clone(),
                    learners,
                    // Channel groups take their leader from slot config.
                    election_on: false,
                    election_interval_tick: self.opts.election_interval_tick,
                    heartbeat_interval_tick: self.opts.heartbeat_interval_tick,
                    leader_timeout_max_tick: self.opts.leader_timeout_max_tick,
                    max_uncommitted_log_size: self.opts.max_uncommitted_log_size,
                    sync_limit_size: self.opts.sync_limit_size,
                    learner_to_follower_min_log_gap: self.opts.learner_to_follower_min_log_gap,
                    ack_mode: AckMode::Majority,
                    last_index,
                    last_term,
                    applied_index,
                    term: cfg.term.max(1),
                    ..Default::default()
                });
                let init = ReplicaMsg {
                    msg_type: MsgType::InitResp,
                    config: Some(cfg),
                    ..Default::default()
                };
                if let Err(e) = replica.step(init) {
                    tracing::warn!(
                        target: "wren::channel",
                        channel = %self.channel,
                        error = %e,
                        "group init failed"
                    );
                }
                self.replica = Some(replica);
                self.tag = tag;
                self.status = ChannelStatus::Ready;

                for msg in std::mem::take(&mut self.pending_replica) {
                    if let Some(replica) = self.replica.as_mut() {
                        let _ = replica.step(msg);
                    }
                }
                self.propose_sends();
            },
            ChannelEvent::TagUpdated(tag) => {
                self.tag = tag;
            },
            // Harvested variants are never stepped back in.
            _ => {},
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wrn_core::ChannelType;
    use wrn_proto::SendPacket;

    fn send_msg(from: &str, payload: &'static [u8]) -> ReactorChannelMessage {
        ReactorChannelMessage {
            from_uid: from.into(),
            from_device_id: "d1".into(),
            from_conn_id: 1,
            from_node_id: 1,
            message_id: 1001,
            message_seq: 0,
            send_packet: SendPacket {
                channel_id: "g1".into(),
                channel_type: 2,
                payload: Bytes::from_static(payload),
                ..Default::default()
            },
        }
    }

    fn leader_init(members: Vec<u64>) -> ChannelEvent {
        ChannelEvent::InitResult {
            last_index: 0,
            last_term: 0,
            applied_index: 0,
            cfg: GroupConfig {
                version: 1,
                term: 1,
                leader: 1,
                replicas: members,
                ..Default::default()
            },
            tag: Tag::default(),
        }
    }

    fn handler() -> ChannelHandler {
        ChannelHandler::new(
            Channel::new("g1", ChannelType::Group),
            1,
            Arc::new(Config::default()),
        )
    }

    #[test]
    fn test_send_buffered_until_init_then_proposed() {
        let mut h = handler();
        h.step(ChannelEvent::Send(send_msg("u1", b"hello"))).unwrap();
        // First harvest asks for init.
        let events = h.ready();
        assert!(events.iter().any(|e| matches!(e, ChannelEvent::Init)));

        h.step(leader_init(vec![1])).unwrap();
        assert!(h.is_leader());
        let events = h.ready();
        // Single-node group: append and apply come out immediately.
        let apply = events
            .iter()
            .find_map(|e| match e {
                ChannelEvent::Apply { entries, hi, .. } => Some((entries, *hi)),
                _ => None,
            })
            .unwrap();
        assert_eq!(apply.1, 1);
        let decoded = ReactorChannelMessage::unmarshal(&apply.0[0].data).unwrap();
        assert_eq!(decoded.message_seq, 1);
        assert_eq!(decoded.from_uid, "u1");
        assert!(events
            .iter()
            .any(|e| matches!(e, ChannelEvent::StoreAppend { .. })));
    }

    #[test]
    fn test_seq_is_dense_across_batches() {
        let mut h = handler();
        let _ = h.ready();
        h.step(leader_init(vec![1])).unwrap();
        h.step(ChannelEvent::Send(send_msg("u1", b"a"))).unwrap();
        h.step(ChannelEvent::Send(send_msg("u2", b"b"))).unwrap();
        let events = h.ready();
        let seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Apply { entries, .. } => Some(
                    entries
                        .iter()
                        .map(|entry| {
                            ReactorChannelMessage::unmarshal(&entry.data)
                                .unwrap()
                                .message_seq
                        })
                        .collect::<Vec<u64>>(),
                ),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_non_leader_drops_sends() {
        let mut h = handler();
        let _ = h.ready();
        // Leader is node 2; we are a follower.
        h.step(ChannelEvent::InitResult {
            last_index: 0,
            last_term: 0,
            applied_index: 0,
            cfg: GroupConfig {
                version: 1,
                term: 1,
                leader: 2,
                replicas: vec![1, 2, 3],
                ..Default::default()
            },
            tag: Tag::default(),
        })
        .unwrap();
        assert!(!h.is_leader());
        h.step(ChannelEvent::Send(send_msg("u1", b"x"))).unwrap();
        let events = h.ready();
        assert!(!events
            .iter()
            .any(|e| matches!(e, ChannelEvent::Apply { .. })));
    }

    #[test]
    fn test_replica_traffic_buffered_until_init() {
        let mut h = handler();
        h.step(ChannelEvent::Replica(ReplicaMsg {
            msg_type: MsgType::SyncReq,
            from: 2,
            to: 1,
            term: 1,
            index: 1,
            ..Default::default()
        }))
        .unwrap();
        let _ = h.ready();
        h.step(leader_init(vec![1, 2, 3])).unwrap();
        // The buffered sync request is answered after init.
        let events = h.ready();
        assert!(events.iter().any(|e| matches!(
            e,
            ChannelEvent::ReplicaOut(m) if m.msg_type == MsgType::SyncResp
        )));
    }

    #[test]
    fn test_no_persist_flag_respected() {
        let h = handler();
        let mut msg = send_msg("u1", b"x");
        assert!(h.should_persist(&msg));
        msg.send_packet.framer.no_persist = true;
        assert!(!h.should_persist(&msg));

        let cmd = ChannelHandler::new(
            Channel::new("g1____cmd", ChannelType::Group),
            1,
            Arc::new(Config::default()),
        );
        let msg = send_msg("u1", b"x");
        assert!(!cmd.should_persist(&msg));
    }
}
