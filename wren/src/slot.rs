//! Slot replication groups: one elected group per slot. The winners feed
//! the slot leader map, which in turn decides user- and channel-leader
//! placement.

use crate::server::{encode_replica_envelope, Ctx};
use std::sync::Arc;
use wrn_cluster::ROUTE_REPLICA;
use wrn_core::Result;
use wrn_reactor::{ActionProcessor, Handler, Reactor, ReactorOptions};
use wrn_replica::{Entry, Message as ReplicaMsg, MsgType, Replica, ReplicaOptions};

pub enum SlotEvent {
    // ── inbound ────────────────────────────────────────────────────────
    /// Nudge used at bootstrap so the handler (and its group) exists.
    Start,
    Replica(ReplicaMsg),
    // ── harvested ──────────────────────────────────────────────────────
    StoreAppend {
        entries: Vec<Entry>,
        last_index: u64,
    },
    StoreTruncate {
        index: u64,
    },
    Apply {
        hi: u64,
        applied_size: u64,
    },
    ReplicaOut(ReplicaMsg),
    /// The group observed a (possibly new) leader.
    LeaderIs {
        leader: u64,
    },
}

pub struct SlotHandler {
    slot: u32,
    replica: Replica,
    reported_leader: u64,
    actions: Vec<SlotEvent>,
}

impl SlotHandler {
    pub fn new(slot: u32, replica: Replica) -> Self {
        Self {
            slot,
            replica,
            reported_leader: 0,
            actions: Vec::new(),
        }
    }

    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    fn harvest(&mut self) {
        if self.replica.has_ready() {
            for msg in self.replica.ready() {
                match msg.msg_type {
                    MsgType::StoreAppend => self.actions.push(SlotEvent::StoreAppend {
                        last_index: msg.index,
                        entries: msg.entries,
                    }),
                    MsgType::ApplyLogs => {
                        let applied_size = msg.entries.iter().map(Entry::size).sum();
                        self.actions.push(SlotEvent::Apply {
                            hi: msg.committed_index,
                            applied_size,
                        });
                    },
                    _ => self.actions.push(SlotEvent::ReplicaOut(msg)),
                }
            }
        }
        let leader = self.replica.leader();
        if leader != 0 && leader != self.reported_leader {
            self.reported_leader = leader;
            self.actions.push(SlotEvent::LeaderIs { leader });
        }
    }
}

impl Handler for SlotHandler {
    type Action = SlotEvent;

    fn tick(&mut self) {
        self.replica.tick();
    }

    fn has_ready(&self) -> bool {
        !self.actions.is_empty()
            || self.replica.has_ready()
            || (self.replica.leader() != 0 && self.replica.leader() != self.reported_leader)
    }

    fn ready(&mut self) -> Vec<SlotEvent> {
        self.harvest();
        std::mem::take(&mut self.actions)
    }

    fn step(&mut self, event: SlotEvent) -> Result<()> {
        match event {
            SlotEvent::Start => {},
            SlotEvent::Replica(msg) => {
                let truncates_at = (msg.msg_type == MsgType::LogConflictCheckResp
                    && !msg.reject
                    && msg.index != wrn_replica::NO_CONFLICT
                    && msg.index > 0)
                    .then_some(msg.index);
                if let Err(e) = self.replica.step(msg) {
                    tracing::warn!(
                        target: "wren::slot",
                        slot = self.slot,
                        error = %e,
                        "slot replica step failed"
                    );
                } else if let Some(index) = truncates_at {
                    self.actions.push(SlotEvent::StoreTruncate { index });
                }
            },
            _ => {},
        }
        Ok(())
    }
}

#[must_use]
pub fn slot_key(slot: u32) -> String {
    format!("slot-{slot}")
}

#[must_use]
pub fn parse_slot_key(key: &str) -> u32 {
    key.strip_prefix("slot-")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

pub fn start_reactor(ctx: Arc<Ctx>) -> Arc<Reactor<SlotHandler>> {
    let opts = ReactorOptions {
        name: "slot".into(),
        sub_count: (ctx.opts.slot_count as usize).min(8).max(1),
        tick_interval: ctx.opts.tick_interval(),
        inbox_capacity: 4096,
        deadline_tick: 0,
    };
    let factory_ctx = Arc::clone(&ctx);
    Reactor::new(
        opts,
        Arc::new(move |key: &str| {
            let slot = parse_slot_key(key);
            let group = slot_key(slot);
            let (last_index, last_term, applied_index) = factory_ctx
                .store
                .replica_meta(&group)
                .unwrap_or((0, 0, 0));
            let replica = Replica::new(ReplicaOptions {
                node_id: factory_ctx.opts.node_id,
                group,
                replicas: factory_ctx.slots.replicas_of(slot),
                election_on: true,
                election_interval_tick: factory_ctx.opts.election_interval_tick,
                heartbeat_interval_tick: factory_ctx.opts.heartbeat_interval_tick,
                leader_timeout_max_tick: factory_ctx.opts.leader_timeout_max_tick,
                max_uncommitted_log_size: factory_ctx.opts.max_uncommitted_log_size,
                sync_limit_size: factory_ctx.opts.sync_limit_size,
                learner_to_follower_min_log_gap: factory_ctx
                    .opts
                    .learner_to_follower_min_log_gap,
                last_index,
                last_term,
                applied_index,
                ..Default::default()
            });
            SlotHandler::new(slot, replica)
        }),
        Arc::new(SlotProcessor { ctx }),
    )
}

pub struct SlotProcessor {
    ctx: Arc<Ctx>,
}

impl ActionProcessor<SlotHandler> for SlotProcessor {
    fn process(&self, key: &str, events: Vec<SlotEvent>) {
        let slot = parse_slot_key(key);
        let group = slot_key(slot);
        for event in events {
            match event {
                SlotEvent::StoreAppend {
                    entries,
                    last_index,
                } => {
                    let reject = self.ctx.store.append_replica_logs(&group, &entries).is_err();
                    self.ctx.slot_step(
                        key,
                        SlotEvent::Replica(ReplicaMsg {
                            msg_type: MsgType::StoreAppendResp,
                            index: last_index,
                            reject,
                            ..Default::default()
                        }),
                    );
                },
                SlotEvent::StoreTruncate { index } => {
                    if let Err(e) = self.ctx.store.truncate_replica_logs_from(&group, index) {
                        tracing::warn!(
                            target: "wren::slot",
                            slot,
                            error = %e,
                            "log truncation failed"
                        );
                    }
                },
                SlotEvent::Apply { hi, applied_size } => {
                    // Slot logs carry no application payload in this
                    // server; applying is position bookkeeping only.
                    if let Err(e) = self.ctx.store.set_applied_index(&group, hi) {
                        tracing::warn!(
                            target: "wren::slot",
                            slot,
                            error = %e,
                            "applied index persistence failed"
                        );
                    }
                    self.ctx.slot_step(
                        key,
                        SlotEvent::Replica(ReplicaMsg {
                            msg_type: MsgType::ApplyLogsResp,
                            index: hi,
                            applied_size,
                            ..Default::default()
                        }),
                    );
                },
                SlotEvent::ReplicaOut(msg) => {
                    let to = msg.to;
                    if to == 0 || to == self.ctx.self_id() {
                        continue;
                    }
                    let body = encode_replica_envelope(1, key, &msg);
                    self.ctx.rpc_ff(to, ROUTE_REPLICA, body);
                },
                SlotEvent::LeaderIs { leader } => {
                    self.ctx.slots.set_slot_leader(slot, leader);
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
    fn test_slot_key_roundtrip() {
        assert_eq!(parse_slot_key(&slot_key(17)), 17);
        assert_eq!(parse_slot_key("garbage"), 0);
    }

    #[test]
    fn test_single_node_slot_elects_itself() {
        let replica = Replica::new(ReplicaOptions {
            node_id: 1,
            group: "slot-0".into(),
            replicas: vec![1],
            ..Default::default()
        });
        let mut h = SlotHandler::new(0, replica);
        assert!(h.has_ready());
        let events = h.ready();
        assert!(events
            .iter()
            .any(|e| matches!(e, SlotEvent::LeaderIs { leader: 1 })));
    }
}
