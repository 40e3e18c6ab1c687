//! User reactor: role determination, pipeline dispatch, and forwarding.

pub mod handler;

pub use handler::{UserEvent, UserHandler, UserQueue, UserRole};

use crate::server::connection::ConnContext;
use crate::server::{unix_ts, Ctx};
use bytes::Bytes;
use std::sync::Arc;
use wrn_cluster::{
    ForwardWriteReq, Status, UserAction, UserActionKind, UserActionSet, UserMessage,
    ROUTE_CONN_WRITE, ROUTE_USER_ACTION,
};
use wrn_core::Conversation;
use wrn_proto::{encode_packet, parse_packet, Packet};
use wrn_reactor::{ActionProcessor, Reactor, ReactorOptions};

pub fn start_reactor(ctx: Arc<Ctx>) -> Arc<Reactor<UserHandler>> {
    let opts = ReactorOptions {
        name: "user".into(),
        sub_count: ctx.opts.user_sub_count,
        tick_interval: ctx.opts.tick_interval(),
        inbox_capacity: 8192,
        deadline_tick: 0,
    };
    let factory_ctx = Arc::clone(&ctx);
    let node_id = ctx.opts.node_id;
    Reactor::new(
        opts,
        Arc::new(move |uid: &str| {
            UserHandler::new(uid, node_id, Arc::clone(&factory_ctx.opts))
        }),
        Arc::new(UserProcessor { ctx }),
    )
}

/// Executes harvested user pipeline batches.
pub struct UserProcessor {
    ctx: Arc<Ctx>,
}

impl UserProcessor {
    fn determine_role(&self, uid: &str) {
        let leader = self.ctx.slots.slot_leader_of_key(uid);
        self.ctx
            .user_step(uid, UserEvent::RoleChanged { leader_id: leader });
    }

    /// Write framed bytes to a connection: locally when we own the socket,
    /// via `/wk/connWrite` when it lives on another node.
    fn write_conn(&self, uid: &str, conn: &Arc<ConnContext>, data: Bytes) {
        if conn.real_node_id == self.ctx.self_id() {
            if !conn.write(data) {
                tracing::debug!(
                    target: "wren::user",
                    uid,
                    conn_id = conn.conn_id,
                    "local conn write failed"
                );
            }
        } else {
            let req = ForwardWriteReq {
                uid: uid.to_string(),
                conn_id: conn.proxy_conn_id,
                data,
            };
            self.ctx
                .rpc_ff(conn.real_node_id, ROUTE_CONN_WRITE, req.marshal());
        }
    }

    fn process_ping(
        &self,
        uid: &str,
        messages: Vec<UserMessage>,
        index: u64,
        conns: Vec<Arc<ConnContext>>,
    ) {
        let pong = encode_packet(&Packet::Pong);
        for msg in &messages {
            let conn = conns.iter().find(|c| {
                if msg.from_node_id == self.ctx.self_id() {
                    c.conn_id == msg.conn_id
                } else {
                    c.real_node_id == msg.from_node_id && c.proxy_conn_id == msg.conn_id
                }
            });
            if let Some(conn) = conn {
                self.write_conn(uid, conn, pong.clone());
            }
        }
        self.ctx.user_step(
            uid,
            UserEvent::Advance {
                queue: UserQueue::Ping,
                index,
                ok: true,
            },
        );
    }

    fn process_recvack(
        &self,
        uid: &str,
        messages: Vec<UserMessage>,
        index: u64,
        conns: Vec<Arc<ConnContext>>,
    ) {
        for msg in &messages {
            let Ok(Some((Packet::Recvack(ack), _))) = parse_packet(&msg.payload) else {
                continue;
            };
            let conn = conns.iter().find(|c| {
                if msg.from_node_id == self.ctx.self_id() {
                    c.conn_id == msg.conn_id
                } else {
                    c.real_node_id == msg.from_node_id && c.proxy_conn_id == msg.conn_id
                }
            });
            let conn_id = conn.map(|c| c.conn_id).unwrap_or(msg.conn_id);
            if let Some(entry) = self.ctx.retry.ack(uid, conn_id, ack.message_id) {
                // Advance the read cursor for the acked channel.
                let current = self
                    .ctx
                    .store
                    .conversation(uid, &entry.channel_key)
                    .ok()
                    .flatten();
                let mut conv = current.unwrap_or_else(|| Conversation {
                    channel_id: entry.channel_id.clone(),
                    channel_type: entry.channel_type,
                    created_at: unix_ts(),
                    ..Default::default()
                });
                if ack.message_seq > conv.readed_to_msg_seq {
                    conv.readed_to_msg_seq = ack.message_seq;
                    conv.unread_count = 0;
                    conv.updated_at = unix_ts();
                    if let Err(e) = self.ctx.store.add_or_update_conversations(uid, &[conv]) {
                        tracing::warn!(
                            target: "wren::user",
                            uid,
                            error = %e,
                            "conversation update failed"
                        );
                    }
                }
            }
        }
        self.ctx.user_step(
            uid,
            UserEvent::Advance {
                queue: UserQueue::Recvack,
                index,
                ok: true,
            },
        );
    }

    fn process_recv(
        &self,
        uid: &str,
        messages: Vec<UserMessage>,
        index: u64,
        conns: Vec<Arc<ConnContext>>,
    ) {
        for msg in &messages {
            let targets: Vec<&Arc<ConnContext>> = if msg.conn_id == 0 {
                conns.iter().filter(|c| c.is_authed()).collect()
            } else {
                conns
                    .iter()
                    .filter(|c| c.conn_id == msg.conn_id && c.is_authed())
                    .collect()
            };
            // Message identity for the retry index rides in the packet.
            let ids = parse_packet(&msg.payload)
                .ok()
                .flatten()
                .and_then(|(packet, _)| match packet {
                    Packet::Recv(recv) => Some((
                        recv.message_id,
                        recv.message_seq,
                        recv.channel_id,
                        recv.channel_type,
                    )),
                    _ => None,
                });
            for conn in targets {
                if let Some((message_id, message_seq, ref channel_id, channel_type)) = ids {
                    self.ctx.retry.track(
                        uid,
                        conn.conn_id,
                        message_id,
                        message_seq,
                        channel_id,
                        channel_type,
                        msg.payload.clone(),
                    );
                }
                self.write_conn(uid, conn, msg.payload.clone());
            }
        }
        self.ctx.user_step(
            uid,
            UserEvent::Advance {
                queue: UserQueue::Recv,
                index,
                ok: true,
            },
        );
    }

    fn process_forward(
        &self,
        uid: &str,
        leader_id: u64,
        queue: UserQueue,
        index: u64,
        action: UserAction,
    ) {
        let set = UserActionSet(vec![action]);
        let body = set.marshal();
        let ctx = Arc::clone(&self.ctx);
        let uid = uid.to_string();
        self.ctx.rpc(leader_id, ROUTE_USER_ACTION, body, move |result| {
            match result {
                Ok((Status::Ok, _)) => {
                    ctx.user_step(&uid, UserEvent::Advance { queue, index, ok: true });
                },
                Ok((Status::NotUserLeader, _)) => {
                    tracing::info!(
                        target: "wren::user",
                        uid = %uid,
                        leader_id,
                        "stale user leader, rechecking"
                    );
                    ctx.user_step(&uid, UserEvent::Advance { queue, index, ok: false });
                    let leader = ctx.slots.slot_leader_of_key(&uid);
                    ctx.user_step(&uid, UserEvent::RoleChanged { leader_id: leader });
                },
                Ok((status, _)) => {
                    tracing::warn!(
                        target: "wren::user",
                        uid = %uid,
                        ?status,
                        "user action forward rejected"
                    );
                    ctx.user_step(&uid, UserEvent::Advance { queue, index, ok: false });
                },
                Err(e) => {
                    tracing::warn!(
                        target: "wren::user",
                        uid = %uid,
                        leader_id,
                        error = %e,
                        "user action forward failed"
                    );
                    ctx.user_step(&uid, UserEvent::Advance { queue, index, ok: false });
                },
            }
        });
    }

    fn process_node_ping(&self, uid: &str, nodes: Vec<(u64, Vec<UserMessage>)>) {
        for (node, messages) in nodes {
            let mut action = UserAction::new(UserActionKind::NodePing, uid);
            action.leader_id = self.ctx.self_id();
            action.messages = messages;
            let body = UserActionSet(vec![action]).marshal();
            self.ctx.rpc_ff(node, ROUTE_USER_ACTION, body);
        }
    }

    fn process_node_pong(&self, uid: &str, to_node: u64) {
        let mut action = UserAction::new(UserActionKind::NodePong, uid);
        action.leader_id = to_node;
        let body = UserActionSet(vec![action]).marshal();
        self.ctx.rpc_ff(to_node, ROUTE_USER_ACTION, body);
    }

    fn close_conns(&self, uid: &str, conns: &[Arc<ConnContext>]) {
        for conn in conns {
            self.ctx.retry.drop_conn(uid, conn.conn_id);
            if conn.real_node_id == self.ctx.self_id() {
                self.ctx.conns.remove(conn.conn_id);
                conn.close();
            }
        }
    }
}

impl ActionProcessor<UserHandler> for UserProcessor {
    fn process(&self, uid: &str, events: Vec<UserEvent>) {
        for event in events {
            match event {
                UserEvent::Init | UserEvent::CheckLeader => self.determine_role(uid),
                UserEvent::Auth { messages, index } => {
                    self.ctx.auth_submit(uid, messages, index);
                },
                UserEvent::Ping {
                    messages,
                    index,
                    conns,
                } => self.process_ping(uid, messages, index, conns),
                UserEvent::Recvack {
                    messages,
                    index,
                    conns,
                } => self.process_recvack(uid, messages, index, conns),
                UserEvent::Recv {
                    messages,
                    index,
                    conns,
                } => self.process_recv(uid, messages, index, conns),
                UserEvent::Forward {
                    leader_id,
                    queue,
                    index,
                    action,
                } => self.process_forward(uid, leader_id, queue, index, action),
                UserEvent::NodePing { nodes } => self.process_node_ping(uid, nodes),
                UserEvent::NodePongOut { to_node } => self.process_node_pong(uid, to_node),
                UserEvent::ProxyTimeout { node_id, conns } => {
                    tracing::warn!(
                        target: "wren::user",
                        uid,
                        node_id,
                        conn_count = conns.len(),
                        "dropping connections of silent proxy node"
                    );
                    self.close_conns(uid, &conns);
                },
                UserEvent::Close { conns } => {
                    self.close_conns(uid, &conns);
                    if let Some(reactor) = self.ctx.user_reactor.get() {
                        reactor.remove(uid);
                    }
                },
                _ => {},
            }
        }
    }
}
