use crate::config::Config;
use crate::server::connection::ConnContext;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use wrn_cluster::{UserAction, UserActionKind, UserMessage};
use wrn_core::Result;
use wrn_reactor::{Handler, MsgQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Leader,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Uninitialized,
    Initializing,
    Ready,
}

/// Which of the four per-user queues an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserQueue {
    Auth,
    Ping,
    Recvack,
    Recv,
}

/// User pipeline events. Inbound variants mutate the handler through
/// `step`; the rest are harvested by `ready` for the processor.
pub enum UserEvent {
    // ── inbound ────────────────────────────────────────────────────────
    /// A connection finished its Connect packet (local socket or proxy
    /// context created for a forwarded connect). Carries the framed
    /// Connect packet for the auth queue.
    ConnOpen {
        conn: Arc<ConnContext>,
        connect: Bytes,
    },
    ConnClosed {
        conn_id: u64,
    },
    PingMsg(UserMessage),
    RecvackMsg(UserMessage),
    RecvMsg(UserMessage),
    /// Node-level ping from the user leader (proxy side).
    LeaderPing {
        from_node: u64,
    },
    /// Node-level pong from a proxy node (leader side).
    NodePong {
        from_node: u64,
    },
    RoleChanged {
        leader_id: u64,
    },
    /// Processor feedback: dispatch of a queue slice finished.
    Advance {
        queue: UserQueue,
        index: u64,
        ok: bool,
    },
    // ── harvested ──────────────────────────────────────────────────────
    Init,
    Auth {
        messages: Vec<UserMessage>,
        index: u64,
    },
    Ping {
        messages: Vec<UserMessage>,
        index: u64,
        conns: Vec<Arc<ConnContext>>,
    },
    Recvack {
        messages: Vec<UserMessage>,
        index: u64,
        conns: Vec<Arc<ConnContext>>,
    },
    Recv {
        messages: Vec<UserMessage>,
        index: u64,
        conns: Vec<Arc<ConnContext>>,
    },
    /// Proxy role: ship a queue slice to the user leader.
    Forward {
        leader_id: u64,
        queue: UserQueue,
        index: u64,
        action: UserAction,
    },
    /// Leader role: ping the nodes holding this user's remote sockets.
    NodePing {
        nodes: Vec<(u64, Vec<UserMessage>)>,
    },
    /// Proxy role: answer the leader's node ping.
    NodePongOut {
        to_node: u64,
    },
    /// Leader role: a proxy node stopped answering; its conns must go.
    ProxyTimeout {
        node_id: u64,
        conns: Vec<Arc<ConnContext>>,
    },
    CheckLeader,
    Close {
        conns: Vec<Arc<ConnContext>>,
    },
}

/// Per-user stateful unit: connection set, four cursor queues, and the
/// leader/proxy pipeline state machine.
pub struct UserHandler {
    uid: String,
    node_id: u64,
    opts: Arc<Config>,

    role: UserRole,
    status: UserStatus,
    leader_id: u64,

    conns: Vec<Arc<ConnContext>>,
    conn_node_ids: Vec<u64>,

    auth_queue: MsgQueue<UserMessage>,
    ping_queue: MsgQueue<UserMessage>,
    recvack_queue: MsgQueue<UserMessage>,
    recv_queue: MsgQueue<UserMessage>,

    authing: bool,
    pinging: bool,
    recvacking: bool,
    recving: bool,

    auth_tick: u64,
    recvack_tick: u64,
    recv_tick: u64,

    node_ping_tick: u64,
    node_pong_ticks: HashMap<u64, u64>,
    check_leader_tick: u64,

    actions: Vec<UserEvent>,
}

fn msg_size(msg: &UserMessage) -> u64 {
    (24 + msg.device_id.len() + msg.payload.len()) as u64
}

impl UserHandler {
    pub fn new(uid: &str, node_id: u64, opts: Arc<Config>) -> Self {
        let max = opts.user_msg_queue_max_size;
        Self {
            uid: uid.to_string(),
            node_id,
            opts,
            role: UserRole::Proxy,
            status: UserStatus::Uninitialized,
            leader_id: 0,
            conns: Vec::new(),
            conn_node_ids: Vec::new(),
            auth_queue: MsgQueue::new(max, msg_size),
            ping_queue: MsgQueue::new(max, msg_size),
            recvack_queue: MsgQueue::new(max, msg_size),
            recv_queue: MsgQueue::new(max, msg_size),
            authing: false,
            pinging: false,
            recvacking: false,
            recving: false,
            auth_tick: 0,
            recvack_tick: 0,
            recv_tick: 0,
            node_ping_tick: 0,
            node_pong_ticks: HashMap::new(),
            check_leader_tick: 0,
            actions: Vec::new(),
        }
    }

    #[inline]
    pub fn role(&self) -> UserRole {
        self.role
    }

    #[inline]
    pub fn leader_id(&self) -> u64 {
        self.leader_id
    }

    fn is_ready(&self) -> bool {
        self.status == UserStatus::Ready
    }

    fn interval(&self) -> u64 {
        self.opts.user_process_interval_tick.max(1)
    }

    fn has_auth(&self) -> bool {
        !self.authing && self.auth_tick >= self.interval() && self.auth_queue.has_pending()
    }

    fn has_ping(&self) -> bool {
        !self.pinging && self.ping_queue.has_pending()
    }

    fn has_recvack(&self) -> bool {
        !self.recvacking && self.recvack_tick >= self.interval() && self.recvack_queue.has_pending()
    }

    fn has_recv(&self) -> bool {
        !self.recving && self.recv_tick >= self.interval() && self.recv_queue.has_pending()
    }

    /// Clear pipeline progress on role change. Queue contents survive and
    /// are re-dispatched under the new role; only the recv queue carries
    /// data that is meaningful either way, but a reset cursor is harmless
    /// for the others too since dispatch is idempotent upstream.
    fn reset(&mut self) {
        self.auth_queue.reset_processing();
        self.ping_queue.reset_processing();
        self.recvack_queue.reset_processing();
        self.recv_queue.reset_processing();
        self.authing = false;
        self.pinging = false;
        self.recvacking = false;
        self.recving = false;
        self.auth_tick = 0;
        self.recvack_tick = 0;
        self.recv_tick = 0;
        self.node_ping_tick = 0;
        self.node_pong_ticks.clear();
    }

    fn become_leader(&mut self) {
        self.reset();
        self.role = UserRole::Leader;
        self.leader_id = self.node_id;
        tracing::info!(target: "wren::user", uid = %self.uid, "user handler became leader");
    }

    fn become_proxy(&mut self, leader_id: u64) {
        self.reset();
        self.role = UserRole::Proxy;
        self.leader_id = leader_id;
        tracing::info!(
            target: "wren::user",
            uid = %self.uid,
            leader_id,
            "user handler became proxy"
        );
    }

    fn add_conn(&mut self, conn: Arc<ConnContext>) {
        let exists = self.conns.iter().any(|c| c.conn_id == conn.conn_id);
        if !exists {
            self.conns.push(conn);
            self.rebuild_conn_node_ids();
        }
    }

    fn remove_conn(&mut self, conn_id: u64) {
        self.conns.retain(|c| c.conn_id != conn_id);
        self.rebuild_conn_node_ids();
    }

    fn rebuild_conn_node_ids(&mut self) {
        self.conn_node_ids.clear();
        for conn in &self.conns {
            if conn.real_node_id == self.node_id {
                continue;
            }
            if !self.conn_node_ids.contains(&conn.real_node_id) {
                self.conn_node_ids.push(conn.real_node_id);
            }
        }
    }

    /// Find the proxy context for a connection living on another node.
    pub fn conn_by_proxy(&self, node_id: u64, proxy_conn_id: u64) -> Option<&Arc<ConnContext>> {
        self.conns
            .iter()
            .find(|c| c.real_node_id == node_id && c.proxy_conn_id == proxy_conn_id)
    }

    fn tick_leader(&mut self) {
        self.node_ping_tick += 1;
        for node in &self.conn_node_ids {
            *self.node_pong_ticks.entry(*node).or_insert(0) += 1;
        }

        if self.node_ping_tick >= self.opts.user_node_ping_tick {
            self.node_ping_tick = 0;
            if self.conns.is_empty() {
                self.actions.push(UserEvent::Close { conns: Vec::new() });
            } else {
                let mut per_node: HashMap<u64, Vec<UserMessage>> = HashMap::new();
                for conn in &self.conns {
                    if conn.real_node_id == self.node_id {
                        continue;
                    }
                    per_node
                        .entry(conn.real_node_id)
                        .or_default()
                        .push(UserMessage {
                            from_node_id: conn.real_node_id,
                            conn_id: conn.proxy_conn_id,
                            device_id: conn.device_id.clone(),
                            seq: 0,
                            payload: Bytes::new(),
                        });
                }
                if !per_node.is_empty() {
                    self.actions.push(UserEvent::NodePing {
                        nodes: per_node.into_iter().collect(),
                    });
                }
            }
        }

        let timeout = self.opts.user_node_pong_timeout_tick;
        let timed_out: Vec<u64> = self
            .conn_node_ids
            .iter()
            .copied()
            .filter(|node| self.node_pong_ticks.get(node).copied().unwrap_or(0) >= timeout)
            .collect();
        for node in timed_out {
            tracing::warn!(
                target: "wren::user",
                uid = %self.uid,
                node,
                "proxy node pong timeout"
            );
            let conns: Vec<Arc<ConnContext>> = self
                .conns
                .iter()
                .filter(|c| c.real_node_id == node)
                .cloned()
                .collect();
            self.conns.retain(|c| c.real_node_id != node);
            self.rebuild_conn_node_ids();
            self.node_pong_ticks.remove(&node);
            self.actions
                .push(UserEvent::ProxyTimeout { node_id: node, conns });
        }
    }

    fn tick_proxy(&mut self) {
        self.node_ping_tick += 1;
        let limit = self.opts.user_node_ping_tick + self.opts.user_node_ping_tick / 2;
        if self.node_ping_tick >= limit {
            // Lost contact with the leader; drop our sockets.
            self.node_ping_tick = 0;
            let conns = std::mem::take(&mut self.conns);
            self.conn_node_ids.clear();
            self.actions.push(UserEvent::Close { conns });
        }
    }
}

impl Handler for UserHandler {
    type Action = UserEvent;

    fn tick(&mut self) {
        self.auth_tick += 1;
        self.recvack_tick += 1;
        self.recv_tick += 1;

        self.check_leader_tick += 1;
        if self.check_leader_tick >= self.opts.check_user_leader_interval_tick.max(1) {
            self.check_leader_tick = 0;
            if self.is_ready() {
                self.actions.push(UserEvent::CheckLeader);
            }
        }

        if self.is_ready() {
            match self.role {
                UserRole::Leader => self.tick_leader(),
                UserRole::Proxy => self.tick_proxy(),
            }
        }
    }

    fn has_ready(&self) -> bool {
        if !self.actions.is_empty() {
            return true;
        }
        match self.status {
            UserStatus::Uninitialized => true,
            UserStatus::Initializing => false,
            UserStatus::Ready => {
                self.has_auth() || self.has_ping() || self.has_recvack() || self.has_recv()
            },
        }
    }

    fn ready(&mut self) -> Vec<UserEvent> {
        match self.status {
            UserStatus::Uninitialized => {
                self.status = UserStatus::Initializing;
                self.actions.push(UserEvent::Init);
            },
            UserStatus::Initializing => {},
            UserStatus::Ready => {
                if self.has_auth() {
                    self.authing = true;
                    self.auth_tick = 0;
                    let messages = self.auth_queue.pending();
                    let index = self.auth_queue.last_index;
                    match self.role {
                        UserRole::Leader => {
                            self.actions.push(UserEvent::Auth { messages, index });
                        },
                        UserRole::Proxy => {
                            let mut action = UserAction::new(UserActionKind::Connect, &self.uid);
                            action.messages = messages;
                            self.actions.push(UserEvent::Forward {
                                leader_id: self.leader_id,
                                queue: UserQueue::Auth,
                                index,
                                action,
                            });
                        },
                    }
                }
                if self.has_recvack() {
                    self.recvacking = true;
                    self.recvack_tick = 0;
                    let messages = self.recvack_queue.pending();
                    let index = self.recvack_queue.last_index;
                    match self.role {
                        UserRole::Leader => {
                            self.actions.push(UserEvent::Recvack {
                                messages,
                                index,
                                conns: self.conns.clone(),
                            });
                        },
                        UserRole::Proxy => {
                            let mut action = UserAction::new(UserActionKind::Recvack, &self.uid);
                            action.messages = messages;
                            self.actions.push(UserEvent::Forward {
                                leader_id: self.leader_id,
                                queue: UserQueue::Recvack,
                                index,
                                action,
                            });
                        },
                    }
                }
                if self.has_ping() {
                    self.pinging = true;
                    self.actions.push(UserEvent::Ping {
                        messages: self.ping_queue.pending(),
                        index: self.ping_queue.last_index,
                        conns: self.conns.clone(),
                    });
                }
                if self.has_recv() {
                    self.recving = true;
                    self.recv_tick = 0;
                    self.actions.push(UserEvent::Recv {
                        messages: self.recv_queue.pending(),
                        index: self.recv_queue.last_index,
                        conns: self.conns.clone(),
                    });
                }
            },
        }
        std::mem::take(&mut self.actions)
    }

    fn step(&mut self, event: UserEvent) -> Result<()> {
        match event {
            UserEvent::ConnOpen { conn, connect } => {
                let msg = UserMessage {
                    from_node_id: conn.real_node_id,
                    conn_id: conn.proxy_conn_id,
                    device_id: conn.device_id.clone(),
                    seq: 0,
                    payload: connect,
                };
                self.add_conn(conn);
                if !self.auth_queue.append(msg) {
                    tracing::warn!(
                        target: "wren::user",
                        uid = %self.uid,
                        "auth queue over budget, dropping connect"
                    );
                }
            },
            UserEvent::ConnClosed { conn_id } => {
                self.remove_conn(conn_id);
            },
            UserEvent::PingMsg(msg) => {
                if !self.ping_queue.append(msg) {
                    tracing::warn!(target: "wren::user", uid = %self.uid, "ping queue over budget");
                }
            },
            UserEvent::RecvackMsg(msg) => {
                if !self.recvack_queue.append(msg) {
                    tracing::warn!(
                        target: "wren::user",
                        uid = %self.uid,
                        "recvack queue over budget"
                    );
                }
            },
            UserEvent::RecvMsg(msg) => {
                if !self.recv_queue.append(msg) {
                    tracing::warn!(target: "wren::user", uid = %self.uid, "recv queue over budget");
                }
            },
            UserEvent::LeaderPing { from_node } => {
                // Contact from the leader keeps this proxy's sockets alive.
                self.node_ping_tick = 0;
                self.actions.push(UserEvent::NodePongOut { to_node: from_node });
            },
            UserEvent::NodePong { from_node } => {
                self.node_pong_ticks.insert(from_node, 0);
            },
            UserEvent::RoleChanged { leader_id } => {
                let was = (self.role, self.leader_id, self.status);
                if leader_id == self.node_id {
                    if was.0 != UserRole::Leader || was.2 != UserStatus::Ready {
                        self.become_leader();
                    }
                } else if was.0 != UserRole::Proxy || was.1 != leader_id || was.2 != UserStatus::Ready
                {
                    self.become_proxy(leader_id);
                }
                self.status = UserStatus::Ready;
            },
            UserEvent::Advance { queue, index, ok } => {
                let (queue, flag) = match queue {
                    UserQueue::Auth => (&mut self.auth_queue, &mut self.authing),
                    UserQueue::Ping => (&mut self.ping_queue, &mut self.pinging),
                    UserQueue::Recvack => (&mut self.recvack_queue, &mut self.recvacking),
                    UserQueue::Recv => (&mut self.recv_queue, &mut self.recving),
                };
                *flag = false;
                if ok {
                    queue.advance_to(index);
                }
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
    use crate::server::connection::ConnContext;

    fn opts() -> Arc<Config> {
        Arc::new(Config::default())
    }

    fn handler(node_id: u64) -> UserHandler {
        UserHandler::new("u1", node_id, opts())
    }

    fn local_conn(conn_id: u64, node_id: u64) -> Arc<ConnContext> {
        Arc::new(ConnContext::proxy("u1", "d1", conn_id, node_id, conn_id))
    }

    fn drain_init(h: &mut UserHandler, leader_id: u64) {
        // First ready emits Init; role comes back from the processor.
        let events = h.ready();
        assert!(matches!(events.as_slice(), [UserEvent::Init]));
        h.step(UserEvent::RoleChanged { leader_id }).unwrap();
    }

    #[test]
    fn test_init_then_leader_auth_batch() {
        let mut h = handler(1);
        assert!(h.has_ready());
        drain_init(&mut h, 1);
        assert_eq!(h.role(), UserRole::Leader);

        h.step(UserEvent::ConnOpen {
            conn: local_conn(7, 1),
            connect: Bytes::from_static(b"connect-frame"),
        })
        .unwrap();
        h.tick();
        assert!(h.has_ready());
        let events = h.ready();
        let auth = events
            .iter()
            .find_map(|e| match e {
                UserEvent::Auth { messages, index } => Some((messages, *index)),
                _ => None,
            })
            .unwrap();
        assert_eq!(auth.0.len(), 1);
        assert_eq!(auth.0[0].conn_id, 7);

        // In-flight flag holds further batches until the processor acks.
        h.tick();
        let events = h.ready();
        assert!(!events
            .iter()
            .any(|e| matches!(e, UserEvent::Auth { .. })));
        h.step(UserEvent::Advance {
            queue: UserQueue::Auth,
            index: auth.1,
            ok: true,
        })
        .unwrap();
        h.tick();
        assert!(!h.has_auth());
    }

    #[test]
    fn test_proxy_forwards_auth_and_recvack() {
        let mut h = handler(2);
        drain_init(&mut h, 3);
        assert_eq!(h.role(), UserRole::Proxy);
        assert_eq!(h.leader_id(), 3);

        h.step(UserEvent::ConnOpen {
            conn: local_conn(1, 2),
            connect: Bytes::from_static(b"connect"),
        })
        .unwrap();
        h.step(UserEvent::RecvackMsg(UserMessage {
            from_node_id: 2,
            conn_id: 1,
            device_id: "d1".into(),
            seq: 0,
            payload: Bytes::from_static(b"recvack"),
        }))
        .unwrap();
        h.tick();
        let events = h.ready();
        let forwards: Vec<&UserAction> = events
            .iter()
            .filter_map(|e| match e {
                UserEvent::Forward {
                    leader_id, action, ..
                } => {
                    assert_eq!(*leader_id, 3);
                    Some(action)
                },
                _ => None,
            })
            .collect();
        assert_eq!(forwards.len(), 2);
        assert!(forwards.iter().any(|a| a.kind == UserActionKind::Connect));
        assert!(forwards.iter().any(|a| a.kind == UserActionKind::Recvack));
    }

    #[test]
    fn test_role_switch_resets_progress_keeps_recv() {
        let mut h = handler(1);
        drain_init(&mut h, 1);
        h.step(UserEvent::RecvMsg(UserMessage {
            payload: Bytes::from_static(b"recv"),
            ..Default::default()
        }))
        .unwrap();
        h.tick();
        let _ = h.ready();
        // Now the leader moved away: handler becomes proxy; the recv
        // queue still redelivers its pending item.
        h.step(UserEvent::RoleChanged { leader_id: 9 }).unwrap();
        assert_eq!(h.role(), UserRole::Proxy);
        h.tick();
        let events = h.ready();
        assert!(events
            .iter()
            .any(|e| matches!(e, UserEvent::Recv { .. })));
    }

    #[test]
    fn test_leader_node_ping_and_pong_timeout() {
        let mut h = handler(1);
        drain_init(&mut h, 1);
        // A proxy connection living on node 2.
        h.step(UserEvent::ConnOpen {
            conn: Arc::new(ConnContext::proxy("u1", "d2", 100, 2, 55)),
            connect: Bytes::from_static(b"c"),
        })
        .unwrap();
        // Swallow the auth work so only tick output remains.
        h.tick();
        let _ = h.ready();

        let ping_tick = h.opts.user_node_ping_tick;
        let mut saw_node_ping = false;
        for _ in 0..ping_tick {
            h.tick();
        }
        for e in h.ready() {
            if let UserEvent::NodePing { nodes } = e {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].0, 2);
                assert_eq!(nodes[0].1[0].conn_id, 55);
                saw_node_ping = true;
            }
        }
        assert!(saw_node_ping);

        // No pong ever arrives: the node times out and its conns close.
        let timeout = h.opts.user_node_pong_timeout_tick;
        let mut saw_timeout = false;
        for _ in 0..=timeout {
            h.tick();
        }
        for e in h.ready() {
            if let UserEvent::ProxyTimeout { node_id, conns } = e {
                assert_eq!(node_id, 2);
                assert_eq!(conns.len(), 1);
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
    }

    #[test]
    fn test_proxy_closes_on_leader_silence() {
        let mut h = handler(2);
        drain_init(&mut h, 3);
        h.step(UserEvent::ConnOpen {
            conn: local_conn(1, 2),
            connect: Bytes::from_static(b"c"),
        })
        .unwrap();
        h.tick();
        let _ = h.ready();

        let limit = h.opts.user_node_ping_tick + h.opts.user_node_ping_tick / 2;
        for _ in 0..limit {
            h.tick();
        }
        let events = h.ready();
        assert!(events.iter().any(|e| matches!(e, UserEvent::Close { .. })));

        // A leader ping in time would have reset the counter.
        let mut h2 = handler(2);
        drain_init(&mut h2, 3);
        h2.step(UserEvent::ConnOpen {
            conn: local_conn(1, 2),
            connect: Bytes::from_static(b"c"),
        })
        .unwrap();
        for _ in 0..limit / 2 {
            h2.tick();
        }
        h2.step(UserEvent::LeaderPing { from_node: 3 }).unwrap();
        for _ in 0..limit / 2 {
            h2.tick();
        }
        let events = h2.ready();
        assert!(!events.iter().any(|e| matches!(e, UserEvent::Close { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, UserEvent::NodePongOut { to_node: 3 })));
    }

    #[test]
    fn test_check_leader_emitted_periodically() {
        let mut h = handler(1);
        drain_init(&mut h, 1);
        for _ in 0..h.opts.check_user_leader_interval_tick {
            h.tick();
        }
        let events = h.ready();
        assert!(events
            .iter()
            .any(|e| matches!(e, UserEvent::CheckLeader)));
    }
}
