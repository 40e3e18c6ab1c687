//! Client connection handling: accept loop, per-connection read buffer
//! with partial-frame handling, and a writer task per socket so packet
//! writes are serialised.

use crate::server::Ctx;
use crate::user::UserEvent;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use wrn_cluster::{ReactorChannelMessage, ReactorChannelMessageSet, Status, ROUTE_CHANNEL_FORWARD};
use wrn_core::{fake_channel_id, Channel, ChannelType, Result};
use wrn_proto::{encode_packet, parse_packet, Packet, SendPacket};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One live client connection (or, on a user-leader node, a lightweight
/// stand-in for a socket terminated elsewhere).
pub struct ConnContext {
    pub conn_id: u64,
    pub uid: String,
    pub device_id: String,
    pub device_flag: u8,
    /// Node that terminates the socket.
    pub real_node_id: u64,
    /// Connection id local to that node (== `conn_id` for local conns).
    pub proxy_conn_id: u64,
    device_level: AtomicU8,
    proto_version: AtomicU8,
    authed: AtomicBool,
    key_material: Mutex<(String, String)>,
    writer: Option<mpsc::Sender<Bytes>>,
}

impl ConnContext {
    /// A connection whose socket this node owns.
    pub fn local(
        uid: &str,
        device_id: &str,
        device_flag: u8,
        conn_id: u64,
        node_id: u64,
        writer: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            conn_id,
            uid: uid.to_string(),
            device_id: device_id.to_string(),
            device_flag,
            real_node_id: node_id,
            proxy_conn_id: conn_id,
            device_level: AtomicU8::new(0),
            proto_version: AtomicU8::new(0),
            authed: AtomicBool::new(false),
            key_material: Mutex::new((String::new(), String::new())),
            writer: Some(writer),
        }
    }

    /// A stand-in for a socket on `real_node_id`, held by the user leader
    /// for routing.
    pub fn proxy(
        uid: &str,
        device_id: &str,
        conn_id: u64,
        real_node_id: u64,
        proxy_conn_id: u64,
    ) -> Self {
        Self {
            conn_id,
            uid: uid.to_string(),
            device_id: device_id.to_string(),
            device_flag: 0,
            real_node_id,
            proxy_conn_id,
            device_level: AtomicU8::new(0),
            proto_version: AtomicU8::new(0),
            authed: AtomicBool::new(true),
            key_material: Mutex::new((String::new(), String::new())),
            writer: None,
        }
    }

    /// Queue framed bytes onto the socket writer. False when the writer
    /// is gone or this context has no socket.
    pub fn write(&self, data: Bytes) -> bool {
        match &self.writer {
            Some(writer) => writer.try_send(data).is_ok(),
            None => false,
        }
    }

    /// Shut the socket down. An empty buffer is the writer task's close
    /// sentinel; the read loop drops the connection on its next wakeup.
    pub fn close(&self) {
        self.authed.store(false, Ordering::Release);
        if let Some(writer) = &self.writer {
            let _ = writer.try_send(Bytes::new());
        }
    }

    #[inline]
    pub fn is_authed(&self) -> bool {
        self.authed.load(Ordering::Acquire)
    }

    pub fn mark_authed(&self, device_level: u8, proto_version: u8, aes_key: &str, aes_iv: &str) {
        self.device_level.store(device_level, Ordering::Release);
        self.proto_version.store(proto_version, Ordering::Release);
        if let Ok(mut keys) = self.key_material.lock() {
            *keys = (aes_key.to_string(), aes_iv.to_string());
        }
        self.authed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn device_level(&self) -> u8 {
        self.device_level.load(Ordering::Acquire)
    }
}

/// All connection contexts known to this node, by local conn id.
#[derive(Default)]
pub struct ConnRegistry {
    next_id: AtomicU64,
    conns: RwLock<HashMap<u64, Arc<ConnContext>>>,
}

impl ConnRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            conns: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, conn: Arc<ConnContext>) {
        if let Ok(mut conns) = self.conns.write() {
            conns.insert(conn.conn_id, conn);
        }
    }

    #[must_use]
    pub fn get(&self, conn_id: u64) -> Option<Arc<ConnContext>> {
        self.conns
            .read()
            .ok()
            .and_then(|conns| conns.get(&conn_id).cloned())
    }

    pub fn remove(&self, conn_id: u64) -> Option<Arc<ConnContext>> {
        self.conns
            .write()
            .ok()
            .and_then(|mut conns| conns.remove(&conn_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.read().map(|conns| conns.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bind the client listener and accept forever.
pub async fn start_listener(ctx: Arc<Ctx>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(ctx.opts.listen_addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(target: "wren::server", addr = %local, "client listener up");
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_conn(ctx, stream).await {
                            tracing::debug!(
                                target: "wren::server",
                                peer = %peer,
                                error = %e,
                                "client connection closed"
                            );
                        }
                    });
                },
                Err(e) => {
                    tracing::warn!(target: "wren::server", error = %e, "client accept failed");
                },
            }
        }
    });
    Ok(local)
}

async fn handle_conn(ctx: Arc<Ctx>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(256);
    tokio::spawn(async move {
        while let Some(data) = writer_rx.recv().await {
            if data.is_empty() {
                break;
            }
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut conn: Option<Arc<ConnContext>> = None;
    let idle = ctx.opts.conn_idle_time();
    let started = Instant::now();

    loop {
        // Unauthenticated sockets do not get to linger.
        if conn.as_ref().map(|c| !c.is_authed()).unwrap_or(true) && started.elapsed() > idle {
            tracing::debug!(target: "wren::server", "dropping idle unauthenticated socket");
            break;
        }

        let read = tokio::time::timeout(idle, read_half.read_buf(&mut buf)).await;
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                cleanup(&ctx, &conn);
                return Err(e.into());
            },
            Err(_) => continue,
        }

        loop {
            match parse_packet(&buf) {
                Ok(Some((packet, used))) => {
                    let _ = buf.split_to(used);
                    if !handle_packet(&ctx, &writer_tx, &mut conn, packet) {
                        cleanup(&ctx, &conn);
                        return Ok(());
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    cleanup(&ctx, &conn);
                    return Err(e);
                },
            }
        }
    }

    cleanup(&ctx, &conn);
    Ok(())
}

fn cleanup(ctx: &Arc<Ctx>, conn: &Option<Arc<ConnContext>>) {
    if let Some(conn) = conn {
        ctx.conns.remove(conn.conn_id);
        ctx.retry.drop_conn(&conn.uid, conn.conn_id);
        ctx.user_step(
            &conn.uid,
            UserEvent::ConnClosed {
                conn_id: conn.conn_id,
            },
        );
    }
}

/// Dispatch one parsed packet. Returns false to close the connection.
fn handle_packet(
    ctx: &Arc<Ctx>,
    writer: &mpsc::Sender<Bytes>,
    conn: &mut Option<Arc<ConnContext>>,
    packet: Packet,
) -> bool {
    match packet {
        Packet::Connect(connect) => {
            if conn.is_some() {
                tracing::warn!(target: "wren::server", "duplicate connect packet");
                return false;
            }
            let conn_id = ctx.conns.next_conn_id();
            let context = Arc::new(ConnContext::local(
                &connect.uid,
                &connect.device_id,
                connect.device_flag,
                conn_id,
                ctx.self_id(),
                writer.clone(),
            ));
            ctx.conns.insert(Arc::clone(&context));
            let frame = encode_packet(&Packet::Connect(connect.clone()));
            ctx.user_step(
                &connect.uid,
                UserEvent::ConnOpen {
                    conn: Arc::clone(&context),
                    connect: frame,
                },
            );
            *conn = Some(context);
            true
        },
        Packet::Ping => {
            match conn {
                Some(conn) => {
                    ctx.user_step(
                        &conn.uid,
                        UserEvent::PingMsg(wrn_cluster::UserMessage {
                            from_node_id: ctx.self_id(),
                            conn_id: conn.conn_id,
                            device_id: conn.device_id.clone(),
                            seq: 0,
                            payload: Bytes::new(),
                        }),
                    );
                },
                None => {
                    // Pre-connect ping: answer directly, nothing to track.
                    let _ = writer.try_send(encode_packet(&Packet::Pong));
                },
            }
            true
        },
        Packet::Send(send) => {
            let Some(conn) = conn.as_ref() else {
                tracing::warn!(target: "wren::server", "send before connect");
                return false;
            };
            if !conn.is_authed() {
                tracing::warn!(
                    target: "wren::server",
                    uid = %conn.uid,
                    "send on unauthenticated connection"
                );
                return true;
            }
            handle_send(ctx, conn, send);
            true
        },
        Packet::Recvack(ack) => {
            if let Some(conn) = conn.as_ref() {
                ctx.user_step(
                    &conn.uid,
                    UserEvent::RecvackMsg(wrn_cluster::UserMessage {
                        from_node_id: ctx.self_id(),
                        conn_id: conn.conn_id,
                        device_id: conn.device_id.clone(),
                        seq: 0,
                        payload: encode_packet(&Packet::Recvack(ack)),
                    }),
                );
            }
            true
        },
        Packet::Sub(sub) => {
            if let Some(conn) = conn.as_ref() {
                handle_sub(ctx, conn, writer, sub);
            }
            true
        },
        Packet::Disconnect(_) => false,
        other => {
            tracing::debug!(
                target: "wren::server",
                packet = ?other.packet_type(),
                "ignoring unexpected client packet"
            );
            true
        },
    }
}

/// Normalise the target channel and route the proposal to its leader.
pub fn handle_send(ctx: &Arc<Ctx>, conn: &Arc<ConnContext>, send: SendPacket) {
    let channel = normalize_channel(&conn.uid, &send);
    let message = ReactorChannelMessage {
        from_uid: conn.uid.clone(),
        from_device_id: conn.device_id.clone(),
        from_conn_id: conn.conn_id,
        from_node_id: ctx.self_id(),
        message_id: ctx.next_message_id(),
        message_seq: 0,
        send_packet: send,
    };
    let key = channel.key();
    let leader = ctx.slots.channel_leader(&channel);
    if leader == ctx.self_id() {
        ctx.channel_step(&key, crate::channel::ChannelEvent::Send(message));
        return;
    }

    // Not ours: ship the proposal to the channel leader, refreshing the
    // leader map once when the remote disagrees.
    let body = ReactorChannelMessageSet(vec![message]).marshal();
    let ctx = Arc::clone(ctx);
    ctx.clone().rpc(leader, ROUTE_CHANNEL_FORWARD, body.clone(), move |result| {
        match result {
            Ok((Status::Ok, _)) => {},
            Ok((Status::NotChannelLeader, _)) => {
                let retry_leader = ctx.slots.channel_leader(&channel);
                if retry_leader != leader && retry_leader != 0 {
                    tracing::info!(
                        target: "wren::server",
                        channel = %channel,
                        leader = retry_leader,
                        "channel leader moved, re-forwarding"
                    );
                    ctx.rpc_ff(retry_leader, ROUTE_CHANNEL_FORWARD, body);
                } else {
                    tracing::warn!(
                        target: "wren::server",
                        channel = %channel,
                        "no usable channel leader"
                    );
                }
            },
            Ok((status, _)) => {
                tracing::warn!(
                    target: "wren::server",
                    channel = %channel,
                    ?status,
                    "channel forward rejected"
                );
            },
            Err(e) => {
                tracing::warn!(
                    target: "wren::server",
                    channel = %channel,
                    error = %e,
                    "channel forward failed"
                );
            },
        }
    });
}

fn handle_sub(
    ctx: &Arc<Ctx>,
    conn: &Arc<ConnContext>,
    writer: &mpsc::Sender<Bytes>,
    sub: wrn_proto::SubPacket,
) {
    let channel = Channel::new(&sub.channel_id, ChannelType::from_u8(sub.channel_type));
    let key = channel.key();
    // Subscriber state lives with the channel leader's store shard;
    // mutations elsewhere would not be visible to fanout.
    let reason = if ctx.slots.channel_leader(&channel) == ctx.self_id() {
        let result = if sub.action == 0 {
            ctx.store.add_subscribers(&key, &[conn.uid.clone()])
        } else {
            ctx.store.remove_subscriber(&key, &conn.uid)
        };
        match result {
            Ok(()) => {
                // The cached tag must see the membership change.
                let tag = crate::channel::build_tag(ctx, &channel);
                ctx.channel_step(&key, crate::channel::ChannelEvent::TagUpdated(tag));
                wrn_core::ReasonCode::Success
            },
            Err(_) => wrn_core::ReasonCode::SystemError,
        }
    } else {
        tracing::debug!(
            target: "wren::server",
            channel = %channel,
            "subscribe reached a non-leader node"
        );
        wrn_core::ReasonCode::SystemError
    };
    let _ = writer.try_send(encode_packet(&Packet::Suback(wrn_proto::SubackPacket {
        channel_id: sub.channel_id,
        channel_type: sub.channel_type,
        reason_code: reason.as_u8(),
    })));
}

/// Person channels get their canonical unordered-pair id; everything else
/// passes through.
#[must_use]
pub fn normalize_channel(from_uid: &str, send: &SendPacket) -> Channel {
    let kind = ChannelType::from_u8(send.channel_type);
    match kind {
        ChannelType::Person => Channel::new(fake_channel_id(from_uid, &send.channel_id), kind),
        ChannelType::Group => Channel::new(&send.channel_id, kind),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_person_channel_is_symmetric() {
        let send = SendPacket {
            channel_id: "u2".into(),
            channel_type: 1,
            ..Default::default()
        };
        let a = normalize_channel("u1", &send);
        let reverse = SendPacket {
            channel_id: "u1".into(),
            channel_type: 1,
            ..Default::default()
        };
        let b = normalize_channel("u2", &reverse);
        assert_eq!(a, b);
        assert_eq!(a.id, "u1@u2");
    }

    #[test]
    fn test_group_channel_untouched() {
        let send = SendPacket {
            channel_id: "g1".into(),
            channel_type: 2,
            ..Default::default()
        };
        assert_eq!(normalize_channel("u1", &send).id, "g1");
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = ConnRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = registry.next_conn_id();
        let conn = Arc::new(ConnContext::local("u1", "d1", 0, id, 1, tx));
        registry.insert(Arc::clone(&conn));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());
        assert!(registry.remove(id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_conn_auth_state() {
        let (tx, _rx) = mpsc::channel(4);
        let conn = ConnContext::local("u1", "d1", 0, 1, 1, tx);
        assert!(!conn.is_authed());
        conn.mark_authed(1, 4, "key", "iv");
        assert!(conn.is_authed());
        assert_eq!(conn.device_level(), 1);
    }
}
