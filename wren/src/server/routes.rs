//! Cluster RPC route handlers. Handlers only enqueue work into reactors
//! or write to connections; anything slow happens elsewhere.

use crate::channel::ChannelEvent;
use crate::server::auth::{apply_auth_result, ensure_proxy_conn};
use crate::server::{decode_replica_envelope, Ctx};
use crate::slot::{slot_key, SlotEvent};
use crate::user::UserEvent;
use bytes::Bytes;
use std::sync::Arc;
use wrn_cluster::{
    ForwardSendackPacketSet, ForwardWriteReq, ReactorChannelMessageSet, Router, Status,
    UserActionKind, UserActionSet, UserAuthResult, ROUTE_CHANNEL_FORWARD, ROUTE_CONN_WRITE,
    ROUTE_FORWARD_SENDACK, ROUTE_NODE_PING, ROUTE_REPLICA, ROUTE_USER_ACTION,
    ROUTE_USER_AUTH_RESULT,
};
use wrn_core::{fake_channel_id, Channel, ChannelType};
use wrn_proto::{encode_packet, Packet};

pub fn register(router: &Router, ctx: Arc<Ctx>) {
    let forward_ctx = Arc::clone(&ctx);
    router.route(
        ROUTE_CHANNEL_FORWARD,
        Arc::new(move |from, body| handle_channel_forward(&forward_ctx, from, body)),
    );

    let sendack_ctx = Arc::clone(&ctx);
    router.route(
        ROUTE_FORWARD_SENDACK,
        Arc::new(move |_, body| handle_forward_sendack(&sendack_ctx, body)),
    );

    let write_ctx = Arc::clone(&ctx);
    router.route(
        ROUTE_CONN_WRITE,
        Arc::new(move |_, body| handle_conn_write(&write_ctx, body)),
    );

    let action_ctx = Arc::clone(&ctx);
    router.route(
        ROUTE_USER_ACTION,
        Arc::new(move |from, body| handle_user_action(&action_ctx, from, body)),
    );

    let auth_ctx = Arc::clone(&ctx);
    router.route(
        ROUTE_USER_AUTH_RESULT,
        Arc::new(move |_, body| handle_user_auth_result(&auth_ctx, body)),
    );

    let replica_ctx = Arc::clone(&ctx);
    router.route(
        ROUTE_REPLICA,
        Arc::new(move |_, body| handle_replica(&replica_ctx, body)),
    );

    router.route(ROUTE_NODE_PING, Arc::new(|_, _| (Status::Ok, Bytes::new())));
}

fn handle_channel_forward(ctx: &Arc<Ctx>, from: u64, body: Bytes) -> (Status, Bytes) {
    let set = match ReactorChannelMessageSet::unmarshal(&body) {
        Ok(set) => set,
        Err(e) => {
            tracing::warn!(target: "wren::server", error = %e, "bad channel forward payload");
            return (Status::Error, Bytes::new());
        },
    };
    let Some(first) = set.0.first() else {
        return (Status::Ok, Bytes::new());
    };

    // Person channels are normalised at every entry point.
    let kind = ChannelType::from_u8(first.send_packet.channel_type);
    let channel = match kind {
        ChannelType::Person => Channel::new(
            fake_channel_id(&first.from_uid, &first.send_packet.channel_id),
            kind,
        ),
        ChannelType::Group => Channel::new(&first.send_packet.channel_id, kind),
    };
    if ctx.slots.channel_leader(&channel) != ctx.self_id() {
        tracing::debug!(
            target: "wren::server",
            channel = %channel,
            from,
            "channel forward reached a non-leader"
        );
        return (Status::NotChannelLeader, Bytes::new());
    }

    let key = channel.key();
    for message in set.0 {
        ctx.channel_step(&key, ChannelEvent::Send(message));
    }
    (Status::Ok, Bytes::new())
}

fn handle_forward_sendack(ctx: &Arc<Ctx>, body: Bytes) -> (Status, Bytes) {
    let set = match ForwardSendackPacketSet::unmarshal(&body) {
        Ok(set) => set,
        Err(e) => {
            tracing::warn!(target: "wren::server", error = %e, "bad sendack payload");
            return (Status::Error, Bytes::new());
        },
    };
    for packet in set.0 {
        match ctx.conns.get(packet.conn_id) {
            Some(conn) if conn.uid == packet.uid => {
                conn.write(encode_packet(&Packet::Sendack(packet.sendack)));
            },
            _ => {
                tracing::debug!(
                    target: "wren::server",
                    uid = %packet.uid,
                    conn_id = packet.conn_id,
                    "sendack for unknown connection"
                );
            },
        }
    }
    (Status::Ok, Bytes::new())
}

fn handle_conn_write(ctx: &Arc<Ctx>, body: Bytes) -> (Status, Bytes) {
    let req = match ForwardWriteReq::unmarshal(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(target: "wren::server", error = %e, "bad conn write payload");
            return (Status::Error, Bytes::new());
        },
    };
    if req.data.is_empty() {
        return (Status::Ok, Bytes::new());
    }
    match ctx.conns.get(req.conn_id) {
        Some(conn) if conn.uid == req.uid => {
            conn.write(req.data);
            (Status::Ok, Bytes::new())
        },
        _ => {
            tracing::debug!(
                target: "wren::server",
                uid = %req.uid,
                conn_id = req.conn_id,
                "conn write for unknown connection"
            );
            (Status::NotFound, Bytes::new())
        },
    }
}

fn handle_user_action(ctx: &Arc<Ctx>, from: u64, body: Bytes) -> (Status, Bytes) {
    let set = match UserActionSet::unmarshal(&body) {
        Ok(set) => set,
        Err(e) => {
            tracing::warn!(target: "wren::server", error = %e, "bad user action payload");
            return (Status::Error, Bytes::new());
        },
    };
    let Some(first) = set.0.first() else {
        return (Status::Ok, Bytes::new());
    };

    // Node-level ping/pong is peer bookkeeping, not leader work.
    let needs_leader = !matches!(
        first.kind,
        UserActionKind::NodePing | UserActionKind::NodePong
    );
    if needs_leader && ctx.slots.slot_leader_of_key(&first.uid) != ctx.self_id() {
        tracing::debug!(
            target: "wren::server",
            uid = %first.uid,
            from,
            "user action reached a non-leader"
        );
        return (Status::NotUserLeader, Bytes::new());
    }

    for action in set.0 {
        let uid = action.uid.clone();
        match action.kind {
            UserActionKind::Connect => {
                for msg in action.messages {
                    let conn = ensure_proxy_conn(ctx, &uid, from, &msg);
                    ctx.conns.insert(Arc::clone(&conn));
                    let connect = msg.payload.clone();
                    ctx.user_step(&uid, UserEvent::ConnOpen { conn, connect });
                }
            },
            UserActionKind::Recvack => {
                for mut msg in action.messages {
                    msg.from_node_id = from;
                    ctx.user_step(&uid, UserEvent::RecvackMsg(msg));
                }
            },
            UserActionKind::Recv => {
                for mut msg in action.messages {
                    msg.from_node_id = from;
                    msg.conn_id = 0;
                    ctx.user_step(&uid, UserEvent::RecvMsg(msg));
                }
            },
            UserActionKind::NodePing => {
                ctx.user_step(&uid, UserEvent::LeaderPing { from_node: from });
            },
            UserActionKind::NodePong => {
                ctx.user_step(&uid, UserEvent::NodePong { from_node: from });
            },
            other => {
                tracing::debug!(
                    target: "wren::server",
                    uid = %uid,
                    kind = ?other,
                    "unsupported user action kind on the wire"
                );
            },
        }
    }
    (Status::Ok, Bytes::new())
}

fn handle_user_auth_result(ctx: &Arc<Ctx>, body: Bytes) -> (Status, Bytes) {
    let result = match UserAuthResult::unmarshal(&body) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(target: "wren::server", error = %e, "bad auth result payload");
            return (Status::Error, Bytes::new());
        },
    };
    apply_auth_result(ctx, &result);
    (Status::Ok, Bytes::new())
}

fn handle_replica(ctx: &Arc<Ctx>, body: Bytes) -> (Status, Bytes) {
    let (group_kind, key, msg) = match decode_replica_envelope(&body) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::warn!(target: "wren::server", error = %e, "bad replica payload");
            return (Status::Error, Bytes::new());
        },
    };
    match group_kind {
        1 => {
            let slot = crate::slot::parse_slot_key(&key);
            ctx.slot_step(&slot_key(slot), SlotEvent::Replica(msg));
        },
        2 => {
            ctx.channel_step(&key, ChannelEvent::Replica(msg));
        },
        other => {
            tracing::warn!(target: "wren::server", group_kind = other, "unknown group kind");
            return (Status::Error, Bytes::new());
        },
    }
    (Status::Ok, Bytes::new())
}
