//! Authentication worker pool.
//!
//! The user leader batches connect packets here; workers validate the
//! device token against stored credentials, mint key material, and route
//! the result back to the node holding the socket.

use crate::server::connection::ConnContext;
use crate::server::Ctx;
use crate::user::{UserEvent, UserQueue};
use std::sync::Arc;
use wrn_cluster::{UserAuthResult, UserMessage, ROUTE_USER_AUTH_RESULT};
use wrn_core::{fnv1a, DeviceFlag, DeviceLevel, ReasonCode};
use wrn_proto::{encode_packet, parse_packet, ConnackPacket, Packet};

pub struct AuthTask {
    pub uid: String,
    pub messages: Vec<UserMessage>,
    pub index: u64,
}

pub struct AuthPool {
    tx: flume::Sender<AuthTask>,
}

impl AuthPool {
    pub fn start(ctx: Arc<Ctx>, pool_size: usize) -> Self {
        let (tx, rx) = flume::bounded::<AuthTask>(4096);
        for _ in 0..pool_size.max(1) {
            let rx = rx.clone();
            let ctx = Arc::clone(&ctx);
            let runtime = ctx.runtime.clone();
            runtime.spawn(async move {
                while let Ok(task) = rx.recv_async().await {
                    run_auth(&ctx, task).await;
                }
            });
        }
        Self { tx }
    }

    pub fn submit(&self, task: AuthTask) {
        if self.tx.try_send(task).is_err() {
            tracing::warn!(target: "wren::auth", "auth pool saturated, dropping batch");
        }
    }
}

async fn run_auth(ctx: &Arc<Ctx>, task: AuthTask) {
    for msg in &task.messages {
        let result = authenticate(ctx, &task.uid, msg);
        let origin = msg.from_node_id;
        if origin == ctx.self_id() || origin == 0 {
            apply_auth_result(ctx, &result);
        } else {
            match ctx
                .nodes
                .request(origin, ROUTE_USER_AUTH_RESULT, result.marshal())
                .await
            {
                Ok(_) => {},
                Err(e) => {
                    tracing::warn!(
                        target: "wren::auth",
                        uid = %task.uid,
                        origin,
                        error = %e,
                        "auth result delivery failed"
                    );
                },
            }
        }
    }
    ctx.user_step(
        &task.uid,
        UserEvent::Advance {
            queue: UserQueue::Auth,
            index: task.index,
            ok: true,
        },
    );
}

fn authenticate(ctx: &Arc<Ctx>, uid: &str, msg: &UserMessage) -> UserAuthResult {
    let mut result = UserAuthResult {
        uid: uid.to_string(),
        conn_id: msg.conn_id,
        device_id: msg.device_id.clone(),
        reason_code: ReasonCode::AuthFail.as_u8(),
        ..Default::default()
    };

    let connect = match parse_packet(&msg.payload) {
        Ok(Some((Packet::Connect(connect), _))) => connect,
        _ => {
            tracing::warn!(target: "wren::auth", uid, "undecodable connect payload");
            return result;
        },
    };
    tracing::debug!(
        target: "wren::auth",
        uid,
        device_id = %connect.device_id,
        device_flag = ?DeviceFlag::from_u8(connect.device_flag),
        proto_version = connect.proto_version,
        "authenticating connection"
    );

    let device_level = match ctx.store.device(uid) {
        Ok(Some(info)) => {
            if info.token != connect.token {
                tracing::info!(target: "wren::auth", uid, "token mismatch");
                return result;
            }
            info.device_level
        },
        // No registered credentials: open registration accepts the
        // connection with a master device.
        Ok(None) => DeviceLevel::Master,
        Err(e) => {
            tracing::warn!(target: "wren::auth", uid, error = %e, "device lookup failed");
            result.reason_code = ReasonCode::SystemError.as_u8();
            return result;
        },
    };

    result.reason_code = ReasonCode::Success.as_u8();
    result.proto_version = connect.proto_version;
    result.device_level = device_level.as_u8();
    result.aes_iv = key_material(uid, msg.conn_id, "iv");
    result.aes_key = key_material(uid, msg.conn_id, "key");
    result.server_key = key_material(uid, msg.conn_id, "srv");
    result
}

/// Per-connection key material: hashed, hex-rendered, fixed width.
fn key_material(uid: &str, conn_id: u64, label: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut hasher);
    let seed = hasher.finish();
    let material = format!("{uid}:{conn_id}:{label}:{seed}");
    format!("{:016x}", fnv1a(material.as_bytes()))
}

/// Apply an auth outcome on the node that owns the socket: update the
/// connection context and answer with a connack.
pub fn apply_auth_result(ctx: &Arc<Ctx>, result: &UserAuthResult) {
    let Some(conn) = ctx.conns.get(result.conn_id) else {
        tracing::warn!(
            target: "wren::auth",
            uid = %result.uid,
            conn_id = result.conn_id,
            "auth result for unknown connection"
        );
        return;
    };
    if conn.device_id != result.device_id {
        tracing::warn!(
            target: "wren::auth",
            uid = %result.uid,
            expect = %conn.device_id,
            got = %result.device_id,
            "auth result device mismatch"
        );
        return;
    }

    let success = result.reason_code == ReasonCode::Success.as_u8();
    if success {
        conn.mark_authed(
            result.device_level,
            result.proto_version,
            &result.aes_key,
            &result.aes_iv,
        );
    }
    let connack = ConnackPacket {
        server_version: result.proto_version,
        reason_code: result.reason_code,
        server_key: result.server_key.clone(),
        salt: result.aes_iv.clone(),
        node_id: ctx.self_id(),
    };
    conn.write(encode_packet(&Packet::Connack(connack)));
    if !success {
        // Terminal for this connection; the client must reconnect.
        conn.close();
    }
}

/// Register a proxy connection context on the user leader for a socket
/// terminated on `origin` (forwarded connect path).
pub fn ensure_proxy_conn(ctx: &Arc<Ctx>, uid: &str, origin: u64, msg: &UserMessage) -> Arc<ConnContext> {
    let conn_id = ctx.conns.next_conn_id();
    Arc::new(ConnContext::proxy(
        uid,
        &msg.device_id,
        conn_id,
        origin,
        msg.conn_id,
    ))
}
