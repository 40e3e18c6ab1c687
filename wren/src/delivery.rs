//! Delivery pool: writes committed messages toward their recipients.
//!
//! Tasks arrive partitioned by recipient user-leader node. A local
//! partition feeds each recipient's recv queue directly (and bumps
//! conversation unread counts); a remote partition ships the same work as
//! Recv user actions. Tasks over the per-node byte budget are split.

use crate::server::{unix_ts, Ctx};
use crate::user::UserEvent;
use std::sync::Arc;
use wrn_cluster::{UserAction, UserActionKind, UserActionSet, UserMessage, ROUTE_USER_ACTION};
use wrn_core::{Channel, Conversation, Message};
use wrn_proto::{encode_packet, Packet, RecvPacket};

#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub channel: Channel,
    pub messages: Vec<Message>,
    /// Recipients' user-leader node.
    pub node_id: u64,
    pub uids: Vec<String>,
}

pub struct DeliveryPool {
    tx: flume::Sender<DeliveryTask>,
}

impl DeliveryPool {
    pub fn start(ctx: Arc<Ctx>, worker_count: usize) -> Self {
        let (tx, rx) = flume::bounded::<DeliveryTask>(4096);
        for worker_id in 0..worker_count.max(1) {
            let rx = rx.clone();
            let ctx = Arc::clone(&ctx);
            let runtime = ctx.runtime.clone();
            runtime.spawn(async move {
                while let Ok(task) = rx.recv_async().await {
                    for part in split_task(task, ctx.opts.max_deliver_size_per_node) {
                        deliver(&ctx, part).await;
                    }
                }
                tracing::debug!(target: "wren::deliver", worker_id, "delivery worker stopped");
            });
        }
        Self { tx }
    }

    /// Enqueue a fanout task; blocks briefly under back-pressure.
    pub fn submit(&self, task: DeliveryTask) {
        if self.tx.send(task).is_err() {
            tracing::error!(target: "wren::deliver", "delivery pool is gone");
        }
    }
}

/// Split a task so no piece exceeds the per-node byte budget.
fn split_task(task: DeliveryTask, max_size: u64) -> Vec<DeliveryTask> {
    let total: u64 = task.messages.iter().map(Message::size).sum();
    if max_size == 0 || total <= max_size || task.messages.len() <= 1 {
        return vec![task];
    }
    let mut out = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_size = 0u64;
    for msg in task.messages {
        let size = msg.size();
        if !current.is_empty() && current_size + size > max_size {
            out.push(DeliveryTask {
                channel: task.channel.clone(),
                messages: std::mem::take(&mut current),
                node_id: task.node_id,
                uids: task.uids.clone(),
            });
            current_size = 0;
        }
        current_size += size;
        current.push(msg);
    }
    if !current.is_empty() {
        out.push(DeliveryTask {
            channel: task.channel.clone(),
            messages: current,
            node_id: task.node_id,
            uids: task.uids,
        });
    }
    out
}

fn recv_packet(msg: &Message) -> RecvPacket {
    RecvPacket {
        framer: msg.framer,
        message_id: msg.message_id,
        message_seq: msg.message_seq,
        timestamp: msg.timestamp,
        channel_id: msg.channel_id.clone(),
        channel_type: msg.channel_type,
        from_uid: msg.from_uid.clone(),
        stream_no: msg.stream_no.clone(),
        stream_seq: msg.stream_seq,
        stream_flag: msg.stream_flag,
        topic: msg.topic.clone(),
        payload: msg.payload.clone(),
    }
}

async fn deliver(ctx: &Arc<Ctx>, task: DeliveryTask) {
    let frames: Vec<(bytes::Bytes, &Message)> = task
        .messages
        .iter()
        .map(|msg| (encode_packet(&Packet::Recv(recv_packet(msg))), msg))
        .collect();

    if task.node_id == ctx.self_id() {
        for uid in &task.uids {
            for (frame, msg) in &frames {
                ctx.user_step_wait(
                    uid,
                    UserEvent::RecvMsg(UserMessage {
                        from_node_id: ctx.self_id(),
                        conn_id: 0,
                        device_id: String::new(),
                        seq: msg.message_seq,
                        payload: frame.clone(),
                    }),
                );
            }
            bump_conversations(ctx, uid, &task.channel, &task.messages);
        }
    } else {
        if !ctx.nodes.alive(task.node_id, ctx.opts.pong_max_tick) {
            tracing::warn!(
                target: "wren::deliver",
                node = task.node_id,
                "recipient node is down, leaving messages for catch-up"
            );
            return;
        }
        let actions: Vec<UserAction> = task
            .uids
            .iter()
            .map(|uid| {
                let mut action = UserAction::new(UserActionKind::Recv, uid.clone());
                action.messages = frames
                    .iter()
                    .map(|(frame, msg)| UserMessage {
                        from_node_id: ctx.self_id(),
                        conn_id: 0,
                        device_id: String::new(),
                        seq: msg.message_seq,
                        payload: frame.clone(),
                    })
                    .collect();
                action
            })
            .collect();
        let body = UserActionSet(actions).marshal();
        let max_attempts = ctx.opts.deliver_max_retry.max(1);
        for attempt in 1..=max_attempts {
            match ctx
                .nodes
                .request(task.node_id, ROUTE_USER_ACTION, body.clone())
                .await
            {
                Ok((wrn_cluster::Status::Ok, _)) => return,
                Ok((status, _)) => {
                    tracing::warn!(
                        target: "wren::deliver",
                        node = task.node_id,
                        ?status,
                        "remote delivery rejected"
                    );
                    return;
                },
                Err(e) => {
                    tracing::warn!(
                        target: "wren::deliver",
                        node = task.node_id,
                        attempt,
                        error = %e,
                        "remote delivery failed"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(50 * u64::from(attempt)))
                        .await;
                },
            }
        }
        tracing::error!(
            target: "wren::deliver",
            node = task.node_id,
            "remote delivery abandoned after retries"
        );
    }
}

/// Unread accounting for recipients; the sender's own row only moves its
/// read cursor.
fn bump_conversations(ctx: &Arc<Ctx>, uid: &str, channel: &Channel, messages: &[Message]) {
    let channel_key = channel.key();
    let max_seq = messages.iter().map(|m| m.message_seq).max().unwrap_or(0);
    let incoming = messages.iter().filter(|m| m.from_uid != uid).count() as u32;
    let now = unix_ts();

    let mut conv = ctx
        .store
        .conversation(uid, &channel_key)
        .ok()
        .flatten()
        .unwrap_or_else(|| Conversation {
            channel_id: channel.id.clone(),
            channel_type: channel.kind.as_u8(),
            created_at: now,
            ..Default::default()
        });
    if incoming > 0 {
        conv.unread_count += incoming;
    } else {
        conv.readed_to_msg_seq = conv.readed_to_msg_seq.max(max_seq);
    }
    conv.updated_at = now;
    if let Err(e) = ctx.store.add_or_update_conversations(uid, &[conv]) {
        tracing::warn!(
            target: "wren::deliver",
            uid,
            error = %e,
            "conversation write failed"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wrn_core::ChannelType;

    fn msg(seq: u64, payload_len: usize) -> Message {
        Message {
            message_id: seq as i64,
            message_seq: seq,
            channel_id: "g1".into(),
            channel_type: 2,
            from_uid: "u1".into(),
            payload: Bytes::from(vec![0u8; payload_len]),
            ..Default::default()
        }
    }

    fn task(messages: Vec<Message>) -> DeliveryTask {
        DeliveryTask {
            channel: Channel::new("g1", ChannelType::Group),
            messages,
            node_id: 1,
            uids: vec!["u2".into()],
        }
    }

    #[test]
    fn test_small_task_not_split() {
        let parts = split_task(task(vec![msg(1, 10), msg(2, 10)]), 1024 * 1024);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].messages.len(), 2);
    }

    #[test]
    fn test_oversized_task_splits_preserving_order() {
        let budget = msg(1, 100).size() + 10;
        let parts = split_task(
            task(vec![msg(1, 100), msg(2, 100), msg(3, 100)]),
            budget,
        );
        assert_eq!(parts.len(), 3);
        let seqs: Vec<u64> = parts
            .iter()
            .flat_map(|p| p.messages.iter().map(|m| m.message_seq))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        for part in &parts {
            assert_eq!(part.uids, vec!["u2"]);
        }
    }

    #[test]
    fn test_single_huge_message_passes_through() {
        let parts = split_task(task(vec![msg(1, 10_000)]), 100);
        assert_eq!(parts.len(), 1);
    }
}
