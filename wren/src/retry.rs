//! Recvack bookkeeping: messages written to a connection stay in the
//! retry index until acked, and are re-queued on an interval scan until
//! the retry budget runs out.

use crate::server::Ctx;
use crate::user::UserEvent;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use wrn_cluster::UserMessage;

#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub uid: String,
    pub conn_id: u64,
    pub message_id: i64,
    pub message_seq: u64,
    pub channel_id: String,
    pub channel_type: u8,
    pub channel_key: String,
    /// Framed Recv packet, replayed as-is.
    pub payload: Bytes,
    pub retry_count: u32,
    pub last_attempt: Instant,
}

type Key = (String, u64, i64);

/// Index of unacked deliveries keyed by (uid, conn id, message id).
pub struct RetryManager {
    entries: Mutex<HashMap<Key, RetryEntry>>,
    max_count: u32,
}

impl RetryManager {
    #[must_use]
    pub fn new(max_count: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_count,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn track(
        &self,
        uid: &str,
        conn_id: u64,
        message_id: i64,
        message_seq: u64,
        channel_id: &str,
        channel_type: u8,
        payload: Bytes,
    ) {
        let key = (uid.to_string(), conn_id, message_id);
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.entry(key).or_insert_with(|| RetryEntry {
            uid: uid.to_string(),
            conn_id,
            message_id,
            message_seq,
            channel_id: channel_id.to_string(),
            channel_type,
            channel_key: format!("{channel_id}:{channel_type}"),
            payload,
            retry_count: 0,
            last_attempt: Instant::now(),
        });
    }

    /// A recvack arrived: drop the entry and hand it back for
    /// conversation bookkeeping.
    pub fn ack(&self, uid: &str, conn_id: u64, message_id: i64) -> Option<RetryEntry> {
        let key = (uid.to_string(), conn_id, message_id);
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(&key)
    }

    /// Forget everything tracked for a closed connection.
    pub fn drop_conn(&self, uid: &str, conn_id: u64) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|(entry_uid, entry_conn, _), _| {
            !(entry_uid == uid && *entry_conn == conn_id)
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One scan pass: re-queue entries past the interval, drop those out
    /// of budget. Returns the re-queued entries.
    pub fn scan(&self, interval: std::time::Duration) -> Vec<RetryEntry> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|_, entry| {
            if now.duration_since(entry.last_attempt) < interval {
                return true;
            }
            if entry.retry_count >= self.max_count {
                tracing::warn!(
                    target: "wren::retry",
                    uid = %entry.uid,
                    conn_id = entry.conn_id,
                    message_id = entry.message_id,
                    retry_count = entry.retry_count,
                    "message dropped after retry budget"
                );
                return false;
            }
            entry.retry_count += 1;
            entry.last_attempt = now;
            due.push(entry.clone());
            true
        });
        due
    }

    /// Spawn the periodic scanner plus the worker pool that feeds due
    /// re-deliveries back into the user reactor.
    pub fn start_scanner(self: &Arc<Self>, ctx: Arc<Ctx>) {
        let manager = Arc::clone(self);
        let scan_interval = ctx.opts.message_retry_scan_interval();
        let retry_interval = ctx.opts.message_retry_interval();
        let (tx, rx) = flume::bounded::<RetryEntry>(4096);

        for _ in 0..ctx.opts.message_retry_worker_count.max(1) {
            let rx = rx.clone();
            let ctx = Arc::clone(&ctx);
            ctx.runtime.clone().spawn(async move {
                while let Ok(entry) = rx.recv_async().await {
                    tracing::debug!(
                        target: "wren::retry",
                        uid = %entry.uid,
                        message_id = entry.message_id,
                        retry_count = entry.retry_count,
                        "re-queueing unacked message"
                    );
                    ctx.user_step(
                        &entry.uid,
                        UserEvent::RecvMsg(UserMessage {
                            from_node_id: ctx.self_id(),
                            conn_id: entry.conn_id,
                            device_id: String::new(),
                            seq: entry.message_seq,
                            payload: entry.payload.clone(),
                        }),
                    );
                }
            });
        }

        ctx.runtime.clone().spawn(async move {
            let mut ticker = tokio::time::interval(scan_interval);
            loop {
                ticker.tick().await;
                for entry in manager.scan(retry_interval) {
                    if tx.send_async(entry).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn track(manager: &RetryManager, message_id: i64) {
        manager.track(
            "u2",
            1,
            message_id,
            message_id as u64,
            "g1",
            2,
            Bytes::from_static(b"frame"),
        );
    }

    #[test]
    fn test_ack_removes_entry() {
        let manager = RetryManager::new(5);
        track(&manager, 10);
        assert_eq!(manager.len(), 1);
        let entry = manager.ack("u2", 1, 10).unwrap();
        assert_eq!(entry.channel_key, "g1:2");
        assert!(manager.is_empty());
        assert!(manager.ack("u2", 1, 10).is_none());
    }

    #[test]
    fn test_scan_requeues_then_drops_at_budget() {
        let manager = RetryManager::new(5);
        track(&manager, 10);
        // Not due yet.
        assert!(manager.scan(Duration::from_secs(60)).is_empty());

        // Due immediately with a zero interval: exactly max_count retries,
        // then the entry is dropped and recorded.
        let mut total = 0;
        for round in 1..=6 {
            let due = manager.scan(Duration::ZERO);
            if round <= 5 {
                assert_eq!(due.len(), 1);
                assert_eq!(due[0].retry_count, round);
                total += due.len();
            } else {
                assert!(due.is_empty());
                assert!(manager.is_empty());
            }
        }
        assert_eq!(total, 5);
    }

    #[test]
    fn test_drop_conn_clears_only_that_conn() {
        let manager = RetryManager::new(5);
        track(&manager, 1);
        manager.track("u2", 2, 9, 9, "g1", 2, Bytes::new());
        manager.drop_conn("u2", 1);
        assert_eq!(manager.len(), 1);
        assert!(manager.ack("u2", 2, 9).is_some());
    }
}
