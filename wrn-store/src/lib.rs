//! Bounded adapter over the persistent column store.
//!
//! The store engine itself is an external collaborator providing keyed
//! get/put/range; this crate pins down the key layout per column and the
//! operations the rest of the system is allowed to perform. Columns are
//! sharded: uid-keyed data (conversations, devices) by uid hash, channel-
//! and group-keyed data (messages, replication logs) by slot. Each shard
//! is single-writer behind its own lock.

mod keys;

use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use wrn_core::{slot_of, Conversation, Decoder, DeviceLevel, Encoder, Message, Result, WrenError};
use wrn_replica::Entry;

/// Deadline applied to store batch operations by async callers.
pub const BATCH_DEADLINE: Duration = Duration::from_secs(20);

/// Sentinel file marking completion of the legacy import.
const MIGRATED_SENTINEL: &str = "migrated";

/// Registered device credentials for a uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub token: String,
    pub device_level: DeviceLevel,
}

type Shard = Mutex<BTreeMap<Vec<u8>, Bytes>>;

pub struct Store {
    data_dir: PathBuf,
    /// Shards for uid-keyed columns.
    uid_shards: Vec<Shard>,
    /// Shards for channel/group-keyed columns.
    slot_shards: Vec<Shard>,
}

impl Store {
    pub fn open(data_dir: impl AsRef<Path>, shard_num: usize, slot_shard_num: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        let uid_shards = (0..shard_num.max(1)).map(|_| Mutex::new(BTreeMap::new())).collect();
        let slot_shards = (0..slot_shard_num.max(1))
            .map(|_| Mutex::new(BTreeMap::new()))
            .collect();
        Ok(Self {
            data_dir,
            uid_shards,
            slot_shards,
        })
    }

    fn uid_shard(&self, uid: &str) -> &Shard {
        let idx = slot_of(uid, self.uid_shards.len() as u32) as usize;
        &self.uid_shards[idx]
    }

    fn slot_shard(&self, key: &str) -> &Shard {
        let idx = slot_of(key, self.slot_shards.len() as u32) as usize;
        &self.slot_shards[idx]
    }

    fn with_shard<R>(
        shard: &Shard,
        f: impl FnOnce(&mut BTreeMap<Vec<u8>, Bytes>) -> R,
    ) -> Result<R> {
        let mut guard = shard
            .lock()
            .map_err(|_| WrenError::Store("shard lock poisoned".into()))?;
        Ok(f(&mut guard))
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Persist committed messages under (channel, seq).
    pub fn append_messages(&self, messages: &[Message]) -> Result<()> {
        for msg in messages {
            let channel_key = format!("{}:{}", msg.channel_id, msg.channel_type);
            let key = keys::message_key(&channel_key, msg.message_seq);
            let value = encode_message(msg);
            Self::with_shard(self.slot_shard(&channel_key), |map| {
                map.insert(key, value);
            })?;
        }
        Ok(())
    }

    /// Highest persisted seq for a channel, zero when empty.
    pub fn channel_max_seq(&self, channel_key: &str) -> Result<u64> {
        let prefix = keys::message_prefix(channel_key);
        let end = keys::prefix_end(&prefix);
        Self::with_shard(self.slot_shard(channel_key), |map| {
            map.range(prefix.clone()..end)
                .next_back()
                .map(|(key, _)| {
                    let seq_bytes = &key[key.len() - 8..];
                    u64::from_be_bytes(seq_bytes.try_into().unwrap_or_default())
                })
                .unwrap_or(0)
        })
    }

    /// Messages with seq in `[from_seq, from_seq + limit)`, ascending.
    pub fn messages_range(
        &self,
        channel_key: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let start = keys::message_key(channel_key, from_seq);
        let end = keys::prefix_end(&keys::message_prefix(channel_key));
        Self::with_shard(self.slot_shard(channel_key), |map| {
            map.range(start..end)
                .take(limit)
                .filter_map(|(_, value)| decode_message(value).ok())
                .collect()
        })
    }

    // =========================================================================
    // Subscribers
    // =========================================================================

    pub fn add_subscribers(&self, channel_key: &str, uids: &[String]) -> Result<()> {
        Self::with_shard(self.slot_shard(channel_key), |map| {
            for uid in uids {
                map.insert(keys::subscriber_key(channel_key, uid), Bytes::new());
            }
        })
    }

    pub fn remove_subscriber(&self, channel_key: &str, uid: &str) -> Result<()> {
        Self::with_shard(self.slot_shard(channel_key), |map| {
            map.remove(&keys::subscriber_key(channel_key, uid));
        })
    }

    pub fn subscribers(&self, channel_key: &str) -> Result<Vec<String>> {
        let prefix = keys::subscriber_prefix(channel_key);
        let end = keys::prefix_end(&prefix);
        let prefix_len = prefix.len();
        Self::with_shard(self.slot_shard(channel_key), |map| {
            map.range(prefix.clone()..end)
                .filter_map(|(key, _)| {
                    // Part layout: u16 len + uid bytes.
                    let rest = &key[prefix_len..];
                    if rest.len() < 2 {
                        return None;
                    }
                    String::from_utf8(rest[2..].to_vec()).ok()
                })
                .collect()
        })
    }

    // =========================================================================
    // Devices + conversations
    // =========================================================================

    pub fn put_device(&self, uid: &str, info: &DeviceInfo) -> Result<()> {
        let mut enc = Encoder::with_capacity(32);
        enc.put_str(&info.token);
        enc.put_u8(info.device_level.as_u8());
        let value = enc.freeze();
        Self::with_shard(self.uid_shard(uid), |map| {
            map.insert(keys::device_key(uid), value);
        })
    }

    pub fn device(&self, uid: &str) -> Result<Option<DeviceInfo>> {
        let value = Self::with_shard(self.uid_shard(uid), |map| {
            map.get(&keys::device_key(uid)).cloned()
        })?;
        match value {
            Some(raw) => {
                let mut dec = Decoder::new(&raw);
                Ok(Some(DeviceInfo {
                    token: dec.str()?,
                    device_level: DeviceLevel::from_u8(dec.u8()?),
                }))
            },
            None => Ok(None),
        }
    }

    pub fn add_or_update_conversations(
        &self,
        uid: &str,
        conversations: &[Conversation],
    ) -> Result<()> {
        for conv in conversations {
            let channel_key = format!("{}:{}", conv.channel_id, conv.channel_type);
            let key = keys::conversation_key(uid, &channel_key);
            let value = encode_conversation(conv);
            Self::with_shard(self.uid_shard(uid), |map| {
                map.insert(key, value);
            })?;
        }
        Ok(())
    }

    pub fn conversation(&self, uid: &str, channel_key: &str) -> Result<Option<Conversation>> {
        let value = Self::with_shard(self.uid_shard(uid), |map| {
            map.get(&keys::conversation_key(uid, channel_key)).cloned()
        })?;
        value.map(|raw| decode_conversation(&raw)).transpose()
    }

    pub fn conversations(&self, uid: &str) -> Result<Vec<Conversation>> {
        let prefix = keys::conversation_prefix(uid);
        let end = keys::prefix_end(&prefix);
        Self::with_shard(self.uid_shard(uid), |map| {
            map.range(prefix.clone()..end)
                .filter_map(|(_, value)| decode_conversation(value).ok())
                .collect()
        })
    }

    // =========================================================================
    // Replication log
    // =========================================================================

    pub fn append_replica_logs(&self, group: &str, entries: &[Entry]) -> Result<()> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        let (last_index, last_term) = (last.index, last.term);
        let meta = self.replica_meta(group)?;
        Self::with_shard(self.slot_shard(group), |map| {
            for entry in entries {
                let mut enc = Encoder::with_capacity(8 + entry.data.len());
                entry.encode(&mut enc);
                map.insert(keys::replica_log_key(group, entry.index), enc.freeze());
            }
            let mut enc = Encoder::with_capacity(20);
            enc.put_u64(last_index);
            enc.put_u32(last_term);
            enc.put_u64(meta.2);
            map.insert(keys::replica_meta_key(group), enc.freeze());
        })
    }

    /// Entries `[lo, hi)` for a group, capped at `max_size` encoded bytes.
    pub fn replica_logs(
        &self,
        group: &str,
        lo: u64,
        hi: u64,
        max_size: u64,
    ) -> Result<Vec<Entry>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let start = keys::replica_log_key(group, lo);
        let end = keys::replica_log_key(group, hi);
        Self::with_shard(self.slot_shard(group), |map| {
            let mut out = Vec::new();
            let mut size = 0u64;
            for (_, value) in map.range(start..end) {
                let mut dec = Decoder::new(value);
                let Ok(entry) = Entry::decode(&mut dec) else {
                    continue;
                };
                size += entry.size();
                if !out.is_empty() && size > max_size {
                    break;
                }
                out.push(entry);
            }
            out
        })
    }

    /// Drop entries at or above `index` (conflict resolution).
    pub fn truncate_replica_logs_from(&self, group: &str, index: u64) -> Result<()> {
        tracing::info!(target: "wren::store", group, index, "truncating replication log");
        let start = keys::replica_log_key(group, index);
        let end = keys::prefix_end(&keys::replica_log_prefix(group));
        let meta = self.replica_meta(group)?;
        Self::with_shard(self.slot_shard(group), |map| {
            let doomed: Vec<Vec<u8>> = map.range(start..end).map(|(k, _)| k.clone()).collect();
            for key in doomed {
                map.remove(&key);
            }
            let new_last = index.saturating_sub(1);
            let mut enc = Encoder::with_capacity(20);
            enc.put_u64(new_last.min(meta.0));
            enc.put_u32(meta.1);
            enc.put_u64(meta.2.min(new_last));
            map.insert(keys::replica_meta_key(group), enc.freeze());
        })
    }

    /// `(last_index, last_term, applied_index)` for a group.
    pub fn replica_meta(&self, group: &str) -> Result<(u64, u32, u64)> {
        let value = Self::with_shard(self.slot_shard(group), |map| {
            map.get(&keys::replica_meta_key(group)).cloned()
        })?;
        match value {
            Some(raw) => {
                let mut dec = Decoder::new(&raw);
                Ok((dec.u64()?, dec.u32()?, dec.u64()?))
            },
            None => Ok((0, 0, 0)),
        }
    }

    pub fn set_applied_index(&self, group: &str, applied: u64) -> Result<()> {
        let meta = self.replica_meta(group)?;
        Self::with_shard(self.slot_shard(group), |map| {
            let mut enc = Encoder::with_capacity(20);
            enc.put_u64(meta.0.max(applied));
            enc.put_u32(meta.1);
            enc.put_u64(applied);
            map.insert(keys::replica_meta_key(group), enc.freeze());
        })
    }

    // =========================================================================
    // Migration sentinel
    // =========================================================================

    /// True once the legacy import finished on this data dir.
    #[must_use]
    pub fn is_migrated(&self) -> bool {
        self.data_dir.join(MIGRATED_SENTINEL).exists()
    }

    pub fn mark_migrated(&self) -> Result<()> {
        std::fs::write(self.data_dir.join(MIGRATED_SENTINEL), b"")?;
        Ok(())
    }
}

fn encode_message(msg: &Message) -> Bytes {
    let mut enc = Encoder::with_capacity(64 + msg.payload.len());
    enc.put_i64(msg.message_id);
    enc.put_u64(msg.message_seq);
    enc.put_str(&msg.channel_id);
    enc.put_u8(msg.channel_type);
    enc.put_str(&msg.from_uid);
    enc.put_u64(msg.timestamp);
    enc.put_u8(msg.framer.as_u8());
    enc.put_str(&msg.stream_no);
    enc.put_u64(msg.stream_seq);
    enc.put_u8(msg.stream_flag);
    enc.put_str(&msg.topic);
    enc.put_bytes(&msg.payload);
    enc.freeze()
}

fn decode_message(raw: &[u8]) -> Result<Message> {
    let mut dec = Decoder::new(raw);
    Ok(Message {
        message_id: dec.i64()?,
        message_seq: dec.u64()?,
        channel_id: dec.str()?,
        channel_type: dec.u8()?,
        from_uid: dec.str()?,
        timestamp: dec.u64()?,
        framer: wrn_core::Framer::from_u8(dec.u8()?),
        stream_no: dec.str()?,
        stream_seq: dec.u64()?,
        stream_flag: dec.u8()?,
        topic: dec.str()?,
        payload: dec.bytes()?,
    })
}

fn encode_conversation(conv: &Conversation) -> Bytes {
    let mut enc = Encoder::with_capacity(48);
    enc.put_str(&conv.channel_id);
    enc.put_u8(conv.channel_type);
    enc.put_u32(conv.unread_count);
    enc.put_u64(conv.readed_to_msg_seq);
    enc.put_u64(conv.created_at);
    enc.put_u64(conv.updated_at);
    enc.freeze()
}

fn decode_conversation(raw: &[u8]) -> Result<Conversation> {
    let mut dec = Decoder::new(raw);
    Ok(Conversation {
        channel_id: dec.str()?,
        channel_type: dec.u8()?,
        unread_count: dec.u32()?,
        readed_to_msg_seq: dec.u64()?,
        created_at: dec.u64()?,
        updated_at: dec.u64()?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 4, 4).unwrap();
        (dir, store)
    }

    fn msg(channel_id: &str, seq: u64) -> Message {
        Message {
            message_id: seq as i64 * 100,
            message_seq: seq,
            channel_id: channel_id.into(),
            channel_type: 2,
            from_uid: "u1".into(),
            timestamp: 1_700_000_000,
            payload: Bytes::from_static(b"hi"),
            ..Default::default()
        }
    }

    #[test]
    fn test_message_roundtrip_and_max_seq() {
        let (_dir, store) = store();
        store
            .append_messages(&[msg("g1", 1), msg("g1", 2), msg("g1", 3)])
            .unwrap();
        assert_eq!(store.channel_max_seq("g1:2").unwrap(), 3);
        assert_eq!(store.channel_max_seq("g2:2").unwrap(), 0);

        let got = store.messages_range("g1:2", 2, 10).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].message_seq, 2);
        assert_eq!(got[1].message_seq, 3);
        assert_eq!(got[0], msg("g1", 2));
    }

    #[test]
    fn test_subscribers() {
        let (_dir, store) = store();
        store
            .add_subscribers("g1:2", &["u1".into(), "u2".into()])
            .unwrap();
        store.add_subscribers("g1:2", &["u2".into()]).unwrap();
        let mut subs = store.subscribers("g1:2").unwrap();
        subs.sort();
        assert_eq!(subs, vec!["u1", "u2"]);

        store.remove_subscriber("g1:2", "u1").unwrap();
        assert_eq!(store.subscribers("g1:2").unwrap(), vec!["u2"]);
    }

    #[test]
    fn test_device_roundtrip() {
        let (_dir, store) = store();
        assert!(store.device("u1").unwrap().is_none());
        let info = DeviceInfo {
            token: "tok".into(),
            device_level: DeviceLevel::Master,
        };
        store.put_device("u1", &info).unwrap();
        assert_eq!(store.device("u1").unwrap().unwrap(), info);
    }

    #[test]
    fn test_conversations() {
        let (_dir, store) = store();
        let conv = Conversation {
            channel_id: "u1@u2".into(),
            channel_type: 1,
            unread_count: 2,
            readed_to_msg_seq: 5,
            created_at: 1,
            updated_at: 2,
        };
        store.add_or_update_conversations("u1", &[conv.clone()]).unwrap();
        assert_eq!(
            store.conversation("u1", "u1@u2:1").unwrap().unwrap(),
            conv
        );
        assert_eq!(store.conversations("u1").unwrap(), vec![conv]);
        assert!(store.conversations("u2").unwrap().is_empty());
    }

    #[test]
    fn test_replica_log_roundtrip() {
        let (_dir, store) = store();
        let entries: Vec<Entry> = (1..=5)
            .map(|i| Entry::new(i, 2, Bytes::from_static(b"entry")))
            .collect();
        store.append_replica_logs("slot-1", &entries).unwrap();
        assert_eq!(store.replica_meta("slot-1").unwrap(), (5, 2, 0));

        let got = store.replica_logs("slot-1", 2, 5, u64::MAX).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].index, 2);
        assert_eq!(got[2].index, 4);

        store.set_applied_index("slot-1", 3).unwrap();
        assert_eq!(store.replica_meta("slot-1").unwrap(), (5, 2, 3));
    }

    #[test]
    fn test_replica_log_truncate() {
        let (_dir, store) = store();
        let entries: Vec<Entry> = (1..=5)
            .map(|i| Entry::new(i, 1, Bytes::from_static(b"x")))
            .collect();
        store.append_replica_logs("ch-g1", &entries).unwrap();
        store.truncate_replica_logs_from("ch-g1", 4).unwrap();
        let got = store.replica_logs("ch-g1", 1, 100, u64::MAX).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(store.replica_meta("ch-g1").unwrap().0, 3);
    }

    #[test]
    fn test_replica_logs_size_cap() {
        let (_dir, store) = store();
        let entries: Vec<Entry> = (1..=3)
            .map(|i| Entry::new(i, 1, Bytes::from_static(b"0123456789")))
            .collect();
        store.append_replica_logs("g", &entries).unwrap();
        let one = store
            .replica_logs("g", 1, 4, entries[0].size())
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_migrated_sentinel() {
        let (_dir, store) = store();
        assert!(!store.is_migrated());
        store.mark_migrated().unwrap();
        assert!(store.is_migrated());
    }
}
