//! Key encodings per column. Sequence and index components are big endian
//! so lexicographic order matches numeric order under range scans.

pub const COL_MESSAGE: u8 = 0x01;
pub const COL_CONVERSATION: u8 = 0x02;
pub const COL_DEVICE: u8 = 0x03;
pub const COL_SUBSCRIBER: u8 = 0x04;
pub const COL_REPLICA_LOG: u8 = 0x05;
pub const COL_REPLICA_META: u8 = 0x06;

fn push_part(key: &mut Vec<u8>, part: &str) {
    key.extend_from_slice(&(part.len() as u16).to_be_bytes());
    key.extend_from_slice(part.as_bytes());
}

#[must_use]
pub fn message_key(channel_key: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + channel_key.len() + 8);
    key.push(COL_MESSAGE);
    push_part(&mut key, channel_key);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

#[must_use]
pub fn message_prefix(channel_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + channel_key.len());
    key.push(COL_MESSAGE);
    push_part(&mut key, channel_key);
    key
}

#[must_use]
pub fn conversation_key(uid: &str, channel_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + uid.len() + channel_key.len());
    key.push(COL_CONVERSATION);
    push_part(&mut key, uid);
    push_part(&mut key, channel_key);
    key
}

#[must_use]
pub fn conversation_prefix(uid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + uid.len());
    key.push(COL_CONVERSATION);
    push_part(&mut key, uid);
    key
}

#[must_use]
pub fn device_key(uid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + uid.len());
    key.push(COL_DEVICE);
    push_part(&mut key, uid);
    key
}

#[must_use]
pub fn subscriber_key(channel_key: &str, uid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + channel_key.len() + uid.len());
    key.push(COL_SUBSCRIBER);
    push_part(&mut key, channel_key);
    push_part(&mut key, uid);
    key
}

#[must_use]
pub fn subscriber_prefix(channel_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + channel_key.len());
    key.push(COL_SUBSCRIBER);
    push_part(&mut key, channel_key);
    key
}

#[must_use]
pub fn replica_log_key(group: &str, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + group.len() + 8);
    key.push(COL_REPLICA_LOG);
    push_part(&mut key, group);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

#[must_use]
pub fn replica_log_prefix(group: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + group.len());
    key.push(COL_REPLICA_LOG);
    push_part(&mut key, group);
    key
}

#[must_use]
pub fn replica_meta_key(group: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + group.len());
    key.push(COL_REPLICA_META);
    push_part(&mut key, group);
    key
}

/// Smallest key strictly greater than every key with this prefix.
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // All 0xFF: unbounded above.
    end
}
