//! Stable key partitioning and channel id normalisation.
//!
//! Every user id and channel key maps to exactly one slot for the lifetime
//! of the cluster: `slot_of` is a pure function of the key bytes and the
//! configured slot count, so a rehash with an unchanged slot count never
//! moves keys.

/// Suffix marking out-of-band command channels.
pub const CMD_SUFFIX: &str = "____cmd";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over the key bytes.
#[inline]
#[must_use]
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Map a key to its slot.
#[inline]
#[must_use]
pub fn slot_of(key: &str, slot_count: u32) -> u32 {
    debug_assert!(slot_count > 0);
    (fnv1a(key.as_bytes()) % u64::from(slot_count)) as u32
}

/// Canonical channel id for a person-to-person conversation: the unordered
/// pair joined with `@`, smaller id first. Both directions land on the
/// same id, so both participants share one channel and one message log.
#[must_use]
pub fn fake_channel_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}@{b}")
    } else {
        format!("{b}@{a}")
    }
}

#[inline]
#[must_use]
pub fn is_cmd_channel(channel_id: &str) -> bool {
    channel_id.ends_with(CMD_SUFFIX)
}

/// Append the command suffix, idempotently.
#[must_use]
pub fn to_cmd_channel(channel_id: &str) -> String {
    if is_cmd_channel(channel_id) {
        channel_id.to_string()
    } else {
        format!("{channel_id}{CMD_SUFFIX}")
    }
}

/// Strip the command suffix, idempotently.
#[must_use]
pub fn from_cmd_channel(channel_id: &str) -> String {
    match channel_id.strip_suffix(CMD_SUFFIX) {
        Some(base) => base.to_string(),
        None => channel_id.to_string(),
    }
}
