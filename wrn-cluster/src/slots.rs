use std::sync::RwLock;
use wrn_core::{slot_of, Channel, NodeId};

#[derive(Debug, Clone)]
struct SlotState {
    replicas: Vec<NodeId>,
    leader: NodeId,
}

/// The slot table: a fixed partition of the id space onto replica groups.
///
/// Replica sets are assigned round-robin over the replica-role nodes at
/// bootstrap; leaders are learned at runtime (slot group elections feed
/// [`SlotManager::set_slot_leader`]). Every routing decision (where to
/// propose a channel send, whom to forward a user action to) reads the
/// current leader here, and a stale answer is corrected by the typed
/// not-leader statuses on the RPC paths.
pub struct SlotManager {
    slot_count: u32,
    slots: RwLock<Vec<SlotState>>,
}

impl SlotManager {
    #[must_use]
    pub fn new(slot_count: u32, replica_nodes: &[NodeId], replica_count: usize) -> Self {
        let slot_count = slot_count.max(1);
        let mut nodes: Vec<NodeId> = replica_nodes.to_vec();
        nodes.sort_unstable();
        let mut slots = Vec::with_capacity(slot_count as usize);
        for slot in 0..slot_count {
            let replicas: Vec<NodeId> = if nodes.is_empty() {
                Vec::new()
            } else {
                (0..replica_count.min(nodes.len()))
                    .map(|i| nodes[(slot as usize + i) % nodes.len()])
                    .collect()
            };
            let leader = replicas.first().copied().unwrap_or(0);
            slots.push(SlotState { replicas, leader });
        }
        Self {
            slot_count,
            slots: RwLock::new(slots),
        }
    }

    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[inline]
    #[must_use]
    pub fn slot_of_key(&self, key: &str) -> u32 {
        slot_of(key, self.slot_count)
    }

    #[must_use]
    pub fn replicas_of(&self, slot: u32) -> Vec<NodeId> {
        self.slots
            .read()
            .map(|slots| slots[slot as usize % slots.len()].replicas.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn leader_of_slot(&self, slot: u32) -> NodeId {
        self.slots
            .read()
            .map(|slots| slots[slot as usize % slots.len()].leader)
            .unwrap_or(0)
    }

    /// Record a learned leader change for a slot.
    pub fn set_slot_leader(&self, slot: u32, leader: NodeId) {
        if let Ok(mut slots) = self.slots.write() {
            let len = slots.len();
            let state = &mut slots[slot as usize % len];
            if state.leader != leader {
                tracing::info!(
                    target: "wren::cluster",
                    slot,
                    leader,
                    "slot leader changed"
                );
                state.leader = leader;
            }
        }
    }

    /// Leader of the slot a key hashes to. This is the user-leader for a
    /// uid and the channel-leader for a channel key.
    #[must_use]
    pub fn slot_leader_of_key(&self, key: &str) -> NodeId {
        self.leader_of_slot(self.slot_of_key(key))
    }

    #[must_use]
    pub fn channel_leader(&self, channel: &Channel) -> NodeId {
        self.slot_leader_of_key(&channel.key())
    }

    #[must_use]
    pub fn channel_replicas(&self, channel: &Channel) -> Vec<NodeId> {
        self.replicas_of(self.slot_of_key(&channel.key()))
    }

    #[must_use]
    pub fn is_slot_leader(&self, key: &str, node_id: NodeId) -> bool {
        self.slot_leader_of_key(key) == node_id
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wrn_core::ChannelType;

    #[test]
    fn test_replica_assignment_round_robin() {
        let slots = SlotManager::new(8, &[1, 2, 3], 3);
        for slot in 0..8 {
            let replicas = slots.replicas_of(slot);
            assert_eq!(replicas.len(), 3);
            // All three nodes participate, rotated per slot.
            let mut sorted = replicas.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![1, 2, 3]);
        }
        // Initial leaders rotate too.
        let leaders: std::collections::HashSet<u64> =
            (0..8).map(|s| slots.leader_of_slot(s)).collect();
        assert_eq!(leaders.len(), 3);
    }

    #[test]
    fn test_single_node_cluster() {
        let slots = SlotManager::new(64, &[1], 3);
        assert_eq!(slots.replicas_of(5), vec![1]);
        assert_eq!(slots.slot_leader_of_key("u1"), 1);
    }

    #[test]
    fn test_key_routing_is_stable() {
        let slots = SlotManager::new(64, &[1, 2, 3], 3);
        let slot = slots.slot_of_key("u42");
        for _ in 0..10 {
            assert_eq!(slots.slot_of_key("u42"), slot);
        }
    }

    #[test]
    fn test_leader_update() {
        let slots = SlotManager::new(4, &[1, 2], 2);
        let channel = Channel::new("g1", ChannelType::Group);
        let slot = slots.slot_of_key(&channel.key());
        slots.set_slot_leader(slot, 2);
        assert_eq!(slots.channel_leader(&channel), 2);
    }
}
