//! In-process multi-replica harness: three state machines wired together
//! by routing their ready messages, with a fake per-node log store
//! answering storage reads.

use bytes::Bytes;
use std::collections::HashMap;
use wrn_replica::{Entry, Message, MsgType, Replica, ReplicaOptions, Role};

struct Node {
    replica: Replica,
    /// Durable entries, answered back on SyncGet.
    store: Vec<Entry>,
    alive: bool,
}

struct Cluster {
    nodes: HashMap<u64, Node>,
}

impl Cluster {
    fn new(ids: &[u64]) -> Self {
        let mut nodes = HashMap::new();
        for id in ids {
            let replica = Replica::new(ReplicaOptions {
                node_id: *id,
                group: format!("harness-{id}"),
                replicas: ids.to_vec(),
                election_interval_tick: 5,
                leader_timeout_max_tick: 10,
                ..Default::default()
            });
            nodes.insert(
                *id,
                Node {
                    replica,
                    store: Vec::new(),
                    alive: true,
                },
            );
        }
        Self { nodes }
    }

    fn kill(&mut self, id: u64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.alive = false;
        }
    }

    fn leader(&self) -> Option<u64> {
        self.nodes
            .values()
            .filter(|n| n.alive && n.replica.is_leader())
            .map(|n| n.replica.leader())
            .next()
    }

    /// One round: tick everyone, then route all ready messages (local
    /// storage/apply work is acknowledged inline, network messages are
    /// delivered to alive peers).
    fn round(&mut self) {
        let ids: Vec<u64> = self.nodes.keys().copied().collect();
        let mut wire: Vec<(u64, Message)> = Vec::new();

        for id in &ids {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if !node.alive {
                continue;
            }
            node.replica.tick();
            if !node.replica.has_ready() {
                continue;
            }
            let mut local: Vec<Message> = Vec::new();
            for msg in node.replica.ready() {
                match msg.msg_type {
                    MsgType::StoreAppend => {
                        for entry in &msg.entries {
                            let pos = (entry.index - 1) as usize;
                            node.store.truncate(pos);
                            node.store.push(entry.clone());
                        }
                        local.push(Message {
                            msg_type: MsgType::StoreAppendResp,
                            index: msg.index,
                            ..Default::default()
                        });
                    },
                    MsgType::ApplyLogs => {
                        let applied_size: u64 = msg.entries.iter().map(Entry::size).sum();
                        local.push(Message {
                            msg_type: MsgType::ApplyLogsResp,
                            index: msg.committed_index,
                            applied_size,
                            ..Default::default()
                        });
                    },
                    MsgType::SyncGet => {
                        let entries: Vec<Entry> = node
                            .store
                            .iter()
                            .filter(|e| e.index >= msg.index)
                            .cloned()
                            .collect();
                        local.push(Message {
                            msg_type: MsgType::SyncGetResp,
                            to: msg.to,
                            index: msg.index,
                            entries,
                            ..Default::default()
                        });
                    },
                    _ => wire.push((msg.to, msg.clone())),
                }
            }
            for msg in local {
                let _ = node.replica.step(msg);
            }
        }

        for (to, msg) in wire {
            if let Some(target) = self.nodes.get_mut(&to) {
                if target.alive {
                    let _ = target.replica.step(msg);
                }
            }
        }
    }

    fn run_until(&mut self, max_rounds: usize, mut check: impl FnMut(&Cluster) -> bool) -> bool {
        for _ in 0..max_rounds {
            self.round();
            if check(self) {
                return true;
            }
        }
        false
    }
}

#[test]
fn test_three_node_election_and_replication() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    assert!(
        cluster.run_until(500, |c| c.leader().is_some()),
        "no leader elected"
    );
    let leader_id = cluster.leader().unwrap();

    // Exactly one leader in the elected term.
    let term = cluster.nodes[&leader_id].replica.term();
    let leaders = cluster
        .nodes
        .values()
        .filter(|n| n.replica.is_leader() && n.replica.term() == term)
        .count();
    assert_eq!(leaders, 1);

    // Propose through the leader and wait for cluster-wide commit.
    let payloads = [b"m1".as_slice(), b"m2", b"m3"];
    {
        let node = cluster.nodes.get_mut(&leader_id).unwrap();
        for p in payloads {
            node.replica.propose(vec![Bytes::copy_from_slice(p)]).unwrap();
        }
    }
    assert!(
        cluster.run_until(500, |c| {
            c.nodes
                .values()
                .all(|n| n.replica.log.committed_index == 3)
        }),
        "entries did not commit everywhere"
    );

    // Log monotonicity holds on every node.
    for node in cluster.nodes.values() {
        assert!(node.replica.log.applied_index <= node.replica.log.committed_index);
        assert!(node.replica.log.committed_index <= node.replica.log.last_log_index);
    }
}

#[test]
fn test_leader_failover_preserves_log() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    assert!(cluster.run_until(500, |c| c.leader().is_some()));
    let old_leader = cluster.leader().unwrap();
    let old_term = cluster.nodes[&old_leader].replica.term();

    {
        let node = cluster.nodes.get_mut(&old_leader).unwrap();
        for i in 0..5u8 {
            node.replica
                .propose(vec![Bytes::copy_from_slice(&[i])])
                .unwrap();
        }
    }
    assert!(cluster.run_until(500, |c| {
        c.nodes
            .values()
            .filter(|n| n.alive)
            .all(|n| n.replica.log.committed_index == 5)
    }));

    cluster.kill(old_leader);

    // A survivor takes over in a higher term.
    assert!(
        cluster.run_until(2000, |c| {
            c.leader()
                .map(|id| id != old_leader && c.nodes[&id].replica.term() > old_term)
                .unwrap_or(false)
        }),
        "no failover leader emerged"
    );
    let new_leader = cluster.leader().unwrap();

    // Committed entries survived and no sequence number is reissued: the
    // next proposal lands at index 6.
    let node = cluster.nodes.get_mut(&new_leader).unwrap();
    assert_eq!(node.replica.log.committed_index, 5);
    let index = node
        .replica
        .propose(vec![Bytes::from_static(b"after")])
        .unwrap();
    assert_eq!(index, 6);

    assert!(cluster.run_until(500, |c| {
        c.nodes
            .values()
            .filter(|n| n.alive)
            .all(|n| n.replica.log.committed_index == 6)
    }));
}

#[test]
fn test_learner_syncs_and_promotes() {
    let mut cluster = Cluster::new(&[1]);
    // Single node: leader immediately. Attach a learner out-of-band.
    let learner = Replica::new(ReplicaOptions {
        node_id: 4,
        group: "harness-4".into(),
        replicas: vec![1],
        learners: vec![4],
        ..Default::default()
    });
    assert_eq!(learner.role(), Role::Learner);
    cluster.nodes.insert(
        4,
        Node {
            replica: learner,
            store: Vec::new(),
            alive: true,
        },
    );
    {
        let node = cluster.nodes.get_mut(&1).unwrap();
        // The leader's own config must know about the learner.
        node.replica
            .step(Message {
                msg_type: MsgType::InitResp,
                config: Some(wrn_replica::GroupConfig {
                    version: 1,
                    term: node.replica.term(),
                    leader: 1,
                    replicas: vec![1],
                    learners: vec![4],
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();
        for i in 0..3u8 {
            node.replica
                .propose(vec![Bytes::copy_from_slice(&[i])])
                .unwrap();
        }
    }

    // The learner catches up and is promoted to follower; quorum widens.
    assert!(
        cluster.run_until(1000, |c| {
            c.nodes[&4].replica.role() == Role::Follower
                && c.nodes[&4].replica.log.last_log_index == 3
        }),
        "learner did not promote"
    );
    assert!(cluster.nodes[&1]
        .replica
        .config()
        .replicas
        .contains(&4));
}
