use wrn_core::NodeId;

/// One recipient partition: the uids whose user-leader is `node_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePartition {
    pub node_id: NodeId,
    pub uids: Vec<String>,
}

/// Materialised subscriber list with node-locality hints, cached on the
/// channel handler and rebuilt when membership changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tag {
    pub members: Vec<String>,
    pub partitions: Vec<NodePartition>,
}

impl Tag {
    pub fn build(members: Vec<String>, leader_of: impl Fn(&str) -> NodeId) -> Self {
        let mut partitions: Vec<NodePartition> = Vec::new();
        for uid in &members {
            let node_id = leader_of(uid);
            match partitions.iter_mut().find(|p| p.node_id == node_id) {
                Some(partition) => partition.uids.push(uid.clone()),
                None => partitions.push(NodePartition {
                    node_id,
                    uids: vec![uid.clone()],
                }),
            }
        }
        Self {
            members,
            partitions,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_build_partitions_by_leader() {
        let members = vec!["u1".to_string(), "u2".into(), "u3".into(), "u4".into()];
        let tag = Tag::build(members, |uid| if uid == "u3" { 2 } else { 1 });
        assert_eq!(tag.partitions.len(), 2);
        let node1 = tag.partitions.iter().find(|p| p.node_id == 1).unwrap();
        assert_eq!(node1.uids, vec!["u1", "u2", "u4"]);
        let node2 = tag.partitions.iter().find(|p| p.node_id == 2).unwrap();
        assert_eq!(node2.uids, vec!["u3"]);
    }

    #[test]
    fn test_empty_tag() {
        let tag = Tag::build(Vec::new(), |_| 1);
        assert!(tag.is_empty());
        assert!(tag.partitions.is_empty());
    }
}
