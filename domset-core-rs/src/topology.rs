//! Group membership and role assignment
//!
//! A node's group is itself plus its direct non-bridge neighbors. The node
//! with the lowest id in that set is the group master. Roles are fixed for
//! the lifetime of the controller; there is no re-election.

use crate::types::{casu_name, parse_casu_id, NodeId, Role};
use std::collections::BTreeSet;
use tracing::warn;

/// Static per-node view of its group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    my_id: NodeId,
    /// Non-bridge neighbor ids, sorted, never containing `my_id`
    neighbors: BTreeSet<NodeId>,
    role: Role,
    master_id: NodeId,
}

impl Topology {
    /// Compute the group view from this node's id and its neighbor ids
    pub fn new(my_id: NodeId, neighbor_ids: impl IntoIterator<Item = NodeId>) -> Self {
        let neighbors: BTreeSet<NodeId> = neighbor_ids
            .into_iter()
            .filter(|id| *id != my_id)
            .collect();

        let master_id = neighbors
            .iter()
            .next()
            .map_or(my_id, |lowest| (*lowest).min(my_id));

        let role = if master_id == my_id {
            Role::Master
        } else {
            Role::Slave
        };

        Self {
            my_id,
            neighbors,
            role,
            master_id,
        }
    }

    /// Build from peer names as listed in the node's deployment file.
    ///
    /// Names containing `bridge_tag` are the cross-species bridge and are
    /// not group members. Names without a numeric suffix are skipped.
    pub fn from_peer_names<'a>(
        my_id: NodeId,
        names: impl IntoIterator<Item = &'a str>,
        bridge_tag: &str,
    ) -> Self {
        let ids = names.into_iter().filter_map(|name| {
            if name.contains(bridge_tag) {
                return None;
            }
            let id = parse_casu_id(name);
            if id.is_none() {
                warn!("Topology: Ignoring peer with unparseable name {}", name);
            }
            id
        });
        Self::new(my_id, ids)
    }

    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Id of the group master (this node if master)
    pub fn master_id(&self) -> NodeId {
        self.master_id
    }

    /// Peer name of the group master
    pub fn master_name(&self) -> String {
        casu_name(self.master_id)
    }

    /// 1 + number of neighbors
    pub fn group_size(&self) -> usize {
        1 + self.neighbors.len()
    }

    /// Neighbor ids in ascending order
    pub fn neighbors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.neighbors.iter().copied()
    }

    pub fn is_neighbor(&self, id: NodeId) -> bool {
        self.neighbors.contains(&id)
    }
}
