//! Test fixtures and helpers.
//!
//! A [`TestNode`] is a [`LocalNode`] with a peer name. Nodes are wired with
//! [`connect_pair`] and exchange messages synchronously through
//! [`deliver_all`], so multi-node scenarios run without a runtime.

use std::sync::Arc;

use covalue::core::{AllowAll, CoValueId, CoValueType, PeerId, Ruleset, SignerSecret};
use covalue::store::{MemoryStorage, Storage};
use covalue::sync::{PeerRole, SyncManager, SyncMessage};
use covalue::{LocalNode, NodeConfig};

/// Rounds [`deliver_all`] runs before giving up on a chatty exchange.
const MAX_ROUNDS: usize = 1000;

/// A local node addressed by a peer name.
pub struct TestNode {
    pub peer: PeerId,
    pub node: LocalNode,
}

impl TestNode {
    /// Node enforcing group rules, with a deterministic agent from `seed`.
    pub fn new(name: &str, seed: u8) -> Self {
        Self::with_config(name, seed, None, NodeConfig::default())
    }

    /// Node backed by `storage`.
    pub fn with_storage(name: &str, seed: u8, storage: Arc<dyn Storage>) -> Self {
        Self::with_config(name, seed, Some(storage), NodeConfig::default())
    }

    pub fn with_config(
        name: &str,
        seed: u8,
        storage: Option<Arc<dyn Storage>>,
        config: NodeConfig,
    ) -> Self {
        Self {
            peer: PeerId::from(name),
            node: LocalNode::with_group_rules(SignerSecret::from_seed(&[seed; 32]), storage, config),
        }
    }

    /// Node accepting every correctly signed transaction.
    pub fn allow_all(name: &str, seed: u8) -> Self {
        Self {
            peer: PeerId::from(name),
            node: LocalNode::new(
                SignerSecret::from_seed(&[seed; 32]),
                None,
                Box::new(AllowAll),
                NodeConfig::default(),
            ),
        }
    }

    pub fn manager(&self) -> &SyncManager {
        self.node.sync()
    }

    /// An unowned map anyone may write to.
    pub fn create_map(&mut self) -> covalue::Result<CoValueId> {
        self.node
            .create_covalue(CoValueType::Map, Ruleset::UnsafeAllowAll, None)
    }

    /// An unowned list anyone may write to.
    pub fn create_list(&mut self) -> covalue::Result<CoValueId> {
        self.node
            .create_covalue(CoValueType::List, Ruleset::UnsafeAllowAll, None)
    }
}

impl std::fmt::Debug for TestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestNode").field("peer", &self.peer).finish()
    }
}

/// Fresh in-memory storage.
pub fn memory_storage() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new())
}

/// Connect `client` to `server`: the client treats the server as a
/// persistent server peer, the server sees a client.
pub fn connect_pair(server: &mut TestNode, client: &mut TestNode) {
    server
        .node
        .sync_mut()
        .add_peer(client.peer.clone(), PeerRole::Client, false);
    client
        .node
        .sync_mut()
        .add_peer(server.peer.clone(), PeerRole::Server, true);
}

/// A message in flight between two test nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: PeerId,
    pub to: PeerId,
    pub message: SyncMessage,
}

/// Deliver everything currently queued, once. Returns what was delivered.
///
/// Messages addressed to a peer outside `nodes` are dropped, like sends on
/// a closed link.
pub fn step(nodes: &mut [&mut TestNode]) -> Vec<Delivery> {
    let mut in_flight = Vec::new();
    for node in nodes.iter_mut() {
        let from = node.peer.clone();
        for (to, message) in node.node.sync_mut().take_outgoing() {
            in_flight.push(Delivery {
                from: from.clone(),
                to,
                message,
            });
        }
    }

    let mut delivered = Vec::with_capacity(in_flight.len());
    for delivery in in_flight {
        if let Some(target) = nodes.iter_mut().find(|n| n.peer == delivery.to) {
            let _ = target
                .node
                .sync_mut()
                .handle_message(&delivery.from, delivery.message.clone());
            delivered.push(delivery);
        }
    }
    for node in nodes.iter_mut() {
        node.node.sync_mut().flush_notifications();
    }
    delivered
}

/// Deliver until no node has anything left to send. Returns the message count.
///
/// # Panics
///
/// If the nodes are still talking after a thousand rounds.
pub fn deliver_all(nodes: &mut [&mut TestNode]) -> usize {
    let mut total = 0;
    for _ in 0..MAX_ROUNDS {
        let delivered = step(nodes);
        if delivered.is_empty() && nodes.iter().all(|n| quiet(n.manager())) {
            return total;
        }
        total += delivered.len();
    }
    panic!("nodes still exchanging messages after {MAX_ROUNDS} rounds");
}

fn quiet(manager: &SyncManager) -> bool {
    manager
        .peer_ids()
        .filter_map(|id| manager.peer(id))
        .all(|peer| peer.pending() == 0)
}

/// Nodes with distinct deterministic agents, named `node-0`, `node-1`, ...
pub fn multi_party(count: usize) -> Vec<TestNode> {
    (0..count)
        .map(|i| TestNode::new(&format!("node-{i}"), i as u8 + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue::core::map_set;
    use covalue::Privacy;
    use serde_json::json;

    #[test]
    fn test_pair_syncs_on_load() {
        let mut server = TestNode::new("server", 1);
        let mut client = TestNode::new("client", 2);
        connect_pair(&mut server, &mut client);

        let id = server.create_map().unwrap();
        server
            .node
            .make_transaction(&id, &[map_set("hello", json!("world"))], Privacy::Trusting)
            .unwrap();

        client.node.load(id);
        let delivered = deliver_all(&mut [&mut server, &mut client]);
        assert!(delivered > 0);
        assert_eq!(client.node.known_state(&id), server.node.known_state(&id));
    }

    #[test]
    fn test_messages_to_strangers_are_dropped() {
        let mut lonely = TestNode::new("lonely", 1);
        lonely
            .node
            .sync_mut()
            .add_peer(PeerId::from("gone"), PeerRole::Server, false);
        lonely.node.load(CoValueId::from_bytes([3; 32]));

        let delivered = step(&mut [&mut lonely]);
        assert!(delivered.is_empty());
    }

    #[test]
    fn test_multi_party_names() {
        let nodes = multi_party(3);
        let names: Vec<&str> = nodes.iter().map(|n| n.peer.as_str()).collect();
        assert_eq!(names, vec!["node-0", "node-1", "node-2"]);
        assert_ne!(nodes[0].node.session(), nodes[1].node.session());
    }
}
