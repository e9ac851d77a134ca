//! The node table: per-type live entries with replacement lists, the
//! persistent node DB, and the authorized-node ACL.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::node::{Node, NodeId, NodeType};

/// Maximum live entries kept per node type.
pub const BUCKET_SIZE: usize = 16;

/// Maximum replacement candidates kept per node type.
pub const MAX_REPLACEMENTS: usize = 10;

/// Nearest-neighbour count returned by lookups.
pub const LOOKUP_SIZE: usize = 16;

#[derive(Default)]
struct TypeBucket {
    entries: Vec<Node>,
    replacements: Vec<Node>,
}

struct Inner {
    buckets: HashMap<NodeType, TypeBucket>,
    db: HashMap<NodeId, Node>,
    authorized: Vec<Node>,
}

/// Cluster membership state.
///
/// Reads take a snapshot under the lock; mutation batches are atomic.
/// Network revalidation of entries is the owning transport's concern.
pub struct NodeTable {
    self_node: Node,
    inner: RwLock<Inner>,
}

impl NodeTable {
    pub fn new(self_node: Node) -> Self {
        Self {
            self_node,
            inner: RwLock::new(Inner {
                buckets: HashMap::new(),
                db: HashMap::new(),
                authorized: Vec::new(),
            }),
        }
    }

    /// The local node's own record.
    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    /// Up to [`LOOKUP_SIZE`] entries of `ntype` closest to `target`.
    pub fn lookup(&self, target: NodeId, ntype: NodeType) -> Vec<Node> {
        let inner = self.inner.read();
        let mut entries: Vec<Node> = inner
            .buckets
            .get(&ntype)
            .map(|b| b.entries.clone())
            .unwrap_or_default();
        entries.sort_by_key(|node| std::cmp::Reverse(node.id.proximity(&target)));
        entries.truncate(LOOKUP_SIZE);
        entries
    }

    /// The single closest match for `target`, by exact id when present.
    pub fn resolve(&self, target: NodeId, ntype: NodeType) -> Option<Node> {
        let inner = self.inner.read();
        if let Some(node) = inner.db.get(&target) {
            return Some(node.clone());
        }
        drop(inner);
        self.lookup(target, ntype).into_iter().find(|node| node.id == target)
    }

    /// A uniformly random sample of up to `n` live entries of `ntype`.
    pub fn read_random_nodes(&self, n: usize, ntype: NodeType) -> Vec<Node> {
        let inner = self.inner.read();
        let mut entries: Vec<Node> = inner
            .buckets
            .get(&ntype)
            .map(|b| b.entries.clone())
            .unwrap_or_default();
        drop(inner);
        entries.shuffle(&mut rand::thread_rng());
        entries.truncate(n);
        entries
    }

    /// Live entries of `ntype`, up to `max` (zero means all).
    pub fn get_nodes(&self, ntype: NodeType, max: usize) -> Vec<Node> {
        let inner = self.inner.read();
        let mut entries: Vec<Node> = inner
            .buckets
            .get(&ntype)
            .map(|b| b.entries.clone())
            .unwrap_or_default();
        if max > 0 {
            entries.truncate(max);
        }
        entries
    }

    /// Inserts or refreshes `node` in the live table. A full bucket sends
    /// the node to the replacement list instead.
    pub fn create_update_on_table(&self, node: Node) {
        let mut inner = self.inner.write();
        let bucket = inner.buckets.entry(node.ntype).or_default();

        if let Some(existing) = bucket.entries.iter_mut().find(|n| n.id == node.id) {
            *existing = node;
            return;
        }
        if bucket.entries.len() < BUCKET_SIZE {
            debug!(target: "kestrel::discovery", id = %node.id, ntype = node.ntype.as_str(), "node added to table");
            bucket.entries.push(node);
            return;
        }
        bucket.replacements.retain(|n| n.id != node.id);
        bucket.replacements.insert(0, node);
        bucket.replacements.truncate(MAX_REPLACEMENTS);
    }

    /// Removes `id` from the live table, promoting a replacement if one
    /// is waiting.
    pub fn delete_from_table(&self, id: &NodeId) -> bool {
        let mut inner = self.inner.write();
        for bucket in inner.buckets.values_mut() {
            let before = bucket.entries.len();
            bucket.entries.retain(|n| n.id != *id);
            if bucket.entries.len() != before {
                if let Some(promoted) = bucket.replacements.pop() {
                    bucket.entries.push(promoted);
                }
                return true;
            }
        }
        false
    }

    /// Inserts or refreshes `node` in the persistent node DB.
    pub fn create_update_on_db(&self, node: Node) {
        self.inner.write().db.insert(node.id, node);
    }

    /// Removes `id` from the node DB.
    pub fn delete_from_db(&self, id: &NodeId) -> bool {
        self.inner.write().db.remove(id).is_some()
    }

    /// Fetches `id` from the node DB.
    pub fn get_from_db(&self, id: &NodeId) -> Option<Node> {
        self.inner.read().db.get(id).cloned()
    }

    /// Every live table entry across node types.
    pub fn table_entries(&self) -> Vec<Node> {
        let inner = self.inner.read();
        inner.buckets.values().flat_map(|b| b.entries.clone()).collect()
    }

    /// Every replacement candidate across node types.
    pub fn table_replacements(&self) -> Vec<Node> {
        let inner = self.inner.read();
        inner.buckets.values().flat_map(|b| b.replacements.clone()).collect()
    }

    /// Snapshot of the authorized-node list, in insertion order.
    pub fn authorized_nodes(&self) -> Vec<Node> {
        self.inner.read().authorized.clone()
    }

    /// Adds `nodes` to the ACL, ignoring ids already present.
    pub fn put_authorized_nodes(&self, nodes: Vec<Node>) {
        let mut inner = self.inner.write();
        for node in nodes {
            if !inner.authorized.iter().any(|n| n.id == node.id) {
                inner.authorized.push(node);
            }
        }
    }

    /// Removes `nodes` from the ACL by id.
    pub fn delete_authorized_nodes(&self, nodes: &[Node]) {
        let mut inner = self.inner.write();
        inner.authorized.retain(|n| !nodes.iter().any(|d| d.id == n.id));
    }

    /// True when `id` may complete a bonding handshake.
    pub fn is_authorized(&self, id: &NodeId) -> bool {
        self.inner.read().authorized.iter().any(|n| n.id == *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn node(ntype: NodeType) -> Node {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        Node::new(NodeId::random(), ip, 32323, 32323, ntype)
    }

    fn table() -> NodeTable {
        NodeTable::new(node(NodeType::Bn))
    }

    #[test]
    fn test_create_update_and_lookup() {
        let table = table();
        let n = node(NodeType::Cn);
        table.create_update_on_table(n.clone());

        let found = table.lookup(n.id, NodeType::Cn);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, n.id);
        // Other types see nothing.
        assert!(table.lookup(n.id, NodeType::En).is_empty());
    }

    #[test]
    fn test_update_replaces_entry_in_place() {
        let table = table();
        let mut n = node(NodeType::Cn);
        table.create_update_on_table(n.clone());
        n.tcp = 40404;
        table.create_update_on_table(n.clone());

        let entries = table.table_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tcp, 40404);
    }

    #[test]
    fn test_overflow_goes_to_replacements() {
        let table = table();
        for _ in 0..BUCKET_SIZE {
            table.create_update_on_table(node(NodeType::Cn));
        }
        let extra = node(NodeType::Cn);
        table.create_update_on_table(extra.clone());

        assert_eq!(table.get_nodes(NodeType::Cn, 0).len(), BUCKET_SIZE);
        assert_eq!(table.table_replacements().len(), 1);
        assert_eq!(table.table_replacements()[0].id, extra.id);
    }

    #[test]
    fn test_delete_promotes_replacement() {
        let table = table();
        let mut first = None;
        for i in 0..BUCKET_SIZE {
            let n = node(NodeType::Cn);
            if i == 0 {
                first = Some(n.clone());
            }
            table.create_update_on_table(n);
        }
        table.create_update_on_table(node(NodeType::Cn)); // replacement

        assert!(table.delete_from_table(&first.unwrap().id));
        assert_eq!(table.get_nodes(NodeType::Cn, 0).len(), BUCKET_SIZE);
        assert!(table.table_replacements().is_empty());
    }

    #[test]
    fn test_resolve_prefers_db() {
        let table = table();
        let n = node(NodeType::Pn);
        table.create_update_on_db(n.clone());
        assert_eq!(table.resolve(n.id, NodeType::Pn).unwrap().id, n.id);
        assert!(table.resolve(NodeId::random(), NodeType::Pn).is_none());
    }

    #[test]
    fn test_db_crud() {
        let table = table();
        let n = node(NodeType::En);
        table.create_update_on_db(n.clone());
        assert_eq!(table.get_from_db(&n.id).unwrap().id, n.id);
        assert!(table.delete_from_db(&n.id));
        assert!(!table.delete_from_db(&n.id));
        assert!(table.get_from_db(&n.id).is_none());
    }

    #[test]
    fn test_read_random_nodes_bounds() {
        let table = table();
        for _ in 0..5 {
            table.create_update_on_table(node(NodeType::Cn));
        }
        assert_eq!(table.read_random_nodes(3, NodeType::Cn).len(), 3);
        assert_eq!(table.read_random_nodes(100, NodeType::Cn).len(), 5);
    }

    #[test]
    fn test_authorized_list_is_a_set_in_order() {
        let table = table();
        let a = node(NodeType::Cn);
        let b = node(NodeType::Cn);

        table.put_authorized_nodes(vec![a.clone(), b.clone(), a.clone()]);
        let acl = table.authorized_nodes();
        assert_eq!(acl.len(), 2);
        assert_eq!(acl[0].id, a.id);
        assert!(table.is_authorized(&a.id));

        table.delete_authorized_nodes(&[a.clone()]);
        assert!(!table.is_authorized(&a.id));
        assert!(table.is_authorized(&b.id));
    }

    #[test]
    fn test_lookup_returns_nearest_first() {
        let table = table();
        let target = NodeId::random();
        for _ in 0..BUCKET_SIZE {
            table.create_update_on_table(node(NodeType::Cn));
        }
        let found = table.lookup(target, NodeType::Cn);
        for pair in found.windows(2) {
            assert!(pair[0].id.proximity(&target) >= pair[1].id.proximity(&target));
        }
    }
}
