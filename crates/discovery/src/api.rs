//! The operator-facing discovery façade.
//!
//! Thin, synchronous wrappers over [`NodeTable`], speaking KNI strings at
//! the boundary. Batch arguments are comma-separated KNI lists; a parse
//! error anywhere fails the whole call before anything is applied.

use std::sync::Arc;

use crate::node::{Kni, Node, NodeId, NodeType};
use crate::table::NodeTable;
use crate::Result;

/// Discovery API surface wrapped by the `bootnode` RPC namespace.
#[derive(Clone)]
pub struct DiscoveryApi {
    table: Arc<NodeTable>,
}

impl DiscoveryApi {
    pub fn new(table: Arc<NodeTable>) -> Self {
        Self { table }
    }

    /// The local node's KNI.
    pub fn name(&self) -> String {
        self.table.self_node().kni().to_string()
    }

    /// Underlying table handle.
    pub fn table(&self) -> &Arc<NodeTable> {
        &self.table
    }

    /// Up to K nearest nodes of `ntype` around `target`.
    pub fn lookup(&self, target: NodeId, ntype: NodeType) -> Vec<Node> {
        self.table.lookup(target, ntype)
    }

    /// The single best match, if any.
    pub fn resolve(&self, target: NodeId, ntype: NodeType) -> Option<Node> {
        self.table.resolve(target, ntype)
    }

    /// Uniform random sample of `n` live nodes.
    pub fn read_random_nodes(&self, n: usize, ntype: NodeType) -> Vec<Node> {
        self.table.read_random_nodes(n, ntype)
    }

    /// Parses a comma-separated KNI list; any failure fails the batch.
    fn parse_kni_batch(urls: &str) -> Result<Vec<Node>> {
        urls.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Kni::parse)
            .collect()
    }

    /// Snapshot of the authorized-node ACL as KNI strings.
    pub fn get_authorized_nodes(&self) -> Vec<String> {
        self.table
            .authorized_nodes()
            .into_iter()
            .map(|node| node.kni().to_string())
            .collect()
    }

    /// Adds the given comma-separated KNIs to the ACL.
    pub fn put_authorized_nodes(&self, urls: &str) -> Result<()> {
        let nodes = Self::parse_kni_batch(urls)?;
        self.table.put_authorized_nodes(nodes);
        Ok(())
    }

    /// Removes the given comma-separated KNIs from the ACL.
    pub fn delete_authorized_nodes(&self, urls: &str) -> Result<()> {
        let nodes = Self::parse_kni_batch(urls)?;
        self.table.delete_authorized_nodes(&nodes);
        Ok(())
    }

    /// Inserts or refreshes a node in the persistent DB.
    pub fn create_update_node_on_db(&self, url: &str) -> Result<()> {
        let node = Kni::parse(url)?;
        self.table.create_update_on_db(node);
        Ok(())
    }

    /// Inserts or refreshes a node in the live table.
    pub fn create_update_node_on_table(&self, url: &str) -> Result<()> {
        let node = Kni::parse(url)?;
        self.table.create_update_on_table(node);
        Ok(())
    }

    /// Deletes a node from the persistent DB.
    pub fn delete_node_from_db(&self, url: &str) -> Result<()> {
        let node = Kni::parse(url)?;
        if self.table.delete_from_db(&node.id) {
            Ok(())
        } else {
            Err(crate::DiscoveryError::NodeNotFound)
        }
    }

    /// Deletes a node from the live table.
    pub fn delete_node_from_table(&self, url: &str) -> Result<()> {
        let node = Kni::parse(url)?;
        if self.table.delete_from_table(&node.id) {
            Ok(())
        } else {
            Err(crate::DiscoveryError::NodeNotFound)
        }
    }

    /// Fetches a node from the persistent DB by id.
    pub fn get_node_from_db(&self, id: NodeId) -> Result<Node> {
        self.table.get_from_db(&id).ok_or(crate::DiscoveryError::NodeNotFound)
    }

    /// Every live table entry.
    pub fn get_table_entries(&self) -> Vec<Node> {
        self.table.table_entries()
    }

    /// Every replacement-list entry.
    pub fn get_table_replacements(&self) -> Vec<Node> {
        self.table.table_replacements()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn api() -> DiscoveryApi {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let self_node = Node::new(NodeId::random(), ip, 32323, 32323, NodeType::Bn);
        DiscoveryApi::new(Arc::new(NodeTable::new(self_node)))
    }

    fn kni(ntype: NodeType) -> String {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        Node::new(NodeId::random(), ip, 32323, 32323, ntype).kni().to_string()
    }

    #[test]
    fn test_name_is_own_kni() {
        let api = api();
        assert!(api.name().starts_with("kni://"));
    }

    #[test]
    fn test_acl_batch_roundtrip() {
        let api = api();
        let a = kni(NodeType::Cn);
        let b = kni(NodeType::Pn);

        api.put_authorized_nodes(&format!("{a},{b}")).unwrap();
        assert_eq!(api.get_authorized_nodes().len(), 2);

        api.delete_authorized_nodes(&a).unwrap();
        let left = api.get_authorized_nodes();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0], b);
    }

    #[test]
    fn test_acl_batch_is_all_or_nothing() {
        let api = api();
        let good = kni(NodeType::Cn);
        let batch = format!("{good},kni://broken");
        assert!(api.put_authorized_nodes(&batch).is_err());
        assert!(api.get_authorized_nodes().is_empty());
    }

    #[test]
    fn test_db_and_table_maintenance() {
        let api = api();
        let url = kni(NodeType::En);
        let node = Kni::parse(&url).unwrap();

        api.create_update_node_on_db(&url).unwrap();
        assert_eq!(api.get_node_from_db(node.id).unwrap().id, node.id);

        api.create_update_node_on_table(&url).unwrap();
        assert_eq!(api.get_table_entries().len(), 1);

        api.delete_node_from_table(&url).unwrap();
        assert!(api.get_table_entries().is_empty());
        assert!(api.delete_node_from_table(&url).is_err());

        api.delete_node_from_db(&url).unwrap();
        assert!(api.get_node_from_db(node.id).is_err());
    }

    #[test]
    fn test_lookup_and_resolve_via_api() {
        let api = api();
        let url = kni(NodeType::Cn);
        let node = Kni::parse(&url).unwrap();
        api.create_update_node_on_table(&url).unwrap();

        assert_eq!(api.lookup(node.id, NodeType::Cn).len(), 1);
        assert_eq!(api.resolve(node.id, NodeType::Cn).unwrap().id, node.id);
        assert_eq!(api.read_random_nodes(5, NodeType::Cn).len(), 1);
    }
}
