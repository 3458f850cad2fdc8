use std::sync::Arc;

use dashmap::DashSet;
use rand::seq::SliceRandom;

/// The set of known peer addresses (`ip:port`)
#[derive(Debug, Clone)]
pub struct NodeList {
    nodes: Arc<DashSet<String>>,

    /// This node's own advertised address; never accepted as a peer
    own_address: String,
}

impl NodeList {
    pub fn new(own_address: impl Into<String>) -> Self {
        NodeList {
            nodes: Arc::new(DashSet::new()),
            own_address: own_address.into(),
        }
    }

    pub fn own_address(&self) -> &str {
        &self.own_address
    }

    /// A node is valid when it has the `host:port` shape and is neither
    /// already known nor this node itself
    pub fn is_valid_node(&self, node: &str) -> bool {
        is_well_formed(node) && node != self.own_address && !self.nodes.contains(node)
    }

    /// Registers a node if it is valid
    ///
    /// # Returns
    ///
    /// Whether the node was newly added
    pub fn add(&self, node: &str) -> bool {
        self.is_valid_node(node) && self.nodes.insert(node.to_string())
    }

    /// All known nodes, sorted
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.nodes.iter().map(|node| node.key().clone()).collect();
        nodes.sort();
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Up to `count` distinct nodes chosen at random
    pub fn sample(&self, count: usize) -> Vec<String> {
        let nodes = self.nodes();
        nodes
            .choose_multiple(&mut rand::thread_rng(), count)
            .cloned()
            .collect()
    }
}

fn is_well_formed(node: &str) -> bool {
    match node.split_once(':') {
        Some((host, port)) => !host.is_empty() && !port.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}
