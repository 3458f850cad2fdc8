// Network module
//
// Peer bookkeeping, the transport used to reach peers and the
// synchronizer that keeps this node in step with them

pub mod client;
pub mod peers;
pub mod sync;

pub use client::HttpPeerClient;
pub use peers::NodeList;
pub use sync::{QuorumPolicy, Synchronizer};
