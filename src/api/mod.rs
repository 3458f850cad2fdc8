// API module
//
// The HTTP surface served to peers and clients

pub mod handlers;
pub mod routes;
pub mod schema;

// Re-export main components for easier access
pub use handlers::{NodeData, NodeState};
pub use routes::configure_routes;
