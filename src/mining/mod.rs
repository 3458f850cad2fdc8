// Mining module
//
// The pending transaction pool and the orchestrator that turns it into blocks

pub mod miner;
pub mod pool;

pub use miner::{Miner, MinerConfig};
