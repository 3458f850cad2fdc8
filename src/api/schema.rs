// Request and response bodies shared by the HTTP handlers and the peer client

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::{Block, Transaction, Utxo};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SupplyResponse {
    pub supply: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UtxosResponse {
    pub utxos: Vec<Utxo>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BlocksResponse {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NodeListResponse {
    pub nodes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingResponse {
    pub transactions: Vec<Transaction>,

    /// idle, assembling or searching
    pub miner_state: String,
}

/// Body of `POST /addtx`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddTransactionRequest {
    pub transact: Transaction,
}

/// Body of `POST /addblock`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddBlockRequest {
    pub block: Block,
}

/// Body of `POST /join`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JoinRequest {
    pub node: String,
}

/// Outcome of every submission endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmissionResponse {
    pub successful: bool,
}
