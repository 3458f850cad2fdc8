use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::api::schema::{
    AddBlockRequest, AddTransactionRequest, BlocksResponse, JoinRequest, NodeListResponse,
    SubmissionResponse,
};
use crate::blockchain::{Block, ChainTip, Transaction};

/// Errors that can occur while talking to a peer
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Request to {node} failed: {source}")]
    Http {
        node: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("{node} answered with status {status}")]
    Status { node: String, status: u16 },

    #[error("{node} sent an unusable answer: {reason}")]
    BadResponse { node: String, reason: String },
}

/// The reads and writes this node performs against a peer
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn node_list(&self, node: &str) -> Result<Vec<String>, NetworkError>;

    /// Announces `own_address` to `node`
    async fn join(&self, node: &str, own_address: &str) -> Result<bool, NetworkError>;

    async fn latest_block(&self, node: &str) -> Result<ChainTip, NetworkError>;

    /// Canonical blocks `start..=end` as seen by `node`
    async fn block_range(&self, node: &str, start: u64, end: u64) -> Result<Vec<Block>, NetworkError>;

    async fn send_block(&self, node: &str, block: &Block) -> Result<bool, NetworkError>;

    async fn send_transaction(&self, node: &str, tx: &Transaction) -> Result<bool, NetworkError>;
}

/// [`PeerClient`] over the node's own HTTP API
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    http: Client,
}

impl HttpPeerClient {
    /// Every request made through this client gives up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(HttpPeerClient { http })
    }

    async fn get<T: DeserializeOwned>(&self, node: &str, path: &str) -> Result<T, NetworkError> {
        let response = self
            .http
            .get(format!("http://{}{}", node, path))
            .send()
            .await
            .map_err(|e| classify(node, e))?;

        decode(node, response).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        node: &str,
        path: &str,
        body: &B,
    ) -> Result<T, NetworkError> {
        let response = self
            .http
            .post(format!("http://{}{}", node, path))
            .json(body)
            .send()
            .await
            .map_err(|e| classify(node, e))?;

        decode(node, response).await
    }
}

fn classify(node: &str, error: reqwest::Error) -> NetworkError {
    if error.is_timeout() {
        NetworkError::Timeout(node.to_string())
    } else {
        NetworkError::Http {
            node: node.to_string(),
            source: error,
        }
    }
}

async fn decode<T: DeserializeOwned>(node: &str, response: reqwest::Response) -> Result<T, NetworkError> {
    let status = response.status();
    if !status.is_success() {
        return Err(NetworkError::Status {
            node: node.to_string(),
            status: status.as_u16(),
        });
    }

    response.json::<T>().await.map_err(|e| NetworkError::BadResponse {
        node: node.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn node_list(&self, node: &str) -> Result<Vec<String>, NetworkError> {
        let response: NodeListResponse = self.get(node, "/nodelist").await?;
        Ok(response.nodes)
    }

    async fn join(&self, node: &str, own_address: &str) -> Result<bool, NetworkError> {
        let body = JoinRequest {
            node: own_address.to_string(),
        };
        let response: SubmissionResponse = self.post(node, "/join", &body).await?;
        Ok(response.successful)
    }

    async fn latest_block(&self, node: &str) -> Result<ChainTip, NetworkError> {
        self.get(node, "/latestblock").await
    }

    async fn block_range(&self, node: &str, start: u64, end: u64) -> Result<Vec<Block>, NetworkError> {
        let response: BlocksResponse = self.get(node, &format!("/blocks/{}/{}", start, end)).await?;
        Ok(response.blocks)
    }

    async fn send_block(&self, node: &str, block: &Block) -> Result<bool, NetworkError> {
        let body = AddBlockRequest {
            block: block.clone(),
        };
        let response: SubmissionResponse = self.post(node, "/addblock", &body).await?;
        Ok(response.successful)
    }

    async fn send_transaction(&self, node: &str, tx: &Transaction) -> Result<bool, NetworkError> {
        let body = AddTransactionRequest { transact: tx.clone() };
        let response: SubmissionResponse = self.post(node, "/addtx", &body).await?;
        Ok(response.successful)
    }
}
