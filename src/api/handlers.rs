use std::str::FromStr;

use actix_web::{web, HttpResponse, Responder};
use log::debug;
use serde::de::DeserializeOwned;

use crate::blockchain::{Address, ChainTip};
use crate::mining::Miner;
use crate::network::Synchronizer;

use super::schema::{
    AddBlockRequest, AddTransactionRequest, BlocksResponse, JoinRequest, NodeListResponse,
    PendingResponse, SubmissionResponse, SupplyResponse, UtxosResponse,
};

/// Everything the handlers share
pub struct NodeState {
    pub miner: Miner,
    pub sync: Synchronizer,
}

pub type NodeData = web::Data<NodeState>;

/// Parses a submission body; malformed input is answered rather than rejected
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Option<T> {
    match serde_json::from_slice(body) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!("Malformed request body: {}", e);
            None
        }
    }
}

/// Parses a `{pk}` path segment into an address
fn parse_address(pk: &str) -> Result<Address, HttpResponse> {
    Address::from_str(pk).map_err(|e| {
        HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!("Invalid public key {}: {}", pk, e)
        }))
    })
}

fn submission(successful: bool) -> HttpResponse {
    HttpResponse::Ok().json(SubmissionResponse { successful })
}

/// Get the total supply
///
/// Sum of every unspent output on the canonical chain
#[utoipa::path(
    get,
    path = "/supply",
    responses(
        (status = 200, description = "Total supply", body = SupplyResponse)
    )
)]
pub async fn get_supply(state: NodeData) -> impl Responder {
    let supply = state.miner.ledger().read().await.supply();
    HttpResponse::Ok().json(SupplyResponse { supply })
}

/// Get the supply held by an address
#[utoipa::path(
    get,
    path = "/supply/{pk}",
    params(("pk" = String, Path, description = "Base58 public key")),
    responses(
        (status = 200, description = "Supply held by the address", body = SupplyResponse),
        (status = 400, description = "Not a valid public key")
    )
)]
pub async fn get_supply_for(state: NodeData, pk: web::Path<String>) -> HttpResponse {
    let address = match parse_address(&pk) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let supply = state.miner.ledger().read().await.supply_for(&address);
    HttpResponse::Ok().json(SupplyResponse { supply })
}

/// Get the UTXO set
#[utoipa::path(
    get,
    path = "/utxos",
    responses(
        (status = 200, description = "Every unspent output", body = UtxosResponse)
    )
)]
pub async fn get_utxos(state: NodeData) -> impl Responder {
    let utxos = state.miner.ledger().read().await.utxos();
    HttpResponse::Ok().json(UtxosResponse { utxos })
}

/// Get the unspent outputs owned by an address
#[utoipa::path(
    get,
    path = "/utxos/{pk}",
    params(("pk" = String, Path, description = "Base58 public key")),
    responses(
        (status = 200, description = "Unspent outputs of the address", body = UtxosResponse),
        (status = 400, description = "Not a valid public key")
    )
)]
pub async fn get_utxos_for(state: NodeData, pk: web::Path<String>) -> HttpResponse {
    let address = match parse_address(&pk) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let utxos = state.miner.ledger().read().await.utxos_for(&address);
    HttpResponse::Ok().json(UtxosResponse { utxos })
}

/// Get the canonical chain
///
/// Returns the blocks from genesis to the tip
#[utoipa::path(
    get,
    path = "/blocks",
    responses(
        (status = 200, description = "Canonical chain, height ascending", body = BlocksResponse)
    )
)]
pub async fn get_blocks(state: NodeData) -> impl Responder {
    let blocks = state.miner.ledger().read().await.canonical_chain();
    HttpResponse::Ok().json(BlocksResponse { blocks })
}

/// Get a slice of the canonical chain
///
/// Both bounds are inclusive heights
#[utoipa::path(
    get,
    path = "/blocks/{start}/{end}",
    params(
        ("start" = i64, Path, description = "First height"),
        ("end" = i64, Path, description = "Last height")
    ),
    responses(
        (status = 200, description = "Blocks in the range", body = BlocksResponse),
        (status = 400, description = "Range outside the canonical chain")
    )
)]
pub async fn get_block_range(state: NodeData, range: web::Path<(i64, i64)>) -> impl Responder {
    let (start, end) = range.into_inner();

    match state.miner.ledger().read().await.block_range(start, end) {
        Some(blocks) => HttpResponse::Ok().json(BlocksResponse { blocks }),
        None => HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!("Range {}..={} is outside the canonical chain", start, end)
        })),
    }
}

/// Get the canonical tip
///
/// Height and header hash are null while the chain is empty
#[utoipa::path(
    get,
    path = "/latestblock",
    responses(
        (status = 200, description = "Canonical tip", body = ChainTip)
    )
)]
pub async fn get_latest_block(state: NodeData) -> impl Responder {
    let tip = state.miner.ledger().read().await.latest_metadata();
    HttpResponse::Ok().json(tip)
}

/// Get the known peers
#[utoipa::path(
    get,
    path = "/nodelist",
    responses(
        (status = 200, description = "Known peer addresses", body = NodeListResponse)
    )
)]
pub async fn get_node_list(state: NodeData) -> impl Responder {
    HttpResponse::Ok().json(NodeListResponse {
        nodes: state.sync.nodes().nodes(),
    })
}

/// Get the pending pool
///
/// Also reports what the miner is doing right now
#[utoipa::path(
    get,
    path = "/pendingtxs",
    responses(
        (status = 200, description = "Pending transactions", body = PendingResponse)
    )
)]
pub async fn get_pending_transactions(state: NodeData) -> impl Responder {
    let transactions = state.miner.pending_transactions().await;
    HttpResponse::Ok().json(PendingResponse {
        transactions,
        miner_state: state.miner.state().to_string(),
    })
}

/// Submit a transaction
///
/// Accepted transactions join the pending pool and are relayed to peers
#[utoipa::path(
    post,
    path = "/addtx",
    request_body = AddTransactionRequest,
    responses(
        (status = 200, description = "Whether the transaction was accepted", body = SubmissionResponse)
    )
)]
pub async fn add_transaction(state: NodeData, body: web::Bytes) -> impl Responder {
    let tx = match parse_body::<AddTransactionRequest>(&body) {
        Some(request) => request.transact,
        None => return submission(false),
    };

    let accepted = state.miner.add_transaction(tx.clone()).await;
    if accepted {
        let sync = state.sync.clone();
        actix_web::rt::spawn(async move {
            sync.broadcast_transaction(&tx).await;
        });
    }

    submission(accepted)
}

/// Submit a block
///
/// Accepted blocks restart mining and are relayed to peers
#[utoipa::path(
    post,
    path = "/addblock",
    request_body = AddBlockRequest,
    responses(
        (status = 200, description = "Whether the block was accepted", body = SubmissionResponse)
    )
)]
pub async fn add_block(state: NodeData, body: web::Bytes) -> impl Responder {
    let block = match parse_body::<AddBlockRequest>(&body) {
        Some(request) => request.block,
        None => return submission(false),
    };

    let accepted = state.miner.submit_block(block.clone()).await;
    if accepted {
        let sync = state.sync.clone();
        actix_web::rt::spawn(async move {
            sync.broadcast_block(&block).await;
        });
    }

    submission(accepted)
}

/// Register a peer
///
/// Rejects malformed addresses, known peers and this node's own address
#[utoipa::path(
    post,
    path = "/join",
    request_body = JoinRequest,
    responses(
        (status = 200, description = "Whether the peer was added", body = SubmissionResponse)
    )
)]
pub async fn join(state: NodeData, body: web::Bytes) -> impl Responder {
    let added = match parse_body::<JoinRequest>(&body) {
        Some(request) => state.sync.nodes().add(&request.node),
        None => false,
    };

    submission(added)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use actix_web::{test, App};
    use serde_json::{json, Value};

    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::test_utils::{build_block, transfer};
    use crate::blockchain::{Keypair, Ledger};
    use crate::mining::MinerConfig;
    use crate::network::{HttpPeerClient, NodeList, QuorumPolicy};

    const OWN: &str = "127.0.0.1:3000";

    /// Node state with no peers, so relays go nowhere
    fn node_state() -> NodeData {
        let (miner, _mined) = Miner::new(
            Ledger::new(0).into_shared(),
            Keypair::generate(),
            MinerConfig {
                block_reward: 50,
                difficulty: 0,
            },
        );
        let client = Arc::new(HttpPeerClient::new(Duration::from_secs(1)).unwrap());
        let sync = Synchronizer::new(client, NodeList::new(OWN), miner.clone(), QuorumPolicy::default());
        web::Data::new(NodeState { miner, sync })
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(App::new().app_data($state.clone()).configure(configure_routes)).await
        };
    }

    #[actix_web::test]
    async fn test_empty_node() {
        let state = node_state();
        let app = app!(state);

        let tip: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/latestblock").to_request()).await;
        assert_eq!(tip, json!({ "height": null, "headerHash": null }));

        let supply: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/supply").to_request()).await;
        assert_eq!(supply, json!({ "supply": 0 }));

        let blocks: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/blocks").to_request()).await;
        assert_eq!(blocks, json!({ "blocks": [] }));

        let pending: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/pendingtxs").to_request()).await;
        assert_eq!(pending, json!({ "transactions": [], "minerState": "idle" }));
    }

    #[actix_web::test]
    async fn test_add_block_and_query() {
        let state = node_state();
        let app = app!(state);
        let alice = Keypair::generate();
        let genesis = build_block(None, &alice, Vec::new(), 50);

        let request = test::TestRequest::post()
            .uri("/addblock")
            .set_json(AddBlockRequest { block: genesis.clone() })
            .to_request();
        let response: SubmissionResponse = test::call_and_read_body_json(&app, request).await;
        assert!(response.successful);

        // The same block again is a duplicate.
        let request = test::TestRequest::post()
            .uri("/addblock")
            .set_json(AddBlockRequest { block: genesis.clone() })
            .to_request();
        let response: SubmissionResponse = test::call_and_read_body_json(&app, request).await;
        assert!(!response.successful);

        let tip: ChainTip = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/latestblock").to_request()).await;
        assert_eq!(tip.height, Some(0));
        assert_eq!(tip.header_hash, Some(genesis.hash()));

        let uri = format!("/supply/{}", alice.address());
        let supply: SupplyResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(supply.supply, 50);

        let uri = format!("/utxos/{}", alice.address());
        let utxos: UtxosResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(utxos.utxos.len(), 1);
        assert_eq!(utxos.utxos[0].tx_hash, genesis.txs[0].hash());

        let range: BlocksResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/blocks/0/0").to_request()).await;
        assert_eq!(range.blocks, vec![genesis]);
    }

    #[actix_web::test]
    async fn test_invalid_public_key() {
        let state = node_state();
        let app = app!(state);

        for uri in ["/supply/not-a-key", "/utxos/0OIl"] {
            let response = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(response.status(), 400, "{}", uri);
        }

        let uri = format!("/supply/{}", Keypair::generate().address());
        let supply: SupplyResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(supply.supply, 0);
    }

    #[actix_web::test]
    async fn test_block_range_out_of_bounds() {
        let state = node_state();
        let app = app!(state);

        for uri in ["/blocks/0/0", "/blocks/-1/0", "/blocks/1/0"] {
            let response = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(response.status(), 400, "{}", uri);
        }
    }

    #[actix_web::test]
    async fn test_add_transaction() {
        let state = node_state();
        let app = app!(state);
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let genesis = build_block(None, &alice, Vec::new(), 50);
        assert!(state.miner.submit_block(genesis.clone()).await);

        let tx = transfer(&alice, &genesis.txs[0], 0, &[(&bob, 50)]);
        let request = test::TestRequest::post()
            .uri("/addtx")
            .set_json(AddTransactionRequest { transact: tx.clone() })
            .to_request();
        let response: SubmissionResponse = test::call_and_read_body_json(&app, request).await;
        assert!(response.successful);

        // Spending the same output twice is a conflict with the pool.
        let again = transfer(&alice, &genesis.txs[0], 0, &[(&bob, 50)]);
        let request = test::TestRequest::post()
            .uri("/addtx")
            .set_json(AddTransactionRequest { transact: again })
            .to_request();
        let response: SubmissionResponse = test::call_and_read_body_json(&app, request).await;
        assert!(!response.successful);

        let pending: PendingResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/pendingtxs").to_request()).await;
        assert_eq!(pending.transactions, vec![tx]);
    }

    #[actix_web::test]
    async fn test_malformed_bodies() {
        let state = node_state();
        let app = app!(state);

        for uri in ["/addtx", "/addblock", "/join"] {
            let request = test::TestRequest::post()
                .uri(uri)
                .insert_header(("content-type", "application/json"))
                .set_payload("{\"not\": \"what you expect\"")
                .to_request();
            let response: SubmissionResponse = test::call_and_read_body_json(&app, request).await;
            assert!(!response.successful, "{}", uri);
        }
    }

    #[actix_web::test]
    async fn test_large_body_is_answered() {
        let state = node_state();
        let app = app!(state);

        let body = format!("{{\"block\": \"{}\"}}", "x".repeat(512 * 1024));
        let request = test::TestRequest::post()
            .uri("/addblock")
            .insert_header(("content-type", "application/json"))
            .set_payload(body)
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 200);

        let response: SubmissionResponse = test::read_body_json(response).await;
        assert!(!response.successful);
    }

    #[actix_web::test]
    async fn test_join() {
        let state = node_state();
        let app = app!(state);

        for (node, expected) in [("10.0.0.2:3000", true), ("10.0.0.2:3000", false), (OWN, false), ("nonsense", false)] {
            let request = test::TestRequest::post()
                .uri("/join")
                .set_json(JoinRequest { node: node.to_string() })
                .to_request();
            let response: SubmissionResponse = test::call_and_read_body_json(&app, request).await;
            assert_eq!(response.successful, expected, "{}", node);
        }

        let nodes: NodeListResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/nodelist").to_request()).await;
        assert_eq!(nodes.nodes, vec!["10.0.0.2:3000".to_string()]);
    }
}
