use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;
mod mining;
mod network;

use blockchain::{Keypair, Ledger};
use config::{Cli, NodeConfig};
use mining::{Miner, MinerConfig};
use network::{HttpPeerClient, NodeList, Synchronizer};

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_supply,
        api::handlers::get_supply_for,
        api::handlers::get_utxos,
        api::handlers::get_utxos_for,
        api::handlers::get_blocks,
        api::handlers::get_block_range,
        api::handlers::get_latest_block,
        api::handlers::get_node_list,
        api::handlers::get_pending_transactions,
        api::handlers::add_transaction,
        api::handlers::add_block,
        api::handlers::join
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::BlockHeader,
            blockchain::Transaction,
            blockchain::TxInput,
            blockchain::TxOutput,
            blockchain::Utxo,
            blockchain::ChainTip,
            blockchain::Address,
            blockchain::DigitalSignature,
            api::schema::SupplyResponse,
            api::schema::UtxosResponse,
            api::schema::BlocksResponse,
            api::schema::NodeListResponse,
            api::schema::PendingResponse,
            api::schema::AddTransactionRequest,
            api::schema::AddBlockRequest,
            api::schema::JoinRequest,
            api::schema::SubmissionResponse
        )
    ),
    tags(
        (name = "node", description = "UTXO node API endpoints")
    ),
    info(
        title = "UTXO Node API",
        version = "1.0.0",
        description = "A proof-of-work UTXO node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

fn load_keypair(config: &NodeConfig) -> anyhow::Result<Keypair> {
    match &config.miner_secret_key {
        Some(secret) => Keypair::from_secret_hex(secret).context("Invalid miner_secret_key"),
        None => {
            let keypair = Keypair::generate();
            info!("Generated miner key, secret {}", keypair.secret_hex());
            Ok(keypair)
        }
    }
}

fn open_ledger(config: &NodeConfig) -> anyhow::Result<Ledger> {
    match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
            let ledger = Ledger::with_storage(dir, config.difficulty)
                .with_context(|| format!("Failed to open block store at {}", dir.display()))?;
            info!("Using block store at {}", dir.display());
            Ok(ledger)
        }
        None => {
            info!("No data_dir configured, keeping blocks in memory");
            Ok(Ledger::new(config.difficulty))
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    let config = NodeConfig::load(&cli)?;

    let keypair = load_keypair(&config)?;
    info!("Miner address: {}", keypair.address());

    let ledger = open_ledger(&config)?.into_shared();
    let (miner, mined) = Miner::new(
        ledger,
        keypair,
        MinerConfig {
            block_reward: config.block_reward,
            difficulty: config.difficulty,
        },
    );

    let own_address = config.advertised_address();
    let nodes = NodeList::new(own_address.clone());
    let client = HttpPeerClient::new(config.request_timeout()).context("Failed to build HTTP client")?;
    let sync = Synchronizer::new(Arc::new(client), nodes, miner.clone(), config.quorum_policy());

    if let Some(seed) = &config.seed_node {
        sync.bootstrap(seed).await;
    }

    if config.mining {
        tokio::spawn(miner.clone().run());
    } else {
        info!("Mining disabled");
    }
    tokio::spawn(sync.clone().relay_mined(mined));
    tokio::spawn(sync.clone().run(config.sync_interval()));

    let state = web::Data::new(api::NodeState { miner, sync });

    info!("Starting HTTP server at http://{}:{} (advertised as {})", config.host, config.port, own_address);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.port))
    .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?
    .run()
    .await?;

    Ok(())
}
