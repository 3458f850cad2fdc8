use actix_web::web;

use super::handlers;

/// Largest request body accepted, well above actix's 256 KiB default
const MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_PAYLOAD_BYTES))
        .route("/supply", web::get().to(handlers::get_supply))
        .route("/supply/{pk}", web::get().to(handlers::get_supply_for))
        .route("/utxos", web::get().to(handlers::get_utxos))
        .route("/utxos/{pk}", web::get().to(handlers::get_utxos_for))
        .route("/blocks", web::get().to(handlers::get_blocks))
        .route("/blocks/{start}/{end}", web::get().to(handlers::get_block_range))
        .route("/latestblock", web::get().to(handlers::get_latest_block))
        .route("/nodelist", web::get().to(handlers::get_node_list))
        .route("/pendingtxs", web::get().to(handlers::get_pending_transactions))
        .route("/addtx", web::post().to(handlers::add_transaction))
        .route("/addblock", web::post().to(handlers::add_block))
        .route("/join", web::post().to(handlers::join));
}
