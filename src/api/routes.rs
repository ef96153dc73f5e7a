use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(handlers::status))
        .route("/status", web::get().to(handlers::status))
        .route("/health", web::get().to(handlers::health))
        .route("/block/current", web::get().to(handlers::current_block))
        .route("/block/{index}", web::get().to(handlers::block_by_index))
        .route("/share/submit", web::post().to(handlers::submit_share))
        .route("/blockchain", web::get().to(handlers::full_chain))
        .route("/blockchain/info", web::get().to(handlers::chain_info))
        .route("/blockchain/height", web::get().to(handlers::chain_height))
        .route("/blockchain/reset", web::post().to(handlers::reset_chain))
        .route("/coins", web::get().to(handlers::list_coins))
        // registered before /coins/{coin_id} so these names are not taken as ids
        .route("/coins/stats", web::get().to(handlers::coin_stats))
        .route("/coins/import", web::post().to(handlers::import_coin))
        .route("/coins/combine-payload", web::post().to(handlers::combine_payload))
        .route("/coins/combine", web::post().to(handlers::combine_coins))
        .route("/coins/{coin_id}", web::get().to(handlers::export_coin))
        .route("/coins/{coin_id}/transfer-payload", web::get().to(handlers::transfer_payload))
        .route("/coins/{coin_id}/transfer", web::post().to(handlers::transfer_coin))
        .route("/coins/{coin_id}/split-payload", web::get().to(handlers::split_payload))
        .route("/coins/{coin_id}/split", web::post().to(handlers::split_coin))
        .route("/balance/{pubkey}", web::get().to(handlers::balance))
        .route("/mining/status", web::get().to(handlers::mining_status))
        .route("/mining/start", web::post().to(handlers::start_mining))
        .route("/mining/stop", web::post().to(handlers::stop_mining));
}
