use std::sync::Arc;
use std::time::Instant;

use actix_web::{http::StatusCode, web, HttpResponse, Responder};
use log::{error, info, warn};

use super::schema::{
    BalanceResponse, CoinImportRequest, CoinListQuery, CoinListResponse, CoinResponse, CombinePayloadRequest,
    CombineRequest, FailureResponse, HealthResponse, HeightResponse, MessageResponse, PayloadResponse,
    SplitPayloadQuery, SplitRequest, SplitResponse, StatusResponse, SubmitShareRequest, SubmitShareResponse,
    TransferPayloadQuery, TransferPayloadResponse, TransferRequest,
};
use crate::blockchain::params::units_to_coins;
use crate::blockchain::{Blockchain, Coin, CoinError, Digest, DigitalSignature, PublicKey, ShareError, ShareReceipt};
use crate::mining::MiningControl;

/// Shared state of the HTTP handlers
pub struct AppState {
    pub chain: Arc<Blockchain>,

    /// Whether `POST /blockchain/reset` is honoured
    pub enable_reset: bool,

    pub started: Instant,

    /// The node's own miner, when it serves the ledger locally
    pub mining: Option<Arc<MiningControl>>,
}

impl AppState {
    pub fn new(chain: Arc<Blockchain>, enable_reset: bool) -> Self {
        AppState {
            chain,
            enable_reset,
            started: Instant::now(),
            mining: None,
        }
    }

    pub fn with_mining(mut self, mining: Arc<MiningControl>) -> Self {
        self.mining = Some(mining);
        self
    }
}

/// Data structure for the node state
pub type NodeData = web::Data<AppState>;

fn failure(status: StatusCode, reason: &str, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(FailureResponse::new(reason, message))
}

fn internal(err: impl std::fmt::Display) -> HttpResponse {
    error!("Request failed: {}", err);
    failure(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

fn coin_json(coin: &Coin) -> serde_json::Value {
    serde_json::to_value(coin).unwrap_or_default()
}

fn payload_response(payload: &[u8]) -> HttpResponse {
    HttpResponse::Ok().json(PayloadResponse {
        payload_hex: hex::encode(payload),
        payload: String::from_utf8_lossy(payload).into_owned(),
    })
}

fn parse_pubkey(raw: &str) -> Result<PublicKey, HttpResponse> {
    raw.parse()
        .map_err(|e| failure(StatusCode::BAD_REQUEST, "invalid_pubkey", format!("Invalid public key: {}", e)))
}

fn accepted(receipt: &ShareReceipt, message: &str) -> HttpResponse {
    HttpResponse::Ok().json(SubmitShareResponse {
        success: true,
        message: message.to_string(),
        share_index: receipt.share.share_index,
        is_block_find: receipt.is_block_find,
        bonus_shares: receipt.bonus_shares,
        coin_data: receipt.coin.as_ref().map(coin_json),
        bonus_coin_data: receipt.bonus_coin.as_ref().map(coin_json),
    })
}

/// Maps a share rejection onto a status code
///
/// A duplicate from the miner that recorded it is answered with the original
/// receipt, so resubmitting after a lost response is harmless.
fn share_rejected(err: ShareError, miner: &PublicKey) -> HttpResponse {
    let status = match &err {
        ShareError::DuplicateShare(receipt) if receipt.share.miner_pubkey == *miner => {
            return accepted(receipt, "Share already recorded");
        }
        ShareError::StaleTemplate { .. } | ShareError::DuplicateShare(_) | ShareError::SharesExhausted { .. } => {
            StatusCode::CONFLICT
        }
        ShareError::InvalidProof | ShareError::InsufficientDifficulty { .. } | ShareError::InvalidPubkey(_) => {
            StatusCode::BAD_REQUEST
        }
        ShareError::Internal(e) => return internal(e),
    };

    failure(status, err.reason(), err.to_string())
}

fn coin_rejected(err: CoinError) -> HttpResponse {
    let (status, reason) = match &err {
        CoinError::UnknownCoin(_) => (StatusCode::NOT_FOUND, "unknown_coin"),
        CoinError::AlreadySpent(_) => (StatusCode::CONFLICT, "already_spent"),
        CoinError::InvalidSignature(_) => (StatusCode::BAD_REQUEST, "invalid_signature"),
        CoinError::InvalidProvenance(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_provenance"),
        CoinError::Malformed(_) => (StatusCode::BAD_REQUEST, "malformed"),
        CoinError::Crypto(_) => (StatusCode::BAD_REQUEST, "invalid_signature"),
        CoinError::SupplyCapExceeded { .. } => (StatusCode::CONFLICT, "supply_cap_exceeded"),
        CoinError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        CoinError::Storage(_) => return internal(&err),
    };

    failure(status, reason, err.to_string())
}

/// Get the node status
///
/// Returns the node name, chain height and current difficulties
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, description = "Node status", body = StatusResponse),
        (status = 500, description = "Internal server error", body = FailureResponse)
    )
)]
pub async fn status(node: NodeData) -> impl Responder {
    match node.chain.info() {
        Ok(info) => HttpResponse::Ok().json(StatusResponse {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            blockchain_height: info.height,
            share_difficulty: info.share_difficulty,
            block_difficulty: info.block_difficulty,
            shares_per_block: info.shares_per_block,
            share_value: info.share_value,
            share_value_coins: units_to_coins(info.share_value),
            block_reward: info.block_reward,
            block_reward_coins: units_to_coins(info.block_reward),
            consensus: info.consensus,
        }),
        Err(err) => internal(err),
    }
}

/// Get the current mining template
///
/// Miners hash `header` followed by the decimal nonce, salted with `previous_hash`
#[utoipa::path(
    get,
    path = "/block/current",
    responses(
        (status = 200, description = "Template of the open block", body = crate::blockchain::Template),
        (status = 500, description = "Internal server error", body = FailureResponse)
    )
)]
pub async fn current_block(node: NodeData) -> impl Responder {
    match node.chain.template() {
        Ok(template) => HttpResponse::Ok().json(template),
        Err(err) => internal(err),
    }
}

/// Get a block by index
///
/// Closed blocks and the open block, shares included
#[utoipa::path(
    get,
    path = "/block/{index}",
    params(
        ("index" = u64, Path, description = "Block index")
    ),
    responses(
        (status = 200, description = "The block"),
        (status = 404, description = "No block at that index", body = FailureResponse)
    )
)]
pub async fn block_by_index(node: NodeData, index: web::Path<u64>) -> impl Responder {
    let index = index.into_inner();
    match node.chain.block(index) {
        Ok(Some(block)) => HttpResponse::Ok().json(block),
        Ok(None) => failure(
            StatusCode::NOT_FOUND,
            "block_not_found",
            format!("No block at index {}", index),
        ),
        Err(err) => internal(err),
    }
}

/// Submit a share
///
/// Records the share and mints its coin. A share that also meets the block
/// difficulty closes the block and pays the finder the remaining slots.
#[utoipa::path(
    post,
    path = "/share/submit",
    request_body = SubmitShareRequest,
    responses(
        (status = 200, description = "Share accepted", body = SubmitShareResponse),
        (status = 400, description = "Invalid proof, difficulty or public key", body = FailureResponse),
        (status = 409, description = "Stale template, duplicate share or no slots left", body = FailureResponse),
        (status = 500, description = "Internal server error", body = FailureResponse)
    )
)]
pub async fn submit_share(node: NodeData, request: web::Json<SubmitShareRequest>) -> impl Responder {
    let request = request.into_inner();

    let miner = match parse_pubkey(&request.miner_pubkey) {
        Ok(key) => key,
        Err(response) => return response,
    };
    let hash: Digest = match request.hash.parse() {
        Ok(hash) => hash,
        Err(e) => return failure(StatusCode::BAD_REQUEST, "invalid_proof", format!("Invalid hash: {}", e)),
    };

    let chain = node.chain.clone();
    let submitter = miner.clone();
    let result = web::block(move || chain.submit_share(request.block_index, &submitter, request.nonce, hash)).await;

    match result {
        Ok(Ok(receipt)) => {
            let message = if receipt.is_block_find {
                format!("Block {} found", receipt.share.block_index)
            } else {
                "Share accepted".to_string()
            };
            accepted(&receipt, &message)
        }
        Ok(Err(err)) => share_rejected(err, &miner),
        Err(err) => internal(err),
    }
}

/// Get chain information
#[utoipa::path(
    get,
    path = "/blockchain/info",
    responses(
        (status = 200, description = "Chain summary", body = crate::blockchain::ChainInfo)
    )
)]
pub async fn chain_info(node: NodeData) -> impl Responder {
    match node.chain.info() {
        Ok(info) => HttpResponse::Ok().json(info),
        Err(err) => internal(err),
    }
}

/// Get the chain height
#[utoipa::path(
    get,
    path = "/blockchain/height",
    responses(
        (status = 200, description = "Index of the newest closed block", body = HeightResponse)
    )
)]
pub async fn chain_height(node: NodeData) -> impl Responder {
    match node.chain.height() {
        Ok(height) => HttpResponse::Ok().json(HeightResponse { height }),
        Err(err) => internal(err),
    }
}

/// Get the full chain
///
/// Closed blocks and the open block, as peers fetch them for chain selection
#[utoipa::path(
    get,
    path = "/blockchain",
    responses(
        (status = 200, description = "Closed blocks and the open block")
    )
)]
pub async fn full_chain(node: NodeData) -> impl Responder {
    match node.chain.snapshot() {
        Ok(state) => HttpResponse::Ok().json(state),
        Err(err) => internal(err),
    }
}

/// Reset the chain
///
/// Discards every block and coin. Only available when the node was started with resets enabled.
#[utoipa::path(
    post,
    path = "/blockchain/reset",
    responses(
        (status = 200, description = "Chain reset to genesis", body = MessageResponse),
        (status = 403, description = "Resets are disabled", body = FailureResponse)
    )
)]
pub async fn reset_chain(node: NodeData) -> impl Responder {
    if !node.enable_reset {
        warn!("Refused reset request; resets are disabled");
        return failure(StatusCode::FORBIDDEN, "forbidden", "Reset is disabled on this node");
    }

    let chain = node.chain.clone();
    match web::block(move || chain.reset()).await {
        Ok(Ok(())) => HttpResponse::Ok().json(MessageResponse {
            success: true,
            message: "Blockchain reset to genesis".to_string(),
        }),
        Ok(Err(err)) => internal(err),
        Err(err) => internal(err),
    }
}

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Node health", body = HealthResponse)
    )
)]
pub async fn health(node: NodeData) -> impl Responder {
    let chain_valid = node.chain.verify_links().unwrap_or(false);
    let height = node.chain.height().unwrap_or_default();

    HttpResponse::Ok().json(HealthResponse {
        status: if chain_valid { "ok" } else { "degraded" }.to_string(),
        chain_valid,
        height,
        uptime_secs: node.started.elapsed().as_secs(),
    })
}

/// List the coins of an owner
#[utoipa::path(
    get,
    path = "/coins",
    params(
        ("owner" = String, Query, description = "Hex-encoded public key of the owner"),
        ("include_spent" = Option<bool>, Query, description = "Include spent records")
    ),
    responses(
        (status = 200, description = "Coin records of the owner", body = CoinListResponse),
        (status = 400, description = "Invalid public key", body = FailureResponse)
    )
)]
pub async fn list_coins(node: NodeData, query: web::Query<CoinListQuery>) -> impl Responder {
    let owner = match parse_pubkey(&query.owner) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let coins = node.chain.coins().coins_of(&owner, query.include_spent);
    HttpResponse::Ok().json(CoinListResponse {
        owner: owner.to_string(),
        count: coins.len(),
        total_value: coins.iter().filter(|coin| !coin.is_spent()).map(|coin| coin.value).sum(),
        coins: coins.iter().map(coin_json).collect(),
    })
}

/// Get coin store statistics
#[utoipa::path(
    get,
    path = "/coins/stats",
    responses(
        (status = 200, description = "Record counts and supply figures")
    )
)]
pub async fn coin_stats(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.chain.coins().stats())
}

/// Export a coin
///
/// Returns the full record, history included, as another node would import it
#[utoipa::path(
    get,
    path = "/coins/{coin_id}",
    params(
        ("coin_id" = String, Path, description = "Coin identifier")
    ),
    responses(
        (status = 200, description = "The coin record"),
        (status = 404, description = "Unknown coin", body = FailureResponse)
    )
)]
pub async fn export_coin(node: NodeData, coin_id: web::Path<String>) -> impl Responder {
    match node.chain.coins().export(&coin_id) {
        Ok(exported) => HttpResponse::Ok().content_type("application/json").body(exported),
        Err(err) => coin_rejected(err),
    }
}

/// Import a coin
///
/// Replays the coin's history and admits it if every link verifies and every
/// mint it traces back to is a share recorded on this node's chain
#[utoipa::path(
    post,
    path = "/coins/import",
    request_body = CoinImportRequest,
    responses(
        (status = 200, description = "Coin admitted", body = CoinResponse),
        (status = 400, description = "Malformed record", body = FailureResponse),
        (status = 409, description = "Coin or an ancestor already spent", body = FailureResponse),
        (status = 422, description = "History does not verify or a mint is not on this chain", body = FailureResponse)
    )
)]
pub async fn import_coin(node: NodeData, request: web::Json<CoinImportRequest>) -> impl Responder {
    let serialized = request.into_inner().coin_data.to_string();
    let chain = node.chain.clone();

    match web::block(move || chain.import_coin(&serialized)).await {
        Ok(Ok(coin)) => HttpResponse::Ok().json(CoinResponse {
            success: true,
            message: "Coin imported".to_string(),
            coin_id: coin.coin_id.clone(),
            coin_data: coin_json(&coin),
        }),
        Ok(Err(err)) => coin_rejected(err),
        Err(err) => internal(err),
    }
}

/// Get the transfer payload of a coin
///
/// The current owner signs these bytes to hand the coin to `to`
#[utoipa::path(
    get,
    path = "/coins/{coin_id}/transfer-payload",
    params(
        ("coin_id" = String, Path, description = "Coin identifier"),
        ("to" = String, Query, description = "Hex-encoded public key of the recipient")
    ),
    responses(
        (status = 200, description = "Bytes to sign", body = TransferPayloadResponse),
        (status = 404, description = "Unknown coin", body = FailureResponse),
        (status = 409, description = "Coin already spent", body = FailureResponse)
    )
)]
pub async fn transfer_payload(
    node: NodeData,
    coin_id: web::Path<String>,
    query: web::Query<TransferPayloadQuery>,
) -> impl Responder {
    let to = match parse_pubkey(&query.to) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match node.chain.coins().transfer_payload(&coin_id, &to) {
        Ok(payload) => HttpResponse::Ok().json(TransferPayloadResponse {
            coin_id: coin_id.into_inner(),
            to: to.to_string(),
            payload_hex: hex::encode(&payload),
            payload: String::from_utf8_lossy(&payload).into_owned(),
        }),
        Err(err) => coin_rejected(err),
    }
}

/// Transfer a coin
///
/// Spends the coin and reissues its value to the recipient as a new record
#[utoipa::path(
    post,
    path = "/coins/{coin_id}/transfer",
    params(
        ("coin_id" = String, Path, description = "Coin identifier")
    ),
    request_body = TransferRequest,
    responses(
        (status = 200, description = "Coin reissued to the recipient", body = CoinResponse),
        (status = 400, description = "Invalid signature or public key", body = FailureResponse),
        (status = 404, description = "Unknown coin", body = FailureResponse),
        (status = 409, description = "Coin already spent", body = FailureResponse)
    )
)]
pub async fn transfer_coin(
    node: NodeData,
    coin_id: web::Path<String>,
    request: web::Json<TransferRequest>,
) -> impl Responder {
    let request = request.into_inner();
    let to = match parse_pubkey(&request.to_pubkey) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let chain = node.chain.clone();
    let source = coin_id.into_inner();
    let signature = DigitalSignature(request.signature);
    let spent = source.clone();

    match web::block(move || chain.coins().transfer(&spent, &to, signature)).await {
        Ok(Ok(coin)) => {
            info!("Coin {} reissued as {}", source, coin.coin_id);
            HttpResponse::Ok().json(CoinResponse {
                success: true,
                message: format!("Coin {} transferred", source),
                coin_id: coin.coin_id.clone(),
                coin_data: coin_json(&coin),
            })
        }
        Ok(Err(err)) => coin_rejected(err),
        Err(err) => internal(err),
    }
}

/// Get the split payload of a coin
///
/// The owner signs these bytes to cut the coin into `amounts`
#[utoipa::path(
    get,
    path = "/coins/{coin_id}/split-payload",
    params(
        ("coin_id" = String, Path, description = "Coin identifier"),
        ("amounts" = String, Query, description = "Comma-separated amounts in base units")
    ),
    responses(
        (status = 200, description = "Bytes to sign", body = PayloadResponse),
        (status = 400, description = "Amounts do not add up to the coin's value", body = FailureResponse),
        (status = 404, description = "Unknown coin", body = FailureResponse),
        (status = 409, description = "Coin already spent", body = FailureResponse)
    )
)]
pub async fn split_payload(
    node: NodeData,
    coin_id: web::Path<String>,
    query: web::Query<SplitPayloadQuery>,
) -> impl Responder {
    let amounts: Result<Vec<u64>, _> = query.amounts.split(',').map(|amount| amount.trim().parse()).collect();
    let amounts = match amounts {
        Ok(amounts) => amounts,
        Err(e) => return failure(StatusCode::BAD_REQUEST, "invalid_request", format!("Invalid amounts: {}", e)),
    };

    match node.chain.coins().split_payload(&coin_id, &amounts) {
        Ok(payload) => payload_response(&payload),
        Err(err) => coin_rejected(err),
    }
}

/// Split a coin
///
/// Spends the coin and issues one record per amount to the same owner
#[utoipa::path(
    post,
    path = "/coins/{coin_id}/split",
    params(
        ("coin_id" = String, Path, description = "Coin identifier")
    ),
    request_body = SplitRequest,
    responses(
        (status = 200, description = "Pieces issued", body = SplitResponse),
        (status = 400, description = "Invalid amounts or signature", body = FailureResponse),
        (status = 404, description = "Unknown coin", body = FailureResponse),
        (status = 409, description = "Coin already spent", body = FailureResponse)
    )
)]
pub async fn split_coin(node: NodeData, coin_id: web::Path<String>, request: web::Json<SplitRequest>) -> impl Responder {
    let request = request.into_inner();
    let chain = node.chain.clone();
    let source = coin_id.into_inner();
    let spent = source.clone();

    match web::block(move || chain.coins().split(&spent, &request.amounts, DigitalSignature(request.signature))).await {
        Ok(Ok(pieces)) => HttpResponse::Ok().json(SplitResponse {
            success: true,
            message: format!("Coin {} split into {} pieces", source, pieces.len()),
            coin_ids: pieces.iter().map(|piece| piece.coin_id.clone()).collect(),
            coins: pieces.iter().map(coin_json).collect(),
        }),
        Ok(Err(err)) => coin_rejected(err),
        Err(err) => internal(err),
    }
}

/// Get the combine payload for a set of coins
#[utoipa::path(
    post,
    path = "/coins/combine-payload",
    request_body = CombinePayloadRequest,
    responses(
        (status = 200, description = "Bytes to sign", body = PayloadResponse),
        (status = 400, description = "Fewer than two coins, a duplicate or a foreign coin", body = FailureResponse),
        (status = 404, description = "Unknown coin", body = FailureResponse),
        (status = 409, description = "A coin is already spent", body = FailureResponse)
    )
)]
pub async fn combine_payload(node: NodeData, request: web::Json<CombinePayloadRequest>) -> impl Responder {
    let owner = match parse_pubkey(&request.owner_pubkey) {
        Ok(key) => key,
        Err(response) => return response,
    };

    match node.chain.coins().combine_payload(&request.coin_ids, &owner) {
        Ok(payload) => payload_response(&payload),
        Err(err) => coin_rejected(err),
    }
}

/// Combine coins
///
/// Spends every listed coin and issues their total to the owner as one record
#[utoipa::path(
    post,
    path = "/coins/combine",
    request_body = CombineRequest,
    responses(
        (status = 200, description = "Combined coin issued", body = CoinResponse),
        (status = 400, description = "Invalid request or signature", body = FailureResponse),
        (status = 404, description = "Unknown coin", body = FailureResponse),
        (status = 409, description = "A coin is already spent", body = FailureResponse)
    )
)]
pub async fn combine_coins(node: NodeData, request: web::Json<CombineRequest>) -> impl Responder {
    let request = request.into_inner();
    let owner = match parse_pubkey(&request.owner_pubkey) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let chain = node.chain.clone();
    let coin_ids = request.coin_ids;
    let signature = DigitalSignature(request.signature);

    match web::block(move || chain.coins().combine(&coin_ids, &owner, signature)).await {
        Ok(Ok(coin)) => HttpResponse::Ok().json(CoinResponse {
            success: true,
            message: "Coins combined".to_string(),
            coin_id: coin.coin_id.clone(),
            coin_data: coin_json(&coin),
        }),
        Ok(Err(err)) => coin_rejected(err),
        Err(err) => internal(err),
    }
}

fn mining_control(node: &AppState) -> Result<&Arc<MiningControl>, HttpResponse> {
    node.mining.as_ref().ok_or_else(|| {
        failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "mining_unavailable",
            "This node has no local miner",
        )
    })
}

/// Get the state of the node's miner
#[utoipa::path(
    get,
    path = "/mining/status",
    responses(
        (status = 200, description = "Miner state and counters", body = crate::mining::MiningStatus),
        (status = 503, description = "No local miner", body = FailureResponse)
    )
)]
pub async fn mining_status(node: NodeData) -> impl Responder {
    match mining_control(&node) {
        Ok(mining) => HttpResponse::Ok().json(mining.status()),
        Err(response) => response,
    }
}

/// Start the node's miner
#[utoipa::path(
    post,
    path = "/mining/start",
    responses(
        (status = 200, description = "Mining started", body = MessageResponse),
        (status = 409, description = "Already mining", body = FailureResponse),
        (status = 503, description = "No local miner", body = FailureResponse)
    )
)]
pub async fn start_mining(node: NodeData) -> impl Responder {
    let mining = match mining_control(&node) {
        Ok(mining) => mining,
        Err(response) => return response,
    };

    if mining.start() {
        HttpResponse::Ok().json(MessageResponse {
            success: true,
            message: "Mining started".to_string(),
        })
    } else {
        failure(StatusCode::CONFLICT, "mining_active", "Mining is already running")
    }
}

/// Stop the node's miner
#[utoipa::path(
    post,
    path = "/mining/stop",
    responses(
        (status = 200, description = "Mining stopping", body = MessageResponse),
        (status = 409, description = "Not mining", body = FailureResponse),
        (status = 503, description = "No local miner", body = FailureResponse)
    )
)]
pub async fn stop_mining(node: NodeData) -> impl Responder {
    let mining = match mining_control(&node) {
        Ok(mining) => mining,
        Err(response) => return response,
    };

    if mining.stop() {
        HttpResponse::Ok().json(MessageResponse {
            success: true,
            message: "Mining stopped".to_string(),
        })
    } else {
        failure(StatusCode::CONFLICT, "mining_inactive", "Mining is not running")
    }
}

/// Get the balance of a public key
#[utoipa::path(
    get,
    path = "/balance/{pubkey}",
    params(
        ("pubkey" = String, Path, description = "Hex-encoded public key")
    ),
    responses(
        (status = 200, description = "Balance of the key", body = BalanceResponse),
        (status = 400, description = "Invalid public key", body = FailureResponse)
    )
)]
pub async fn balance(node: NodeData, pubkey: web::Path<String>) -> impl Responder {
    let owner = match parse_pubkey(&pubkey) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let coins = node.chain.coins();
    let balance = coins.balance(&owner);
    HttpResponse::Ok().json(BalanceResponse {
        address: owner.address().map(|address| address.to_string()).unwrap_or_default(),
        pubkey: owner.to_string(),
        balance,
        balance_coins: units_to_coins(balance),
        coins: coins.coins_of(&owner, false).len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::coin::MiningProof;
    use crate::blockchain::{ChainParams, CoinLedger, Template, Wallet};
    use crate::mining::engine::{search, CancelToken, MinerConfig, MinerStats};
    use crate::mining::LocalSink;
    use actix_web::{test, App};
    use serde_json::Value;

    fn node(enable_reset: bool) -> NodeData {
        let params = ChainParams::testing();
        let coins = Arc::new(CoinLedger::in_memory(params.max_supply));
        let chain = Arc::new(Blockchain::in_memory(params, coins).unwrap());
        web::Data::new(AppState::new(chain, enable_reset))
    }

    /// Finds a share for the open block
    fn find_share(chain: &Blockchain, base: u64) -> (Template, u64, Digest) {
        let template = chain.template().unwrap();
        let (nonce, hash) = search(
            chain.validator().engine(),
            template.header.as_bytes(),
            &template.previous_hash,
            template.share_difficulty,
            2,
            base,
            &CancelToken::new(),
            &MinerStats::default(),
        )
        .unwrap()
        .unwrap();
        (template, nonce, hash)
    }

    fn submission(miner: &PublicKey, template: &Template, nonce: u64, hash: &Digest) -> SubmitShareRequest {
        SubmitShareRequest {
            miner_pubkey: miner.to_string(),
            nonce,
            hash: hash.to_hex(),
            block_index: template.block_index,
        }
    }

    #[actix_web::test]
    async fn test_status_and_template() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;

        let status: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(status["name"], "blockshares");
        assert_eq!(status["blockchain_height"], 0);
        assert_eq!(status["shares_per_block"], 100);
        let share_value = status["share_value"].as_u64().unwrap();
        assert_eq!(status["share_value_coins"].as_f64().unwrap(), units_to_coins(share_value));
        let reward = status["block_reward"].as_u64().unwrap();
        assert_eq!(status["block_reward_coins"].as_f64().unwrap(), units_to_coins(reward));

        let template: Template =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/block/current").to_request()).await;
        assert_eq!(template.block_index, 1);
        assert_eq!(template.shares_remaining, 100);
        assert!(!template.is_closed);
    }

    #[actix_web::test]
    async fn test_submit_share_and_resubmit() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;
        let wallet = Wallet::new();
        let (template, nonce, hash) = find_share(&node.chain, 0);
        let body = submission(wallet.public_key(), &template, nonce, &hash);

        let req = test::TestRequest::post().uri("/share/submit").set_json(&body).to_request();
        let first: SubmitShareResponse = test::call_and_read_body_json(&app, req).await;
        assert!(first.success);
        assert_eq!(first.share_index, 0);
        let coin = first.coin_data.unwrap();
        assert_eq!(coin["owner_pubkey"], wallet.public_key().to_string());

        // same miner gets the original receipt back
        let req = test::TestRequest::post().uri("/share/submit").set_json(&body).to_request();
        let again: SubmitShareResponse = test::call_and_read_body_json(&app, req).await;
        assert!(again.success);
        assert_eq!(again.share_index, 0);
        assert_eq!(again.coin_data.unwrap()["coin_id"], coin["coin_id"]);

        // anyone else replaying it is refused
        let thief = Wallet::new();
        let stolen = submission(thief.public_key(), &template, nonce, &hash);
        let req = test::TestRequest::post().uri("/share/submit").set_json(&stolen).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert!(!failure.success);
        assert_eq!(failure.reason, "duplicate_share");
    }

    #[actix_web::test]
    async fn test_submit_share_rejections() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;
        let wallet = Wallet::new();
        let (template, nonce, hash) = find_share(&node.chain, 0);

        let mut stale = submission(wallet.public_key(), &template, nonce, &hash);
        stale.block_index = 7;
        let resp = test::call_service(&app, test::TestRequest::post().uri("/share/submit").set_json(&stale).to_request()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert_eq!(failure.reason, "stale_template");

        let forged = submission(wallet.public_key(), &template, nonce + 1, &hash);
        let resp = test::call_service(&app, test::TestRequest::post().uri("/share/submit").set_json(&forged).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert_eq!(failure.reason, "invalid_proof");

        let mut bad_key = submission(wallet.public_key(), &template, nonce, &hash);
        bad_key.miner_pubkey = "not-a-key".to_string();
        let resp = test::call_service(&app, test::TestRequest::post().uri("/share/submit").set_json(&bad_key).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert_eq!(failure.reason, "invalid_pubkey");

        // nothing was recorded
        assert_eq!(node.chain.template().unwrap().shares_claimed, 0);
    }

    #[actix_web::test]
    async fn test_reset_is_disabled_by_default() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;

        let resp = test::call_service(&app, test::TestRequest::post().uri("/blockchain/reset").to_request()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_reset_when_enabled() {
        let node = node(true);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;
        let wallet = Wallet::new();
        let (template, nonce, hash) = find_share(&node.chain, 0);
        node.chain
            .submit_share(template.block_index, wallet.public_key(), nonce, hash)
            .unwrap();

        let resp = test::call_service(&app, test::TestRequest::post().uri("/blockchain/reset").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let height: HeightResponse =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/blockchain/height").to_request()).await;
        assert_eq!(height.height, 0);
        assert_eq!(node.chain.template().unwrap().shares_claimed, 0);
        assert_eq!(node.chain.coins().balance(wallet.public_key()), 0);
    }

    #[actix_web::test]
    async fn test_health_and_full_chain() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;

        let health: HealthResponse =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(health.status, "ok");
        assert!(health.chain_valid);

        let chain: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/blockchain").to_request()).await;
        assert_eq!(chain["blocks"].as_array().unwrap().len(), 1);
        assert_eq!(chain["open"]["index"], 1);
    }

    #[actix_web::test]
    async fn test_coin_transfer_flow() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;
        let alice = Wallet::new();
        let bob = Wallet::new();

        let (template, nonce, hash) = find_share(&node.chain, 0);
        let receipt = node
            .chain
            .submit_share(template.block_index, alice.public_key(), nonce, hash)
            .unwrap();
        let coin = receipt.coin.unwrap();

        let uri = format!("/coins/{}/transfer-payload?to={}", coin.coin_id, bob.public_key());
        let payload: TransferPayloadResponse =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        let bytes = hex::decode(&payload.payload_hex).unwrap();

        // a signature by someone other than the owner is refused
        let forged = TransferRequest {
            to_pubkey: bob.public_key().to_string(),
            signature: bob.sign(&bytes).0,
        };
        let uri = format!("/coins/{}/transfer", coin.coin_id);
        let resp = test::call_service(&app, test::TestRequest::post().uri(&uri).set_json(&forged).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let signed = TransferRequest {
            to_pubkey: bob.public_key().to_string(),
            signature: alice.sign(&bytes).0,
        };
        let resp = test::call_service(&app, test::TestRequest::post().uri(&uri).set_json(&signed).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let moved: CoinResponse = test::read_body_json(resp).await;
        assert_eq!(moved.coin_data["owner_pubkey"], bob.public_key().to_string());

        let resp = test::call_service(&app, test::TestRequest::post().uri(&uri).set_json(&signed).to_request()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let uri = format!("/balance/{}", bob.public_key());
        let balance: BalanceResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(balance.balance, coin.value);
        assert_eq!(balance.coins, 1);
        assert_eq!(&balance.address, &bob.address().0);

        let uri = format!("/coins?owner={}&include_spent=true", alice.public_key());
        let listed: CoinListResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(listed.count, 1);
        assert_eq!(listed.total_value, 0);
    }

    #[actix_web::test]
    async fn test_unknown_coin() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/coins/COIN-missing").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert_eq!(failure.reason, "unknown_coin");
    }

    #[actix_web::test]
    async fn test_import_checks_the_chain() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;
        let wallet = Wallet::new();

        let (template, nonce, hash) = find_share(&node.chain, 0);
        let coin = node
            .chain
            .submit_share(template.block_index, wallet.public_key(), nonce, hash)
            .unwrap()
            .coin
            .unwrap();
        let exported: Value = serde_json::from_str(&node.chain.coins().export(&coin.coin_id).unwrap()).unwrap();

        let mut tampered = exported.clone();
        tampered["value"] = Value::from(coin.value * 2);
        let request = CoinImportRequest { coin_data: tampered };
        let resp = test::call_service(&app, test::TestRequest::post().uri("/coins/import").set_json(&request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        // a well-formed mint with no share behind it on this chain
        let proof = MiningProof {
            nonce: 1,
            hash: Digest::default(),
            share_difficulty: template.share_difficulty,
            block_difficulty: template.block_difficulty,
        };
        let fabricated = Coin::mint(wallet.public_key().clone(), coin.value, proof, 1, 5, false);
        let request = CoinImportRequest { coin_data: coin_json(&fabricated) };
        let resp = test::call_service(&app, test::TestRequest::post().uri("/coins/import").set_json(&request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert_eq!(failure.reason, "invalid_provenance");
        assert!(node.chain.coins().get(&fabricated.coin_id).is_none());

        let request = CoinImportRequest { coin_data: exported };
        let resp = test::call_service(&app, test::TestRequest::post().uri("/coins/import").set_json(&request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(node.chain.coins().balance(wallet.public_key()), coin.value);

        let stats: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/coins/stats").to_request()).await;
        assert_eq!(stats["unspent_records"], 1);
    }

    #[actix_web::test]
    async fn test_block_by_index() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;
        let wallet = Wallet::new();
        let (template, nonce, hash) = find_share(&node.chain, 0);
        node.chain
            .submit_share(template.block_index, wallet.public_key(), nonce, hash)
            .unwrap();

        let genesis: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/block/0").to_request()).await;
        assert_eq!(genesis["index"], 0);
        assert_eq!(genesis["is_closed"], true);

        let open: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/block/1").to_request()).await;
        assert_eq!(open["index"], 1);
        assert_eq!(open["shares"].as_array().unwrap().len(), 1);
        assert_eq!(open["shares"][0]["miner_pubkey"], wallet.public_key().to_string());

        let resp = test::call_service(&app, test::TestRequest::get().uri("/block/42").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert_eq!(failure.reason, "block_not_found");

        // the template route is not taken for an index
        let resp = test::call_service(&app, test::TestRequest::get().uri("/block/current").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_split_and_combine_flow() {
        let node = node(false);
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;
        let alice = Wallet::new();

        let (template, nonce, hash) = find_share(&node.chain, 0);
        let coin = node
            .chain
            .submit_share(template.block_index, alice.public_key(), nonce, hash)
            .unwrap()
            .coin
            .unwrap();
        let first = coin.value / 4;
        let second = coin.value - first;

        let uri = format!("/coins/{}/split-payload?amounts={},{}", coin.coin_id, first, second + 1);
        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert_eq!(failure.reason, "invalid_request");

        let uri = format!("/coins/{}/split-payload?amounts={},{}", coin.coin_id, first, second);
        let payload: PayloadResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        let bytes = hex::decode(&payload.payload_hex).unwrap();

        let uri = format!("/coins/{}/split", coin.coin_id);
        let request = SplitRequest {
            amounts: vec![first, second],
            signature: alice.sign(&bytes).0,
        };
        let resp = test::call_service(&app, test::TestRequest::post().uri(&uri).set_json(&request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let split: SplitResponse = test::read_body_json(resp).await;
        assert_eq!(split.coin_ids.len(), 2);
        assert_eq!(split.coins[0]["value"], first);
        assert_eq!(node.chain.coins().balance(alice.public_key()), coin.value);

        let resp = test::call_service(&app, test::TestRequest::post().uri(&uri).set_json(&request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let single = CombinePayloadRequest {
            coin_ids: vec![split.coin_ids[0].clone()],
            owner_pubkey: alice.public_key().to_string(),
        };
        let resp = test::call_service(&app, test::TestRequest::post().uri("/coins/combine-payload").set_json(&single).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let wanted = CombinePayloadRequest {
            coin_ids: split.coin_ids.clone(),
            owner_pubkey: alice.public_key().to_string(),
        };
        let payload: PayloadResponse = test::call_and_read_body_json(
            &app,
            test::TestRequest::post().uri("/coins/combine-payload").set_json(&wanted).to_request(),
        )
        .await;
        let bytes = hex::decode(&payload.payload_hex).unwrap();

        let request = CombineRequest {
            coin_ids: split.coin_ids.clone(),
            owner_pubkey: alice.public_key().to_string(),
            signature: alice.sign(&bytes).0,
        };
        let resp = test::call_service(&app, test::TestRequest::post().uri("/coins/combine").set_json(&request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let combined: CoinResponse = test::read_body_json(resp).await;
        assert_eq!(combined.coin_data["value"], coin.value);

        let uri = format!("/balance/{}", alice.public_key());
        let balance: BalanceResponse = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(balance.balance, coin.value);
        assert_eq!(balance.coins, 1);
    }

    #[actix_web::test]
    async fn test_mining_endpoints() {
        let bare = node(false);
        let app = test::init_service(App::new().app_data(bare.clone()).configure(configure_routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/mining/status").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let params = ChainParams::testing();
        let coins = Arc::new(CoinLedger::in_memory(params.max_supply));
        let chain = Arc::new(Blockchain::in_memory(params, coins).unwrap());
        let miner = Wallet::new();
        let control = Arc::new(MiningControl::new(
            chain.validator().engine().clone(),
            Arc::new(LocalSink::new(chain.clone())),
            MinerConfig::new(miner.public_key().clone(), 1),
        ));
        let node = web::Data::new(AppState::new(chain, false).with_mining(control));
        let app = test::init_service(App::new().app_data(node.clone()).configure(configure_routes)).await;

        let status: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/mining/status").to_request()).await;
        assert_eq!(status["active"], false);
        assert_eq!(status["miner_pubkey"], miner.public_key().to_string());

        let resp = test::call_service(&app, test::TestRequest::post().uri("/mining/stop").to_request()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = test::call_service(&app, test::TestRequest::post().uri("/mining/start").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = test::call_service(&app, test::TestRequest::post().uri("/mining/start").to_request()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let failure: FailureResponse = test::read_body_json(resp).await;
        assert_eq!(failure.reason, "mining_active");

        let status: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/mining/status").to_request()).await;
        assert_eq!(status["active"], true);

        let resp = test::call_service(&app, test::TestRequest::post().uri("/mining/stop").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let status: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/mining/status").to_request()).await;
        assert_eq!(status["active"], false);
    }
}
