use std::path::Path;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;
mod mining;
mod sync;

use blockchain::clock::SystemClock;
use blockchain::storage::{write_atomic, LedgerFile};
use blockchain::{Blockchain, ChainParams, CoinLedger, HashEngine, PublicKey, Wallet};
use config::{Config, ConsensusMode};
use mining::{CancelToken, LocalSink, Miner, MinerConfig, MiningControl, RemoteSink};

const MINER_KEY_FILE: &str = "miner.key";

// Load the miner wallet from the data directory, creating one on first start
fn load_or_create_wallet(data_dir: &Path) -> anyhow::Result<Wallet> {
    let path = data_dir.join(MINER_KEY_FILE);

    if path.exists() {
        let encoded = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let secret = hex::decode(encoded.trim()).with_context(|| format!("decoding {}", path.display()))?;
        let wallet = Wallet::from_secret_key(&secret)?;
        info!("Loaded miner wallet {} ({})", wallet.address(), wallet.public_key());
        return Ok(wallet);
    }

    let wallet = Wallet::new();
    write_atomic(&path, hex::encode(wallet.export_secret_key()).as_bytes())?;
    info!(
        "Created miner wallet {} ({}), secret key in {}",
        wallet.address(),
        wallet.public_key(),
        path.display()
    );
    Ok(wallet)
}

fn miner_key(config: &Config) -> anyhow::Result<PublicKey> {
    match &config.miner_pubkey {
        Some(key) => Ok(key.clone()),
        None => Ok(load_or_create_wallet(&config.data_dir)?.public_key().clone()),
    }
}

// Mine against a remote server instead of serving a ledger
async fn run_remote_miner(config: &Config, server: &str) -> anyhow::Result<()> {
    let params = ChainParams::default();
    let engine = HashEngine::new(&params.pow)?;
    let sink = RemoteSink::new(server, config.peer_timeout)?;
    let threads = config.miner_threads.max(1);
    let miner = Miner::new(engine, Arc::new(sink), MinerConfig::new(miner_key(config)?, threads));

    let stop = CancelToken::new();
    let signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stopping miner");
            signal.cancel();
        }
    });

    info!("Mining against {}", server);
    miner.run(stop).await?;
    Ok(())
}

// Open the stored coins and ledger, or start both from genesis
fn initialize_blockchain(config: &Config) -> anyhow::Result<Arc<Blockchain>> {
    let params = ChainParams::default();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let coins = Arc::new(CoinLedger::open(&config.data_dir, params.max_supply).context("opening coin store")?);
    let chain = Blockchain::new(
        params,
        coins,
        Some(LedgerFile::new(&config.data_dir)),
        config.consensus.policy(),
        Arc::new(SystemClock),
    )
    .context("loading ledger; restore ledger.json.bak or move the data directory aside")?;

    info!(
        "Blockchain ready at height {} ({} consensus)",
        chain.height()?,
        chain.consensus()
    );
    Ok(Arc::new(chain))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::status,
        api::handlers::current_block,
        api::handlers::block_by_index,
        api::handlers::submit_share,
        api::handlers::chain_info,
        api::handlers::chain_height,
        api::handlers::full_chain,
        api::handlers::reset_chain,
        api::handlers::health,
        api::handlers::list_coins,
        api::handlers::coin_stats,
        api::handlers::export_coin,
        api::handlers::import_coin,
        api::handlers::transfer_payload,
        api::handlers::transfer_coin,
        api::handlers::split_payload,
        api::handlers::split_coin,
        api::handlers::combine_payload,
        api::handlers::combine_coins,
        api::handlers::balance,
        api::handlers::mining_status,
        api::handlers::start_mining,
        api::handlers::stop_mining
    ),
    components(
        schemas(
            blockchain::Template,
            blockchain::ChainInfo,
            mining::MiningStatus,
            api::schema::StatusResponse,
            api::schema::SubmitShareRequest,
            api::schema::SubmitShareResponse,
            api::schema::FailureResponse,
            api::schema::MessageResponse,
            api::schema::HeightResponse,
            api::schema::HealthResponse,
            api::schema::CoinListQuery,
            api::schema::CoinListResponse,
            api::schema::CoinImportRequest,
            api::schema::CoinResponse,
            api::schema::TransferPayloadQuery,
            api::schema::TransferPayloadResponse,
            api::schema::TransferRequest,
            api::schema::PayloadResponse,
            api::schema::SplitPayloadQuery,
            api::schema::SplitRequest,
            api::schema::SplitResponse,
            api::schema::CombinePayloadRequest,
            api::schema::CombineRequest,
            api::schema::BalanceResponse
        )
    ),
    tags(
        (name = "blockshares", description = "Block-shares node API")
    ),
    info(
        title = "Block Shares API",
        version = "1.0.0",
        description = "Mining templates, share submission, chain inspection and coin transfers",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env()?;

    if let Some(server) = config.miner_server_url.clone() {
        return run_remote_miner(&config, &server).await;
    }

    let chain = initialize_blockchain(&config)?;
    let stop = CancelToken::new();

    // MINER_THREADS=0 leaves the miner idle until POST /mining/start
    let mining = Arc::new(MiningControl::new(
        chain.validator().engine().clone(),
        Arc::new(LocalSink::new(chain.clone())),
        MinerConfig::new(miner_key(&config)?, config.miner_threads.max(1)),
    ));
    if config.miner_threads > 0 {
        mining.start();
    }

    match (config.consensus, config.peers.is_empty()) {
        (ConsensusMode::Weighted, true) => warn!("No peers configured; running standalone"),
        (ConsensusMode::Weighted, false) => {
            let peer_sync = sync::PeerSync::new(chain.clone(), config.peers.clone(), config.peer_timeout)?;
            let interval = config.sync_interval;
            let stop = stop.clone();
            tokio::spawn(async move { peer_sync.run(interval, stop).await });
        }
        (ConsensusMode::Authoritative, false) => {
            warn!("Ignoring {} configured peers under authoritative consensus", config.peers.len())
        }
        (ConsensusMode::Authoritative, true) => {}
    }

    let state = web::Data::new(api::AppState::new(chain, config.enable_reset).with_mining(mining.clone()));
    let (host, port) = config.bind_address();
    info!("Starting HTTP server at http://{}:{}", host, port);
    if config.enable_reset {
        warn!("POST /blockchain/reset is enabled");
    }

    // Start HTTP server
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
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()))
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    stop.cancel();
    mining.stop();
    info!("Server stopped");
    Ok(())
}
