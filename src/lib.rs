pub mod config;
pub mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use taponark_sdk::{
    AssetId, BitcoindBackend, ChainBackend, Party, Role, TaponarkNode, TaponarkSdk,
};

pub use config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Sdk(#[from] taponark_sdk::Error),
}

/// Connect to the configured bitcoind.
pub fn connect_chain(config: &AppConfig) -> Result<BitcoindBackend, AppError> {
    let url = config.bitcoind.url(config.network);
    let backend = BitcoindBackend::new(&url, config.bitcoind.auth()?)?;
    log::info!("app: using bitcoind at {url} ({})", config.network);
    Ok(backend)
}

/// Wire a node for `server` over `chain` from `config`.
pub fn build_node(
    config: &AppConfig,
    server: Party,
    chain: Arc<dyn ChainBackend>,
) -> Result<TaponarkNode, AppError> {
    if server.role != Role::Server {
        return Err(AppError::Config(format!(
            "node must run as the server, not the {}",
            server.role
        )));
    }
    let asset_id: AssetId = config
        .asset_id
        .ok_or_else(|| AppError::Config("asset_id is not set".into()))?;
    let sdk = TaponarkSdk::new(
        config.network,
        asset_id,
        server,
        chain,
        config.policy,
        config.wait_config()?,
    )?;
    log::info!(
        "app: settling {asset_id} with tree depth {} on {}",
        config.policy.level,
        config.network
    );
    Ok(TaponarkNode::new(sdk))
}

/// Initialise logging from `config`, connect bitcoind and wire the node.
pub fn start(config: &AppConfig, server: Party) -> Result<TaponarkNode, AppError> {
    let level = config
        .log_level
        .parse()
        .map_err(|_| AppError::Config(format!("invalid log level: {}", config.log_level)))?;
    logging::init(level);
    let chain = connect_chain(config)?;
    build_node(config, server, Arc::new(chain))
}
