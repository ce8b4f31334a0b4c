use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taponark_sdk::bitcoincore_rpc::Auth;
use taponark_sdk::{AssetId, Network, RoundPolicy, WaitConfig};

use crate::AppError;

pub const CONFIG_FILE: &str = "taponark.json";

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitcoindConfig {
    /// JSON-RPC endpoint; the network's default port on localhost when unset.
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub cookie_file: Option<PathBuf>,
}

impl BitcoindConfig {
    pub fn url(&self, network: Network) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| network.default_rpc_url().to_string())
    }

    /// Cookie file wins over user/password; neither means no auth.
    pub fn auth(&self) -> Result<Auth, AppError> {
        if let Some(cookie) = &self.cookie_file {
            return Ok(Auth::CookieFile(cookie.clone()));
        }
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Ok(Auth::UserPass(user.clone(), password.clone())),
            (None, None) => Ok(Auth::None),
            _ => Err(AppError::Config(
                "bitcoind user and password must be set together".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSettings {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        let wait = WaitConfig::default();
        Self {
            timeout_secs: wait.timeout.as_secs(),
            poll_interval_secs: wait.poll_interval.as_secs(),
        }
    }
}

impl WaitSettings {
    pub fn to_wait_config(self) -> Result<WaitConfig, AppError> {
        if self.timeout_secs == 0 || self.poll_interval_secs == 0 {
            return Err(AppError::Config(
                "wait timeout and poll interval must be non-zero".into(),
            ));
        }
        Ok(WaitConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        })
    }
}

// ============================================================================
// App config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: Network,
    /// Asset settled by this server's rounds.
    pub asset_id: Option<AssetId>,
    pub bitcoind: BitcoindConfig,
    pub policy: RoundPolicy,
    pub wait: WaitSettings,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            asset_id: None,
            bitcoind: BitcoindConfig::default(),
            policy: RoundPolicy::default(),
            wait: WaitSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        let config: AppConfig =
            serde_json::from_str(json).map_err(|e| AppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path).map_err(|source| AppError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Load `taponark.json` from `dir`, or defaults when the file is absent.
    pub fn load_or_default(dir: &Path) -> Result<Self, AppError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        fs::write(path, json).map_err(|source| AppError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.policy.validate()?;
        self.wait.to_wait_config()?;
        self.bitcoind.auth()?;
        self.log_level
            .parse::<log::LevelFilter>()
            .map_err(|_| AppError::Config(format!("invalid log level: {}", self.log_level)))?;
        Ok(())
    }

    pub fn wait_config(&self) -> Result<WaitConfig, AppError> {
        self.wait.to_wait_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_takes_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.bitcoind.url(config.network), "http://127.0.0.1:18443");
        assert_eq!(config.wait_config().unwrap(), WaitConfig::default());
    }

    #[test]
    fn partial_policy_keeps_other_defaults() {
        let config = AppConfig::from_json(r#"{"policy": {"level": 3, "fee_sats": 2000}}"#).unwrap();
        assert_eq!(config.policy.level, 3);
        assert_eq!(config.policy.fee_sats, 2_000);
        assert_eq!(config.policy.locktime, 4320);
    }

    #[test]
    fn half_credentials_rejected() {
        let err = AppConfig::from_json(r#"{"bitcoind": {"user": "alice"}}"#).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn bad_log_level_rejected() {
        assert!(AppConfig::from_json(r#"{"log_level": "loud"}"#).is_err());
    }

    #[test]
    fn zero_wait_rejected() {
        assert!(AppConfig::from_json(r#"{"wait": {"timeout_secs": 0}}"#).is_err());
    }
}
