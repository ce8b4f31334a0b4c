use std::time::Duration;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// CLTV height guarding the unilateral leaf of every contract.
pub const DEFAULT_LOCKTIME: u32 = 4320;

/// Flat per-hop fee. Not derived from transaction weight.
pub const DEFAULT_FEE_SATS: u64 = 10_000;

/// Value carried by an output that anchors an asset commitment.
pub const DEFAULT_DUST_SATS: u64 = 1_000;

const MAX_TREE_LEVEL: u32 = 16;

/// Which kind of output a contract protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractFlavor {
    /// A user's initial deposit.
    Boarding,
    /// A round-root, branch, or leaf-funding output.
    Round,
}

/// The party whose key sits in the CLTV unilateral leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitKeyHolder {
    User,
    Server,
}

/// Protocol constants passed into every construction call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundPolicy {
    pub locktime: u32,
    pub fee_sats: u64,
    /// Value of the anchor output that carries the asset at a leaf.
    pub asset_dust_sats: u64,
    /// Value of the zero-amount change anchor at a leaf.
    pub change_dust_sats: u64,
    /// Depth of the settlement tree below the round root.
    pub level: u32,
    pub boarding_exit_key: ExitKeyHolder,
    pub round_exit_key: ExitKeyHolder,
}

impl Default for RoundPolicy {
    fn default() -> Self {
        Self {
            locktime: DEFAULT_LOCKTIME,
            fee_sats: DEFAULT_FEE_SATS,
            asset_dust_sats: DEFAULT_DUST_SATS,
            change_dust_sats: DEFAULT_DUST_SATS,
            level: 2,
            boarding_exit_key: ExitKeyHolder::User,
            round_exit_key: ExitKeyHolder::Server,
        }
    }
}

impl RoundPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.locktime == 0 {
            return Err(Error::Config("locktime must be non-zero".into()));
        }
        if self.asset_dust_sats == 0 || self.change_dust_sats == 0 {
            return Err(Error::Config("dust reserves must be non-zero".into()));
        }
        if self.level > MAX_TREE_LEVEL {
            return Err(Error::Config(format!(
                "tree level {} exceeds maximum {MAX_TREE_LEVEL}",
                self.level
            )));
        }
        Ok(())
    }

    pub fn fee(&self) -> Amount {
        Amount::from_sat(self.fee_sats)
    }

    pub fn asset_dust(&self) -> Amount {
        Amount::from_sat(self.asset_dust_sats)
    }

    pub fn change_dust(&self) -> Amount {
        Amount::from_sat(self.change_dust_sats)
    }

    /// Holder of the timeout key for contracts of the given flavor.
    pub fn exit_key_holder(&self, flavor: ContractFlavor) -> ExitKeyHolder {
        match flavor {
            ContractFlavor::Boarding => self.boarding_exit_key,
            ContractFlavor::Round => self.round_exit_key,
        }
    }

    /// Btc value of each child output of a branch: `(anchor - fee) / 2`.
    ///
    /// Returns `(left, right)`; an odd remainder goes to the left child.
    pub fn branch_split(&self, anchor_value: Amount) -> Result<(Amount, Amount)> {
        let spendable = anchor_value.checked_sub(self.fee()).ok_or_else(|| {
            Error::Construction(format!(
                "anchor value {anchor_value} does not cover fee {}",
                self.fee()
            ))
        })?;
        let half = spendable.to_sat() / 2;
        Ok((
            Amount::from_sat(spendable.to_sat() - half),
            Amount::from_sat(half),
        ))
    }

    /// Btc value of a leaf's plain output: `anchor - asset dust - change dust - fee`.
    pub fn leaf_btc(&self, anchor_value: Amount) -> Result<Amount> {
        [self.asset_dust(), self.change_dust(), self.fee()]
            .into_iter()
            .try_fold(anchor_value, |acc, reserve| acc.checked_sub(reserve))
            .filter(|v| *v > Amount::ZERO)
            .ok_or_else(|| {
                Error::Construction(format!(
                    "anchor value {anchor_value} does not cover leaf reserves"
                ))
            })
    }
}

/// Process-wide deadline for every wait on an external event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitConfig {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self::new()
    }
}
