//! Asset registry and per-chain parameters.
//!
//! Resolves symbolic asset codes to their chain, decimals and contract, and
//! exposes the per-chain confirmation and dust settings the engine needs.
//! Canonical asset codes are always suffixed by their chain id
//! (`USDC.ETH`), which keeps per-asset bookkeeping unambiguous on deals that
//! span chains.

use std::collections::HashMap;

use anyhow::{anyhow, bail};
use rust_decimal::Decimal;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq)]
pub struct AssetInfo {
    /// Canonical code, `SYMBOL.CHAIN`.
    pub code: String,
    pub symbol: String,
    pub chain: String,
    pub native: bool,
    pub decimals: u32,
    pub contract: Option<String>,
    /// Fixed fee added on top of percentage commissions for this token.
    pub fixed_fee: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainParams {
    pub chain_id: String,
    pub utxo: bool,
    pub confirmation_threshold: u32,
    pub collect_confirms: u32,
    /// Canonical code of the native token.
    pub native_asset: String,
    /// Canonical code of the token gas reimbursements are paid in.
    pub reimbursement_asset: String,
    pub dust_threshold: Decimal,
}

/// Turn a symbolic code into its canonical chain-suffixed form.
#[must_use]
pub fn canonical_code(code: &str, chain: &str) -> String {
    if code.contains('.') {
        code.to_owned()
    } else {
        format!("{code}.{chain}")
    }
}

#[derive(Debug, Default)]
pub struct AssetRegistry {
    assets: HashMap<String, AssetInfo>,
    chains: HashMap<String, ChainParams>,
}

impl AssetRegistry {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut assets = HashMap::new();
        let mut chains = HashMap::new();

        for (chain_id, chain) in &config.chains {
            let native = canonical_code(&chain.native_asset, chain_id);
            let reimbursement = chain
                .reimbursement_asset
                .as_deref()
                .map_or_else(|| native.clone(), |code| canonical_code(code, chain_id));

            chains.insert(
                chain_id.clone(),
                ChainParams {
                    chain_id: chain_id.clone(),
                    utxo: chain.utxo,
                    confirmation_threshold: chain.confirmation_threshold,
                    collect_confirms: chain.collect_confirms,
                    native_asset: native,
                    reimbursement_asset: reimbursement,
                    dust_threshold: chain.dust_threshold.unwrap_or(config.app.dust_threshold),
                },
            );
        }

        for asset in &config.assets {
            if !chains.contains_key(&asset.chain) {
                bail!(
                    "asset {} references unconfigured chain {}",
                    asset.code,
                    asset.chain
                );
            }

            let code = canonical_code(&asset.code, &asset.chain);
            let info = AssetInfo {
                code: code.clone(),
                symbol: asset.code.clone(),
                chain: asset.chain.clone(),
                native: asset.native,
                decimals: asset.decimals,
                contract: asset.contract.clone(),
                fixed_fee: asset.fixed_fee,
            };

            if assets.insert(code.clone(), info).is_some() {
                bail!("duplicate asset {code}");
            }
        }

        Ok(Self { assets, chains })
    }

    #[must_use]
    pub fn asset(&self, code: &str) -> Option<&AssetInfo> {
        self.assets.get(code)
    }

    pub fn require_asset(&self, code: &str) -> anyhow::Result<&AssetInfo> {
        self.asset(code).ok_or_else(|| anyhow!("unknown asset {code}"))
    }

    #[must_use]
    pub fn chain(&self, chain_id: &str) -> Option<&ChainParams> {
        self.chains.get(chain_id)
    }

    pub fn require_chain(&self, chain_id: &str) -> anyhow::Result<&ChainParams> {
        self.chain(chain_id)
            .ok_or_else(|| anyhow!("unknown chain {chain_id}"))
    }

    /// Declared decimals of a canonical asset code.
    #[must_use]
    pub fn decimals(&self, code: &str) -> Option<u32> {
        self.assets.get(code).map(|info| info.decimals)
    }

    #[must_use]
    pub fn dust_threshold(&self, chain_id: &str) -> Option<Decimal> {
        self.chains.get(chain_id).map(|chain| chain.dust_threshold)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::config::Config;

    fn config() -> Config {
        toml::from_str(indoc::indoc! {r#"
            [database]
            database = "postgres://localhost/broker"

            [chains.ETH]
            confirmation_threshold = 3
            collect_confirms = 3
            native_asset = "ETH"
            reimbursement_asset = "USDC"

            [chains.UNICITY]
            utxo = true
            native_asset = "ALPHA"
            dust_threshold = "0.00001"

            [[assets]]
            code = "ETH"
            chain = "ETH"
            decimals = 18
            native = true

            [[assets]]
            code = "USDC"
            chain = "ETH"
            decimals = 6
            contract = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
            fixed_fee = "1"

            [[assets]]
            code = "ALPHA"
            chain = "UNICITY"
            decimals = 8
            native = true
        "#})
        .unwrap()
    }

    #[test]
    fn canonical_codes_are_chain_suffixed() {
        assert_eq!(canonical_code("USDC", "ETH"), "USDC.ETH");
        assert_eq!(canonical_code("USDC.ETH", "ETH"), "USDC.ETH");
    }

    #[test]
    fn builds_registry_from_config() {
        let registry = AssetRegistry::from_config(&config()).unwrap();

        let usdc = registry.asset("USDC.ETH").unwrap();
        assert_eq!(usdc.decimals, 6);
        assert_eq!(usdc.fixed_fee, Some(Decimal::ONE));
        assert!(!usdc.native);

        let eth = registry.chain("ETH").unwrap();
        assert_eq!(eth.collect_confirms, 3);
        assert_eq!(eth.native_asset, "ETH.ETH");
        assert_eq!(eth.reimbursement_asset, "USDC.ETH");

        let unicity = registry.chain("UNICITY").unwrap();
        assert!(unicity.utxo);
        assert_eq!(unicity.reimbursement_asset, "ALPHA.UNICITY");
        assert_eq!(
            unicity.dust_threshold,
            Decimal::from_str("0.00001").unwrap()
        );
    }

    #[test]
    fn rejects_asset_on_unknown_chain() {
        let mut config = config();
        config.assets.push(crate::config::AssetConfig {
            code: "DOGE".into(),
            chain: "DOGECHAIN".into(),
            decimals: 8,
            native: true,
            contract: None,
            fixed_fee: None,
        });

        assert!(AssetRegistry::from_config(&config).is_err());
    }
}
