use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use crate::core_types::{Address, AssetUnits, Lamports};
use crate::fee::{DEFAULT_TRADE_FEE, FEE_PRECISION, FeeSplit};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub curve: CurveConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub graduation: GraduationConfig,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    /// PostgreSQL connection URL; the in-process store is used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub postgres_max_connections: u32,
}

fn default_max_connections() -> u32 {
    32
}

/// Parameters every new market's curve is seeded with.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CurveConfig {
    pub initial_virtual_quote: Lamports,
    pub initial_virtual_asset: AssetUnits,
    /// Units sellable through the curve; the rest of the supply is kept for the pool
    pub initial_real_asset: AssetUnits,
    pub total_supply: AssetUnits,
    /// Trade fee in 10^6 precision
    pub fee_rate: u64,
    #[serde(default)]
    pub fee_split: FeeSplit,
    /// Real quote reserve at which a market graduates
    pub graduation_threshold: Lamports,
    /// Base58 address credited with the protocol fee share
    pub protocol_treasury: String,
}

impl Default for CurveConfig {
    fn default() -> Self {
        Self {
            initial_virtual_quote: 30_000_000_000,
            initial_virtual_asset: 1_073_000_000_000_000,
            initial_real_asset: 793_100_000_000_000,
            total_supply: 1_000_000_000_000_000,
            fee_rate: DEFAULT_TRADE_FEE,
            fee_split: FeeSplit::default(),
            graduation_threshold: 85_000_000_000,
            protocol_treasury: "11111111111111111111111111111111".to_string(),
        }
    }
}

impl CurveConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_virtual_quote == 0 || self.initial_virtual_asset == 0 {
            bail!("curve virtual reserves must be positive");
        }
        if self.initial_real_asset > self.total_supply {
            bail!(
                "initial_real_asset {} exceeds total_supply {}",
                self.initial_real_asset,
                self.total_supply
            );
        }
        if self.initial_real_asset > self.initial_virtual_asset {
            bail!("initial_real_asset must not exceed initial_virtual_asset");
        }
        if self.fee_rate >= FEE_PRECISION {
            bail!("fee_rate {} must be below {}", self.fee_rate, FEE_PRECISION);
        }
        if !self.fee_split.is_valid() {
            bail!("fee_split shares must sum to {}", FEE_PRECISION);
        }
        if self.graduation_threshold == 0 {
            bail!("graduation_threshold must be positive");
        }
        self.treasury_address()?;
        Ok(())
    }

    pub fn treasury_address(&self) -> anyhow::Result<Address> {
        Address::from_str(&self.protocol_treasury)
            .with_context(|| format!("invalid protocol_treasury {}", self.protocol_treasury))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScheduleConfig {
    pub heartbeat_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub pool_creation_timeout_secs: u64,
    pub reconcile_batch_size: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            reconcile_interval_secs: 300,
            pool_creation_timeout_secs: 30,
            reconcile_batch_size: 500,
        }
    }
}

impl ScheduleConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn pool_creation_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_creation_timeout_secs)
    }
}

/// Which ledger decides whether a market has graduated.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceOfTruth {
    /// Trading settles on-chain; the curve account is authoritative
    OnChain,
    /// Trading settles against this store; local reserves are authoritative
    #[default]
    Custodial,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GraduationConfig {
    #[serde(default)]
    pub source_of_truth: SourceOfTruth,
    /// Program owning the curve accounts on the external ledger
    #[serde(default = "default_curve_program")]
    pub curve_program: String,
    /// Expected first 8 bytes of a curve account; unchecked when absent
    #[serde(default)]
    pub account_discriminator: Option<[u8; 8]>,
}

fn default_curve_program() -> String {
    "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M4uBBFGF6P".to_string()
}

impl Default for GraduationConfig {
    fn default() -> Self {
        Self {
            source_of_truth: SourceOfTruth::default(),
            curve_program: default_curve_program(),
            account_discriminator: None,
        }
    }
}

impl GraduationConfig {
    pub fn curve_program_address(&self) -> anyhow::Result<Address> {
        Address::from_str(&self.curve_program)
            .with_context(|| format!("invalid curve_program {}", self.curve_program))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EndpointsConfig {
    /// JSON endpoint returning the quote currency's USD price
    pub price_feed_url: String,
    pub rpc_url: String,
    pub pool_service_url: String,
    pub custody_service_url: String,
    #[serde(default)]
    pub announce_webhook_url: Option<String>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            price_feed_url: "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd"
                .to_string(),
            rpc_url: "http://localhost:8899".to_string(),
            pool_service_url: "http://localhost:8090".to_string(),
            custody_service_url: "http://localhost:8091".to_string(),
            announce_webhook_url: None,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config: {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.curve.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: curve_market.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.curve, CurveConfig::default());
        assert_eq!(config.graduation.source_of_truth, SourceOfTruth::Custodial);
        assert_eq!(config.schedule.heartbeat_interval(), Duration::from_secs(60));
        assert!(config.postgres_url.is_none());
        assert_eq!(config.postgres_max_connections, 32);
    }

    #[test]
    fn test_source_of_truth_parses() {
        let yaml = format!("{}graduation:\n  source_of_truth: on_chain\n", MINIMAL);
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.graduation.source_of_truth, SourceOfTruth::OnChain);
    }

    #[test]
    fn test_default_curve_is_valid() {
        assert!(CurveConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_curve_rejected() {
        let mut curve = CurveConfig::default();
        curve.initial_real_asset = curve.total_supply + 1;
        assert!(curve.validate().is_err());

        let mut curve = CurveConfig::default();
        curve.fee_split.referrer += 1;
        assert!(curve.validate().is_err());

        let mut curve = CurveConfig::default();
        curve.protocol_treasury = "not-an-address".to_string();
        assert!(curve.validate().is_err());
    }
}
