//! Configuration management for the quote executor
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::batch::BatchExecutorConfig;
use crate::execution::{ExecuteOptions, StatusPollConfig};

use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub batch: Option<BatchConfig>,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Delay between solver status polls
    pub status_poll_interval_ms: u64,
    /// Total solver polls before `SolverStatusTimeout`
    pub status_max_attempts: u32,
    /// `waiting` responses tolerated before `DepositTransactionTimeout`
    pub deposit_max_attempts: u32,
    /// Delay between receipt polls in the reference wallet
    pub confirmation_poll_interval_ms: u64,
    /// Time allowed for inclusion; restarted by each new block once mined
    pub confirmation_timeout_secs: u64,
    pub atomic_batch: bool,
    /// Send gasless batches through the backend relay
    pub relay_batches: bool,
    pub fast_fill: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: 1500,
            status_max_attempts: 40,
            deposit_max_attempts: 40,
            confirmation_poll_interval_ms: 2000,
            confirmation_timeout_secs: 300,
            atomic_batch: false,
            relay_batches: true,
            fast_fill: true,
        }
    }
}

impl ExecutorConfig {
    pub fn status_poll(&self) -> StatusPollConfig {
        StatusPollConfig {
            interval: Duration::from_millis(self.status_poll_interval_ms),
            max_attempts: self.status_max_attempts,
            deposit_max_attempts: self.deposit_max_attempts,
        }
    }

    /// Options for one execution; cancellation and progress are wired by the caller
    pub fn to_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            atomic_batch: self.atomic_batch,
            relay_batches: self.relay_batches,
            fast_fill: self.fast_fill,
            status_poll: self.status_poll(),
            ..ExecuteOptions::default()
        }
    }

    pub fn confirmation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl ApiConfig {
    /// Empty strings left by an unset `${VAR}` count as no key
    pub fn api_key(&self) -> Option<String> {
        self.api_key.clone().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 5,
        }
    }
}

/// Gasless batch executor deployment
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    pub implementation: String,
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub domain_version: Option<String>,
    #[serde(default)]
    pub gas_overhead: Option<u64>,
}

impl BatchConfig {
    pub fn to_executor_config(&self) -> Result<BatchExecutorConfig> {
        let implementation = Address::from_str(&self.implementation)
            .with_context(|| format!("Invalid batch implementation address {}", self.implementation))?;

        let mut config = BatchExecutorConfig::calibur(implementation);
        if let Some(name) = &self.domain_name {
            config.domain_name = name.clone();
        }
        if let Some(version) = &self.domain_version {
            config.domain_version = version.clone();
        }
        if let Some(overhead) = self.gas_overhead {
            config.gas_overhead = overhead;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Falls back to the chain's recommended depth
    #[serde(default)]
    pub confirmation_blocks: Option<u64>,
    #[serde(default = "default_gas_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_priority_fee")]
    pub priority_fee_gwei: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// JSON-RPC node answering `debug_traceTransaction`
    #[serde(default)]
    pub trace_url: Option<String>,
}

fn default_gas_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}

fn default_max_gas_price() -> u64 {
    500
}

fn default_priority_fee() -> u64 {
    2
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "QUOTE_EXECUTOR_PRIVATE_KEY".to_string(),
        }
    }
}

impl WalletConfig {
    pub fn private_key(&self) -> Result<String> {
        env::var(&self.private_key_env)
            .with_context(|| format!("Private key variable {} is not set", self.private_key_env))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Settings {
    /// Load settings from `QUOTE_EXECUTOR_CONFIG` or `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("QUOTE_EXECUTOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&config_str)
    }

    /// Parse TOML after substituting environment variables
    pub fn parse(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        url::Url::parse(&self.api.base_url)
            .with_context(|| format!("Invalid API base URL {}", self.api.base_url))?;

        if self.executor.status_max_attempts == 0 || self.executor.deposit_max_attempts == 0 {
            anyhow::bail!("Status attempt budgets must be positive");
        }
        if self.executor.status_poll_interval_ms == 0 {
            anyhow::bail!("Status poll interval must be positive");
        }

        if let Some(batch) = &self.batch {
            batch.to_executor_config()?;
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }

    pub fn batch_executor(&self) -> Result<Option<BatchExecutorConfig>> {
        self.batch.as_ref().map(|b| b.to_executor_config()).transpose()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
