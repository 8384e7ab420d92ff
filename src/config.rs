//! Runtime options for the Template Provider.
//!
//! The embedding node deserializes these from its own configuration file (or
//! builds them programmatically) and hands them to
//! [`crate::Sv2TemplateProvider::new`]. Every field has a default so a
//! partial configuration section is enough.

use serde::Deserialize;
use std::time::Duration;

/// Chain flavour the node runs on.
///
/// Signet nodes skip the initial-block-download wait at startup because they
/// may be the only miner on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Default for ChainType {
    fn default() -> Self {
        ChainType::Mainnet
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8336
}

fn default_fee_delta() -> u64 {
    1000
}

fn default_fee_check_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sv2TemplateProviderOptions {
    /// Address the transport binds for incoming Stratum v2 connections.
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    /// Minimum aggregate fee improvement, in satoshis, that triggers a new
    /// template for a client.
    #[serde(default = "default_fee_delta")]
    fee_delta: u64,
    /// Minimum spacing, in seconds, between fee-driven template refreshes
    /// per client.
    #[serde(default = "default_fee_check_interval")]
    fee_check_interval: u64,
    /// Enables short wait timeouts and pacing sleeps for functional tests.
    #[serde(default)]
    is_test: bool,
    #[serde(default)]
    chain: ChainType,
}

impl Default for Sv2TemplateProviderOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            fee_delta: default_fee_delta(),
            fee_check_interval: default_fee_check_interval(),
            is_test: false,
            chain: ChainType::default(),
        }
    }
}

impl Sv2TemplateProviderOptions {
    pub fn new(
        host: String,
        port: u16,
        fee_delta: u64,
        fee_check_interval: u64,
        is_test: bool,
        chain: ChainType,
    ) -> Self {
        Self {
            host,
            port,
            fee_delta,
            fee_check_interval,
            is_test,
            chain,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn fee_delta(&self) -> u64 {
        self.fee_delta
    }

    pub fn fee_check_interval(&self) -> Duration {
        Duration::from_secs(self.fee_check_interval)
    }

    pub fn is_test(&self) -> bool {
        self.is_test
    }

    pub fn chain(&self) -> ChainType {
        self.chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let options: Sv2TemplateProviderOptions = toml::from_str(
            r#"
            host = "127.0.0.1"
            fee_delta = 5000
            chain = "signet"
            "#,
        )
        .unwrap();

        assert_eq!(options.host(), "127.0.0.1");
        assert_eq!(options.port(), 8336);
        assert_eq!(options.fee_delta(), 5000);
        assert_eq!(options.fee_check_interval(), Duration::from_secs(30));
        assert!(!options.is_test());
        assert_eq!(options.chain(), ChainType::Signet);
    }

    #[test]
    fn empty_config_is_valid() {
        let options: Sv2TemplateProviderOptions = toml::from_str("").unwrap();
        assert_eq!(options.host(), "0.0.0.0");
        assert_eq!(options.fee_delta(), 1000);
        assert_eq!(options.chain(), ChainType::Mainnet);
    }
}
