//! Engine configuration and per-chain defaults.

use serde::{Deserialize, Serialize};

/// How events from different chains are ordered relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingPolicy {
    /// Independent per-chain checkpoint order; chains never wait for each
    /// other.
    Multichain,
    /// One globally sorted stream across all chains.
    Omnichain,
}

impl std::fmt::Display for OrderingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Multichain => write!(f, "multichain"),
            Self::Omnichain => write!(f, "omnichain"),
        }
    }
}

/// Default finality depth for a chain id.
///
/// Mainnet/Sepolia 65, Polygon/Mumbai 200, Arbitrum One 240; everything
/// else falls back to 30.
pub fn default_finality_depth(chain_id: u64) -> u64 {
    match chain_id {
        1 | 11155111 => 65,
        137 | 80001 => 200,
        42161 => 240,
        _ => 30,
    }
}

/// Per-chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Human-readable chain name exposed to handlers (e.g. `"mainnet"`).
    pub name: String,
    /// Override for [`default_finality_depth`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finality_depth: Option<u64>,
}

impl ChainConfig {
    pub fn new(chain_id: u64, name: impl Into<String>) -> Self {
        Self { chain_id, name: name.into(), finality_depth: None }
    }

    pub fn finality_depth(&self) -> u64 {
        self.finality_depth.unwrap_or_else(|| default_finality_depth(self.chain_id))
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cross-chain ordering policy; immutable for the run.
    pub ordering: OrderingPolicy,
    /// Chains to index.
    pub chains: Vec<ChainConfig>,
    /// Events per historical batch transaction.
    pub batch_size: usize,
    /// Bound of each per-chain adapter→merger channel.
    pub channel_capacity: usize,
    /// Ceiling for a historical batch transaction (fatal when exceeded).
    pub historical_tx_timeout_ms: u64,
    /// Ceiling for a realtime event transaction (retryable when exceeded).
    pub realtime_tx_timeout_ms: u64,
    /// Per-call RPC timeout for the cached client.
    pub rpc_timeout_ms: u64,
    /// Build identifier; restarts against a store with a different build id
    /// are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let batch_size = 93;
        Self {
            ordering: OrderingPolicy::Omnichain,
            chains: vec![],
            batch_size,
            // ~2× batch size: backpressure without starving realtime.
            channel_capacity: batch_size * 2,
            historical_tx_timeout_ms: 60_000,
            realtime_tx_timeout_ms: 5_000,
            rpc_timeout_ms: 10_000,
            build_id: None,
        }
    }
}

impl EngineConfig {
    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finality_depth_table() {
        assert_eq!(default_finality_depth(1), 65);
        assert_eq!(default_finality_depth(11155111), 65);
        assert_eq!(default_finality_depth(137), 200);
        assert_eq!(default_finality_depth(80001), 200);
        assert_eq!(default_finality_depth(42161), 240);
        assert_eq!(default_finality_depth(8453), 30); // unknown → fallback
    }

    #[test]
    fn chain_override_wins() {
        let mut chain = ChainConfig::new(1, "mainnet");
        assert_eq!(chain.finality_depth(), 65);
        chain.finality_depth = Some(12);
        assert_eq!(chain.finality_depth(), 12);
    }

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.batch_size, 93);
        assert_eq!(cfg.channel_capacity, 186);
        assert_eq!(cfg.ordering, OrderingPolicy::Omnichain);
        assert_eq!(cfg.historical_tx_timeout_ms, 60_000);
        assert_eq!(cfg.realtime_tx_timeout_ms, 5_000);
    }
}
