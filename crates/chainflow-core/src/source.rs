//! Declarative source filters — which raw items become events, and under
//! which handler name.

use serde::{Deserialize, Serialize};

/// Factory declaration for runtime child-contract discovery.
///
/// A log emitted by `address` whose topic0 equals `event_topic0` announces
/// a child contract; the child address is decoded from the indexed topic at
/// `child_address_topic_index` (1-based, topic0 is the signature).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    pub address: String,
    pub event_topic0: String,
    pub child_address_topic_index: usize,
}

/// Log-based source: logs from fixed addresses and/or factory children.
///
/// With `include_call_traces` set, call traces into the matched addresses
/// are emitted as `Trace` events under the same handler name; the handler
/// distinguishes them by the event's variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSource {
    /// Handler key for matched events.
    pub name: String,
    pub chain_id: u64,
    /// Static addresses to match (empty = factory children only).
    #[serde(default)]
    pub addresses: Vec<String>,
    /// topic0 filter (empty = all events from the matched addresses).
    #[serde(default)]
    pub topics0: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<FactoryConfig>,
    #[serde(default)]
    pub include_call_traces: bool,
}

/// Account-based source: transactions and value transfers touching an
/// address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSource {
    pub name: String,
    pub chain_id: u64,
    pub address: String,
}

/// Block-interval source: one event every `interval` blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSource {
    pub name: String,
    pub chain_id: u64,
    pub interval: u64,
    #[serde(default)]
    pub offset: u64,
}

/// A declarative filter turning raw items into named events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Source {
    Contract(ContractSource),
    Account(AccountSource),
    Block(BlockSource),
}

impl Source {
    /// The handler key this source emits under.
    pub fn name(&self) -> &str {
        match self {
            Self::Contract(s) => &s.name,
            Self::Account(s) => &s.name,
            Self::Block(s) => &s.name,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Self::Contract(s) => s.chain_id,
            Self::Account(s) => s.chain_id,
            Self::Block(s) => s.chain_id,
        }
    }
}

impl ContractSource {
    /// Returns `true` if `address` is one of the source's static addresses.
    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Returns `true` if `topic0` passes the topic filter.
    pub fn matches_topic0(&self, topic0: Option<&str>) -> bool {
        if self.topics0.is_empty() {
            return true;
        }
        match topic0 {
            Some(t) => self.topics0.iter().any(|x| x.eq_ignore_ascii_case(t)),
            None => false,
        }
    }
}

impl AccountSource {
    /// Returns `true` if the account participates as sender or recipient.
    pub fn matches(&self, from: &str, to: Option<&str>) -> bool {
        self.address.eq_ignore_ascii_case(from)
            || to.is_some_and(|t| self.address.eq_ignore_ascii_case(t))
    }
}

impl BlockSource {
    pub fn matches_block(&self, number: u64) -> bool {
        self.interval > 0 && number >= self.offset && (number - self.offset) % self.interval == 0
    }
}
