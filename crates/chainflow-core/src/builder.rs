//! Event builder — turns raw block bundles into checkpoint-ordered events.
//!
//! The builder is stateful per run: it remembers which chains have had
//! their setup events emitted and which factory children have been
//! discovered so far. Per-item decode failures are non-fatal (logged at
//! debug, item dropped); everything else propagates.

use std::collections::{HashMap, HashSet};

use serde_json::json;
use tracing::debug;

use crate::checkpoint::Checkpoint;
use crate::event::{Event, EventData, EventKind, RawBlockBundle, RawLog};
use crate::source::{ContractSource, Source};

/// Result of building one bundle.
#[derive(Debug)]
pub struct BuiltBlock {
    /// Events sorted ascending by checkpoint.
    pub events: Vec<Event>,
    /// Factory children first seen in this block, keyed by source name.
    /// The sync adapter records these against the block so a reorg can
    /// forget them.
    pub discovered_children: HashMap<String, HashSet<String>>,
}

/// Stateful builder for one engine run.
pub struct EventBuilder {
    sources: Vec<Source>,
    /// source name → all discovered child addresses (lowercased).
    children: HashMap<String, HashSet<String>>,
    /// Chains whose setup events have been emitted.
    setup_emitted: HashSet<u64>,
}

impl EventBuilder {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            sources,
            children: HashMap::new(),
            setup_emitted: HashSet::new(),
        }
    }

    /// All currently known children for a source.
    pub fn children_of(&self, source_name: &str) -> Option<&HashSet<String>> {
        self.children.get(source_name)
    }

    /// Forget child addresses dropped by a reorg.
    pub fn forget_children(&mut self, removed: &HashSet<String>) {
        for set in self.children.values_mut() {
            for addr in removed {
                set.remove(&addr.to_ascii_lowercase());
            }
        }
    }

    /// Materialize events for one bundle.
    ///
    /// The first bundle seen for a chain is preceded by one setup event per
    /// source on that chain, at the zero checkpoint.
    pub fn build(&mut self, bundle: &RawBlockBundle) -> BuiltBlock {
        let mut events = Vec::new();
        let mut discovered: HashMap<String, HashSet<String>> = HashMap::new();

        if self.setup_emitted.insert(bundle.chain_id) {
            for source in self.sources.iter().filter(|s| s.chain_id() == bundle.chain_id) {
                events.push(Event {
                    chain_id: bundle.chain_id,
                    name: source.name().to_string(),
                    checkpoint: Checkpoint::ZERO,
                    data: EventData::Setup,
                });
            }
        }

        // Factory discovery runs over the whole block first, so children
        // announced in this block already match its later logs.
        for source in &self.sources {
            if let Source::Contract(contract) = source {
                if contract.chain_id != bundle.chain_id {
                    continue;
                }
                if let Some(factory) = &contract.factory {
                    for log in &bundle.logs {
                        if !log.address.eq_ignore_ascii_case(&factory.address) {
                            continue;
                        }
                        if !log
                            .topic0()
                            .is_some_and(|t| t.eq_ignore_ascii_case(&factory.event_topic0))
                        {
                            continue;
                        }
                        match decode_child_address(log, factory.child_address_topic_index) {
                            Some(child) => {
                                let newly_seen = self
                                    .children
                                    .entry(contract.name.clone())
                                    .or_default()
                                    .insert(child.clone());
                                if newly_seen {
                                    discovered
                                        .entry(contract.name.clone())
                                        .or_default()
                                        .insert(child);
                                }
                            }
                            None => debug!(
                                chain_id = bundle.chain_id,
                                block = bundle.block.number,
                                log_index = log.log_index,
                                "dropping factory log with undecodable child address"
                            ),
                        }
                    }
                }
            }
        }

        // Reverted transactions contribute no transaction/transfer/trace
        // events.
        let failed: HashSet<u64> = bundle
            .transaction_receipts
            .iter()
            .filter(|r| !r.status)
            .map(|r| r.transaction_index)
            .collect();

        for source in &self.sources {
            if source.chain_id() != bundle.chain_id {
                continue;
            }
            match source {
                Source::Contract(contract) => {
                    self.build_log_events(contract, bundle, &mut events);
                    if contract.include_call_traces {
                        self.build_trace_events(contract, bundle, &failed, &mut events);
                    }
                }
                Source::Account(account) => {
                    for tx in &bundle.transactions {
                        if failed.contains(&tx.transaction_index) {
                            continue;
                        }
                        if account.matches(&tx.from, tx.to.as_deref()) {
                            events.push(Event {
                                chain_id: bundle.chain_id,
                                name: account.name.clone(),
                                checkpoint: Checkpoint {
                                    block_timestamp: bundle.block.timestamp,
                                    chain_id: bundle.chain_id,
                                    block_number: bundle.block.number,
                                    transaction_index: tx.transaction_index,
                                    event_type: EventKind::Transaction.as_u8(),
                                    event_index: 0,
                                },
                                data: EventData::Transaction {
                                    transaction: tx.clone(),
                                    block: bundle.block.clone(),
                                },
                            });
                        }
                    }
                    for trace in &bundle.traces {
                        if failed.contains(&trace.transaction_index) {
                            continue;
                        }
                        if !account.matches(&trace.from, trace.to.as_deref()) {
                            continue;
                        }
                        let Some(value) = parse_value(&trace.value) else {
                            debug!(
                                chain_id = bundle.chain_id,
                                block = bundle.block.number,
                                trace_index = trace.trace_index,
                                value = %trace.value,
                                "dropping trace with undecodable value"
                            );
                            continue;
                        };
                        if value == 0 {
                            continue;
                        }
                        events.push(Event {
                            chain_id: bundle.chain_id,
                            name: account.name.clone(),
                            checkpoint: Checkpoint {
                                block_timestamp: bundle.block.timestamp,
                                chain_id: bundle.chain_id,
                                block_number: bundle.block.number,
                                transaction_index: trace.transaction_index,
                                event_type: EventKind::Transfer.as_u8(),
                                event_index: trace.trace_index,
                            },
                            data: EventData::Transfer {
                                from: trace.from.clone(),
                                to: trace.to.clone().unwrap_or_default(),
                                value: value.to_string(),
                                trace_index: trace.trace_index,
                                block: bundle.block.clone(),
                            },
                        });
                    }
                }
                Source::Block(block_source) => {
                    if block_source.matches_block(bundle.block.number) {
                        events.push(Event {
                            chain_id: bundle.chain_id,
                            name: block_source.name.clone(),
                            checkpoint: Checkpoint {
                                block_timestamp: bundle.block.timestamp,
                                chain_id: bundle.chain_id,
                                block_number: bundle.block.number,
                                transaction_index: 0,
                                event_type: EventKind::Block.as_u8(),
                                event_index: 0,
                            },
                            data: EventData::Block { block: bundle.block.clone() },
                        });
                    }
                }
            }
        }

        events.sort_by_key(|e| e.checkpoint);
        BuiltBlock { events, discovered_children: discovered }
    }

    /// Call traces into the contract (or its children) become `Trace`
    /// events under the source's handler name.
    fn build_trace_events(
        &self,
        contract: &ContractSource,
        bundle: &RawBlockBundle,
        failed: &HashSet<u64>,
        events: &mut Vec<Event>,
    ) {
        let children = self.children.get(&contract.name);
        for trace in &bundle.traces {
            if failed.contains(&trace.transaction_index) {
                continue;
            }
            let Some(to) = trace.to.as_deref() else { continue };
            let is_child =
                children.is_some_and(|set| set.contains(&to.to_ascii_lowercase()));
            if !is_child && !contract.matches_address(to) {
                continue;
            }
            events.push(Event {
                chain_id: bundle.chain_id,
                name: contract.name.clone(),
                checkpoint: Checkpoint {
                    block_timestamp: bundle.block.timestamp,
                    chain_id: bundle.chain_id,
                    block_number: bundle.block.number,
                    transaction_index: trace.transaction_index,
                    event_type: EventKind::Trace.as_u8(),
                    event_index: trace.trace_index,
                },
                data: EventData::Trace {
                    trace: trace.clone(),
                    block: bundle.block.clone(),
                },
            });
        }
    }

    fn build_log_events(
        &self,
        contract: &ContractSource,
        bundle: &RawBlockBundle,
        events: &mut Vec<Event>,
    ) {
        let children = self.children.get(&contract.name);
        for log in &bundle.logs {
            let is_child = children
                .is_some_and(|set| set.contains(&log.address.to_ascii_lowercase()));
            if !is_child && !contract.matches_address(&log.address) {
                continue;
            }
            if !contract.matches_topic0(log.topic0()) {
                continue;
            }
            events.push(Event {
                chain_id: bundle.chain_id,
                name: contract.name.clone(),
                checkpoint: Checkpoint {
                    block_timestamp: bundle.block.timestamp,
                    chain_id: bundle.chain_id,
                    block_number: bundle.block.number,
                    transaction_index: log.transaction_index,
                    event_type: EventKind::Log.as_u8(),
                    event_index: log.log_index,
                },
                data: EventData::Log {
                    log: log.clone(),
                    block: bundle.block.clone(),
                    fields: json!({
                        "topics": log.topics,
                        "data": log.data,
                    }),
                },
            });
        }
    }
}

/// Decode a child contract address from an indexed topic: the last 40 hex
/// characters of a 32-byte topic word.
fn decode_child_address(log: &RawLog, topic_index: usize) -> Option<String> {
    let topic = log.topics.get(topic_index)?;
    let hex = topic.strip_prefix("0x").unwrap_or(topic);
    if hex.len() < 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", &hex[hex.len() - 40..].to_ascii_lowercase()))
}

/// Parse a decimal or 0x-hex value string.
fn parse_value(s: &str) -> Option<u128> {
    match s.strip_prefix("0x") {
        Some(hex) => u128::from_str_radix(hex, 16).ok(),
        None => s.parse::<u128>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RawBlock, RawTrace, RawTransaction, RawTransactionReceipt};
    use crate::source::{AccountSource, BlockSource, FactoryConfig};

    fn block(number: u64) -> RawBlock {
        RawBlock {
            number,
            hash: format!("0x{number:02x}"),
            parent_hash: format!("0x{:02x}", number.saturating_sub(1)),
            timestamp: number * 12,
        }
    }

    fn log(address: &str, topic0: &str, tx_index: u64, log_index: u64) -> RawLog {
        RawLog {
            address: address.into(),
            topics: vec![topic0.into()],
            data: "0x".into(),
            log_index,
            transaction_index: tx_index,
            transaction_hash: format!("0xtx{tx_index}"),
        }
    }

    fn transfer_source() -> Source {
        Source::Contract(ContractSource {
            name: "ERC20:Transfer".into(),
            chain_id: 1,
            addresses: vec!["0xToken".into()],
            topics0: vec!["0xddf2".into()],
            factory: None,
            include_call_traces: false,
        })
    }

    fn bundle(chain_id: u64, block_number: u64, logs: Vec<RawLog>) -> RawBlockBundle {
        RawBlockBundle {
            chain_id,
            block: block(block_number),
            logs,
            transactions: vec![],
            transaction_receipts: vec![],
            traces: vec![],
        }
    }

    #[test]
    fn matching_logs_become_events_in_checkpoint_order() {
        let mut builder = EventBuilder::new(vec![transfer_source()]);
        let built = builder.build(&bundle(
            1,
            100,
            vec![
                log("0xtoken", "0xddf2", 3, 7),
                log("0xtoken", "0xddf2", 1, 2),
                log("0xother", "0xddf2", 0, 0), // address mismatch
                log("0xtoken", "0xbeef", 0, 1), // topic mismatch
            ],
        ));

        // 2 setup-less matches + 1 setup event for the chain's only source
        let names: Vec<_> = built.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ERC20:Transfer"; 3]);
        assert!(matches!(built.events[0].data, EventData::Setup));
        let cps: Vec<_> = built.events.iter().map(|e| e.checkpoint).collect();
        let mut sorted = cps.clone();
        sorted.sort();
        assert_eq!(cps, sorted);
        assert_eq!(built.events[1].checkpoint.transaction_index, 1);
        assert_eq!(built.events[2].checkpoint.transaction_index, 3);
    }

    #[test]
    fn setup_emitted_once_per_chain_before_real_events() {
        let mut builder = EventBuilder::new(vec![transfer_source()]);
        let first = builder.build(&bundle(1, 100, vec![log("0xtoken", "0xddf2", 0, 0)]));
        assert!(matches!(first.events[0].data, EventData::Setup));
        assert_eq!(first.events[0].checkpoint, Checkpoint::ZERO);

        let second = builder.build(&bundle(1, 101, vec![log("0xtoken", "0xddf2", 0, 0)]));
        assert!(second.events.iter().all(|e| !matches!(e.data, EventData::Setup)));
    }

    #[test]
    fn block_source_interval() {
        let mut builder = EventBuilder::new(vec![Source::Block(BlockSource {
            name: "hourly".into(),
            chain_id: 1,
            interval: 2,
            offset: 0,
        })]);
        let hit = builder.build(&bundle(1, 100, vec![]));
        assert!(hit.events.iter().any(|e| matches!(e.data, EventData::Block { .. })));
        let miss = builder.build(&bundle(1, 101, vec![]));
        assert!(miss.events.is_empty());
    }

    #[test]
    fn account_source_emits_transactions_and_transfers() {
        let mut builder = EventBuilder::new(vec![Source::Account(AccountSource {
            name: "vault".into(),
            chain_id: 1,
            address: "0xVault".into(),
        })]);
        let mut b = bundle(1, 50, vec![]);
        b.transactions.push(RawTransaction {
            hash: "0xt1".into(),
            transaction_index: 0,
            from: "0xvault".into(),
            to: Some("0xdead".into()),
            value: "5".into(),
            input: "0x".into(),
        });
        b.traces.push(RawTrace {
            trace_index: 0,
            transaction_index: 0,
            transaction_hash: "0xt1".into(),
            from: "0xvault".into(),
            to: Some("0xdead".into()),
            value: "0x5".into(),
            input: "0x".into(),
        });
        let built = builder.build(&b);
        let kinds: Vec<_> = built.events.iter().map(|e| e.data.kind()).collect();
        assert!(kinds.contains(&EventKind::Transaction));
        assert!(kinds.contains(&EventKind::Transfer));
    }

    #[test]
    fn undecodable_trace_value_is_dropped_not_fatal() {
        let mut builder = EventBuilder::new(vec![Source::Account(AccountSource {
            name: "vault".into(),
            chain_id: 1,
            address: "0xVault".into(),
        })]);
        let mut b = bundle(1, 50, vec![]);
        b.traces.push(RawTrace {
            trace_index: 0,
            transaction_index: 0,
            transaction_hash: "0xt1".into(),
            from: "0xvault".into(),
            to: None,
            value: "not-a-number".into(),
            input: "0x".into(),
        });
        let built = builder.build(&b);
        assert!(built.events.iter().all(|e| e.data.kind() != EventKind::Transfer));
    }

    #[test]
    fn reverted_transactions_are_skipped() {
        let mut builder = EventBuilder::new(vec![Source::Account(AccountSource {
            name: "vault".into(),
            chain_id: 1,
            address: "0xVault".into(),
        })]);
        let mut b = bundle(1, 50, vec![]);
        b.transactions.push(RawTransaction {
            hash: "0xt1".into(),
            transaction_index: 0,
            from: "0xvault".into(),
            to: None,
            value: "1".into(),
            input: "0x".into(),
        });
        b.transaction_receipts.push(RawTransactionReceipt {
            transaction_hash: "0xt1".into(),
            transaction_index: 0,
            status: false,
            gas_used: 21_000,
        });
        let built = builder.build(&b);
        assert!(built.events.iter().all(|e| e.data.kind() != EventKind::Transaction));
    }

    #[test]
    fn contract_call_traces_become_trace_events() {
        let mut builder = EventBuilder::new(vec![Source::Contract(ContractSource {
            name: "Vault:call".into(),
            chain_id: 1,
            addresses: vec!["0xVault".into()],
            topics0: vec![],
            factory: None,
            include_call_traces: true,
        })]);
        let mut b = bundle(1, 50, vec![]);
        b.traces.push(RawTrace {
            trace_index: 0,
            transaction_index: 0,
            transaction_hash: "0xt1".into(),
            from: "0xcaller".into(),
            to: Some("0xvault".into()),
            value: "0".into(),
            input: "0xdeadbeef".into(),
        });
        b.traces.push(RawTrace {
            trace_index: 1,
            transaction_index: 0,
            transaction_hash: "0xt1".into(),
            from: "0xcaller".into(),
            to: Some("0xother".into()),
            value: "0".into(),
            input: "0x".into(),
        });
        let built = builder.build(&b);
        let traces: Vec<_> = built
            .events
            .iter()
            .filter(|e| e.data.kind() == EventKind::Trace)
            .collect();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].checkpoint.event_index, 0);
    }

    #[test]
    fn factory_children_match_from_discovery_block_onward() {
        let mut builder = EventBuilder::new(vec![Source::Contract(ContractSource {
            name: "Pool:Swap".into(),
            chain_id: 1,
            addresses: vec![],
            topics0: vec!["0x5afe".into()],
            factory: Some(FactoryConfig {
                address: "0xFactory".into(),
                event_topic0: "0xc0de".into(),
                child_address_topic_index: 1,
            }),
            include_call_traces: false,
        })]);

        let child_topic = format!("0x{}{}", "0".repeat(24), "ab".repeat(20));
        let mut create = log("0xfactory", "0xc0de", 0, 0);
        create.topics.push(child_topic);
        let child_addr = format!("0x{}", "ab".repeat(20));

        let built = builder.build(&bundle(
            1,
            10,
            vec![create, log(&child_addr, "0x5afe", 1, 1)],
        ));
        // One discovered child, and its swap log in the same block matched.
        assert_eq!(built.discovered_children["Pool:Swap"].len(), 1);
        assert!(built
            .events
            .iter()
            .any(|e| matches!(&e.data, EventData::Log { log, .. } if log.log_index == 1)));

        // Forgetting the child stops matching.
        let removed: std::collections::HashSet<String> = [child_addr.clone()].into();
        builder.forget_children(&removed);
        let after = builder.build(&bundle(1, 11, vec![log(&child_addr, "0x5afe", 0, 0)]));
        assert!(after.events.is_empty());
    }
}
