//! Classifies stream blocks into [`ActivityEvent`]s for monitored addresses.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::membership::MembershipOracle;
use crate::types::{
    parse_quantity, parse_quantity_u64, topic_to_address, ActivityEvent, Block, ChainType,
    Direction, Log, Receipt, StreamItem, StreamPayload, TransferKind, TxStatus,
    ERC20_TRANSFER_TOPIC,
};

/// ERC-20 `Transfer` parsed out of a log. ERC-721 shares the topic but indexes
/// the token id as a fourth topic, so only three-topic logs qualify.
#[derive(Debug, Clone)]
struct TransferLog<'a> {
    log: &'a Log,
    tx_hash: &'a str,
    from: String,
    to: String,
}

fn as_erc20_transfer<'a>(log: &'a Log, receipt: &'a Receipt) -> Option<TransferLog<'a>> {
    if log.topics.len() != 3 || !log.topics[0].eq_ignore_ascii_case(ERC20_TRANSFER_TOPIC) {
        return None;
    }
    Some(TransferLog {
        log,
        tx_hash: log.transaction_hash.as_deref().unwrap_or(&receipt.transaction_hash),
        from: topic_to_address(&log.topics[1])?,
        to: topic_to_address(&log.topics[2])?,
    })
}

/// Which side of a transfer is monitored, from the monitored address's view.
fn classify(
    from: &str,
    to: &str,
    monitored: &HashMap<String, bool>,
) -> Option<(String, Direction, String)> {
    let is_monitored = |address: &str| monitored.get(address).copied().unwrap_or(false);
    if is_monitored(from) {
        Some((from.to_string(), Direction::Out, to.to_string()))
    } else if is_monitored(to) {
        Some((to.to_string(), Direction::In, from.to_string()))
    } else {
        None
    }
}

#[derive(Clone)]
pub struct EventExtractor {
    oracle: MembershipOracle,
    network: String,
}

impl EventExtractor {
    pub fn new(oracle: MembershipOracle, network: impl Into<String>) -> Self {
        Self {
            oracle,
            network: network.into(),
        }
    }

    /// Every event in the delivery, in block order. Empty when nothing touched
    /// a monitored address. Any error aborts the whole delivery.
    pub async fn extract(&self, payload: &StreamPayload) -> AppResult<Vec<ActivityEvent>> {
        let mut events = Vec::new();
        for item in &payload.data {
            events.extend(self.extract_item(item).await?);
        }
        Ok(events)
    }

    async fn extract_item(&self, item: &StreamItem) -> AppResult<Vec<ActivityEvent>> {
        let Some(block) = item.block.as_ref() else {
            debug!("stream item without block, skipping");
            return Ok(Vec::new());
        };

        let block_number = parse_quantity_u64(&block.number).ok_or_else(|| {
            AppError::MalformedPayload(format!("Invalid block number: {}", block.number))
        })?;
        let block_timestamp = parse_block_timestamp(block)?;

        let receipts: HashMap<String, &Receipt> = item
            .receipts
            .iter()
            .map(|r| (r.transaction_hash.to_ascii_lowercase(), r))
            .collect();

        let transfers: Vec<TransferLog> = item
            .receipts
            .iter()
            .flat_map(|receipt| receipt.logs.iter().filter_map(move |log| as_erc20_transfer(log, receipt)))
            .collect();

        let mut candidates = BTreeSet::new();
        for tx in &block.transactions {
            candidates.insert(tx.from.to_ascii_lowercase());
            if let Some(to) = &tx.to {
                candidates.insert(to.to_ascii_lowercase());
            }
        }
        for transfer in &transfers {
            candidates.insert(transfer.from.clone());
            candidates.insert(transfer.to.clone());
        }

        let candidates: Vec<String> = candidates.into_iter().collect();
        let flags = self.oracle.contains(ChainType::Evm, &candidates).await?;
        let monitored: HashMap<String, bool> = candidates.into_iter().zip(flags).collect();
        if !monitored.values().any(|m| *m) {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();

        for tx in &block.transactions {
            let value = tx.value.as_deref().and_then(parse_quantity).unwrap_or_default();
            if value.bits() == 0 {
                continue;
            }

            let tx_hash = tx.hash.to_ascii_lowercase();
            let receipt = receipts.get(&tx_hash);
            let from = tx.from.to_ascii_lowercase();
            // contract creation: the receiver is the deployed contract, if known
            let to = tx
                .to
                .clone()
                .or_else(|| receipt.and_then(|r| r.contract_address.clone()))
                .unwrap_or_default()
                .to_ascii_lowercase();

            let Some((matched_address, direction, counterparty)) = classify(&from, &to, &monitored)
            else {
                continue;
            };

            events.push(ActivityEvent {
                event_id: ActivityEvent::native_event_id(&tx_hash),
                kind: TransferKind::NativeTransfer {
                    amount: value.to_string(),
                },
                matched_address,
                direction,
                counterparty,
                network: self.network.clone(),
                block_number,
                block_timestamp,
                tx_hash,
                log_index: None,
                status: receipt.and_then(|r| TxStatus::from_receipt(r.status.as_deref())),
            });
        }

        for transfer in &transfers {
            let Some((matched_address, direction, counterparty)) =
                classify(&transfer.from, &transfer.to, &monitored)
            else {
                continue;
            };

            let tx_hash = transfer.tx_hash.to_ascii_lowercase();
            let log_index = transfer.log.log_index.as_deref().and_then(parse_quantity_u64);
            let amount_raw = parse_quantity(&transfer.log.data)
                .ok_or_else(|| {
                    AppError::MalformedPayload(format!("Invalid transfer amount in {}", tx_hash))
                })?
                .to_string();

            events.push(ActivityEvent {
                event_id: ActivityEvent::erc20_event_id(&tx_hash, log_index),
                kind: TransferKind::Erc20Transfer {
                    token_address: transfer.log.address.to_ascii_lowercase(),
                    amount_raw,
                },
                matched_address,
                direction,
                counterparty,
                network: self.network.clone(),
                block_number,
                block_timestamp,
                status: receipts
                    .get(&tx_hash)
                    .and_then(|r| TxStatus::from_receipt(r.status.as_deref())),
                tx_hash,
                log_index,
            });
        }

        debug!(block_number, events = events.len(), "block classified");
        Ok(events)
    }
}

fn parse_block_timestamp(block: &Block) -> AppResult<DateTime<Utc>> {
    parse_quantity_u64(&block.timestamp)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| {
            AppError::MalformedPayload(format!("Invalid block timestamp: {}", block.timestamp))
        })
}
