use std::fmt;
use std::str::FromStr;

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// keccak256("Transfer(address,address,uint256)")
pub const ERC20_TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainType {
    #[default]
    Evm,
    Sol,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Evm => "EVM",
            ChainType::Sol => "SOL",
        }
    }

    /// Name of the chain-scoped membership list.
    pub fn list_key(&self) -> &'static str {
        match self {
            ChainType::Evm => "monitored:evm",
            ChainType::Sol => "monitored:sol",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EVM" => Ok(ChainType::Evm),
            "SOL" | "SOLANA" => Ok(ChainType::Sol),
            other => Err(AppError::Validation(format!("Unknown chain type: {}", other))),
        }
    }
}

/// Canonical form of a monitored wallet address: lowercase hex for EVM,
/// case-preserved base58 for Solana.
pub fn normalize_address(chain: ChainType, raw: &str) -> AppResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Address is empty".to_string()));
    }

    match chain {
        ChainType::Evm => {
            if trimmed.len() != 42 || !(trimmed.starts_with("0x") || trimmed.starts_with("0X")) {
                return Err(AppError::Validation(format!("Invalid EVM address: {}", trimmed)));
            }
            Address::from_str(&trimmed[2..])
                .map_err(|_| AppError::Validation(format!("Invalid EVM address: {}", trimmed)))?;
            Ok(format!("0x{}", trimmed[2..].to_ascii_lowercase()))
        }
        ChainType::Sol => {
            let decoded = bs58::decode(trimmed)
                .into_vec()
                .map_err(|_| AppError::Validation(format!("Invalid Solana address: {}", trimmed)))?;
            if decoded.len() != 32 {
                return Err(AppError::Validation(format!("Invalid Solana address: {}", trimmed)));
            }
            Ok(trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(AppError::Persistence(format!("Unknown direction: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Failed,
}

impl TxStatus {
    /// Receipt status quantity: `0x1` success, `0x0` failure.
    pub fn from_receipt(status: Option<&str>) -> Option<Self> {
        match parse_quantity_u64(status?)? {
            1 => Some(TxStatus::Success),
            0 => Some(TxStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "success",
            TxStatus::Failed => "failed",
        }
    }
}

impl FromStr for TxStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(TxStatus::Success),
            "failed" => Ok(TxStatus::Failed),
            other => Err(AppError::Persistence(format!("Unknown tx status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    NativeTransfer,
    Erc20Transfer,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NativeTransfer => "nativeTransfer",
            EventType::Erc20Transfer => "erc20Transfer",
        }
    }
}

impl FromStr for EventType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nativeTransfer" => Ok(EventType::NativeTransfer),
            "erc20Transfer" => Ok(EventType::Erc20Transfer),
            other => Err(AppError::Validation(format!("Unknown event type: {}", other))),
        }
    }
}

/// Transfer-specific part of an [`ActivityEvent`]. Amounts are exact base-unit
/// integers rendered as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TransferKind {
    NativeTransfer { amount: String },
    Erc20Transfer { token_address: String, amount_raw: String },
}

impl TransferKind {
    pub fn event_type(&self) -> EventType {
        match self {
            TransferKind::NativeTransfer { .. } => EventType::NativeTransfer,
            TransferKind::Erc20Transfer { .. } => EventType::Erc20Transfer,
        }
    }

    pub fn amount(&self) -> &str {
        match self {
            TransferKind::NativeTransfer { amount } => amount,
            TransferKind::Erc20Transfer { amount_raw, .. } => amount_raw,
        }
    }

    pub fn token_address(&self) -> Option<&str> {
        match self {
            TransferKind::NativeTransfer { .. } => None,
            TransferKind::Erc20Transfer { token_address, .. } => Some(token_address),
        }
    }
}

/// One detected transfer touching a monitored address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub event_id: String,
    #[serde(flatten)]
    pub kind: TransferKind,
    pub matched_address: String,
    pub direction: Direction,
    pub counterparty: String,
    pub network: String,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub log_index: Option<u64>,
    pub status: Option<TxStatus>,
}

impl ActivityEvent {
    pub fn native_event_id(tx_hash: &str) -> String {
        format!("{}:native", tx_hash)
    }

    pub fn erc20_event_id(tx_hash: &str, log_index: Option<u64>) -> String {
        match log_index {
            Some(index) => format!("{}:{}", tx_hash, index),
            None => format!("{}:unknown", tx_hash),
        }
    }
}

/// Optional filters for reading persisted activity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityQuery {
    pub address: Option<String>,
    pub event_type: Option<EventType>,
    pub limit: Option<u32>,
}

impl ActivityQuery {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 200;

    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub wallet_address: String,
    pub chain_type: ChainType,
    pub name: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Row to be inserted by the registry. The address is already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub wallet_address: String,
    pub chain_type: ChainType,
    pub name: String,
    pub display_name: Option<String>,
}

impl NewUser {
    pub fn into_user(self) -> User {
        User {
            id: Uuid::new_v4(),
            wallet_address: self.wallet_address,
            chain_type: self.chain_type,
            name: self.name,
            display_name: self.display_name,
            created_at: Utc::now(),
        }
    }
}

/// `0x1234…abcd` style label used when no name is supplied.
pub fn short_address(address: &str) -> String {
    if address.len() <= 12 {
        return address.to_string();
    }
    format!("{}…{}", &address[..6], &address[address.len() - 4..])
}

// Stream payload as delivered by the block_with_receipts dataset.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamPayload {
    #[serde(default)]
    pub data: Vec<StreamItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamItem {
    pub block: Option<Block>,
    #[serde(default)]
    pub receipts: Vec<Receipt>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: String,
    pub status: Option<String>,
    pub contract_address: Option<String>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    pub log_index: Option<String>,
    pub transaction_hash: Option<String>,
}

/// Parses a JSON-RPC quantity. `0x`-prefixed values are hex, bare digits decimal.
/// An empty hex body (`0x`) is zero.
pub fn parse_quantity(raw: &str) -> Option<BigUint> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some("") => Some(BigUint::default()),
        Some(hex) => BigUint::parse_bytes(hex.as_bytes(), 16),
        None if raw.is_empty() => None,
        None => BigUint::parse_bytes(raw.as_bytes(), 10),
    }
}

pub fn parse_quantity_u64(raw: &str) -> Option<u64> {
    let value = parse_quantity(raw)?;
    match value.to_u64_digits().as_slice() {
        [] => Some(0),
        [single] => Some(*single),
        _ => None,
    }
}

/// Rightmost 20 bytes of a 32-byte indexed topic, as a lowercase address.
pub fn topic_to_address(topic: &str) -> Option<String> {
    let hex = topic.strip_prefix("0x")?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex[24..].to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_topic_matches_signature_hash() {
        let hash = alloy_primitives::keccak256("Transfer(address,address,uint256)");
        assert_eq!(format!("0x{}", hex::encode(hash)), ERC20_TRANSFER_TOPIC);
    }

    #[test]
    fn test_normalize_evm_lowercases() {
        let normalized =
            normalize_address(ChainType::Evm, " 0xAbCdEf0123456789aBcDeF0123456789AbCdEf01 ").unwrap();
        assert_eq!(normalized, "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn test_normalize_evm_rejects_malformed() {
        assert!(normalize_address(ChainType::Evm, "bad").is_err());
        assert!(normalize_address(ChainType::Evm, "0x1234").is_err());
        assert!(normalize_address(ChainType::Evm, "0xzz00000000000000000000000000000000000000").is_err());
        assert!(normalize_address(ChainType::Evm, "").is_err());
    }

    #[test]
    fn test_normalize_sol_preserves_case() {
        let addr = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
        assert_eq!(normalize_address(ChainType::Sol, addr).unwrap(), addr);
        assert!(normalize_address(ChainType::Sol, "0OIl").is_err());
        assert!(normalize_address(ChainType::Sol, "abc").is_err());
    }

    #[test]
    fn test_event_ids() {
        assert_eq!(ActivityEvent::native_event_id("0xabc"), "0xabc:native");
        assert_eq!(ActivityEvent::erc20_event_id("0xabc", Some(7)), "0xabc:7");
        assert_eq!(ActivityEvent::erc20_event_id("0xabc", None), "0xabc:unknown");
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0xde0b6b3a7640000").unwrap().to_string(), "1000000000000000000");
        assert_eq!(parse_quantity("0x").unwrap().to_string(), "0");
        assert_eq!(parse_quantity("42").unwrap().to_string(), "42");
        assert!(parse_quantity("0xnothex").is_none());
        assert_eq!(parse_quantity_u64("0x10"), Some(16));
    }

    #[test]
    fn test_topic_to_address() {
        let topic = "0x000000000000000000000000AbCdEf0123456789aBcDeF0123456789AbCdEf01";
        assert_eq!(
            topic_to_address(topic).unwrap(),
            "0xabcdef0123456789abcdef0123456789abcdef01"
        );
        assert!(topic_to_address("0x1234").is_none());
    }

    #[test]
    fn test_receipt_status() {
        assert_eq!(TxStatus::from_receipt(Some("0x1")), Some(TxStatus::Success));
        assert_eq!(TxStatus::from_receipt(Some("0x0")), Some(TxStatus::Failed));
        assert_eq!(TxStatus::from_receipt(None), None);
    }

    #[test]
    fn test_activity_event_serialization() {
        let event = ActivityEvent {
            event_id: "0xabc:3".into(),
            kind: TransferKind::Erc20Transfer {
                token_address: "0xtoken".into(),
                amount_raw: "5".into(),
            },
            matched_address: "0xme".into(),
            direction: Direction::In,
            counterparty: "0xthem".into(),
            network: "ethereum-mainnet".into(),
            block_number: 10,
            block_timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            tx_hash: "0xabc".into(),
            log_index: Some(3),
            status: None,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventType"], "erc20Transfer");
        assert_eq!(value["amountRaw"], "5");
        assert_eq!(value["tokenAddress"], "0xtoken");
        assert_eq!(value["direction"], "in");
        assert_eq!(value["logIndex"], 3);

        let back: ActivityEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
