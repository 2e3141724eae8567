//! Common types for the deposit → fulfillment relay
//!
//! Identifiers, account references, the per-deposit record and its
//! database-compatible status enum.

use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::{bytes32_to_hex, keccak256};

// ============================================================================
// Identifiers
// ============================================================================

/// Globally unique key of one logical transfer (32 bytes).
///
/// Chosen by the depositor or derived deterministically; the sole key used for
/// replay protection on the destination ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DepositId(pub [u8; 32]);

impl DepositId {
    /// keccak256 of a UTF-8 label, the same derivation as ethers' `id()`
    pub fn from_label(label: &str) -> Self {
        DepositId(keccak256(label.as_bytes()))
    }

    /// Fresh identifier derived from the current timestamp
    pub fn fresh() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self::from_label(&nanos.to_string())
    }

    /// Create from hex string (with or without 0x prefix)
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let bytes = hex::decode(hex)?;
        if bytes.len() != 32 {
            return Err(eyre!("DepositId must be 32 bytes, got {}", bytes.len()));
        }
        let mut result = [0u8; 32];
        result.copy_from_slice(&bytes);
        Ok(DepositId(result))
    }

    /// Lowercase hex with 0x prefix
    pub fn to_hex(&self) -> String {
        bytes32_to_hex(&self.0)
    }
}

impl fmt::Display for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DepositId({})", self.to_hex())
    }
}

impl Serialize for DepositId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DepositId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DepositId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// EVM address (20 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EvmAddress(pub [u8; 20]);

impl EvmAddress {
    pub const ZERO: EvmAddress = EvmAddress([0u8; 20]);

    /// Create from hex string (with or without 0x prefix)
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let bytes = hex::decode(hex)?;
        if bytes.len() != 20 {
            return Err(eyre!("EvmAddress must be 20 bytes, got {}", bytes.len()));
        }
        let mut result = [0u8; 20];
        result.copy_from_slice(&bytes);
        Ok(EvmAddress(result))
    }

    /// Lowercase hex with 0x prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvmAddress({})", self.to_hex())
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EvmAddress::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Routing hint naming the destination ledger (the bridge's `dstChainId`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainTag(pub u64);

impl fmt::Display for ChainTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Notifications and records
// ============================================================================

/// A deposit as observed in the source ledger's event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositNotification {
    pub id: DepositId,
    pub sender: EvmAddress,
    pub recipient: EvmAddress,
    pub amount: u128,
    pub dest_chain_tag: ChainTag,
    /// Source ledger position (block height) of the deposit event
    pub observed_at: u64,
}

/// Processing status of a deposit record
///
/// `Observed → Submitted → {Confirmed | Failed}`, with `Submitted → Observed`
/// on a transient failure. `Confirmed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Observed,
    Submitted,
    Confirmed,
    Failed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Observed,
        Status::Submitted,
        Status::Confirmed,
        Status::Failed,
    ];

    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Observed => "observed",
            Status::Submitted => "submitted",
            Status::Confirmed => "confirmed",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Confirmed | Status::Failed)
    }

    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Observed, Status::Submitted)
                | (Status::Submitted, Status::Confirmed)
                | (Status::Submitted, Status::Observed)
                | (Status::Submitted, Status::Failed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "observed" => Ok(Status::Observed),
            "submitted" => Ok(Status::Submitted),
            "confirmed" => Ok(Status::Confirmed),
            "failed" => Ok(Status::Failed),
            other => Err(eyre!("unknown deposit status: {}", other)),
        }
    }
}

/// Locally tracked state of one deposit
///
/// `amount`, `recipient` and `dest_chain_tag` are immutable once observed.
/// Records are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub id: DepositId,
    pub sender: EvmAddress,
    pub recipient: EvmAddress,
    pub amount: u128,
    pub dest_chain_tag: ChainTag,
    pub observed_at: u64,
    pub status: Status,
    /// Fulfillment attempts that ended in a transient failure
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Destination transaction that confirmed the fulfillment, when known
    pub fulfillment_tx: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DepositRecord {
    /// New `Observed` record for a notification
    pub fn observed(notification: &DepositNotification) -> Self {
        let now = Utc::now();
        Self {
            id: notification.id,
            sender: notification.sender,
            recipient: notification.recipient,
            amount: notification.amount,
            dest_chain_tag: notification.dest_chain_tag,
            observed_at: notification.observed_at,
            status: Status::Observed,
            attempts: 0,
            last_error: None,
            fulfillment_tx: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a notification describes the same transfer as this record
    pub fn matches(&self, notification: &DepositNotification) -> bool {
        self.id == notification.id
            && self.recipient == notification.recipient
            && self.amount == notification.amount
            && self.dest_chain_tag == notification.dest_chain_tag
    }
}
