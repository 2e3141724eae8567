//! EVM ledger adapters
//!
//! Source side reads `Deposited` logs through an alloy provider. Destination
//! side submits `fulfill` with the relayer key and tracks receipts over raw
//! JSON-RPC until the configured confirmation depth is reached.
//!
//! Node error text is interpreted here and nowhere else: [`classify_node_error`]
//! turns it into a [`LedgerError`] variant.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, FixedBytes, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::Filter;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::Url;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    DestinationLedger, FulfillRequest, PendingSubmission, SourceLedger, SubmissionReceipt,
    SubmitOptions,
};
use crate::contracts::simple_bridge::SimpleBridge;
use crate::error::LedgerError;
use crate::metrics;
use crate::types::{ChainTag, DepositId, DepositNotification, EvmAddress};

/// Map a node / transport error message onto the ledger error taxonomy
pub fn classify_node_error(error: &str) -> LedgerError {
    let error_lower = error.to_lowercase();

    // Contract reverts carrying the bridge's own reasons
    if error_lower.contains("alreadyprocessed") || error_lower.contains("already processed") {
        return LedgerError::AlreadyProcessed;
    }
    if error_lower.contains("notrelayer") {
        return LedgerError::NotRelayer;
    }

    // Ordering metadata
    if error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
        || error_lower.contains("already known")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("underpriced")
    {
        return LedgerError::OrderingConflict(error.to_string());
    }

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return LedgerError::Unavailable(error.to_string());
    }

    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
    {
        return LedgerError::Rejected(error.to_string());
    }

    // Unknown: retried with backoff, bounded by the retry policy
    LedgerError::Unavailable(error.to_string())
}

fn to_evm_address(address: Address) -> EvmAddress {
    EvmAddress(address.into_array())
}

// ============================================================================
// Source
// ============================================================================

/// Deposit log reader for one bridge contract
pub struct EvmSourceLedger {
    provider: RootProvider<Http<Client>>,
    bridge_address: Address,
    finality_blocks: u64,
}

impl EvmSourceLedger {
    pub fn new(rpc_url: &str, bridge_address: &str, finality_blocks: u64) -> Result<Self> {
        let url: Url = rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);
        let bridge_address =
            Address::from_str(bridge_address).wrap_err("Invalid bridge address")?;

        Ok(Self {
            provider,
            bridge_address,
            finality_blocks,
        })
    }
}

#[async_trait]
impl SourceLedger for EvmSourceLedger {
    async fn head(&self) -> Result<u64, LedgerError> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| classify_node_error(&e.to_string()))?;
        Ok(block.saturating_sub(self.finality_blocks))
    }

    async fn deposits_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<DepositNotification>, LedgerError> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(SimpleBridge::Deposited::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| classify_node_error(&e.to_string()))?;

        let mut deposits = Vec::with_capacity(logs.len());
        for log in logs {
            let Some(block_number) = log.block_number else {
                // Pending logs carry no position
                continue;
            };
            let decoded = match log.log_decode::<SimpleBridge::Deposited>() {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(block_number, error = %e, "Failed to decode Deposited log");
                    continue;
                }
            };
            if let Some(deposit) = deposit_from_event(&decoded.inner.data, block_number) {
                deposits.push(deposit);
            }
        }

        debug!(from, to, count = deposits.len(), "Fetched deposit logs");
        Ok(deposits)
    }
}

/// Convert a decoded `Deposited` event, or escalate it when its amount or
/// chain id cannot be represented locally
fn deposit_from_event(
    event: &SimpleBridge::Deposited,
    block_number: u64,
) -> Option<DepositNotification> {
    let id = DepositId(event.depositId.0);
    let (Ok(amount), Ok(dest_chain_tag)) =
        (u128::try_from(event.amount), u64::try_from(event.dstChainId))
    else {
        error!(
            block_number,
            deposit_id = %id,
            sender = %to_evm_address(event.from),
            recipient = %to_evm_address(event.to),
            amount = %event.amount,
            dst_chain_id = %event.dstChainId,
            "Deposit fields out of supported range, operator attention required"
        );
        metrics::record_failed("unsupported_fields");
        return None;
    };

    Some(DepositNotification {
        id,
        sender: to_evm_address(event.from),
        recipient: to_evm_address(event.to),
        amount,
        dest_chain_tag: ChainTag(dest_chain_tag),
        observed_at: block_number,
    })
}

// ============================================================================
// Destination
// ============================================================================

/// EVM transaction receipt from RPC
#[derive(Debug, Deserialize)]
struct TransactionReceipt {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    status: Option<String>,
}

/// EVM RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

fn parse_hex_u64(hex: &str) -> Result<u64, LedgerError> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| LedgerError::Unavailable(format!("malformed quantity {}: {}", hex, e)))
}

/// Relayer-keyed fulfill submitter for one bridge contract
pub struct EvmDestinationLedger {
    rpc_url: Url,
    bridge_address: Address,
    signer: PrivateKeySigner,
    confirmations: u64,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl EvmDestinationLedger {
    pub fn new(
        rpc_url: &str,
        bridge_address: &str,
        private_key: &str,
        confirmations: u64,
        poll_interval: Duration,
    ) -> Result<Self> {
        let rpc_url: Url = rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let bridge_address =
            Address::from_str(bridge_address).wrap_err("Invalid bridge address")?;
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        info!(
            relayer_address = %signer.address(),
            bridge = %bridge_address,
            confirmations,
            "EVM destination initialized"
        );

        Ok(Self {
            rpc_url,
            bridge_address,
            signer,
            confirmations,
            poll_interval,
            client,
        })
    }

    /// Address fulfillments are submitted from
    pub fn relayer_address(&self) -> EvmAddress {
        to_evm_address(self.signer.address())
    }

    async fn rpc_call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, LedgerError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(self.rpc_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?
            .json::<RpcResponse<T>>()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(classify_node_error(&format!(
                "RPC error: {} - {}",
                error.code, error.message
            )));
        }

        Ok(response.result)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, LedgerError> {
        self.rpc_call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await
    }

    async fn get_block_number(&self) -> Result<u64, LedgerError> {
        let hex: String = self
            .rpc_call("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| LedgerError::Unavailable("no block number returned".to_string()))?;
        parse_hex_u64(&hex)
    }
}

#[async_trait]
impl DestinationLedger for EvmDestinationLedger {
    async fn is_processed(&self, id: &DepositId) -> Result<bool, LedgerError> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url.clone());
        let contract = SimpleBridge::new(self.bridge_address, &provider);
        let result = contract
            .isProcessed(FixedBytes::from(id.0))
            .call()
            .await
            .map_err(|e| classify_node_error(&e.to_string()))?;
        Ok(result._0)
    }

    async fn submit_fulfill(
        &self,
        request: &FulfillRequest,
        options: SubmitOptions,
    ) -> Result<PendingSubmission, LedgerError> {
        if request.recipient.is_zero() {
            return Err(LedgerError::InvalidRecipient(request.recipient.to_hex()));
        }

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());

        let contract = SimpleBridge::new(self.bridge_address, &provider);
        let mut call = contract.fulfill(
            Address::from(request.recipient.0),
            U256::from(request.amount),
            FixedBytes::from(request.id.0),
        );

        if options.refresh_ordering {
            let nonce = provider
                .get_transaction_count(self.signer.address())
                .pending()
                .await
                .map_err(|e| classify_node_error(&e.to_string()))?;
            debug!(deposit_id = %request.id, nonce, "Using refreshed nonce");
            call = call.nonce(nonce);
        }

        debug!(
            deposit_id = %request.id,
            to = %request.recipient,
            amount = request.amount,
            "Submitting fulfill"
        );

        let pending_tx = call
            .send()
            .await
            .map_err(|e| classify_node_error(&e.to_string()))?;

        let tx_hash = format!("0x{:x}", pending_tx.tx_hash());
        info!(deposit_id = %request.id, %tx_hash, "Fulfill transaction sent");

        Ok(PendingSubmission {
            id: request.id,
            tx_hash,
        })
    }

    async fn await_confirmation(
        &self,
        submission: &PendingSubmission,
    ) -> Result<SubmissionReceipt, LedgerError> {
        loop {
            let Some(receipt) = self.get_transaction_receipt(&submission.tx_hash).await? else {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            };

            if receipt.status.as_deref() == Some("0x0") {
                return Err(LedgerError::Rejected(format!(
                    "transaction {} reverted",
                    submission.tx_hash
                )));
            }

            let Some(block_hex) = receipt.block_number else {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            };
            let tx_block = parse_hex_u64(&block_hex)?;
            let current_block = self.get_block_number().await?;
            let confirmations = current_block.saturating_sub(tx_block) + 1;

            if confirmations >= self.confirmations {
                return Ok(SubmissionReceipt {
                    tx_hash: submission.tx_hash.clone(),
                    position: tx_block,
                });
            }

            debug!(
                tx_hash = %submission.tx_hash,
                confirmations,
                required = self.confirmations,
                "Waiting for confirmations"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Anvil's first default account
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_classify_bridge_reverts() {
        assert_eq!(
            classify_node_error("execution reverted: AlreadyProcessed"),
            LedgerError::AlreadyProcessed
        );
        assert_eq!(
            classify_node_error("execution reverted: NotRelayer"),
            LedgerError::NotRelayer
        );
    }

    #[test]
    fn test_classify_ordering_and_transport() {
        assert!(matches!(
            classify_node_error("nonce too low: next nonce 5, tx nonce 4"),
            LedgerError::OrderingConflict(_)
        ));
        assert!(matches!(
            classify_node_error("replacement transaction underpriced"),
            LedgerError::OrderingConflict(_)
        ));
        assert!(matches!(
            classify_node_error("connection refused"),
            LedgerError::Unavailable(_)
        ));
        assert!(matches!(
            classify_node_error("HTTP error 503"),
            LedgerError::Unavailable(_)
        ));
    }

    #[test]
    fn test_classify_permanent_and_unknown() {
        assert!(matches!(
            classify_node_error("insufficient funds for gas * price + value"),
            LedgerError::Rejected(_)
        ));
        assert!(matches!(
            classify_node_error("execution reverted"),
            LedgerError::Rejected(_)
        ));
        assert!(classify_node_error("something odd happened").is_transient());
    }

    #[test]
    fn test_destination_rejects_bad_inputs() {
        let bridge = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
        assert!(EvmDestinationLedger::new(
            "http://127.0.0.1:8545",
            bridge,
            "not-a-key",
            1,
            Duration::from_millis(100)
        )
        .is_err());
        assert!(EvmDestinationLedger::new(
            "http://127.0.0.1:8545",
            "0x1234",
            TEST_KEY,
            1,
            Duration::from_millis(100)
        )
        .is_err());
    }

    #[test]
    fn test_relayer_address_from_key() {
        let ledger = EvmDestinationLedger::new(
            "http://127.0.0.1:8545",
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            TEST_KEY,
            1,
            Duration::from_millis(100),
        )
        .unwrap();
        assert_eq!(
            ledger.relayer_address().to_hex(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    fn deposited(amount: U256, dst_chain_id: U256) -> SimpleBridge::Deposited {
        SimpleBridge::Deposited {
            from: Address::repeat_byte(0x01),
            to: Address::repeat_byte(0x02),
            amount,
            dstChainId: dst_chain_id,
            depositId: FixedBytes([0x42; 32]),
        }
    }

    #[test]
    fn test_deposit_from_event_converts_fields() {
        let deposit = deposit_from_event(&deposited(U256::from(500u64), U256::from(1000u64)), 9)
            .unwrap();
        assert_eq!(deposit.id, DepositId([0x42; 32]));
        assert_eq!(deposit.sender, EvmAddress([0x01; 20]));
        assert_eq!(deposit.recipient, EvmAddress([0x02; 20]));
        assert_eq!(deposit.amount, 500);
        assert_eq!(deposit.dest_chain_tag, ChainTag(1000));
        assert_eq!(deposit.observed_at, 9);
    }

    #[test]
    fn test_unrepresentable_deposit_is_counted_as_failed() {
        let failed = metrics::FAILED_DEPOSITS.with_label_values(&["unsupported_fields"]);
        let before = failed.get();

        assert!(deposit_from_event(&deposited(U256::MAX, U256::from(1u64)), 3).is_none());
        assert!(deposit_from_event(&deposited(U256::from(1u64), U256::MAX), 4).is_none());

        assert!(failed.get() >= before + 2.0);
    }

    #[test]
    fn test_parse_hex_quantity() {
        assert_eq!(parse_hex_u64("0x1b4").unwrap(), 436);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
