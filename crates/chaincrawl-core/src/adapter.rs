//! JSON-RPC adapter for EVM chains.
//!
//! One transport serves every supported chain. What differs between Ethereum,
//! Polygon and BSC is captured by [`ChainKind`]: confirmation defaults, fee
//! estimation, sync tolerance and the shape of token metadata attributes.

use async_trait::async_trait;
use log::{debug, error, warn};
use primitive_types::U256;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::decode::{decode_abi_string, encode_call_u256, function_selector, parse_token_id};
use crate::metadata::{
    attributes_from_array, attributes_from_object, fetch_document, gateway_url, partial_metadata,
};
use crate::{
    AdapterBuilder, Block, ChainAdapter, ChainConfig, ChainStatus, CrawlError, CrawlResult,
    RawLog, SyncStatus, TokenAttribute, TokenMetadata, Transaction, TransactionReceipt,
};

const GWEI: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    Ethereum,
    Polygon,
    Bsc,
}

impl ChainKind {
    pub fn from_chain_id(chain_id: &str) -> CrawlResult<Self> {
        match chain_id.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Ok(ChainKind::Ethereum),
            "polygon" | "matic" => Ok(ChainKind::Polygon),
            "bsc" | "binance" => Ok(ChainKind::Bsc),
            other => Err(CrawlError::UnsupportedChain(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChainKind::Ethereum => "ethereum",
            ChainKind::Polygon => "polygon",
            ChainKind::Bsc => "bsc",
        }
    }

    /// Blocks that must build on a block before it is processed
    pub fn default_confirmations(&self) -> u64 {
        match self {
            ChainKind::Ethereum => 12,
            ChainKind::Polygon => 64,
            ChainKind::Bsc => 15,
        }
    }

    pub fn average_gas_per_transaction(&self) -> u64 {
        match self {
            ChainKind::Ethereum => 50_000,
            ChainKind::Polygon => 80_000,
            ChainKind::Bsc => 60_000,
        }
    }

    /// Largest gap between the node's head and the network head still reported as synced
    pub fn sync_tolerance(&self) -> u64 {
        match self {
            ChainKind::Ethereum => 5,
            ChainKind::Polygon => 10,
            ChainKind::Bsc => 20,
        }
    }

    pub fn normalize_attributes(&self, doc: &Value) -> Vec<TokenAttribute> {
        match self {
            ChainKind::Ethereum => attributes_from_array(doc.get("attributes")),
            ChainKind::Polygon => match doc.get("properties") {
                Some(Value::Object(_)) => attributes_from_object(doc.get("properties")),
                _ => attributes_from_array(doc.get("attributes")),
            },
            ChainKind::Bsc => match doc.get("attributes") {
                Some(Value::Object(_)) => attributes_from_object(doc.get("attributes")),
                _ => attributes_from_array(doc.get("attributes")),
            },
        }
    }
}

pub fn parse_quantity(value: &Value) -> CrawlResult<u64> {
    match value {
        Value::String(s) => u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|e| CrawlError::Decode(format!("invalid quantity {}: {}", s, e))),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| CrawlError::Decode(format!("invalid quantity {}", n))),
        other => Err(CrawlError::Decode(format!("expected quantity, got {}", other))),
    }
}

pub fn parse_u256(value: &Value) -> CrawlResult<U256> {
    match value {
        Value::String(s) => U256::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|e| CrawlError::Decode(format!("invalid quantity {}: {:?}", s, e))),
        other => Err(CrawlError::Decode(format!("expected hex quantity, got {}", other))),
    }
}

fn str_field(value: &Value, field: &str) -> CrawlResult<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CrawlError::Decode(format!("missing field {}", field)))
}

fn quantity_field(value: &Value, field: &str) -> CrawlResult<u64> {
    parse_quantity(
        value
            .get(field)
            .ok_or_else(|| CrawlError::Decode(format!("missing field {}", field)))?,
    )
}

pub fn parse_block(value: &Value) -> CrawlResult<Block> {
    let transactions = match value.get("transactions") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|tx| match tx {
                Value::String(hash) => Some(hash.clone()),
                Value::Object(_) => tx.get("hash").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(Block {
        number: quantity_field(value, "number")?,
        hash: str_field(value, "hash")?,
        parent_hash: str_field(value, "parentHash")?,
        timestamp: quantity_field(value, "timestamp")?,
        transactions,
    })
}

pub fn parse_transaction(value: &Value) -> CrawlResult<Transaction> {
    Ok(Transaction {
        hash: str_field(value, "hash")?,
        block_number: value
            .get("blockNumber")
            .filter(|v| !v.is_null())
            .map(parse_quantity)
            .transpose()?,
        from: str_field(value, "from")?,
        to: value.get("to").and_then(Value::as_str).map(str::to_string),
        value: value
            .get("value")
            .map(parse_u256)
            .transpose()?
            .unwrap_or_default()
            .to_string(),
    })
}

pub fn parse_receipt(value: &Value) -> CrawlResult<TransactionReceipt> {
    let block_number = quantity_field(value, "blockNumber")?;
    let transaction_hash = str_field(value, "transactionHash")?;
    let logs = match value.get("logs") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|log| -> CrawlResult<RawLog> {
                Ok(RawLog {
                    address: str_field(log, "address")?,
                    topics: log
                        .get("topics")
                        .and_then(Value::as_array)
                        .map(|topics| {
                            topics
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                    data: log
                        .get("data")
                        .and_then(Value::as_str)
                        .unwrap_or("0x")
                        .to_string(),
                    block_number,
                    transaction_hash: transaction_hash.clone(),
                    log_index: quantity_field(log, "logIndex")?,
                })
            })
            .collect::<CrawlResult<Vec<_>>>()?,
        _ => Vec::new(),
    };
    let status = match value.get("status") {
        Some(v) if !v.is_null() => parse_quantity(v)? == 1,
        _ => true,
    };
    Ok(TransactionReceipt {
        transaction_hash,
        block_number,
        status,
        logs,
    })
}

/// Chain adapter speaking Ethereum JSON-RPC over HTTP
pub struct EvmChainAdapter {
    config: ChainConfig,
    kind: ChainKind,
    client: reqwest::Client,
    next_id: AtomicU64,
    max_retries: u32,
}

impl EvmChainAdapter {
    pub fn new(config: ChainConfig, kind: ChainKind, client: reqwest::Client) -> Self {
        Self {
            config,
            kind,
            client,
            next_id: AtomicU64::new(1),
            max_retries: 5,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    fn rpc_error(&self, message: impl std::fmt::Display) -> CrawlError {
        CrawlError::rpc(&self.config.chain_id, message)
    }

    async fn post(&self, body: &Value) -> CrawlResult<Value> {
        let mut retry_delay = Duration::from_millis(500);
        let max_delay = Duration::from_secs(16);
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            match self.client.post(&self.config.rpc_url).json(body).send().await {
                Ok(response) => match response.json::<Value>().await {
                    Ok(value) => return Ok(value),
                    Err(e) => last_error = format!("invalid response body: {}", e),
                },
                Err(e) => last_error = e.to_string(),
            }
            error!(
                "[{}] RPC request failed (attempt {}): {}",
                self.config.chain_id,
                attempt + 1,
                last_error
            );
            if attempt + 1 == self.max_retries {
                break;
            }

            let jitter = {
                use rand::Rng;
                rand::thread_rng().gen_range(0..=100) as u64
            };
            retry_delay = std::cmp::min(max_delay, retry_delay * 2 + Duration::from_millis(jitter));
            debug!(
                "[{}] retrying RPC request in {:?}",
                self.config.chain_id, retry_delay
            );
            tokio::time::sleep(retry_delay).await;
        }

        Err(self.rpc_error(format!("max retries exceeded: {}", last_error)))
    }

    /// Issue a call and return its `result`, which may be `null`
    async fn call(&self, method: &str, params: Value) -> CrawlResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let mut response = self.post(&body).await?;
        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            return Err(self.rpc_error(format!("{} failed: {}", method, err)));
        }
        Ok(response
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn eth_call(&self, to: &str, data: String) -> CrawlResult<String> {
        let result = self
            .call("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.rpc_error("eth_call returned no data"))
    }

    async fn read_string(&self, contract: &str, signature: &str) -> Option<String> {
        let data = format!("0x{}", hex::encode(function_selector(signature)));
        match self.eth_call(contract, data).await {
            Ok(raw) => decode_abi_string(&raw).ok().filter(|s| !s.is_empty()),
            Err(e) => {
                debug!("[{}] {} on {} failed: {}", self.config.chain_id, signature, contract, e);
                None
            }
        }
    }

    async fn gas_price(&self) -> CrawlResult<U256> {
        parse_u256(&self.call("eth_gasPrice", json!([])).await?)
    }

    /// Fee per gas used for cost estimates
    async fn fee_per_gas(&self) -> CrawlResult<U256> {
        match self.kind {
            ChainKind::Ethereum => self.gas_price().await,
            ChainKind::Polygon => {
                let base = self
                    .gas_price()
                    .await
                    .unwrap_or_else(|_| U256::from(30 * GWEI));
                let priority = match self.call("eth_maxPriorityFeePerGas", json!([])).await {
                    Ok(v) => parse_u256(&v).unwrap_or_else(|_| U256::from(10 * GWEI)),
                    Err(_) => U256::from(10 * GWEI),
                };
                Ok(base + priority)
            }
            ChainKind::Bsc => {
                let floor = U256::from(5 * GWEI);
                Ok(match self.gas_price().await {
                    Ok(price) => price.max(floor),
                    Err(e) => {
                        warn!("[bsc] gas price unavailable, using 5 gwei: {}", e);
                        floor
                    }
                })
            }
        }
    }
}

#[async_trait]
impl ChainAdapter for EvmChainAdapter {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn get_latest_block(&self) -> CrawlResult<u64> {
        parse_quantity(&self.call("eth_blockNumber", json!([])).await?)
    }

    async fn get_block(&self, number: u64) -> CrawlResult<Option<Block>> {
        let result = self
            .call("eth_getBlockByNumber", json!([format!("0x{:x}", number), false]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_block(&result).map(Some)
    }

    async fn get_transaction(&self, hash: &str) -> CrawlResult<Option<Transaction>> {
        let result = self.call("eth_getTransactionByHash", json!([hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_transaction(&result).map(Some)
    }

    async fn get_transaction_receipt(&self, hash: &str) -> CrawlResult<Option<TransactionReceipt>> {
        let result = self.call("eth_getTransactionReceipt", json!([hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_receipt(&result).map(Some)
    }

    async fn is_contract_address(&self, address: &str) -> CrawlResult<bool> {
        let code = self.call("eth_getCode", json!([address, "latest"])).await?;
        let code = code.as_str().unwrap_or("0x");
        Ok(!code.trim_start_matches("0x").is_empty())
    }

    async fn is_connected(&self) -> bool {
        self.call("eth_blockNumber", json!([])).await.is_ok()
    }

    async fn get_chain_status(&self) -> CrawlResult<ChainStatus> {
        let latest_block = self.get_latest_block().await?;
        let peer_count = match self.call("net_peerCount", json!([])).await {
            Ok(v) => parse_quantity(&v).unwrap_or(0) as u32,
            Err(_) => 0,
        };
        let sync_status = match self.call("eth_syncing", json!([])).await {
            Ok(Value::Bool(false)) => SyncStatus::Synced,
            Ok(progress) => {
                let current = progress.get("currentBlock").map(parse_quantity).transpose()?;
                let highest = progress.get("highestBlock").map(parse_quantity).transpose()?;
                match (current, highest) {
                    (Some(current), Some(highest))
                        if highest.saturating_sub(current) <= self.kind.sync_tolerance() =>
                    {
                        SyncStatus::Synced
                    }
                    _ => SyncStatus::Syncing,
                }
            }
            Err(_) => SyncStatus::Error,
        };
        Ok(ChainStatus {
            latest_block,
            sync_status,
            peer_count,
        })
    }

    async fn get_token_metadata(
        &self,
        token_address: &str,
        token_id: &str,
    ) -> CrawlResult<TokenMetadata> {
        let id = parse_token_id(token_id)?;
        let raw = self
            .eth_call(token_address, encode_call_u256("tokenURI(uint256)", id))
            .await?;
        let token_uri = decode_abi_string(&raw)?;
        let name = self.read_string(token_address, "name()").await;
        let symbol = self.read_string(token_address, "symbol()").await;

        let Some(doc) = fetch_document(&self.client, &token_uri).await? else {
            return Ok(partial_metadata(
                &self.config.chain_id,
                token_address,
                token_id,
                &token_uri,
                name,
                symbol,
            ));
        };

        Ok(TokenMetadata {
            chain_id: self.config.chain_id.clone(),
            contract_address: token_address.to_string(),
            token_id: token_id.to_string(),
            token_uri,
            name: doc
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(name),
            symbol,
            description: doc
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            image: doc
                .get("image")
                .or_else(|| doc.get("image_url"))
                .and_then(Value::as_str)
                .map(gateway_url),
            attributes: self.kind.normalize_attributes(&doc),
            resolved: true,
        })
    }

    async fn estimate_processing_cost(&self, transaction_count: u64) -> CrawlResult<U256> {
        let fee = self.fee_per_gas().await?;
        Ok(fee * U256::from(self.kind.average_gas_per_transaction()) * U256::from(transaction_count))
    }
}

/// Builds [`EvmChainAdapter`]s sharing one HTTP client
#[derive(Clone, Default)]
pub struct EvmAdapterBuilder {
    client: reqwest::Client,
}

impl EvmAdapterBuilder {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AdapterBuilder for EvmAdapterBuilder {
    async fn build(&self, config: &ChainConfig) -> CrawlResult<Arc<dyn ChainAdapter>> {
        let kind = ChainKind::from_chain_id(&config.chain_id)?;
        Ok(Arc::new(EvmChainAdapter::new(
            config.clone(),
            kind,
            self.client.clone(),
        )))
    }
}
