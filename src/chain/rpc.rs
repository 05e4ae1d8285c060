//! RPC-backed [`BlockchainReader`] over an alloy provider.
//!
//! The reader presents a synchronous interface to the engine while the
//! provider is async. Callers already inside a tokio runtime cannot block
//! on it, so requests are shipped to a dedicated bridge worker thread that
//! drives the future to completion; plain threads block on the runtime
//! handle directly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{
    Block, BlockId, BlockNumberOrTag, BlockTransactions, BlockTransactionsKind,
};
use alloy::transports::http::{Client, Http};
use revm::primitives::{Address, Bytes, B256, U256};

use super::{BlockData, BlockTag, BlockchainReader, HeaderData, ReceiptData};
use crate::engine::tx::{AccessListEntry, Tx};
use crate::error::ReaderError;

const BRIDGE_TIMEOUT: Duration = Duration::from_secs(10);
const BRIDGE_QUEUE_CAPACITY: usize = 256;

type BridgeJob = Box<dyn FnOnce() + Send + 'static>;

type HttpProvider = RootProvider<Http<Client>>;

pub struct RpcReader {
    provider: Arc<HttpProvider>,
    handle: tokio::runtime::Handle,
    // Keeps a privately owned runtime alive when the reader was created
    // outside of any tokio context.
    _runtime_guard: Option<Arc<tokio::runtime::Runtime>>,
    closed: AtomicBool,
}

impl RpcReader {
    pub fn new(url: &str) -> Result<Self, ReaderError> {
        let parsed = url
            .parse()
            .map_err(|e| ReaderError::InvalidUrl { url: url.to_string(), reason: format!("{e}") })?;
        let provider = ProviderBuilder::new().on_http(parsed);
        let (handle, guard) = match tokio::runtime::Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .worker_threads(2)
                    .thread_name("sandscan-rpc")
                    .build()
                    .map_err(|e| ReaderError::Transport(e.to_string()))?;
                let handle = runtime.handle().clone();
                (handle, Some(Arc::new(runtime)))
            }
        };
        Ok(Self {
            provider: Arc::new(provider),
            handle,
            _runtime_guard: guard,
            closed: AtomicBool::new(false),
        })
    }

    fn bridge_sender() -> &'static mpsc::SyncSender<BridgeJob> {
        static TX: OnceLock<mpsc::SyncSender<BridgeJob>> = OnceLock::new();
        TX.get_or_init(|| {
            let (tx, rx) = mpsc::sync_channel::<BridgeJob>(BRIDGE_QUEUE_CAPACITY);
            let _ = std::thread::Builder::new()
                .name("sandscan-rpc-bridge".to_string())
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                });
            tx
        })
    }

    fn run<T, F>(&self, fut: F) -> Result<T, ReaderError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ReaderError>> + Send + 'static,
    {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ReaderError::Closed);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return self.handle.block_on(fut);
        }
        let (tx, rx) = mpsc::channel();
        let handle = self.handle.clone();
        let job: BridgeJob = Box::new(move || {
            let result = handle.block_on(fut);
            let _ = tx.send(result);
        });
        Self::bridge_sender()
            .send(job)
            .map_err(|_| ReaderError::Transport("rpc bridge worker gone".into()))?;
        rx.recv_timeout(BRIDGE_TIMEOUT)
            .map_err(|_| ReaderError::Transport("rpc bridge timeout".into()))?
    }

    fn block_id(block: BlockTag) -> BlockId {
        match block {
            Some(n) => BlockId::Number(BlockNumberOrTag::Number(n)),
            None => BlockId::Number(BlockNumberOrTag::Latest),
        }
    }
}

fn transport_err<E: std::fmt::Display>(e: E) -> ReaderError {
    ReaderError::Transport(e.to_string())
}

fn header_from_rpc(header: &alloy::rpc::types::Header) -> HeaderData {
    HeaderData {
        number: header.number,
        hash: header.hash,
        parent_hash: header.parent_hash,
        coinbase: header.miner,
        timestamp: header.timestamp,
        difficulty: header.difficulty,
        mix_hash: header.mix_hash,
        gas_limit: header.gas_limit as u64,
        gas_used: header.gas_used as u64,
        base_fee: header.base_fee_per_gas.map(U256::from),
    }
}

fn tx_from_rpc(tx: &alloy::rpc::types::Transaction) -> Tx {
    let access_list = tx
        .access_list
        .as_ref()
        .map(|list| {
            list.iter()
                .map(|item| AccessListEntry {
                    address: item.address,
                    storage_keys: item.storage_keys.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    let gas_price = tx
        .max_fee_per_gas
        .or(tx.gas_price)
        .map(U256::from)
        .unwrap_or_default();
    Tx::signed(
        tx.hash,
        tx.transaction_type.unwrap_or(0),
        tx.from,
        tx.to,
        tx.nonce,
        tx.value,
        tx.gas as u64,
        gas_price,
        tx.max_priority_fee_per_gas.map(U256::from),
        tx.input.clone(),
        access_list,
    )
}

fn block_from_rpc(block: &Block) -> BlockData {
    let transactions = match &block.transactions {
        BlockTransactions::Full(txs) => txs.iter().map(tx_from_rpc).collect(),
        _ => Vec::new(),
    };
    BlockData { header: header_from_rpc(&block.header), transactions }
}

impl BlockchainReader for RpcReader {
    fn balance_at(&self, addr: Address, block: BlockTag) -> Result<U256, ReaderError> {
        let provider = Arc::clone(&self.provider);
        let id = Self::block_id(block);
        self.run(async move { provider.get_balance(addr).block_id(id).await.map_err(transport_err) })
    }

    fn code_at(&self, addr: Address, block: BlockTag) -> Result<Bytes, ReaderError> {
        let provider = Arc::clone(&self.provider);
        let id = Self::block_id(block);
        self.run(async move { provider.get_code_at(addr).block_id(id).await.map_err(transport_err) })
    }

    fn storage_at(&self, addr: Address, slot: B256, block: BlockTag) -> Result<B256, ReaderError> {
        let provider = Arc::clone(&self.provider);
        let id = Self::block_id(block);
        self.run(async move {
            provider
                .get_storage_at(addr, slot.into())
                .block_id(id)
                .await
                .map(B256::from)
                .map_err(transport_err)
        })
    }

    fn nonce_at(&self, addr: Address, block: BlockTag) -> Result<u64, ReaderError> {
        let provider = Arc::clone(&self.provider);
        let id = Self::block_id(block);
        self.run(async move {
            provider
                .get_transaction_count(addr)
                .block_id(id)
                .await
                .map_err(transport_err)
        })
    }

    fn block_number(&self) -> Result<u64, ReaderError> {
        let provider = Arc::clone(&self.provider);
        self.run(async move { provider.get_block_number().await.map_err(transport_err) })
    }

    fn block_hash_by_number(&self, number: u64) -> Result<B256, ReaderError> {
        let provider = Arc::clone(&self.provider);
        self.run(async move {
            let block = provider
                .get_block_by_number(BlockNumberOrTag::Number(number), false)
                .await
                .map_err(transport_err)?;
            block.map(|b| b.header.hash).ok_or(ReaderError::NotFound)
        })
    }

    fn block_by_number(&self, block: BlockTag) -> Result<BlockData, ReaderError> {
        let provider = Arc::clone(&self.provider);
        let tag = match block {
            Some(n) => BlockNumberOrTag::Number(n),
            None => BlockNumberOrTag::Latest,
        };
        self.run(async move {
            let block = provider
                .get_block_by_number(tag, true)
                .await
                .map_err(transport_err)?;
            block.as_ref().map(block_from_rpc).ok_or(ReaderError::NotFound)
        })
    }

    fn block_by_hash(&self, hash: B256) -> Result<BlockData, ReaderError> {
        let provider = Arc::clone(&self.provider);
        self.run(async move {
            let block = provider
                .get_block_by_hash(hash, BlockTransactionsKind::Full)
                .await
                .map_err(transport_err)?;
            block.as_ref().map(block_from_rpc).ok_or(ReaderError::NotFound)
        })
    }

    fn header_by_number(&self, block: BlockTag) -> Result<HeaderData, ReaderError> {
        let provider = Arc::clone(&self.provider);
        let tag = match block {
            Some(n) => BlockNumberOrTag::Number(n),
            None => BlockNumberOrTag::Latest,
        };
        self.run(async move {
            let block = provider
                .get_block_by_number(tag, false)
                .await
                .map_err(transport_err)?;
            block.map(|b| header_from_rpc(&b.header)).ok_or(ReaderError::NotFound)
        })
    }

    fn header_by_hash(&self, hash: B256) -> Result<HeaderData, ReaderError> {
        let provider = Arc::clone(&self.provider);
        self.run(async move {
            let block = provider
                .get_block_by_hash(hash, BlockTransactionsKind::Hashes)
                .await
                .map_err(transport_err)?;
            block.map(|b| header_from_rpc(&b.header)).ok_or(ReaderError::NotFound)
        })
    }

    fn transaction_by_hash(&self, hash: B256) -> Result<Tx, ReaderError> {
        let provider = Arc::clone(&self.provider);
        self.run(async move {
            let tx = provider
                .get_transaction_by_hash(hash)
                .await
                .map_err(transport_err)?;
            tx.as_ref().map(tx_from_rpc).ok_or(ReaderError::NotFound)
        })
    }

    fn transaction_receipt(&self, hash: B256) -> Result<ReceiptData, ReaderError> {
        let provider = Arc::clone(&self.provider);
        self.run(async move {
            let receipt = provider
                .get_transaction_receipt(hash)
                .await
                .map_err(transport_err)?
                .ok_or(ReaderError::NotFound)?;
            Ok(ReceiptData {
                tx_hash: receipt.transaction_hash,
                block_number: receipt.block_number.unwrap_or_default(),
                block_hash: receipt.block_hash.unwrap_or_default(),
                transaction_index: receipt.transaction_index.unwrap_or_default(),
                status: receipt.status(),
                gas_used: receipt.gas_used as u64,
                contract_address: receipt.contract_address,
            })
        })
    }

    fn transaction_in_block(&self, block_hash: B256, index: u64) -> Result<Tx, ReaderError> {
        let block = self.block_by_hash(block_hash)?;
        block
            .transactions
            .get(index as usize)
            .cloned()
            .ok_or(ReaderError::NotFound)
    }

    fn transaction_count(&self, block_hash: B256) -> Result<u64, ReaderError> {
        let block = self.block_by_hash(block_hash)?;
        Ok(block.transactions.len() as u64)
    }

    fn chain_id(&self) -> Result<u64, ReaderError> {
        let provider = Arc::clone(&self.provider);
        self.run(async move { provider.get_chain_id().await.map_err(transport_err) })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
