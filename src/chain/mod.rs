//! Chain access: the [`BlockchainReader`] interface the core consumes, plus
//! light data types decoupled from any particular backend.
//!
//! Readers are synchronous from the caller's point of view; the RPC-backed
//! implementation bridges to an async provider internally (see `rpc`).

pub mod cached;
pub mod rpc;

use crate::engine::tx::Tx;
use crate::error::ReaderError;
use revm::primitives::{Address, Bytes, B256, U256};

pub use cached::CachedReader;
pub use rpc::RpcReader;

/// Block selector: `None` means "latest".
pub type BlockTag = Option<u64>;

/// Header fields the engine needs to rebuild a block's VM context.
#[derive(Debug, Clone, Default)]
pub struct HeaderData {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub coinbase: Address,
    pub timestamp: u64,
    pub difficulty: U256,
    pub mix_hash: Option<B256>,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee: Option<U256>,
}

/// A block with its transactions already converted to engine [`Tx`]s.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub header: HeaderData,
    pub transactions: Vec<Tx>,
}

impl BlockData {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> B256 {
        self.header.hash
    }
}

/// Receipt fields consumed by the orchestrator.
#[derive(Debug, Clone)]
pub struct ReceiptData {
    pub tx_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_index: u64,
    pub status: bool,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
}

/// Read access to a blockchain. All state reads are pinned to a block
/// (`None` = latest). Implementations must be safe to share across threads.
pub trait BlockchainReader: Send + Sync {
    fn balance_at(&self, addr: Address, block: BlockTag) -> Result<U256, ReaderError>;
    fn code_at(&self, addr: Address, block: BlockTag) -> Result<Bytes, ReaderError>;
    fn storage_at(&self, addr: Address, slot: B256, block: BlockTag) -> Result<B256, ReaderError>;
    fn nonce_at(&self, addr: Address, block: BlockTag) -> Result<u64, ReaderError>;

    fn block_number(&self) -> Result<u64, ReaderError>;
    fn block_hash_by_number(&self, number: u64) -> Result<B256, ReaderError>;
    fn block_by_number(&self, block: BlockTag) -> Result<BlockData, ReaderError>;
    fn block_by_hash(&self, hash: B256) -> Result<BlockData, ReaderError>;
    fn header_by_number(&self, block: BlockTag) -> Result<HeaderData, ReaderError>;
    fn header_by_hash(&self, hash: B256) -> Result<HeaderData, ReaderError>;

    fn transaction_by_hash(&self, hash: B256) -> Result<Tx, ReaderError>;
    fn transaction_receipt(&self, hash: B256) -> Result<ReceiptData, ReaderError>;
    fn transaction_in_block(&self, block_hash: B256, index: u64) -> Result<Tx, ReaderError>;
    fn transaction_count(&self, block_hash: B256) -> Result<u64, ReaderError>;

    fn chain_id(&self) -> Result<u64, ReaderError>;
    fn close(&self);
}

impl<T: BlockchainReader + ?Sized> BlockchainReader for std::sync::Arc<T> {
    fn balance_at(&self, addr: Address, block: BlockTag) -> Result<U256, ReaderError> {
        (**self).balance_at(addr, block)
    }
    fn code_at(&self, addr: Address, block: BlockTag) -> Result<Bytes, ReaderError> {
        (**self).code_at(addr, block)
    }
    fn storage_at(&self, addr: Address, slot: B256, block: BlockTag) -> Result<B256, ReaderError> {
        (**self).storage_at(addr, slot, block)
    }
    fn nonce_at(&self, addr: Address, block: BlockTag) -> Result<u64, ReaderError> {
        (**self).nonce_at(addr, block)
    }
    fn block_number(&self) -> Result<u64, ReaderError> {
        (**self).block_number()
    }
    fn block_hash_by_number(&self, number: u64) -> Result<B256, ReaderError> {
        (**self).block_hash_by_number(number)
    }
    fn block_by_number(&self, block: BlockTag) -> Result<BlockData, ReaderError> {
        (**self).block_by_number(block)
    }
    fn block_by_hash(&self, hash: B256) -> Result<BlockData, ReaderError> {
        (**self).block_by_hash(hash)
    }
    fn header_by_number(&self, block: BlockTag) -> Result<HeaderData, ReaderError> {
        (**self).header_by_number(block)
    }
    fn header_by_hash(&self, hash: B256) -> Result<HeaderData, ReaderError> {
        (**self).header_by_hash(hash)
    }
    fn transaction_by_hash(&self, hash: B256) -> Result<Tx, ReaderError> {
        (**self).transaction_by_hash(hash)
    }
    fn transaction_receipt(&self, hash: B256) -> Result<ReceiptData, ReaderError> {
        (**self).transaction_receipt(hash)
    }
    fn transaction_in_block(&self, block_hash: B256, index: u64) -> Result<Tx, ReaderError> {
        (**self).transaction_in_block(block_hash, index)
    }
    fn transaction_count(&self, block_hash: B256) -> Result<u64, ReaderError> {
        (**self).transaction_count(block_hash)
    }
    fn chain_id(&self) -> Result<u64, ReaderError> {
        (**self).chain_id()
    }
    fn close(&self) {
        (**self).close()
    }
}
