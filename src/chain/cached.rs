//! TTL-caching wrapper around any [`BlockchainReader`].
//!
//! Entries are keyed by (block, address[, slot]) and expire after a
//! configurable TTL. Latest-pinned reads (`block == None`) are never cached
//! since "latest" moves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use revm::primitives::{Address, Bytes, B256, U256};

use super::{BlockData, BlockTag, BlockchainReader, HeaderData, ReceiptData};
use crate::engine::tx::Tx;
use crate::error::ReaderError;

const DEFAULT_TTL: Duration = Duration::from_secs(600);
const MAX_STORAGE_CACHE_ENTRIES: usize = 200_000;
const MAX_ACCOUNT_CACHE_ENTRIES: usize = 100_000;
const MAX_BLOCK_HASH_CACHE_ENTRIES: usize = 4_096;

struct Entry<V> {
    value: V,
    stored: Instant,
}

impl<V: Clone> Entry<V> {
    fn new(value: V) -> Self {
        Self { value, stored: Instant::now() }
    }

    fn get(&self, ttl: Duration) -> Option<V> {
        (self.stored.elapsed() <= ttl).then(|| self.value.clone())
    }
}

pub struct CachedReader<R> {
    inner: R,
    ttl: Duration,
    chain_id: u64,

    balances: DashMap<(u64, Address), Entry<U256>>,
    codes: DashMap<(u64, Address), Entry<Bytes>>,
    nonces: DashMap<(u64, Address), Entry<u64>>,
    storages: DashMap<(u64, Address, B256), Entry<B256>>,
    block_hashes: DashMap<u64, Entry<B256>>,
}

impl<R: BlockchainReader> CachedReader<R> {
    pub fn new(inner: R) -> Result<Self, ReaderError> {
        Self::with_ttl(inner, DEFAULT_TTL)
    }

    pub fn with_ttl(inner: R, ttl: Duration) -> Result<Self, ReaderError> {
        let chain_id = inner.chain_id()?;
        Ok(Self {
            inner,
            ttl,
            chain_id,
            balances: DashMap::new(),
            codes: DashMap::new(),
            nonces: DashMap::new(),
            storages: DashMap::new(),
            block_hashes: DashMap::new(),
        })
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn evict_if_full<K: std::hash::Hash + Eq + Clone, V>(map: &DashMap<K, Entry<V>>, cap: usize) {
        if map.len() <= cap {
            return;
        }
        // Cheap pressure valve: drop expired-or-arbitrary entries until under cap.
        let excess = map.len() - cap;
        let victims: Vec<K> = map.iter().take(excess).map(|e| e.key().clone()).collect();
        for k in victims {
            map.remove(&k);
        }
    }
}

impl<R: BlockchainReader> BlockchainReader for CachedReader<R> {
    fn balance_at(&self, addr: Address, block: BlockTag) -> Result<U256, ReaderError> {
        let Some(number) = block else {
            return self.inner.balance_at(addr, block);
        };
        if let Some(hit) = self.balances.get(&(number, addr)).and_then(|e| e.get(self.ttl)) {
            return Ok(hit);
        }
        let value = self.inner.balance_at(addr, block)?;
        Self::evict_if_full(&self.balances, MAX_ACCOUNT_CACHE_ENTRIES);
        self.balances.insert((number, addr), Entry::new(value));
        Ok(value)
    }

    fn code_at(&self, addr: Address, block: BlockTag) -> Result<Bytes, ReaderError> {
        let Some(number) = block else {
            return self.inner.code_at(addr, block);
        };
        if let Some(hit) = self.codes.get(&(number, addr)).and_then(|e| e.get(self.ttl)) {
            return Ok(hit);
        }
        let value = self.inner.code_at(addr, block)?;
        Self::evict_if_full(&self.codes, MAX_ACCOUNT_CACHE_ENTRIES);
        self.codes.insert((number, addr), Entry::new(value.clone()));
        Ok(value)
    }

    fn storage_at(&self, addr: Address, slot: B256, block: BlockTag) -> Result<B256, ReaderError> {
        let Some(number) = block else {
            return self.inner.storage_at(addr, slot, block);
        };
        if let Some(hit) = self.storages.get(&(number, addr, slot)).and_then(|e| e.get(self.ttl)) {
            return Ok(hit);
        }
        let value = self.inner.storage_at(addr, slot, block)?;
        Self::evict_if_full(&self.storages, MAX_STORAGE_CACHE_ENTRIES);
        self.storages.insert((number, addr, slot), Entry::new(value));
        Ok(value)
    }

    fn nonce_at(&self, addr: Address, block: BlockTag) -> Result<u64, ReaderError> {
        let Some(number) = block else {
            return self.inner.nonce_at(addr, block);
        };
        if let Some(hit) = self.nonces.get(&(number, addr)).and_then(|e| e.get(self.ttl)) {
            return Ok(hit);
        }
        let value = self.inner.nonce_at(addr, block)?;
        Self::evict_if_full(&self.nonces, MAX_ACCOUNT_CACHE_ENTRIES);
        self.nonces.insert((number, addr), Entry::new(value));
        Ok(value)
    }

    fn block_number(&self) -> Result<u64, ReaderError> {
        self.inner.block_number()
    }

    fn block_hash_by_number(&self, number: u64) -> Result<B256, ReaderError> {
        if let Some(hit) = self.block_hashes.get(&number).and_then(|e| e.get(self.ttl)) {
            return Ok(hit);
        }
        let value = self.inner.block_hash_by_number(number)?;
        Self::evict_if_full(&self.block_hashes, MAX_BLOCK_HASH_CACHE_ENTRIES);
        self.block_hashes.insert(number, Entry::new(value));
        Ok(value)
    }

    fn block_by_number(&self, block: BlockTag) -> Result<BlockData, ReaderError> {
        self.inner.block_by_number(block)
    }

    fn block_by_hash(&self, hash: B256) -> Result<BlockData, ReaderError> {
        self.inner.block_by_hash(hash)
    }

    fn header_by_number(&self, block: BlockTag) -> Result<HeaderData, ReaderError> {
        self.inner.header_by_number(block)
    }

    fn header_by_hash(&self, hash: B256) -> Result<HeaderData, ReaderError> {
        self.inner.header_by_hash(hash)
    }

    fn transaction_by_hash(&self, hash: B256) -> Result<Tx, ReaderError> {
        self.inner.transaction_by_hash(hash)
    }

    fn transaction_receipt(&self, hash: B256) -> Result<ReceiptData, ReaderError> {
        self.inner.transaction_receipt(hash)
    }

    fn transaction_in_block(&self, block_hash: B256, index: u64) -> Result<Tx, ReaderError> {
        self.inner.transaction_in_block(block_hash, index)
    }

    fn transaction_count(&self, block_hash: B256) -> Result<u64, ReaderError> {
        self.inner.transaction_count(block_hash)
    }

    fn chain_id(&self) -> Result<u64, ReaderError> {
        Ok(self.chain_id)
    }

    fn close(&self) {
        self.inner.close()
    }
}
