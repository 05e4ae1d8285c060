//! Engine-level transactions: real chain transactions (signed envelopes
//! surfaced by a reader), unsigned debugging calls, and pseudo transactions
//! that mutate state directly without touching the EVM.

use std::fmt;
use std::sync::Arc;

use revm::primitives::{keccak256, Address, Bytes, B256, U256};

use crate::engine::state::StateOps;

/// One entry of an EIP-2930 access list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessListEntry {
    pub address: Address,
    pub storage_keys: Vec<B256>,
}

pub type PseudoExec = Arc<dyn Fn(&mut dyn StateOps) -> Result<Bytes, String> + Send + Sync>;

#[derive(Clone)]
enum TxKind {
    /// Recovered from chain data; `from` comes from the envelope signature.
    Signed,
    /// Constructed locally without a signature; `from` is explicit and may
    /// be zero.
    Unsigned,
    /// Direct state mutator. Never executed by the EVM; its hash depends
    /// only on the payload bytes, not on the side-effect closure.
    Pseudo { payload: Bytes, exec: Option<PseudoExec> },
}

#[derive(Clone)]
pub struct Tx {
    hash: B256,
    kind: TxKind,

    pub tx_type: u8,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas_limit: u64,
    /// Legacy gas price, or the fee cap for dynamic-fee transactions.
    pub gas_price: U256,
    /// Priority fee cap for dynamic-fee transactions.
    pub priority_fee: Option<U256>,
    pub input: Bytes,
    pub access_list: Vec<AccessListEntry>,
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("hash", &self.hash)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("nonce", &self.nonce)
            .field("pseudo", &self.is_pseudo())
            .finish()
    }
}

impl Tx {
    /// A transaction read from the chain, with the sender already recovered
    /// by the backend.
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        hash: B256,
        tx_type: u8,
        from: Address,
        to: Option<Address>,
        nonce: u64,
        value: U256,
        gas_limit: u64,
        gas_price: U256,
        priority_fee: Option<U256>,
        input: Bytes,
        access_list: Vec<AccessListEntry>,
    ) -> Self {
        Self {
            hash,
            kind: TxKind::Signed,
            tx_type,
            from,
            to,
            nonce,
            value,
            gas_limit,
            gas_price,
            priority_fee,
            input,
            access_list,
        }
    }

    /// A locally constructed, unsigned transaction. Used by the debugging
    /// harness; `from` defaults to the zero address when not meaningful.
    pub fn unsigned(
        from: Address,
        to: Option<Address>,
        nonce: u64,
        value: U256,
        gas_limit: u64,
        input: Bytes,
    ) -> Self {
        let mut preimage = Vec::with_capacity(96 + input.len());
        preimage.extend_from_slice(from.as_slice());
        if let Some(to) = &to {
            preimage.extend_from_slice(to.as_slice());
        }
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(&value.to_be_bytes::<32>());
        preimage.extend_from_slice(&gas_limit.to_be_bytes());
        preimage.extend_from_slice(&input);
        Self {
            hash: keccak256(&preimage),
            kind: TxKind::Unsigned,
            tx_type: 0,
            from,
            to,
            nonce,
            value,
            gas_limit,
            gas_price: U256::ZERO,
            priority_fee: None,
            input,
            access_list: Vec::new(),
        }
    }

    /// A pseudo transaction: carries an opaque payload and a closure that
    /// mutates state directly. The hash covers only the payload.
    pub fn pseudo(payload: Bytes, exec: PseudoExec) -> Self {
        Self {
            hash: keccak256(&payload),
            kind: TxKind::Pseudo { payload: payload.clone(), exec: Some(exec) },
            tx_type: 0,
            from: Address::ZERO,
            to: None,
            nonce: 0,
            value: U256::ZERO,
            gas_limit: 0,
            gas_price: U256::ZERO,
            priority_fee: None,
            input: payload,
            access_list: Vec::new(),
        }
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self.kind, TxKind::Pseudo { .. })
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.kind, TxKind::Signed)
    }

    pub fn pseudo_payload(&self) -> Option<&Bytes> {
        match &self.kind {
            TxKind::Pseudo { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub(crate) fn pseudo_exec(&self) -> Option<&PseudoExec> {
        match &self.kind {
            TxKind::Pseudo { exec, .. } => exec.as_ref(),
            _ => None,
        }
    }

    /// Contract-creation transactions have no destination.
    pub fn is_creation(&self) -> bool {
        !self.is_pseudo() && self.to.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_hash_covers_payload_only() {
        let payload = Bytes::from_static(b"reward:123");
        let a = Tx::pseudo(payload.clone(), Arc::new(|_s| Ok(Bytes::new())));
        let b = Tx::pseudo(
            payload.clone(),
            Arc::new(|s| {
                s.add_balance(Address::ZERO, U256::from(1));
                Ok(Bytes::new())
            }),
        );
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash(), keccak256(&payload));
    }

    #[test]
    fn unsigned_hash_is_deterministic() {
        let to = Address::with_last_byte(9);
        let a = Tx::unsigned(Address::ZERO, Some(to), 1, U256::ZERO, 100_000, Bytes::new());
        let b = Tx::unsigned(Address::ZERO, Some(to), 1, U256::ZERO, 100_000, Bytes::new());
        assert_eq!(a.hash(), b.hash());
        let c = Tx::unsigned(Address::ZERO, Some(to), 2, U256::ZERO, 100_000, Bytes::new());
        assert_ne!(a.hash(), c.hash());
    }
}
