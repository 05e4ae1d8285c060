//! Asset-level profits (signed deltas per beneficiary) and profit-set
//! comparison, the core of the attack oracle.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use revm::primitives::{Address, B256, I256, U256};
use thiserror::Error;

use crate::summary::transfer::{AssetKind, MergeNotPossible};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("not comparable")]
pub struct NotComparable;

fn signed(amount: U256) -> I256 {
    I256::try_from(amount).unwrap_or(I256::MAX)
}

fn signed_neg(amount: U256) -> I256 {
    signed(amount).checked_neg().unwrap_or(I256::MIN)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profit {
    Zero,
    Ether {
        account: Address,
        amount: I256,
    },
    Erc20 {
        account: Address,
        contract: Address,
        amount: I256,
    },
    Erc777 {
        account: Address,
        contract: Address,
        amount: I256,
    },
    /// ERC-721 profits carry the sets of tokens received and given away.
    /// Some contracts emit duplicate receive/give events for the same
    /// token; merging deduplicates them silently.
    Erc721 {
        account: Address,
        contract: Address,
        receive: BTreeSet<B256>,
        give: BTreeSet<B256>,
    },
    Erc1155 {
        account: Address,
        contract: Address,
        token_id: B256,
        amount: I256,
    },
}

impl Profit {
    pub fn ether_in(account: Address, amount: U256) -> Self {
        Profit::Ether { account, amount: signed(amount) }
    }

    pub fn ether_out(account: Address, amount: U256) -> Self {
        Profit::Ether { account, amount: signed_neg(amount) }
    }

    pub fn erc20_in(account: Address, contract: Address, amount: U256) -> Self {
        Profit::Erc20 { account, contract, amount: signed(amount) }
    }

    pub fn erc20_out(account: Address, contract: Address, amount: U256) -> Self {
        Profit::Erc20 { account, contract, amount: signed_neg(amount) }
    }

    pub fn erc777_in(account: Address, contract: Address, amount: U256) -> Self {
        Profit::Erc777 { account, contract, amount: signed(amount) }
    }

    pub fn erc777_out(account: Address, contract: Address, amount: U256) -> Self {
        Profit::Erc777 { account, contract, amount: signed_neg(amount) }
    }

    pub fn erc721_receive(account: Address, contract: Address, token_id: B256) -> Self {
        Profit::Erc721 {
            account,
            contract,
            receive: BTreeSet::from([token_id]),
            give: BTreeSet::new(),
        }
    }

    pub fn erc721_give(account: Address, contract: Address, token_id: B256) -> Self {
        Profit::Erc721 {
            account,
            contract,
            receive: BTreeSet::new(),
            give: BTreeSet::from([token_id]),
        }
    }

    pub fn erc1155_in(account: Address, contract: Address, token_id: B256, amount: U256) -> Self {
        Profit::Erc1155 { account, contract, token_id, amount: signed(amount) }
    }

    pub fn erc1155_out(account: Address, contract: Address, token_id: B256, amount: U256) -> Self {
        Profit::Erc1155 { account, contract, token_id, amount: signed_neg(amount) }
    }

    pub fn kind(&self) -> Option<AssetKind> {
        match self {
            Profit::Zero => None,
            Profit::Ether { .. } => Some(AssetKind::Ether),
            Profit::Erc20 { .. } => Some(AssetKind::Erc20),
            Profit::Erc777 { .. } => Some(AssetKind::Erc777),
            Profit::Erc721 { .. } => Some(AssetKind::Erc721),
            Profit::Erc1155 { .. } => Some(AssetKind::Erc1155),
        }
    }

    pub fn beneficiary(&self) -> Address {
        match self {
            Profit::Zero => Address::ZERO,
            Profit::Ether { account, .. }
            | Profit::Erc20 { account, .. }
            | Profit::Erc777 { account, .. }
            | Profit::Erc721 { account, .. }
            | Profit::Erc1155 { account, .. } => *account,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Profit::Zero => true,
            Profit::Ether { amount, .. }
            | Profit::Erc20 { amount, .. }
            | Profit::Erc777 { amount, .. }
            | Profit::Erc1155 { amount, .. } => amount.is_zero(),
            Profit::Erc721 { receive, give, .. } => receive.len() == give.len(),
        }
    }

    pub fn positive(&self) -> bool {
        match self {
            Profit::Zero => false,
            Profit::Ether { amount, .. }
            | Profit::Erc20 { amount, .. }
            | Profit::Erc777 { amount, .. }
            | Profit::Erc1155 { amount, .. } => amount.is_positive(),
            Profit::Erc721 { receive, give, .. } => receive.len() > give.len(),
        }
    }

    /// Compare with a profit of the same asset and beneficiary. `Zero`
    /// compares with anything by sign.
    pub fn cmp_profit(&self, other: &Profit) -> Result<Ordering, NotComparable> {
        match (self, other) {
            (Profit::Zero, Profit::Zero) => Ok(Ordering::Equal),
            (Profit::Zero, p) => Ok(sign_of(p).reverse()),
            (p, Profit::Zero) => Ok(sign_of(p)),
            (
                Profit::Ether { account: a1, amount: v1 },
                Profit::Ether { account: a2, amount: v2 },
            ) if a1 == a2 => Ok(v1.cmp(v2)),
            (
                Profit::Erc20 { account: a1, contract: c1, amount: v1 },
                Profit::Erc20 { account: a2, contract: c2, amount: v2 },
            ) if a1 == a2 && c1 == c2 => Ok(v1.cmp(v2)),
            (
                Profit::Erc777 { account: a1, contract: c1, amount: v1 },
                Profit::Erc777 { account: a2, contract: c2, amount: v2 },
            ) if a1 == a2 && c1 == c2 => Ok(v1.cmp(v2)),
            (
                Profit::Erc721 { account: a1, contract: c1, receive: r1, give: g1 },
                Profit::Erc721 { account: a2, contract: c2, receive: r2, give: g2 },
            ) if a1 == a2 && c1 == c2 => {
                let n1 = r1.len() as i64 - g1.len() as i64;
                let n2 = r2.len() as i64 - g2.len() as i64;
                Ok(n1.cmp(&n2))
            }
            (
                Profit::Erc1155 { account: a1, contract: c1, token_id: t1, amount: v1 },
                Profit::Erc1155 { account: a2, contract: c2, token_id: t2, amount: v2 },
            ) if a1 == a2 && c1 == c2 && t1 == t2 => Ok(v1.cmp(v2)),
            _ => Err(NotComparable),
        }
    }

    /// Merge with a comparable profit (same asset and beneficiary).
    pub fn merge(&self, other: &Profit) -> Result<Profit, MergeNotPossible> {
        if let Profit::Zero = self {
            return Ok(other.clone());
        }
        if let Profit::Zero = other {
            return Ok(self.clone());
        }
        if self.cmp_profit(other).is_err() {
            return Err(MergeNotPossible);
        }
        match (self, other) {
            (Profit::Ether { account, amount: v1 }, Profit::Ether { amount: v2, .. }) => {
                Ok(Profit::Ether { account: *account, amount: v1.saturating_add(*v2) })
            }
            (
                Profit::Erc20 { account, contract, amount: v1 },
                Profit::Erc20 { amount: v2, .. },
            ) => Ok(Profit::Erc20 {
                account: *account,
                contract: *contract,
                amount: v1.saturating_add(*v2),
            }),
            (
                Profit::Erc777 { account, contract, amount: v1 },
                Profit::Erc777 { amount: v2, .. },
            ) => Ok(Profit::Erc777 {
                account: *account,
                contract: *contract,
                amount: v1.saturating_add(*v2),
            }),
            (
                Profit::Erc721 { account, contract, receive, give },
                Profit::Erc721 { receive: r2, give: g2, .. },
            ) => {
                let mut receive = receive.clone();
                let mut give = give.clone();
                for token in r2 {
                    if give.contains(token) {
                        give.remove(token);
                    } else {
                        // Duplicate receives of the same token collapse.
                        receive.insert(*token);
                    }
                }
                for token in g2 {
                    if receive.contains(token) {
                        receive.remove(token);
                    } else {
                        give.insert(*token);
                    }
                }
                Ok(Profit::Erc721 { account: *account, contract: *contract, receive, give })
            }
            (
                Profit::Erc1155 { account, contract, token_id, amount: v1 },
                Profit::Erc1155 { amount: v2, .. },
            ) => Ok(Profit::Erc1155 {
                account: *account,
                contract: *contract,
                token_id: *token_id,
                amount: v1.saturating_add(*v2),
            }),
            _ => Err(MergeNotPossible),
        }
    }
}

fn sign_of(p: &Profit) -> Ordering {
    if p.positive() {
        Ordering::Greater
    } else if p.is_zero() {
        Ordering::Equal
    } else {
        Ordering::Less
    }
}

/// A bag of profits with merge-on-add semantics.
#[derive(Debug, Clone, Default)]
pub struct Profits(pub Vec<Profit>);

impl Profits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Profit> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add profits, merging each into the first mergeable existing entry.
    /// Entries that become zero are kept; use [`Profits::compact`] to drop
    /// them.
    pub fn add(&mut self, profits: impl IntoIterator<Item = Profit>) {
        'next: for profit in profits {
            for existing in &mut self.0 {
                if let Ok(merged) = existing.merge(&profit) {
                    *existing = merged;
                    continue 'next;
                }
            }
            self.0.push(profit);
        }
    }

    /// Merge everything mergeable and drop zero entries.
    pub fn compact(&self) -> Profits {
        let mut merged = Profits::new();
        merged.add(self.0.iter().cloned());
        Profits(merged.0.into_iter().filter(|p| !p.is_zero()).collect())
    }

    pub fn profits_of(&self, account: Address) -> Profits {
        let mut out = Profits::new();
        out.add(self.0.iter().filter(|p| p.beneficiary() == account).cloned());
        out
    }

    /// Compare two profit sets. Both sides are compacted, empty sides are
    /// treated as {Zero}; every profit is compared against its comparable
    /// counterpart (Zero when absent) and all signs must agree, in both
    /// directions.
    pub fn cmp_profits(&self, other: &Profits) -> Result<Ordering, NotComparable> {
        let mut this = self.compact();
        let mut other = other.compact();
        if this.is_empty() {
            this.0.push(Profit::Zero);
        }
        if other.is_empty() {
            other.0.push(Profit::Zero);
        }

        let forward = directed_cmp(&this, &other)?;
        let backward = directed_cmp(&other, &this)?;
        if forward == backward.reverse() {
            Ok(forward)
        } else {
            Err(NotComparable)
        }
    }

    /// True when some profit here exceeds its counterpart in `other` (or is
    /// positive with no counterpart), considering both directions.
    pub fn some_more(&self, other: &Profits) -> bool {
        'outer: for p in &self.0 {
            for q in &other.0 {
                if let Ok(cmp) = p.cmp_profit(q) {
                    if cmp == Ordering::Greater {
                        return true;
                    }
                    continue 'outer;
                }
            }
            if !p.is_zero() && p.positive() {
                return true;
            }
        }
        'outer2: for q in &other.0 {
            for p in &self.0 {
                if let Ok(cmp) = p.cmp_profit(q) {
                    if cmp == Ordering::Greater {
                        return true;
                    }
                    continue 'outer2;
                }
            }
            if !q.is_zero() && !q.positive() {
                return true;
            }
        }
        false
    }

    pub fn group_by_kind(&self) -> BTreeMap<&'static str, Profits> {
        let mut groups: BTreeMap<&'static str, Profits> = BTreeMap::new();
        for p in &self.0 {
            let key = match p.kind() {
                None => "ZERO",
                Some(AssetKind::Ether) => "ETHER",
                Some(AssetKind::Erc20) => "ERC20_TOKEN",
                Some(AssetKind::Erc777) => "ERC777_TOKEN",
                Some(AssetKind::Erc721) => "ERC721_TOKEN",
                Some(AssetKind::Erc1155) => "ERC1155_TOKEN",
            };
            groups.entry(key).or_default().add([p.clone()]);
        }
        groups
    }

    /// Net ether profit of an account.
    pub fn ether_profit_of(&self, account: Address) -> Profit {
        let mut sum = Profit::Ether { account, amount: I256::ZERO };
        for p in &self.0 {
            if let Ok(merged) = sum.merge(p) {
                if matches!(merged, Profit::Ether { .. }) {
                    sum = merged;
                }
            }
        }
        sum
    }

    /// Net profit of an account in one ERC-20 token.
    pub fn erc20_profit_of(&self, contract: Address, account: Address) -> Profit {
        let mut sum = Profit::Erc20 { account, contract, amount: I256::ZERO };
        for p in &self.0 {
            if let Ok(merged) = sum.merge(p) {
                if matches!(merged, Profit::Erc20 { .. }) {
                    sum = merged;
                }
            }
        }
        sum
    }

    /// Net non-zero ERC-20 profits of an account, per token contract.
    pub fn all_erc20_profits_of(&self, account: Address) -> BTreeMap<Address, Profit> {
        let mut sums: BTreeMap<Address, Profit> = BTreeMap::new();
        for p in &self.0 {
            if let Profit::Erc20 { account: a, contract, .. } = p {
                if *a != account {
                    continue;
                }
                match sums.get(contract) {
                    Some(existing) => {
                        if let Ok(merged) = existing.merge(p) {
                            sums.insert(*contract, merged);
                        }
                    }
                    None => {
                        sums.insert(*contract, p.clone());
                    }
                }
            }
        }
        sums.retain(|_, p| !p.is_zero());
        sums
    }
}

/// One direction of the two-phase set comparison.
fn directed_cmp(this: &Profits, other: &Profits) -> Result<Ordering, NotComparable> {
    let mut result = Ordering::Equal;
    for p in &this.0 {
        let cmp = other
            .0
            .iter()
            .find_map(|q| p.cmp_profit(q).ok())
            .unwrap_or_else(|| sign_of(p));
        if result == Ordering::Equal {
            result = cmp;
        } else if cmp != Ordering::Equal && result != cmp {
            return Err(NotComparable);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::with_last_byte(n)
    }

    #[test]
    fn cmp_is_antisymmetric() {
        let a = Profits(vec![Profit::ether_in(addr(1), U256::from(10))]);
        let b = Profits(vec![Profit::ether_in(addr(1), U256::from(3))]);
        assert_eq!(a.cmp_profits(&b).unwrap(), Ordering::Greater);
        assert_eq!(b.cmp_profits(&a).unwrap(), Ordering::Less);
        assert_eq!(a.cmp_profits(&a).unwrap(), Ordering::Equal);
    }

    #[test]
    fn not_comparable_is_symmetric() {
        // a gains ether, b gains a token: mixed signs across assets
        let a = Profits(vec![
            Profit::ether_in(addr(1), U256::from(10)),
            Profit::erc20_out(addr(1), addr(9), U256::from(5)),
        ]);
        let b = Profits(vec![
            Profit::ether_out(addr(1), U256::from(1)),
            Profit::erc20_out(addr(1), addr(9), U256::from(2)),
        ]);
        assert!(a.cmp_profits(&b).is_err());
        assert!(b.cmp_profits(&a).is_err());
    }

    #[test]
    fn empty_side_is_zero() {
        let gains = Profits(vec![Profit::ether_in(addr(1), U256::from(10))]);
        let empty = Profits::new();
        assert_eq!(gains.cmp_profits(&empty).unwrap(), Ordering::Greater);
        assert_eq!(empty.cmp_profits(&gains).unwrap(), Ordering::Less);
        assert_eq!(empty.cmp_profits(&Profits::new()).unwrap(), Ordering::Equal);
    }

    #[test]
    fn merge_requires_same_beneficiary() {
        let a = Profit::ether_in(addr(1), U256::from(10));
        let b = Profit::ether_in(addr(2), U256::from(10));
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn opposite_profits_compact_away() {
        let mut ps = Profits::new();
        ps.add([
            Profit::ether_in(addr(1), U256::from(10)),
            Profit::ether_out(addr(1), U256::from(10)),
        ]);
        assert!(ps.compact().is_empty());
    }

    #[test]
    fn erc721_duplicate_receive_dedups() {
        let token = B256::with_last_byte(7);
        let a = Profit::erc721_receive(addr(1), addr(9), token);
        let merged = a.merge(&Profit::erc721_receive(addr(1), addr(9), token)).unwrap();
        match &merged {
            Profit::Erc721 { receive, give, .. } => {
                assert_eq!(receive.len(), 1);
                assert!(give.is_empty());
            }
            _ => unreachable!(),
        }
        // receiving then giving the same token nets to zero
        let net = merged.merge(&Profit::erc721_give(addr(1), addr(9), token)).unwrap();
        assert!(net.is_zero());
    }
}
