//! Asset transfers observed during execution, and their merge semantics.
//!
//! Fungible transfers of the same asset collapse pairwise: mutual
//! transfers cancel, same-route transfers add up, chained transfers become
//! pass-throughs. Transfers of different assets or contracts do not merge.

use revm::primitives::{Address, B256, U256};
use thiserror::Error;

use crate::contract::{self, DecodedTransferEvent};
use crate::summary::profit::Profit;
use crate::tracing::location::TraceLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Ether,
    Erc20,
    Erc777,
    Erc721,
    Erc1155,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("merge not possible")]
pub struct MergeNotPossible;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("not a transfer")]
pub struct NotTransfer;

#[derive(Debug, Clone)]
pub enum Transfer {
    Ether {
        from: Address,
        to: Address,
        amount: U256,
        location: Option<TraceLocation>,
    },
    Erc20 {
        contract: Address,
        from: Address,
        to: Address,
        amount: U256,
        location: Option<TraceLocation>,
    },
    Erc777 {
        contract: Address,
        from: Address,
        to: Address,
        amount: U256,
        location: Option<TraceLocation>,
    },
    Erc721 {
        contract: Address,
        from: Address,
        to: Address,
        token_id: B256,
        location: Option<TraceLocation>,
    },
    Erc1155 {
        contract: Address,
        from: Address,
        to: Address,
        token_id: B256,
        amount: U256,
        location: Option<TraceLocation>,
    },
}

impl Transfer {
    pub fn kind(&self) -> AssetKind {
        match self {
            Transfer::Ether { .. } => AssetKind::Ether,
            Transfer::Erc20 { .. } => AssetKind::Erc20,
            Transfer::Erc777 { .. } => AssetKind::Erc777,
            Transfer::Erc721 { .. } => AssetKind::Erc721,
            Transfer::Erc1155 { .. } => AssetKind::Erc1155,
        }
    }

    pub fn from(&self) -> Address {
        match self {
            Transfer::Ether { from, .. }
            | Transfer::Erc20 { from, .. }
            | Transfer::Erc777 { from, .. }
            | Transfer::Erc721 { from, .. }
            | Transfer::Erc1155 { from, .. } => *from,
        }
    }

    pub fn to(&self) -> Address {
        match self {
            Transfer::Ether { to, .. }
            | Transfer::Erc20 { to, .. }
            | Transfer::Erc777 { to, .. }
            | Transfer::Erc721 { to, .. }
            | Transfer::Erc1155 { to, .. } => *to,
        }
    }

    /// Token minted from the zero address. Ether is never minted.
    pub fn mint(&self) -> bool {
        !matches!(self, Transfer::Ether { .. }) && self.from() == Address::ZERO
    }

    /// Token burnt to the zero address. Ether is never burnt.
    pub fn burn(&self) -> bool {
        !matches!(self, Transfer::Ether { .. }) && self.to() == Address::ZERO
    }

    pub fn location(&self) -> Option<&TraceLocation> {
        match self {
            Transfer::Ether { location, .. }
            | Transfer::Erc20 { location, .. }
            | Transfer::Erc777 { location, .. }
            | Transfer::Erc721 { location, .. }
            | Transfer::Erc1155 { location, .. } => location.as_ref(),
        }
    }

    /// A transfer with no effect: zero amount or from == to. ERC-721
    /// transfers always move the token.
    pub fn is_zero(&self) -> bool {
        match self {
            Transfer::Erc721 { .. } => false,
            Transfer::Ether { from, to, amount, .. }
            | Transfer::Erc20 { from, to, amount, .. }
            | Transfer::Erc777 { from, to, amount, .. }
            | Transfer::Erc1155 { from, to, amount, .. } => amount.is_zero() || from == to,
        }
    }

    /// The profits this transfer implies for its two parties. Zero
    /// transfers yield nothing; mint/burn sides are skipped.
    pub fn profits(&self) -> Vec<Profit> {
        if self.is_zero() {
            return Vec::new();
        }
        let mut out = Vec::new();
        match self {
            Transfer::Ether { from, to, amount, .. } => {
                out.push(Profit::ether_out(*from, *amount));
                out.push(Profit::ether_in(*to, *amount));
            }
            Transfer::Erc20 { contract, from, to, amount, .. } => {
                if !self.mint() {
                    out.push(Profit::erc20_out(*from, *contract, *amount));
                }
                if !self.burn() {
                    out.push(Profit::erc20_in(*to, *contract, *amount));
                }
            }
            Transfer::Erc777 { contract, from, to, amount, .. } => {
                if !self.mint() {
                    out.push(Profit::erc777_out(*from, *contract, *amount));
                }
                if !self.burn() {
                    out.push(Profit::erc777_in(*to, *contract, *amount));
                }
            }
            Transfer::Erc721 { contract, from, to, token_id, .. } => {
                if !self.mint() {
                    out.push(Profit::erc721_give(*from, *contract, *token_id));
                }
                if !self.burn() {
                    out.push(Profit::erc721_receive(*to, *contract, *token_id));
                }
            }
            Transfer::Erc1155 { contract, from, to, token_id, amount, .. } => {
                if !self.mint() {
                    out.push(Profit::erc1155_out(*from, *contract, *token_id, *amount));
                }
                if !self.burn() {
                    out.push(Profit::erc1155_in(*to, *contract, *token_id, *amount));
                }
            }
        }
        out
    }

    /// Merge with another transfer of the same asset. Returns the list of
    /// replacement transfers; an empty list means the two cancelled out.
    pub fn merge(&self, other: &Transfer) -> Result<Vec<Transfer>, MergeNotPossible> {
        match (self, other) {
            (
                Transfer::Ether { from: f1, to: t1, amount: a1, .. },
                Transfer::Ether { from: f2, to: t2, amount: a2, .. },
            ) => Ok(merge_fungible((*f1, *t1, *a1), (*f2, *t2, *a2))?
                .into_iter()
                .map(|(from, to, amount)| Transfer::Ether { from, to, amount, location: None })
                .collect()),
            (
                Transfer::Erc20 { contract: c1, from: f1, to: t1, amount: a1, .. },
                Transfer::Erc20 { contract: c2, from: f2, to: t2, amount: a2, .. },
            ) => {
                if c1 != c2 {
                    return Err(MergeNotPossible);
                }
                Ok(merge_fungible((*f1, *t1, *a1), (*f2, *t2, *a2))?
                    .into_iter()
                    .map(|(from, to, amount)| Transfer::Erc20 {
                        contract: *c1,
                        from,
                        to,
                        amount,
                        location: None,
                    })
                    .collect())
            }
            (
                Transfer::Erc777 { contract: c1, from: f1, to: t1, amount: a1, .. },
                Transfer::Erc777 { contract: c2, from: f2, to: t2, amount: a2, .. },
            ) => {
                if c1 != c2 {
                    return Err(MergeNotPossible);
                }
                Ok(merge_fungible((*f1, *t1, *a1), (*f2, *t2, *a2))?
                    .into_iter()
                    .map(|(from, to, amount)| Transfer::Erc777 {
                        contract: *c1,
                        from,
                        to,
                        amount,
                        location: None,
                    })
                    .collect())
            }
            (
                Transfer::Erc721 { contract: c1, from: f1, to: t1, token_id: id1, .. },
                Transfer::Erc721 { contract: c2, from: f2, to: t2, token_id: id2, .. },
            ) => {
                if c1 != c2 || id1 != id2 {
                    return Err(MergeNotPossible);
                }
                if f1 == t2 && t1 == f2 {
                    // round trip: the token is back where it started
                    Ok(Vec::new())
                } else if f1 == t2 {
                    Ok(vec![Transfer::Erc721 {
                        contract: *c1,
                        from: *f2,
                        to: *t1,
                        token_id: *id1,
                        location: None,
                    }])
                } else if t1 == f2 {
                    Ok(vec![Transfer::Erc721 {
                        contract: *c1,
                        from: *f1,
                        to: *t2,
                        token_id: *id1,
                        location: None,
                    }])
                } else {
                    Err(MergeNotPossible)
                }
            }
            (
                Transfer::Erc1155 { contract: c1, from: f1, to: t1, token_id: id1, amount: a1, .. },
                Transfer::Erc1155 { contract: c2, from: f2, to: t2, token_id: id2, amount: a2, .. },
            ) => {
                if c1 != c2 || id1 != id2 {
                    return Err(MergeNotPossible);
                }
                Ok(merge_fungible((*f1, *t1, *a1), (*f2, *t2, *a2))?
                    .into_iter()
                    .map(|(from, to, amount)| Transfer::Erc1155 {
                        contract: *c1,
                        from,
                        to,
                        token_id: *id1,
                        amount,
                        location: None,
                    })
                    .collect())
            }
            _ => Err(MergeNotPossible),
        }
    }
}

type Route = (Address, Address, U256);

/// Merge two fungible flows. Zero-amount results are dropped.
fn merge_fungible(a: Route, b: Route) -> Result<Vec<Route>, MergeNotPossible> {
    let (f1, t1, a1) = a;
    let (f2, t2, a2) = b;
    let mut out = Vec::new();
    if f1 == t2 && t1 == f2 {
        // mutual transfer: net flow in the heavier direction
        match a1.cmp(&a2) {
            std::cmp::Ordering::Equal => {}
            std::cmp::Ordering::Greater => out.push((f1, t1, a1 - a2)),
            std::cmp::Ordering::Less => out.push((f2, t2, a2 - a1)),
        }
    } else if f1 == f2 && t1 == t2 {
        out.push((f1, t1, a1 + a2));
    } else if f1 == t2 {
        // b feeds a: pass-through plus remainder
        match a1.cmp(&a2) {
            std::cmp::Ordering::Equal => out.push((f2, t1, a1)),
            std::cmp::Ordering::Greater => {
                out.push((f2, t1, a2));
                out.push((f1, t1, a1 - a2));
            }
            std::cmp::Ordering::Less => {
                out.push((f2, t1, a1));
                out.push((f2, f1, a2 - a1));
            }
        }
    } else if t1 == f2 {
        return merge_fungible(b, a);
    } else {
        return Err(MergeNotPossible);
    }
    Ok(out)
}

/// Decode a raw log into the transfers it encodes. WETH9 deposit/withdraw
/// are normalized to ERC-20 mint/burn.
pub fn log_to_transfers(
    emitter: Address,
    topics: &[B256],
    data: &[u8],
    location: Option<TraceLocation>,
) -> Result<Vec<Transfer>, NotTransfer> {
    let decoded = contract::decode_transfer_event(topics, data).ok_or(NotTransfer)?;
    let topic0 = topics.first().copied().unwrap_or_default();
    match decoded {
        DecodedTransferEvent::Fungible { from, to, amount } => {
            let transfer = if topic0 == contract::erc777_sent_topic()
                || topic0 == contract::erc777_minted_topic()
                || topic0 == contract::erc777_burned_topic()
            {
                Transfer::Erc777 { contract: emitter, from, to, amount, location }
            } else {
                Transfer::Erc20 { contract: emitter, from, to, amount, location }
            };
            Ok(vec![transfer])
        }
        DecodedTransferEvent::Erc721 { from, to, token_id } => Ok(vec![Transfer::Erc721 {
            contract: emitter,
            from,
            to,
            token_id: B256::from(token_id),
            location,
        }]),
        DecodedTransferEvent::Erc1155Single { from, to, token_id, amount } => {
            Ok(vec![Transfer::Erc1155 {
                contract: emitter,
                from,
                to,
                token_id: B256::from(token_id),
                amount,
                location,
            }])
        }
        DecodedTransferEvent::Erc1155Batch { from, to, token_ids, amounts } => {
            if token_ids.len() != amounts.len() {
                return Err(NotTransfer);
            }
            Ok(token_ids
                .into_iter()
                .zip(amounts)
                .map(|(id, amount)| Transfer::Erc1155 {
                    contract: emitter,
                    from,
                    to,
                    token_id: B256::from(id),
                    amount,
                    location: location.clone(),
                })
                .collect())
        }
        DecodedTransferEvent::WethDeposit { dst, amount } => {
            if emitter != contract::WETH9_ADDRESS {
                return Err(NotTransfer);
            }
            Ok(vec![Transfer::Erc20 {
                contract: emitter,
                from: Address::ZERO,
                to: dst,
                amount,
                location,
            }])
        }
        DecodedTransferEvent::WethWithdrawal { src, amount } => {
            if emitter != contract::WETH9_ADDRESS {
                return Err(NotTransfer);
            }
            Ok(vec![Transfer::Erc20 {
                contract: emitter,
                from: src,
                to: Address::ZERO,
                amount,
                location,
            }])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::with_last_byte(n)
    }

    fn ether(from: u8, to: u8, amount: u64) -> Transfer {
        Transfer::Ether {
            from: addr(from),
            to: addr(to),
            amount: U256::from(amount),
            location: None,
        }
    }

    #[test]
    fn mutual_transfers_cancel() {
        let merged = ether(1, 2, 10).merge(&ether(2, 1, 10)).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn mutual_transfers_net_out() {
        let merged = ether(1, 2, 10).merge(&ether(2, 1, 4)).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].from(), addr(1));
        assert_eq!(merged[0].to(), addr(2));
    }

    #[test]
    fn same_route_adds() {
        let merged = ether(1, 2, 10).merge(&ether(1, 2, 5)).unwrap();
        assert_eq!(merged.len(), 1);
        match &merged[0] {
            Transfer::Ether { amount, .. } => assert_eq!(*amount, U256::from(15)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn chained_transfers_pass_through() {
        // 2 -> 1 (4) then 1 -> 3 (10): 4 pass through, 6 from 1's own funds.
        let merged = ether(1, 3, 10).merge(&ether(2, 1, 4)).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].from(), addr(2));
        assert_eq!(merged[0].to(), addr(3));
        assert_eq!(merged[1].from(), addr(1));
        assert_eq!(merged[1].to(), addr(3));
    }

    #[test]
    fn merging_a_zero_transfer_is_identity() {
        let merged = ether(1, 2, 10).merge(&ether(1, 2, 0)).unwrap();
        assert_eq!(merged.len(), 1);
        match &merged[0] {
            Transfer::Ether { from, to, amount, .. } => {
                assert_eq!(*from, addr(1));
                assert_eq!(*to, addr(2));
                assert_eq!(*amount, U256::from(10));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn different_assets_do_not_merge() {
        let erc20 = Transfer::Erc20 {
            contract: addr(9),
            from: addr(1),
            to: addr(2),
            amount: U256::from(10),
            location: None,
        };
        assert!(ether(1, 2, 10).merge(&erc20).is_err());
    }

    #[test]
    fn erc721_round_trip_cancels() {
        let a = Transfer::Erc721 {
            contract: addr(9),
            from: addr(1),
            to: addr(2),
            token_id: B256::with_last_byte(7),
            location: None,
        };
        let b = Transfer::Erc721 {
            contract: addr(9),
            from: addr(2),
            to: addr(1),
            token_id: B256::with_last_byte(7),
            location: None,
        };
        assert!(a.merge(&b).unwrap().is_empty());
    }
}
