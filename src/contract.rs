//! Token-standard knowledge: transfer event signatures and the call
//! selectors that perform token transfers.
//!
//! ERC-20 and ERC-721 share the `Transfer(address,address,uint256)` topic;
//! they are told apart by the indexed-argument count, trying the ERC-20
//! shape first.

use alloy::sol;
use alloy::sol_types::SolEvent;
use revm::primitives::{address, Address, B256, U256};

pub mod erc20 {
    use super::sol;
    sol! {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function transfer(address to, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
    }
}

pub mod erc721 {
    use super::sol;
    sol! {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

        function transferFrom(address from, address to, uint256 tokenId) external;
        function safeTransferFrom(address from, address to, uint256 tokenId) external;
    }
}

pub mod erc777 {
    use super::sol;
    sol! {
        event Sent(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256 amount,
            bytes data,
            bytes operatorData
        );
        event Minted(
            address indexed operator,
            address indexed to,
            uint256 amount,
            bytes data,
            bytes operatorData
        );
        event Burned(
            address indexed operator,
            address indexed from,
            uint256 amount,
            bytes data,
            bytes operatorData
        );

        function send(address recipient, uint256 amount, bytes data) external;
        function operatorSend(
            address sender,
            address recipient,
            uint256 amount,
            bytes data,
            bytes operatorData
        ) external;
        function burn(uint256 amount, bytes data) external;
        function operatorBurn(address account, uint256 amount, bytes data, bytes operatorData) external;
    }
}

pub mod erc1155 {
    use super::sol;
    sol! {
        event TransferSingle(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256 id,
            uint256 value
        );
        event TransferBatch(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256[] ids,
            uint256[] values
        );

        function safeTransferFrom(address from, address to, uint256 id, uint256 amount, bytes data) external;
        function safeBatchTransferFrom(
            address from,
            address to,
            uint256[] ids,
            uint256[] amounts,
            bytes data
        ) external;
    }
}

pub mod weth9 {
    use super::sol;
    sol! {
        event Deposit(address indexed dst, uint256 wad);
        event Withdrawal(address indexed src, uint256 wad);

        function deposit() external payable;
        function withdraw(uint256 wad) external;
    }
}

/// Mainnet WETH9. Deposit/Withdrawal events are normalized to ERC-20
/// mint/burn only for this contract.
pub const WETH9_ADDRESS: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");

pub fn erc20_transfer_topic() -> B256 {
    erc20::Transfer::SIGNATURE_HASH
}

pub fn erc777_sent_topic() -> B256 {
    erc777::Sent::SIGNATURE_HASH
}

pub fn erc777_minted_topic() -> B256 {
    erc777::Minted::SIGNATURE_HASH
}

pub fn erc777_burned_topic() -> B256 {
    erc777::Burned::SIGNATURE_HASH
}

pub fn erc1155_single_topic() -> B256 {
    erc1155::TransferSingle::SIGNATURE_HASH
}

pub fn erc1155_batch_topic() -> B256 {
    erc1155::TransferBatch::SIGNATURE_HASH
}

pub fn weth9_deposit_topic() -> B256 {
    weth9::Deposit::SIGNATURE_HASH
}

pub fn weth9_withdrawal_topic() -> B256 {
    weth9::Withdrawal::SIGNATURE_HASH
}

/// A decoded transfer-shaped event, before asset-type classification.
#[derive(Debug, Clone)]
pub enum DecodedTransferEvent {
    Fungible { from: Address, to: Address, amount: U256 },
    Erc721 { from: Address, to: Address, token_id: U256 },
    Erc1155Single { from: Address, to: Address, token_id: U256, amount: U256 },
    Erc1155Batch { from: Address, to: Address, token_ids: Vec<U256>, amounts: Vec<U256> },
    WethDeposit { dst: Address, amount: U256 },
    WethWithdrawal { src: Address, amount: U256 },
}

/// Decode a raw log into a transfer-shaped event, or `None` when the log is
/// not a recognized transfer.
pub fn decode_transfer_event(topics: &[B256], data: &[u8]) -> Option<DecodedTransferEvent> {
    let topic0 = *topics.first()?;
    if topic0 == erc20::Transfer::SIGNATURE_HASH {
        // ERC-20 first, ERC-721 as fallback (same topic).
        if let Ok(ev) = erc20::Transfer::decode_raw_log(topics.iter().copied(), data, true) {
            return Some(DecodedTransferEvent::Fungible {
                from: ev.from,
                to: ev.to,
                amount: ev.value,
            });
        }
        if let Ok(ev) = erc721::Transfer::decode_raw_log(topics.iter().copied(), data, true) {
            return Some(DecodedTransferEvent::Erc721 {
                from: ev.from,
                to: ev.to,
                token_id: ev.tokenId,
            });
        }
        return None;
    }
    if topic0 == erc777::Sent::SIGNATURE_HASH {
        let ev = erc777::Sent::decode_raw_log(topics.iter().copied(), data, true).ok()?;
        return Some(DecodedTransferEvent::Fungible {
            from: ev.from,
            to: ev.to,
            amount: ev.amount,
        });
    }
    if topic0 == erc777::Minted::SIGNATURE_HASH {
        let ev = erc777::Minted::decode_raw_log(topics.iter().copied(), data, true).ok()?;
        return Some(DecodedTransferEvent::Fungible {
            from: Address::ZERO,
            to: ev.to,
            amount: ev.amount,
        });
    }
    if topic0 == erc777::Burned::SIGNATURE_HASH {
        let ev = erc777::Burned::decode_raw_log(topics.iter().copied(), data, true).ok()?;
        return Some(DecodedTransferEvent::Fungible {
            from: ev.from,
            to: Address::ZERO,
            amount: ev.amount,
        });
    }
    if topic0 == erc1155::TransferSingle::SIGNATURE_HASH {
        let ev = erc1155::TransferSingle::decode_raw_log(topics.iter().copied(), data, true).ok()?;
        return Some(DecodedTransferEvent::Erc1155Single {
            from: ev.from,
            to: ev.to,
            token_id: ev.id,
            amount: ev.value,
        });
    }
    if topic0 == erc1155::TransferBatch::SIGNATURE_HASH {
        let ev = erc1155::TransferBatch::decode_raw_log(topics.iter().copied(), data, true).ok()?;
        return Some(DecodedTransferEvent::Erc1155Batch {
            from: ev.from,
            to: ev.to,
            token_ids: ev.ids,
            amounts: ev.values,
        });
    }
    if topic0 == weth9::Deposit::SIGNATURE_HASH {
        let ev = weth9::Deposit::decode_raw_log(topics.iter().copied(), data, true).ok()?;
        return Some(DecodedTransferEvent::WethDeposit { dst: ev.dst, amount: ev.wad });
    }
    if topic0 == weth9::Withdrawal::SIGNATURE_HASH {
        let ev = weth9::Withdrawal::decode_raw_log(topics.iter().copied(), data, true).ok()?;
        return Some(DecodedTransferEvent::WethWithdrawal { src: ev.src, amount: ev.wad });
    }
    None
}

/// Whether the call input invokes a token-transfer ABI of a known standard.
pub fn is_token_transfer_selector(input: &[u8]) -> bool {
    use alloy::sol_types::SolCall;
    if input.len() < 4 {
        return false;
    }
    let sel: [u8; 4] = input[..4].try_into().unwrap();
    sel == erc20::transferCall::SELECTOR
        || sel == erc20::transferFromCall::SELECTOR
        || sel == erc721::safeTransferFromCall::SELECTOR
        || sel == selector("safeTransferFrom(address,address,uint256,bytes)")
        || sel == erc777::sendCall::SELECTOR
        || sel == erc777::operatorSendCall::SELECTOR
        || sel == erc777::burnCall::SELECTOR
        || sel == erc777::operatorBurnCall::SELECTOR
        || sel == erc1155::safeTransferFromCall::SELECTOR
        || sel == erc1155::safeBatchTransferFromCall::SELECTOR
        || sel == weth9::depositCall::SELECTOR
        || sel == weth9::withdrawCall::SELECTOR
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = alloy::primitives::keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolEvent;

    #[test]
    fn transfer_topic_is_shared_between_erc20_and_erc721() {
        assert_eq!(erc20::Transfer::SIGNATURE_HASH, erc721::Transfer::SIGNATURE_HASH);
    }

    #[test]
    fn selectors_match_signatures() {
        use alloy::sol_types::SolCall;
        assert_eq!(erc20::transferCall::SELECTOR, selector("transfer(address,uint256)"));
        assert_eq!(
            erc20::transferFromCall::SELECTOR,
            selector("transferFrom(address,address,uint256)")
        );
        assert_eq!(
            erc1155::safeBatchTransferFromCall::SELECTOR,
            selector("safeBatchTransferFrom(address,address,uint256[],uint256[],bytes)")
        );
    }
}
