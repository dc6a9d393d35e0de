//! ERC-20 calldata and log helpers

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// `balanceOf(address)`
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Topic of `Transfer(address,address,uint256)`
pub fn transfer_event_topic() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

pub fn transfer_calldata(to: Address, amount: U256) -> Bytes {
    let mut data = TRANSFER_SELECTOR.to_vec();
    data.extend(abi::encode(&[Token::Address(to), Token::Uint(amount)]));
    Bytes::from(data)
}

pub fn balance_of_calldata(owner: Address) -> Bytes {
    let mut data = BALANCE_OF_SELECTOR.to_vec();
    data.extend(abi::encode(&[Token::Address(owner)]));
    Bytes::from(data)
}

/// Recipient and amount of a `transfer` call, if `input` is one
pub fn decode_transfer(input: &[u8]) -> Option<(Address, U256)> {
    if input.len() < 4 || input[..4] != TRANSFER_SELECTOR {
        return None;
    }
    let tokens = abi::decode(&[ParamType::Address, ParamType::Uint(256)], &input[4..]).ok()?;
    match tokens.as_slice() {
        [Token::Address(to), Token::Uint(amount)] => Some((*to, *amount)),
        _ => None,
    }
}

/// Read a 32-byte word returned by `balanceOf`
pub fn decode_uint(output: &[u8]) -> Option<U256> {
    (output.len() >= 32).then(|| U256::from_big_endian(&output[..32]))
}

/// Address stored in an indexed log topic
pub fn topic_address(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_calldata_decodes_back() {
        let to = Address::repeat_byte(0x11);
        let data = transfer_calldata(to, U256::from(1_230_009_077u64));
        assert_eq!(data.len(), 68);
        assert_eq!(
            decode_transfer(&data),
            Some((to, U256::from(1_230_009_077u64)))
        );
    }

    #[test]
    fn other_calls_are_not_transfers() {
        let data = balance_of_calldata(Address::repeat_byte(0x22));
        assert_eq!(decode_transfer(&data), None);
        assert_eq!(decode_transfer(&[]), None);
    }

    #[test]
    fn selectors_match_signatures() {
        assert_eq!(&keccak256("transfer(address,uint256)")[..4], &TRANSFER_SELECTOR);
        assert_eq!(&keccak256("balanceOf(address)")[..4], &BALANCE_OF_SELECTOR);
    }

    #[test]
    fn topic_address_takes_low_bytes() {
        let address = Address::repeat_byte(0x33);
        let topic = H256::from(address);
        assert_eq!(topic_address(&topic), address);
    }
}
