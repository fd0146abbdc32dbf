//! Minimal Solidity ABI encoding for the suite's call surface.
//!
//! Covers static words (address, uint, bool) and the dynamic `bytes`,
//! `string` and `uint256[]` arguments the registries take. Anything richer
//! is out of reach for this crate's operations.

use sha3::{Digest, Keccak256};

use crate::provision::types::Address;

const WORD: usize = 32;

/// An ABI argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(u128),
    Bool(bool),
    Bytes(Vec<u8>),
    String(String),
    UintArray(Vec<u128>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        matches!(self, Self::Bytes(_) | Self::String(_) | Self::UintArray(_))
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// First four bytes of the keccak-256 of a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn uint_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn address_word(address: &Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(&address.to_bytes());
    word
}

fn padded(bytes: &[u8]) -> Vec<u8> {
    let mut out = uint_word(bytes.len() as u128).to_vec();
    out.extend_from_slice(bytes);
    let rem = bytes.len() % WORD;
    if rem != 0 {
        out.resize(out.len() + WORD - rem, 0);
    }
    out
}

fn encode_tail(token: &Token) -> Vec<u8> {
    match token {
        Token::Bytes(bytes) => padded(bytes),
        Token::String(text) => padded(text.as_bytes()),
        Token::UintArray(values) => {
            let mut out = uint_word(values.len() as u128).to_vec();
            for value in values {
                out.extend_from_slice(&uint_word(*value));
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Encode a tuple of arguments (head/tail layout).
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len = tokens.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        match token {
            Token::Address(address) => head.extend_from_slice(&address_word(address)),
            Token::Uint(value) => head.extend_from_slice(&uint_word(*value)),
            Token::Bool(flag) => head.extend_from_slice(&uint_word(u128::from(*flag))),
            dynamic => {
                debug_assert!(dynamic.is_dynamic());
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
                tail.extend_from_slice(&encode_tail(dynamic));
            }
        }
    }

    head.extend_from_slice(&tail);
    head
}

pub fn encode_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut out = selector(signature).to_vec();
    out.extend_from_slice(&encode(tokens));
    out
}

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn from_hex(raw: &str) -> Option<Vec<u8>> {
    hex::decode(raw.trim().strip_prefix("0x").unwrap_or(raw.trim())).ok()
}

fn word_at(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * WORD..(index + 1) * WORD)
}

fn word_to_u128(word: &[u8]) -> Option<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Some(u128::from_be_bytes(buf))
}

/// Read the `index`-th head word as a uint.
pub fn decode_uint(data: &[u8], index: usize) -> Option<u128> {
    word_at(data, index).and_then(word_to_u128)
}

pub fn decode_bool(data: &[u8], index: usize) -> Option<bool> {
    decode_uint(data, index).map(|v| v != 0)
}

pub fn decode_address(data: &[u8], index: usize) -> Option<Address> {
    let word = word_at(data, index)?;
    if word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Some(Address::from_bytes(&bytes))
}

fn dynamic_offset(data: &[u8], index: usize) -> Option<usize> {
    decode_uint(data, index).and_then(|v| usize::try_from(v).ok())
}

/// Read a dynamic `uint256[]`/`bytes32[]` argument whose offset sits at head `index`.
pub fn decode_uint_array(data: &[u8], index: usize) -> Option<Vec<u128>> {
    let offset = dynamic_offset(data, index)?;
    let body = data.get(offset..)?;
    let len = usize::try_from(decode_uint(body, 0)?).ok()?;
    (1..=len).map(|i| decode_uint(body, i)).collect()
}

/// Raw 32-byte words of a dynamic array argument.
pub fn decode_word_array(data: &[u8], index: usize) -> Option<Vec<[u8; 32]>> {
    let offset = dynamic_offset(data, index)?;
    let body = data.get(offset..)?;
    let len = usize::try_from(decode_uint(body, 0)?).ok()?;
    (1..=len)
        .map(|i| {
            let word = word_at(body, i)?;
            let mut out = [0u8; 32];
            out.copy_from_slice(word);
            Some(out)
        })
        .collect()
}

pub fn decode_bytes(data: &[u8], index: usize) -> Option<Vec<u8>> {
    let offset = dynamic_offset(data, index)?;
    let body = data.get(offset..)?;
    let len = usize::try_from(decode_uint(body, 0)?).ok()?;
    body.get(WORD..WORD + len).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_known_value() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn static_arguments_are_left_padded() {
        let addr = Address::parse("a", &format!("0x{}", "ab".repeat(20))).unwrap();
        let encoded = encode(&[Token::Address(addr.clone()), Token::Uint(42), Token::Bool(true)]);

        assert_eq!(encoded.len(), 96);
        assert_eq!(decode_address(&encoded, 0), Some(addr));
        assert_eq!(decode_uint(&encoded, 1), Some(42));
        assert_eq!(decode_bool(&encoded, 2), Some(true));
    }

    #[test]
    fn dynamic_arguments_use_offsets() {
        let encoded = encode(&[
            Token::Uint(7),
            Token::UintArray(vec![1, 2, 3]),
            Token::Bytes(b"hello".to_vec()),
        ]);

        // head (3 words) + array (len + 3 words) + bytes (len + 1 padded word)
        assert_eq!(encoded.len(), 32 * (3 + 4 + 2));
        assert_eq!(decode_uint(&encoded, 1), Some(96));
        assert_eq!(decode_uint_array(&encoded, 1), Some(vec![1, 2, 3]));
        assert_eq!(decode_bytes(&encoded, 2), Some(b"hello".to_vec()));
    }

    #[test]
    fn empty_string_encodes_to_length_word() {
        let encoded = encode(&[Token::String(String::new())]);
        assert_eq!(encoded.len(), 64);
        assert_eq!(decode_uint(&encoded, 0), Some(32));
        assert_eq!(decode_uint(&encoded, 1), Some(0));
    }
}
