//! Deterministic CBOR encoding for hashing and signing.
//!
//! Follows RFC 8949 core deterministic encoding:
//! - Map keys sorted by encoded byte comparison
//! - Integers use the smallest valid encoding
//! - Definite lengths only
//! - No floats (timestamps are i64 milliseconds)
//!
//! Payload hashes, entry signatures, block hashes and oracle batch signatures
//! are all computed over these bytes, so every node must produce identical
//! output for identical values. Wire transport uses plain serde and never
//! needs to decode these bytes.

use ciborium::value::Value;

use crate::block::AccountingBlock;
use crate::crypto::{Blake3Hash, Ed25519PublicKey};
use crate::payload::{AppendOnlyPayload, StoragePayload};
use crate::types::{Capability, PayloadHash};

/// Integer map keys. Keys 0-23 encode as a single byte.
mod keys {
    // Payload fields.
    pub const KIND: u64 = 0;
    pub const OWNER: u64 = 1;
    pub const TTL: u64 = 2;
    pub const DATA: u64 = 3;
    pub const CAPABILITIES: u64 = 4;
    pub const ADD_ONCE: u64 = 5;
    pub const OWNER_NODE: u64 = 6;
    pub const PERSISTABLE: u64 = 7;
    pub const SENDER: u64 = 8;
    pub const RECEIVER: u64 = 9;
    pub const DATE: u64 = 10;
    pub const TRUNCATABLE: u64 = 11;

    // Signed-message fields.
    pub const DOMAIN: u64 = 0;
    pub const SUBJECT: u64 = 1;
    pub const SEQ: u64 = 2;
    pub const SIGNER_CONTEXT: u64 = 3;

    // Block fields.
    pub const HEIGHT: u64 = 0;
    pub const PREVIOUS: u64 = 1;
    pub const TIMESTAMP: u64 = 2;
    pub const TXS: u64 = 3;
    pub const TX_ID: u64 = 0;
    pub const TX_TYPE: u64 = 1;
    pub const OUTPUTS: u64 = 2;
    pub const RECIPIENT: u64 = 0;
    pub const VALUE: u64 = 1;
}

const KIND_PROTECTED: u64 = 0;
const KIND_MAILBOX: u64 = 1;
const KIND_APPEND_ONLY: u64 = 2;

const ENTRY_DOMAIN: &str = "agora/entry/v1";
const BLOCK_DOMAIN: &str = "agora/block/v1";
const BATCH_DOMAIN: &str = "agora/batch/v1";

fn uint(n: u64) -> Value {
    Value::Integer(n.into())
}

fn bytes(b: &[u8]) -> Value {
    Value::Bytes(b.to_vec())
}

fn caps(list: &[Capability]) -> Value {
    Value::Array(list.iter().map(|c| uint(c.0 as u64)).collect())
}

fn map(entries: Vec<(u64, Value)>) -> Value {
    Value::Map(entries.into_iter().map(|(k, v)| (uint(k), v)).collect())
}

/// Canonical bytes of a signed-entry payload.
pub fn payload_bytes(payload: &StoragePayload) -> Vec<u8> {
    let value = match payload {
        StoragePayload::Protected(p) => map(vec![
            (keys::KIND, uint(KIND_PROTECTED)),
            (keys::OWNER, bytes(p.owner.as_bytes())),
            (keys::TTL, uint(p.ttl_ms)),
            (keys::DATA, bytes(&p.data)),
            (keys::CAPABILITIES, caps(&p.required_capabilities)),
            (keys::ADD_ONCE, Value::Bool(p.add_once)),
            (
                keys::OWNER_NODE,
                p.owner_node.map_or(Value::Null, |n| bytes(&n.0)),
            ),
            (keys::PERSISTABLE, Value::Bool(p.persistable)),
        ]),
        StoragePayload::Mailbox(m) => map(vec![
            (keys::KIND, uint(KIND_MAILBOX)),
            (keys::SENDER, bytes(m.sender.as_bytes())),
            (keys::RECEIVER, bytes(m.receiver.as_bytes())),
            (keys::TTL, uint(m.ttl_ms)),
            (keys::DATA, bytes(&m.sealed)),
        ]),
    };
    encode(&value)
}

/// Canonical bytes of a content-addressed payload.
pub fn append_only_bytes(payload: &AppendOnlyPayload) -> Vec<u8> {
    encode(&map(vec![
        (keys::KIND, uint(KIND_APPEND_ONLY)),
        (keys::DATA, bytes(&payload.data)),
        (
            keys::DATE,
            payload.date_ms.map_or(Value::Null, |d| Value::Integer(d.into())),
        ),
        (keys::CAPABILITIES, caps(&payload.required_capabilities)),
        (keys::TRUNCATABLE, Value::Bool(payload.date_sorted_truncatable)),
    ]))
}

/// Message signed for add, refresh and remove of a storage entry:
/// payload hash, sequence number and the entry's owner key.
pub fn entry_signing_message(key: &PayloadHash, seq: u64, owner: &Ed25519PublicKey) -> Vec<u8> {
    encode(&map(vec![
        (keys::DOMAIN, Value::Text(ENTRY_DOMAIN.into())),
        (keys::SUBJECT, bytes(key.as_bytes())),
        (keys::SEQ, uint(seq)),
        (keys::SIGNER_CONTEXT, bytes(owner.as_bytes())),
    ]))
}

/// Canonical bytes of a block, excluding its own hash.
pub fn block_bytes(block: &AccountingBlock) -> Vec<u8> {
    let txs = block
        .txs
        .iter()
        .map(|tx| {
            let outputs = tx
                .outputs
                .iter()
                .map(|o| {
                    map(vec![
                        (keys::RECIPIENT, Value::Text(o.recipient_name.clone())),
                        (keys::VALUE, uint(o.value_sats)),
                    ])
                })
                .collect();
            map(vec![
                (keys::TX_ID, Value::Text(tx.tx_id.clone())),
                (keys::TX_TYPE, uint(tx.tx_type.to_u8() as u64)),
                (keys::OUTPUTS, Value::Array(outputs)),
            ])
        })
        .collect();

    encode(&map(vec![
        (keys::HEIGHT, uint(block.height)),
        (keys::PREVIOUS, bytes(block.previous_hash.as_bytes())),
        (keys::TIMESTAMP, Value::Integer(block.timestamp.into())),
        (keys::TXS, Value::Array(txs)),
    ]))
}

/// Message the oracle signs when broadcasting a single block.
pub fn block_signing_message(hash: &Blake3Hash) -> Vec<u8> {
    encode(&map(vec![
        (keys::DOMAIN, Value::Text(BLOCK_DOMAIN.into())),
        (keys::SUBJECT, bytes(hash.as_bytes())),
    ]))
}

/// Message the oracle signs for a backfill batch: the request nonce plus
/// every block hash in order.
pub fn batch_signing_message(nonce: u64, blocks: &[AccountingBlock]) -> Vec<u8> {
    let hashes = blocks.iter().map(|b| bytes(b.hash.as_bytes())).collect();
    encode(&map(vec![
        (keys::DOMAIN, Value::Text(BATCH_DOMAIN.into())),
        (keys::SUBJECT, Value::Array(hashes)),
        (keys::SEQ, uint(nonce)),
    ]))
}

fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        // Values are only ever built by this module.
        _ => unreachable!("canonical encoder received an unsupported CBOR value"),
    }
}

fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, ...
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | n as u8);
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| (encode(k), v))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::payload::ProtectedPayload;

    #[test]
    fn test_integer_encoding_is_minimal() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (23, &[0x17]),
            (24, &[0x18, 24]),
            (255, &[0x18, 0xff]),
            (256, &[0x19, 0x01, 0x00]),
            (65_536, &[0x1a, 0x00, 0x01, 0x00, 0x00]),
        ];
        for (n, expected) in cases {
            let mut buf = Vec::new();
            encode_uint(&mut buf, 0, *n);
            assert_eq!(&buf, expected, "encoding of {}", n);
        }
    }

    #[test]
    fn test_negative_timestamp_encoding() {
        let mut buf = Vec::new();
        encode_integer(&mut buf, (-1i64).into());
        assert_eq!(buf, vec![0x20]);
    }

    #[test]
    fn test_map_keys_sorted_regardless_of_insertion() {
        let entries = vec![
            (uint(8), uint(80)),
            (uint(0), uint(0)),
            (uint(5), uint(50)),
        ];
        let mut buf = Vec::new();
        encode_map_canonical(&mut buf, &entries);
        assert_eq!(buf, vec![0xa3, 0x00, 0x00, 0x05, 0x18, 50, 0x08, 0x18, 80]);
    }

    #[test]
    fn test_payload_bytes_deterministic() {
        let owner = Keypair::from_seed(&[3; 32]).public_key();
        let payload = StoragePayload::from(ProtectedPayload::new(owner, 1000, &b"abc"[..]));
        assert_eq!(payload_bytes(&payload), payload_bytes(&payload.clone()));
    }

    #[test]
    fn test_entry_message_binds_sequence_and_owner() {
        let key = PayloadHash::from_bytes([1; 32]);
        let a = Keypair::from_seed(&[1; 32]).public_key();
        let b = Keypair::from_seed(&[2; 32]).public_key();
        assert_ne!(entry_signing_message(&key, 1, &a), entry_signing_message(&key, 2, &a));
        assert_ne!(entry_signing_message(&key, 1, &a), entry_signing_message(&key, 1, &b));
    }

    #[test]
    fn test_batch_message_binds_nonce() {
        let block = AccountingBlock::new(1, Blake3Hash::ZERO, 0, vec![]);
        let blocks = vec![block];
        assert_ne!(batch_signing_message(1, &blocks), batch_signing_message(2, &blocks));
    }
}
