//! Proptest generators for property-based testing.

use proptest::prelude::*;

use agora_core::{
    AccountingBlock, AccountingTx, AccountingTxType, Blake3Hash, Ed25519PublicKey, EntryBuilder, Keypair,
    NodeId, PayloadHash, ProtectedPayload, StorageEntry, TxOutput,
};

use crate::fixtures::{ONE_HOUR_MS, T0};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

pub fn public_key() -> impl Strategy<Value = Ed25519PublicKey> {
    keypair().prop_map(|kp| kp.public_key())
}

pub fn node_id() -> impl Strategy<Value = NodeId> {
    any::<[u8; 32]>().prop_map(NodeId::from_bytes)
}

pub fn payload_hash() -> impl Strategy<Value = PayloadHash> {
    any::<[u8; 32]>().prop_map(PayloadHash::from_bytes)
}

/// Payload bytes of at most `max_len`.
pub fn data(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// A protected payload owned by `owner`, one hour TTL.
pub fn protected_payload(owner: Ed25519PublicKey) -> impl Strategy<Value = ProtectedPayload> {
    data(256).prop_map(move |bytes| ProtectedPayload::new(owner, ONE_HOUR_MS, bytes))
}

/// Sequence numbers for one key, in arrival order.
pub fn sequence_arrivals(max_len: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..=64, 1..=max_len)
}

/// Signed entries for one payload, one per sequence number, in arrival order.
pub fn entry_arrivals(owner: Keypair, max_len: usize) -> impl Strategy<Value = (ProtectedPayload, Vec<StorageEntry>)> {
    let owner_key = owner.public_key();
    (protected_payload(owner_key), sequence_arrivals(max_len)).prop_map(move |(payload, seqs)| {
        let entries = seqs
            .into_iter()
            .map(|seq| {
                EntryBuilder::new(payload.clone())
                    .sequence_number(seq)
                    .timestamp(T0)
                    .sign(&owner)
            })
            .collect();
        (payload, entries)
    })
}

pub fn tx_type() -> impl Strategy<Value = AccountingTxType> {
    prop_oneof![Just(AccountingTxType::BtcTradeFee), Just(AccountingTxType::DistributedPayout)]
}

/// Recipients drawn from a small pool so they repeat across blocks.
pub fn recipient() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("alice".to_string()),
        Just("bob".to_string()),
        Just("carol".to_string()),
        Just("Legacy Burningman (DPT)".to_string()),
        Just("Legacy Burningman (BTC fees)".to_string()),
    ]
}

pub fn accounting_tx() -> impl Strategy<Value = AccountingTx> {
    (
        any::<[u8; 32]>(),
        tx_type(),
        prop::collection::vec((recipient(), 1u64..=10_000_000), 1..=4),
    )
        .prop_map(|(id, tx_type, outputs)| {
            let outputs = outputs
                .into_iter()
                .map(|(name, sats)| TxOutput::new(name, sats))
                .collect();
            AccountingTx::new(Blake3Hash::hash(&id).to_hex(), tx_type, outputs)
        })
}

/// A linked chain of `1..=max_len` blocks from `from_height`, one block
/// roughly every ten days starting 2019-06 so several months are covered.
pub fn block_chain(from_height: u64, max_len: usize) -> impl Strategy<Value = Vec<AccountingBlock>> {
    const TEN_DAYS_MS: i64 = 10 * 24 * 60 * 60 * 1000;
    const JUNE_2019: i64 = 1_559_347_200_000;
    prop::collection::vec(prop::collection::vec(accounting_tx(), 0..=3), 1..=max_len).prop_map(move |txs| {
        let mut previous_hash = Blake3Hash::ZERO;
        txs.into_iter()
            .enumerate()
            .map(|(i, txs)| {
                let block = AccountingBlock::new(
                    from_height + i as u64,
                    previous_hash,
                    JUNE_2019 + i as i64 * TEN_DAYS_MS,
                    txs,
                );
                previous_hash = block.hash;
                block
            })
            .collect()
    })
}
