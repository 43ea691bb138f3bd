//! Several nodes on one in-memory network.

use std::sync::Arc;
use std::time::Duration;

use agora::core::{AccountingBlock, Blake3Hash, Capabilities, Capability, NodeId, ProtectedPayload};
use agora::ledger::{
    received_btc_as_bsq, BalanceEntryType, PriceTable, YearMonth, LEGACY_BURNING_MAN_BTC_FEES_NAME,
    LEGACY_BURNING_MAN_DPT_NAME,
};
use agora::store::Persistence;
use agora::sync::{MemoryTransport, Transport, WireMessage, PROTOCOL_VERSION};
use agora_testkit::{eventually, month_start_ms, BlockChainBuilder, NetworkFixture, NodeHandle, OracleFixture};

const ALICE: &str = "alice";

/// Heights 111..=114: three fee outputs to alice in priced months, one in a
/// month past the price table, and payouts to both legacy recipients.
fn fee_blocks() -> Vec<AccountingBlock> {
    BlockChainBuilder::regtest()
        .next_block(month_start_ms(2021, 3))
        .btc_fee(ALICE, 50_000)
        .payout(LEGACY_BURNING_MAN_DPT_NAME, 1_000_000)
        .btc_fee(LEGACY_BURNING_MAN_BTC_FEES_NAME, 2_000_000)
        .next_block(month_start_ms(2021, 4))
        .btc_fee(ALICE, 50_000)
        .next_block(month_start_ms(2021, 5))
        .btc_fee(ALICE, 50_000)
        .next_block(month_start_ms(2030, 1))
        .btc_fee(ALICE, 50_000)
        .build()
}

async fn oracle_and_verifier(net: &NetworkFixture) -> (NodeHandle, NodeHandle) {
    let oracle = net.spawn(1, NetworkFixture::config(1, true)).await;
    let verifier = net.spawn(2, NetworkFixture::config(2, false)).await;
    (oracle, verifier)
}

async fn publish_all(node: &NodeHandle, blocks: &[AccountingBlock]) {
    for block in blocks {
        node.node.accounting().publish_block(block.clone()).await.unwrap();
    }
}

async fn probe(net: &NetworkFixture, seed: u8) -> (NodeId, Arc<MemoryTransport>) {
    peer_with(net, seed, Capabilities::new([Capability::ACCOUNTING])).await
}

async fn peer_with(net: &NetworkFixture, seed: u8, capabilities: Capabilities) -> (NodeId, Arc<MemoryTransport>) {
    let id = NodeId::from_bytes([seed; 32]);
    let transport = net.network.create_transport(id, capabilities).await;
    (id, Arc::new(transport))
}

/// Introduce `peer` to `to` and collect the kinds of everything sent back.
async fn hello_replies(peer: &MemoryTransport, to: &NodeId, capabilities: Capabilities) -> Vec<&'static str> {
    let hello = WireMessage::Hello {
        node_id: peer.local_node_id(),
        protocol_version: PROTOCOL_VERSION,
        capabilities,
    };
    peer.send(to, hello).await.unwrap();
    let mut kinds = Vec::new();
    while let Some((_, message)) = peer.recv_timeout(Duration::from_millis(100)).await.unwrap() {
        kinds.push(message.kind());
    }
    kinds
}

#[tokio::test]
async fn test_published_blocks_reach_verifier_balances() {
    let net = NetworkFixture::new();
    let (oracle, verifier) = oracle_and_verifier(&net).await;
    publish_all(&oracle, &fee_blocks()).await;

    assert!(eventually(|| verifier.node.balances().last_height() == Some(114)).await);
    assert_eq!(verifier.node.accounting().last_height(), 114);

    let balances = verifier.node.balances();
    for month in [3, 4, 5] {
        let entries = balances.distributed_by_month(YearMonth::new(2021, month).unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount_sats, 50_000);
        assert_eq!(entries[0].entry_type, BalanceEntryType::BtcTradeFee);
    }

    let alice = balances.balance_model(ALICE).unwrap();
    assert_eq!(alice.total_sats(), 200_000);

    // The unpriced month counts in satoshis but not in BSQ.
    let prices = PriceTable::historical();
    let expected_bsq: u64 = [3, 4, 5]
        .into_iter()
        .map(|month| {
            let price = prices.get(&YearMonth::new(2021, month).unwrap()).unwrap();
            received_btc_as_bsq(50_000, price)
        })
        .sum();
    assert_eq!(balances.total_distributed_btc(), 200_000);
    assert_eq!(balances.total_distributed_btc_fees(), 200_000);
    assert_eq!(balances.total_distributed_btc_fees_as_bsq(), expected_bsq);
    assert_eq!(balances.total_distributed_bsq(), expected_bsq);

    // Legacy recipients keep their own models but stay out of every total.
    assert_eq!(balances.balance_model(LEGACY_BURNING_MAN_DPT_NAME).unwrap().total_sats(), 1_000_000);
    assert_eq!(
        balances.balance_model(LEGACY_BURNING_MAN_BTC_FEES_NAME).unwrap().total_sats(),
        2_000_000
    );
    assert_eq!(balances.total_distributed_dpt(), 0);
}

#[tokio::test]
async fn test_late_joiner_backfills_on_hello() {
    let net = NetworkFixture::new();
    let (oracle, verifier) = oracle_and_verifier(&net).await;
    publish_all(&oracle, &fee_blocks()).await;
    assert!(eventually(|| verifier.node.accounting().last_height() == 114).await);

    let late = net.spawn(3, NetworkFixture::config(3, false)).await;
    assert_eq!(late.node.accounting().last_height(), 110);
    net.connect(&oracle, &late).await;

    assert!(eventually(|| late.node.balances().last_height() == Some(114)).await);
    assert_eq!(late.node.accounting().blocks(), oracle.node.accounting().blocks());
    assert_eq!(
        late.node.balances().total_distributed_bsq(),
        verifier.node.balances().total_distributed_bsq()
    );
}

#[tokio::test]
async fn test_backfill_request_answers_from_height_with_signed_batch() {
    let net = NetworkFixture::new();
    let oracle = net.spawn(1, NetworkFixture::config(1, true)).await;
    publish_all(&oracle, &fee_blocks()).await;

    let (_, client) = probe(&net, 9).await;
    client
        .send(
            &oracle.id,
            WireMessage::GetAccountingBlocksRequest {
                from_height: 113,
                nonce: 42,
            },
        )
        .await
        .unwrap();

    let (from, response) = client
        .recv_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("oracle answers");
    assert_eq!(from, oracle.id);
    let (blocks, request_nonce, oracle_signature) = match response {
        WireMessage::GetAccountingBlocksResponse {
            blocks,
            request_nonce,
            oracle_signature,
        } => (blocks, request_nonce, oracle_signature),
        other => panic!("unexpected reply {}", other.kind()),
    };
    assert_eq!(request_nonce, 42);
    assert_eq!(blocks.iter().map(|b| b.height).collect::<Vec<_>>(), vec![113, 114]);
    assert!(OracleFixture::verifier().verify_batch(42, &blocks, &oracle_signature).is_ok());
    assert!(OracleFixture::verifier().verify_batch(43, &blocks, &oracle_signature).is_err());
}

#[tokio::test]
async fn test_block_requests_go_only_to_providers() {
    let net = NetworkFixture::new();
    let verifier = net.spawn(2, NetworkFixture::config(2, false)).await;
    assert!(!NetworkFixture::config(2, false)
        .advertised_capabilities()
        .contains(Capability::ACCOUNTING_PROVIDER));

    let receiver_caps = Capabilities::new([Capability::ACCOUNTING]);
    let (_, other_verifier) = peer_with(&net, 8, receiver_caps.clone()).await;
    let replies = hello_replies(&other_verifier, &verifier.id, receiver_caps).await;
    assert!(replies.contains(&"get_data_request"));
    assert!(!replies.contains(&"get_blocks_request"));
    assert_eq!(verifier.node.accounting().pending_requests(), 0);

    let provider_caps = Capabilities::new([Capability::ACCOUNTING, Capability::ACCOUNTING_PROVIDER]);
    let (_, provider) = peer_with(&net, 9, provider_caps.clone()).await;
    let replies = hello_replies(&provider, &verifier.id, provider_caps).await;
    assert!(replies.contains(&"get_blocks_request"));
}

#[tokio::test]
async fn test_broadcast_with_foreign_previous_hash_leaves_chain() {
    let net = NetworkFixture::new();
    let (oracle, verifier) = oracle_and_verifier(&net).await;
    publish_all(&oracle, &fee_blocks()).await;
    assert!(eventually(|| verifier.node.accounting().last_height() == 114).await);
    let before = verifier.node.accounting().blocks();

    let fork = BlockChainBuilder::after(115, Blake3Hash::hash(b"some other chain"))
        .next_block(month_start_ms(2030, 2))
        .btc_fee(ALICE, 1)
        .build();
    let (_, attacker) = probe(&net, 9).await;
    attacker
        .send(&verifier.id, OracleFixture::broadcast(&fork[0]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(verifier.node.accounting().last_height(), 114);
    assert_eq!(verifier.node.accounting().blocks(), before);
    assert_eq!(verifier.node.balances().total_distributed_btc(), 200_000);
}

#[tokio::test]
async fn test_mailbox_message_delivered_and_acknowledged() {
    let net = NetworkFixture::new();
    let alice = net.spawn(1, NetworkFixture::config(1, false)).await;
    let bob = net.spawn(2, NetworkFixture::config(2, false)).await;

    let key = alice
        .node
        .mailbox()
        .send(&b"payment started"[..], &bob.node.mailbox().address())
        .unwrap();

    assert!(eventually(|| bob.node.mailbox().received_messages().len() == 1).await);
    let received = bob.node.mailbox().received_messages().remove(0);
    assert_eq!(received.key, key);
    assert_eq!(received.message.body.as_ref(), b"payment started");
    assert_eq!(received.message.sender, alice.node.mailbox().address());

    bob.node.mailbox().acknowledge(&key).unwrap();
    assert!(eventually(|| alice.node.store().get(&key).is_none()).await);
}

#[tokio::test]
async fn test_initial_data_exchange_on_connect() {
    let net = NetworkFixture::new();
    let first = net.spawn(1, NetworkFixture::config(1, false)).await;
    let payload = ProtectedPayload::new(first.node.public_key(), 60 * 60 * 1000, &b"offer"[..]);
    let key = agora::StoragePayload::from(payload.clone()).hash();
    assert!(first.node.publish(payload).is_added());

    let second = net.spawn(2, NetworkFixture::config(2, false)).await;
    assert!(second.node.store().get(&key).is_none());
    net.connect(&first, &second).await;

    assert!(eventually(|| second.node.store().get(&key).is_some()).await);
}

#[tokio::test]
async fn test_restart_restores_store_chain_and_balances() {
    let net = NetworkFixture::new();
    let (oracle, verifier) = oracle_and_verifier(&net).await;
    publish_all(&oracle, &fee_blocks()).await;

    let payload = ProtectedPayload::new(verifier.node.public_key(), 60 * 60 * 1000, &b"offer"[..]).persistable();
    let key = agora::StoragePayload::from(payload.clone()).hash();
    assert!(verifier.node.publish(payload).is_added());

    assert!(eventually(|| verifier.node.accounting().last_height() == 114).await);
    let mut saved = false;
    for _ in 0..200 {
        if !verifier.persistence.load_entries().await.unwrap().is_empty() {
            saved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saved);
    let bsq = verifier.node.balances().total_distributed_bsq();
    verifier.node.shutdown().await.unwrap();

    let fresh = NetworkFixture::new();
    let restarted = fresh
        .spawn_with(2, NetworkFixture::config(2, false), Arc::clone(&verifier.persistence))
        .await;
    assert_eq!(restarted.node.accounting().last_height(), 114);
    assert_eq!(restarted.node.balances().total_distributed_bsq(), bsq);
    assert!(restarted.node.store().get(&key).is_some());
    assert_eq!(restarted.node.store().sequence_number(&key), Some(1));
}

#[tokio::test]
async fn test_start_twice_fails() {
    let net = NetworkFixture::new();
    let node = net.spawn(1, NetworkFixture::config(1, false)).await;
    assert!(matches!(node.node.start().await, Err(agora::NodeError::AlreadyStarted)));
}
