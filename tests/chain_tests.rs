//! End-to-end ledger scenarios over a real store

use std::collections::HashMap;
use tinycoin::blockchain::Blockchain;
use tinycoin::constants::SUBSIDY;
use tinycoin::error::NodeError;
use tinycoin::transaction::Transaction;
use tinycoin::utxo::UtxoIndex;
use tinycoin::wallet::{hash_pub_key, Wallet};

const FOUNDER_SEED: [u8; 32] = [101u8; 32];
const RECIPIENT_SEED: [u8; 32] = [102u8; 32];

fn founder() -> Wallet {
    Wallet::from_seed(FOUNDER_SEED).unwrap()
}

fn recipient() -> Wallet {
    Wallet::from_seed(RECIPIENT_SEED).unwrap()
}

fn new_chain(dir: &tempfile::TempDir) -> Blockchain {
    Blockchain::create_in(dir.path().join("chain.db"), &founder().address()).unwrap()
}

fn balance(chain: &Blockchain, wallet: &Wallet) -> i64 {
    UtxoIndex::new(chain)
        .find_utxo(&hash_pub_key(&wallet.public_key))
        .unwrap()
        .iter()
        .map(|out| out.value)
        .sum()
}

#[test]
fn test_genesis_balance() {
    let dir = tempfile::tempdir().unwrap();
    let chain = new_chain(&dir);

    assert_eq!(balance(&chain, &founder()), SUBSIDY);
    assert_eq!(chain.best_height().unwrap(), 0);
    assert_eq!(chain.block_hashes().unwrap().len(), 1);
}

#[test]
fn test_simple_transfer_with_local_mine() {
    let dir = tempfile::tempdir().unwrap();
    let chain = new_chain(&dir);
    let founder = founder();
    let recipient = recipient();

    let tx = {
        let utxo = UtxoIndex::new(&chain);
        Transaction::new_utxo(&founder, &recipient.address(), 4, &utxo).unwrap()
    };

    // The transfer conserves value: outputs sum to the consumed coinbase.
    let total_out: i64 = tx.outputs.iter().map(|out| out.value).sum();
    assert_eq!(total_out, SUBSIDY);

    // Mine locally, rewarding the sender as the mining node does.
    let coinbase = Transaction::new_coinbase(&founder.address(), None).unwrap();
    chain.mine_block(vec![coinbase, tx]).unwrap();

    // 6 change + 10 fresh coinbase for the founder, 4 received.
    assert_eq!(balance(&chain, &founder), 16);
    assert_eq!(balance(&chain, &recipient), 4);
    assert_eq!(chain.best_height().unwrap(), 1);
}

#[test]
fn test_insufficient_funds_leaves_chain_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let chain = new_chain(&dir);
    let founder = founder();
    let recipient = recipient();

    let tip_before = chain.tip().unwrap();

    let utxo = UtxoIndex::new(&chain);
    let result = Transaction::new_utxo(&founder, &recipient.address(), 1_000_000, &utxo);
    match result {
        Err(NodeError::InsufficientFunds {
            available,
            required,
        }) => {
            assert_eq!(available, SUBSIDY);
            assert_eq!(required, 1_000_000);
        }
        other => panic!("expected InsufficientFunds, got {:?}", other.map(|_| ())),
    }

    assert_eq!(chain.tip().unwrap(), tip_before);
    assert_eq!(chain.best_height().unwrap(), 0);
    assert_eq!(balance(&chain, &founder), SUBSIDY);
}

#[test]
fn test_tampered_signature_aborts_mining() {
    let dir = tempfile::tempdir().unwrap();
    let chain = new_chain(&dir);
    let founder = founder();
    let recipient = recipient();

    let mut tx = {
        let utxo = UtxoIndex::new(&chain);
        Transaction::new_utxo(&founder, &recipient.address(), 4, &utxo).unwrap()
    };
    assert!(chain.verify_transaction(&tx).unwrap());

    tx.inputs[0].signature[0] ^= 0x01;
    assert!(!chain.verify_transaction(&tx).unwrap());

    let height_before = chain.best_height().unwrap();
    assert!(matches!(
        chain.mine_block(vec![tx]),
        Err(NodeError::InvalidTransaction(_))
    ));
    assert_eq!(chain.best_height().unwrap(), height_before);
}

#[test]
fn test_replay_is_prevented_by_consumption() {
    let dir = tempfile::tempdir().unwrap();
    let chain = new_chain(&dir);
    let founder = founder();
    let recipient = recipient();

    // Spend the founder's entire balance so nothing is left to select.
    let tx = {
        let utxo = UtxoIndex::new(&chain);
        Transaction::new_utxo(&founder, &recipient.address(), SUBSIDY, &utxo).unwrap()
    };
    chain.mine_block(vec![tx.clone()]).unwrap();
    assert_eq!(balance(&chain, &founder), 0);
    assert_eq!(balance(&chain, &recipient), SUBSIDY);

    // Rebuilding the same transfer finds no spendable outputs.
    let utxo = UtxoIndex::new(&chain);
    assert!(matches!(
        Transaction::new_utxo(&founder, &recipient.address(), SUBSIDY, &utxo),
        Err(NodeError::InsufficientFunds { available: 0, .. })
    ));

    // Replaying the mined transaction verbatim no longer resolves: its
    // referenced outputs were consumed and dropped from the index.
    assert!(matches!(
        chain.mine_block(vec![tx]),
        Err(NodeError::UnknownTransaction(_))
    ));
}

#[test]
fn test_tip_monotonicity_on_external_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let chain = new_chain(&dir);
    let miner = recipient();

    let genesis_hash: [u8; 32] = chain.tip().unwrap().as_slice().try_into().unwrap();

    let coinbase = Transaction::new_coinbase(&miner.address(), Some("b1".to_string())).unwrap();
    let b1 = chain.mine_block(vec![coinbase]).unwrap();
    assert_eq!(chain.best_height().unwrap(), 1);

    // A late sibling at height 1 is stored but does not move the tip.
    let sibling_coinbase =
        Transaction::new_coinbase(&miner.address(), Some("sibling".to_string())).unwrap();
    let sibling = tinycoin::Block::new(vec![sibling_coinbase], genesis_hash, 1).unwrap();
    assert!(chain.add_block(&sibling).unwrap());
    assert_eq!(chain.tip().unwrap(), b1.hash.to_vec());
    assert_eq!(chain.best_height().unwrap(), 1);

    // A block above the tip advances it.
    let next_coinbase =
        Transaction::new_coinbase(&miner.address(), Some("b2".to_string())).unwrap();
    let b2 = tinycoin::Block::new(vec![next_coinbase], b1.hash, 2).unwrap();
    assert!(chain.add_block(&b2).unwrap());
    assert_eq!(chain.tip().unwrap(), b2.hash.to_vec());
    assert_eq!(chain.best_height().unwrap(), 2);

    // Replaying an already-stored block changes nothing.
    assert!(!chain.add_block(&b2).unwrap());
    assert_eq!(chain.best_height().unwrap(), 2);
}

#[test]
fn test_incremental_index_matches_reindex() {
    let dir = tempfile::tempdir().unwrap();
    let chain = new_chain(&dir);
    let founder = founder();
    let recipient = recipient();

    // Build a few blocks of history through the incremental path.
    let tx = {
        let utxo = UtxoIndex::new(&chain);
        Transaction::new_utxo(&founder, &recipient.address(), 4, &utxo).unwrap()
    };
    let coinbase = Transaction::new_coinbase(&founder.address(), None).unwrap();
    chain.mine_block(vec![coinbase, tx]).unwrap();

    let tx2 = {
        let utxo = UtxoIndex::new(&chain);
        Transaction::new_utxo(&recipient, &founder.address(), 3, &utxo).unwrap()
    };
    chain.mine_block(vec![tx2]).unwrap();

    let snapshot = |chain: &Blockchain| -> HashMap<Vec<u8>, Vec<u8>> {
        chain
            .store()
            .chainstate_iter()
            .map(|item| item.unwrap())
            .collect()
    };

    let incremental = snapshot(&chain);
    UtxoIndex::new(&chain).reindex().unwrap();
    let rebuilt = snapshot(&chain);

    assert_eq!(incremental, rebuilt);
    assert!(!rebuilt.is_empty());

    // Balances agree with the rebuilt index too.
    assert_eq!(balance(&chain, &founder), 19);
    assert_eq!(balance(&chain, &recipient), 1);
}
