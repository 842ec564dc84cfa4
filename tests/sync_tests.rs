//! Two-node synchronization over loopback TCP

use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};
use tinycoin::blockchain::Blockchain;
use tinycoin::server::Server;
use tinycoin::transaction::Transaction;
use tinycoin::wallet::Wallet;

const CENTRAL_PORT: &str = "23157";
const JOINER_PORT: &str = "23158";

fn wait_for_listener(addr: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        assert!(Instant::now() < deadline, "{} never started listening", addr);
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_late_joiner_syncs_to_central_tip() {
    let founder = Wallet::from_seed([201u8; 32]).unwrap();

    // Central node: genesis plus three more mined blocks.
    let central_dir = tempfile::tempdir().unwrap();
    let central_chain =
        Blockchain::create_in(central_dir.path().join("chain.db"), &founder.address()).unwrap();
    for tag in ["b1", "b2", "b3"] {
        let coinbase =
            Transaction::new_coinbase(&founder.address(), Some(tag.to_string())).unwrap();
        central_chain.mine_block(vec![coinbase]).unwrap();
    }
    assert_eq!(central_chain.best_height().unwrap(), 3);
    let central_tip = central_chain.tip().unwrap();

    // The joiner starts from the shared genesis block only.
    let genesis = central_chain
        .iter()
        .unwrap()
        .last()
        .unwrap()
        .unwrap();
    let joiner_dir = tempfile::tempdir().unwrap();
    let joiner_chain = Blockchain::init_in(joiner_dir.path().join("chain.db")).unwrap();
    assert!(joiner_chain.add_block(&genesis).unwrap());
    assert_eq!(joiner_chain.best_height().unwrap(), 0);

    let central_addr = format!("localhost:{}", CENTRAL_PORT);

    let central_server = Server::with_central(
        CENTRAL_PORT,
        None,
        central_chain.clone(),
        &central_addr,
    );
    thread::spawn(move || central_server.run());
    wait_for_listener(&central_addr);

    // The joiner announces its version on startup, which kicks off the
    // block download.
    let joiner_server = Server::with_central(
        JOINER_PORT,
        None,
        joiner_chain.clone(),
        &central_addr,
    );
    thread::spawn(move || joiner_server.run());
    wait_for_listener(&format!("localhost:{}", JOINER_PORT));

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        if joiner_chain.best_height().unwrap() == 3 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "joiner stalled at height {}",
            joiner_chain.best_height().unwrap()
        );
        thread::sleep(Duration::from_millis(100));
    }

    assert_eq!(joiner_chain.best_height().unwrap(), 3);
    assert_eq!(joiner_chain.tip().unwrap(), central_tip);

    // The joiner holds the identical chain, block for block.
    let central_hashes = central_chain.block_hashes().unwrap();
    let joiner_hashes = joiner_chain.block_hashes().unwrap();
    assert_eq!(joiner_hashes, central_hashes);
}
