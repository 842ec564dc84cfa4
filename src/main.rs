//! Node driver: the command-line surface over the library.

use clap::{Parser, Subcommand};
use log::error;
use std::env;
use std::process;
use tinycoin::blockchain::Blockchain;
use tinycoin::constants::CENTRAL_NODE;
use tinycoin::error::{NodeError, Result};
use tinycoin::pow::ProofOfWork;
use tinycoin::server::{self, Server};
use tinycoin::transaction::Transaction;
use tinycoin::utxo::UtxoIndex;
use tinycoin::wallet::{self, Wallets};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "tinycoin", about = "A minimal proof-of-work cryptocurrency node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a blockchain and send the genesis reward to ADDRESS
    Createblockchain {
        #[arg(long)]
        address: String,
    },
    /// Generate a new key pair and save it into the wallet file
    Createwallet,
    /// Get the balance of ADDRESS
    Getbalance {
        #[arg(long)]
        address: String,
    },
    /// List all addresses from the wallet file
    Listaddresses,
    /// Print all the blocks of the blockchain
    Printchain,
    /// Rebuild the unspent-output index
    Reindexutxo,
    /// Send AMOUNT of coins from FROM to TO; with --mine, mine on this node
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: i64,
        #[arg(long)]
        mine: bool,
    },
    /// Start a node; with --miner, mine blocks rewarded to ADDRESS
    Startnode {
        #[arg(long)]
        miner: Option<String>,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let node_id = match env::var("NODE_ID") {
        Ok(id) if !id.is_empty() => id,
        _ => {
            eprintln!("NODE_ID environment variable is not set");
            process::exit(1);
        }
    };

    if let Err(e) = run(cli.command, &node_id) {
        error!("{}", e);
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run(command: Command, node_id: &str) -> Result<()> {
    match command {
        Command::Createblockchain { address } => create_blockchain(&address, node_id),
        Command::Createwallet => create_wallet(node_id),
        Command::Getbalance { address } => get_balance(&address, node_id),
        Command::Listaddresses => list_addresses(node_id),
        Command::Printchain => print_chain(node_id),
        Command::Reindexutxo => reindex_utxo(node_id),
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => send(&from, &to, amount, node_id, mine),
        Command::Startnode { miner } => start_node(node_id, miner),
    }
}

fn create_blockchain(address: &str, node_id: &str) -> Result<()> {
    if !wallet::validate_address(address) {
        return Err(NodeError::InvalidAddress(address.to_string()));
    }

    let chain = Blockchain::create(address, node_id)?;
    UtxoIndex::new(&chain).reindex()?;

    println!("Done! A new blockchain has been created.");
    Ok(())
}

fn create_wallet(node_id: &str) -> Result<()> {
    let mut wallets = Wallets::load(node_id)?;
    let address = wallets.create_wallet()?;

    println!("Your new address: {}", address);
    Ok(())
}

fn get_balance(address: &str, node_id: &str) -> Result<()> {
    if !wallet::validate_address(address) {
        return Err(NodeError::InvalidAddress(address.to_string()));
    }

    let chain = Blockchain::open(node_id)?;
    let pub_key_hash = wallet::pub_key_hash_from_address(address)?;

    let balance: i64 = UtxoIndex::new(&chain)
        .find_utxo(&pub_key_hash)?
        .iter()
        .map(|out| out.value)
        .sum();

    println!("Balance of '{}': {}", address, balance);
    Ok(())
}

fn list_addresses(node_id: &str) -> Result<()> {
    let wallets = Wallets::load(node_id)?;
    for address in wallets.addresses() {
        println!("{}", address);
    }
    Ok(())
}

fn print_chain(node_id: &str) -> Result<()> {
    let chain = Blockchain::open(node_id)?;

    for block in chain.iter()? {
        let block = block?;

        println!("============ Block {} ============", hex::encode(block.hash));
        println!("Height:     {}", block.height);
        println!("Prev. hash: {}", hex::encode(block.prev_block_hash));
        println!("PoW:        {}", ProofOfWork::new(&block).validate()?);
        for tx in &block.transactions {
            println!("{}", tx);
        }
        println!();
    }
    Ok(())
}

fn reindex_utxo(node_id: &str) -> Result<()> {
    let chain = Blockchain::open(node_id)?;
    let utxo = UtxoIndex::new(&chain);
    utxo.reindex()?;

    let count = utxo.count_transactions()?;
    println!(
        "Done! There are {} transactions in the UTXO set.",
        count
    );
    Ok(())
}

fn send(from: &str, to: &str, amount: i64, node_id: &str, mine_now: bool) -> Result<()> {
    if !wallet::validate_address(from) {
        return Err(NodeError::InvalidAddress(from.to_string()));
    }
    if !wallet::validate_address(to) {
        return Err(NodeError::InvalidAddress(to.to_string()));
    }

    let chain = Blockchain::open(node_id)?;
    let utxo = UtxoIndex::new(&chain);

    let wallets = Wallets::load(node_id)?;
    let sender = wallets
        .get_wallet(from)
        .ok_or_else(|| NodeError::InvalidAddress(format!("no wallet for {}", from)))?;

    let tx = Transaction::new_utxo(sender, to, amount, &utxo)?;

    if mine_now {
        let coinbase = Transaction::new_coinbase(from, None)?;
        chain.mine_block(vec![coinbase, tx])?;
    } else {
        server::send_tx(CENTRAL_NODE, &format!("localhost:{}", node_id), &tx)?;
    }

    println!("Success!");
    Ok(())
}

fn start_node(node_id: &str, miner: Option<String>) -> Result<()> {
    println!("Starting node {}", node_id);

    if let Some(ref miner_address) = miner {
        if !wallet::validate_address(miner_address) {
            return Err(NodeError::InvalidAddress(miner_address.clone()));
        }
        println!("Mining is on. Address to receive rewards: {}", miner_address);
    }

    let chain = Blockchain::open(node_id)?;
    Server::new(node_id, miner, chain).run()
}
