//! Peer server: wire protocol, sync handlers, mempool, and the mining
//! trigger
//!
//! Every TCP connection carries exactly one message and is closed after
//! handling. A message is a 12-byte ASCII command name (right-padded with
//! zeros) followed by the bincode payload of that command's record. The
//! accept loop dispatches each inbound connection to its own thread.

use crate::block::Block;
use crate::blockchain::Blockchain;
use crate::constants::{CENTRAL_NODE, COMMAND_LEN, MIN_MEMPOOL_TXS, NODE_VERSION};
use crate::error::{NodeError, Result};
use crate::transaction::Transaction;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

/// What an `inv` or `getdata` message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

impl fmt::Display for InvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvKind::Block => write!(f, "block"),
            InvKind::Tx => write!(f, "tx"),
        }
    }
}

/// Announce the local chain height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    pub best_height: u64,
    pub addr_from: String,
}

/// Ask a peer for its list of block hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

/// Advertise known items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub items: Vec<Vec<u8>>,
}

/// Request one item by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub id: Vec<u8>,
}

/// Deliver one serialized block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Vec<u8>,
}

/// Deliver one serialized transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

/// Peer address gossip. Reserved; parsed and folded into the peer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addr_list: Vec<String>,
}

/// One wire message: the command-tagged union of all payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    GetBlocks(GetBlocksPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
    Addr(AddrPayload),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::GetBlocks(_) => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Addr(_) => "addr",
        }
    }

    /// Frame the message: padded command name, then the payload record.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Version(p) => bincode::serialize(p)?,
            Message::GetBlocks(p) => bincode::serialize(p)?,
            Message::Inv(p) => bincode::serialize(p)?,
            Message::GetData(p) => bincode::serialize(p)?,
            Message::Block(p) => bincode::serialize(p)?,
            Message::Tx(p) => bincode::serialize(p)?,
            Message::Addr(p) => bincode::serialize(p)?,
        };

        let mut bytes = command_to_bytes(self.command()).to_vec();
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Message> {
        if data.len() < COMMAND_LEN {
            return Err(NodeError::ProtocolParse(format!(
                "frame of {} bytes is shorter than the command field",
                data.len()
            )));
        }

        let command = bytes_to_command(&data[..COMMAND_LEN])?;
        let payload = &data[COMMAND_LEN..];

        match command.as_str() {
            "version" => Ok(Message::Version(decode_payload(command.as_str(), payload)?)),
            "getblocks" => Ok(Message::GetBlocks(decode_payload(command.as_str(), payload)?)),
            "inv" => Ok(Message::Inv(decode_payload(command.as_str(), payload)?)),
            "getdata" => Ok(Message::GetData(decode_payload(command.as_str(), payload)?)),
            "block" => Ok(Message::Block(decode_payload(command.as_str(), payload)?)),
            "tx" => Ok(Message::Tx(decode_payload(command.as_str(), payload)?)),
            "addr" => Ok(Message::Addr(decode_payload(command.as_str(), payload)?)),
            other => Err(NodeError::ProtocolParse(format!(
                "unknown command {:?}",
                other
            ))),
        }
    }
}

fn decode_payload<'de, T: Deserialize<'de>>(command: &str, payload: &'de [u8]) -> Result<T> {
    bincode::deserialize(payload)
        .map_err(|e| NodeError::ProtocolParse(format!("{} payload: {}", command, e)))
}

fn command_to_bytes(command: &str) -> [u8; COMMAND_LEN] {
    debug_assert!(command.len() <= COMMAND_LEN && command.is_ascii());

    let mut bytes = [0u8; COMMAND_LEN];
    bytes[..command.len()].copy_from_slice(command.as_bytes());
    bytes
}

fn bytes_to_command(bytes: &[u8]) -> Result<String> {
    let name: Vec<u8> = bytes.iter().copied().take_while(|&b| b != 0x00).collect();
    if !name.is_ascii() {
        return Err(NodeError::ProtocolParse(
            "command name is not ASCII".to_string(),
        ));
    }
    String::from_utf8(name)
        .map_err(|_| NodeError::ProtocolParse("command name is not ASCII".to_string()))
}

/// Deliver one transaction to a node and close the connection. This is the
/// CLI's non-mining `send` path; the transaction enters the network at the
/// receiving node's mempool.
pub fn send_tx(addr: &str, addr_from: &str, tx: &Transaction) -> Result<()> {
    let message = Message::Tx(TxPayload {
        addr_from: addr_from.to_string(),
        transaction: tx.serialize()?,
    });

    let mut stream = TcpStream::connect(addr)
        .map_err(|e| NodeError::PeerUnreachable(format!("{}: {}", addr, e)))?;
    stream.write_all(&message.to_bytes()?)?;
    Ok(())
}

/// One peer: the listener plus all process-wide mutable protocol state.
pub struct Server {
    node_address: String,
    /// Empty means this node does not mine.
    miner_address: Option<String>,
    central_node: String,
    chain: Blockchain,
    known_nodes: Mutex<Vec<String>>,
    blocks_in_transit: Mutex<Vec<Vec<u8>>>,
    mempool: Mutex<HashMap<String, Transaction>>,
}

impl Server {
    pub fn new(node_id: &str, miner_address: Option<String>, chain: Blockchain) -> Server {
        Server::with_central(node_id, miner_address, chain, CENTRAL_NODE)
    }

    /// As `new`, with an explicit central peer (multi-node tests run on
    /// free loopback ports).
    pub fn with_central(
        node_id: &str,
        miner_address: Option<String>,
        chain: Blockchain,
        central_node: &str,
    ) -> Server {
        Server {
            node_address: format!("localhost:{}", node_id),
            miner_address,
            central_node: central_node.to_string(),
            chain,
            known_nodes: Mutex::new(vec![central_node.to_string()]),
            blocks_in_transit: Mutex::new(Vec::new()),
            mempool: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    /// Bind the listener and serve forever. A non-central node announces
    /// its version to the central peer first, which kicks off the initial
    /// block download.
    pub fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.node_address)?;
        info!("node listening on {}", self.node_address);

        let server = Arc::new(self);

        if server.node_address != server.central_node {
            let central = server.central_node.clone();
            server.send_version(&central)?;
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            warn!("connection handler failed: {}", e);
                        }
                    });
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }

        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut request = Vec::new();
        stream.read_to_end(&mut request)?;
        drop(stream);

        let message = Message::from_bytes(&request)?;
        debug!("received {} command", message.command());

        match message {
            Message::Version(payload) => self.handle_version(payload),
            Message::GetBlocks(payload) => self.handle_get_blocks(payload),
            Message::Inv(payload) => self.handle_inv(payload),
            Message::GetData(payload) => self.handle_get_data(payload),
            Message::Block(payload) => self.handle_block(payload),
            Message::Tx(payload) => self.handle_tx(payload),
            Message::Addr(payload) => self.handle_addr(payload),
        }
    }

    /// Compare heights: the shorter side asks for blocks, the taller side
    /// answers with its own version so the peer can start fetching.
    fn handle_version(&self, payload: VersionPayload) -> Result<()> {
        let my_height = self.local_best_height()?;
        debug!(
            "peer {} is at height {}, local height {}",
            payload.addr_from, payload.best_height, my_height
        );

        if my_height < payload.best_height {
            self.send_get_blocks(&payload.addr_from)?;
        } else if my_height > payload.best_height {
            self.send_version(&payload.addr_from)?;
        }

        let mut nodes = self.known_nodes.lock().unwrap();
        if !nodes.contains(&payload.addr_from) {
            nodes.push(payload.addr_from);
        }
        Ok(())
    }

    /// Answer with every local block hash, genesis first, so the peer
    /// downloads in increasing-height order.
    fn handle_get_blocks(&self, payload: GetBlocksPayload) -> Result<()> {
        let hashes = self.chain.block_hashes()?;
        self.send_inv(&payload.addr_from, InvKind::Block, hashes)
    }

    fn handle_inv(&self, payload: InvPayload) -> Result<()> {
        debug!(
            "received inventory with {} {}",
            payload.items.len(),
            payload.kind
        );

        match payload.kind {
            InvKind::Block => {
                if payload.items.is_empty() {
                    return Ok(());
                }

                let first = {
                    let mut transit = self.blocks_in_transit.lock().unwrap();
                    *transit = payload.items;
                    transit.remove(0)
                };
                self.send_get_data(&payload.addr_from, InvKind::Block, first)
            }
            InvKind::Tx => {
                let tx_id = match payload.items.first() {
                    Some(id) => id.clone(),
                    None => return Ok(()),
                };

                let in_mempool = self
                    .mempool
                    .lock()
                    .unwrap()
                    .contains_key(&hex::encode(&tx_id));
                if !in_mempool {
                    self.send_get_data(&payload.addr_from, InvKind::Tx, tx_id)?;
                }
                Ok(())
            }
        }
    }

    /// Serve one requested block or mempool transaction. An unknown block
    /// id is silently ignored.
    fn handle_get_data(&self, payload: GetDataPayload) -> Result<()> {
        match payload.kind {
            InvKind::Block => match self.chain.get_block(&payload.id) {
                Ok(block) => self.send_block(&payload.addr_from, &block),
                Err(NodeError::UnknownBlock(id)) => {
                    debug!("ignoring getdata for unknown block {}", id);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            InvKind::Tx => {
                let tx = self
                    .mempool
                    .lock()
                    .unwrap()
                    .get(&hex::encode(&payload.id))
                    .cloned();
                match tx {
                    Some(tx) => self.send_tx_message(&payload.addr_from, &tx),
                    None => {
                        debug!(
                            "ignoring getdata for unknown transaction {}",
                            hex::encode(&payload.id)
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// Apply a delivered block (the store folds the unspent-output delta
    /// into the same commit), then request the next block still in
    /// transit.
    fn handle_block(&self, payload: BlockPayload) -> Result<()> {
        let block = Block::deserialize(&payload.block)?;
        info!("received block {}", hex::encode(block.hash));

        self.chain.add_block(&block)?;

        let next = {
            let mut transit = self.blocks_in_transit.lock().unwrap();
            if transit.is_empty() {
                None
            } else {
                Some(transit.remove(0))
            }
        };
        if let Some(hash) = next {
            self.send_get_data(&payload.addr_from, InvKind::Block, hash)?;
        }
        Ok(())
    }

    /// Pool a delivered transaction. The central peer relays it to every
    /// other node; a mining peer starts packing blocks once the pool is
    /// big enough.
    fn handle_tx(&self, payload: TxPayload) -> Result<()> {
        let tx = Transaction::deserialize(&payload.transaction)?;
        info!("received transaction {}", hex::encode(&tx.id));

        self.mempool
            .lock()
            .unwrap()
            .insert(hex::encode(&tx.id), tx.clone());

        if self.node_address == self.central_node {
            let nodes = self.known_nodes.lock().unwrap().clone();
            for node in nodes {
                if node != self.node_address && node != payload.addr_from {
                    self.send_inv(&node, InvKind::Tx, vec![tx.id.clone()])?;
                }
            }
            return Ok(());
        }

        if let Some(miner_address) = self.miner_address.clone() {
            if self.mempool.lock().unwrap().len() >= MIN_MEMPOOL_TXS {
                self.mine_mempool(&miner_address)?;
            }
        }
        Ok(())
    }

    /// Reserved command: fold advertised peers into the known-node list.
    fn handle_addr(&self, payload: AddrPayload) -> Result<()> {
        let mut nodes = self.known_nodes.lock().unwrap();
        for addr in payload.addr_list {
            if !nodes.contains(&addr) {
                nodes.push(addr);
            }
        }
        info!("there are {} known nodes now", nodes.len());
        Ok(())
    }

    /// Drain the mempool into mined blocks: verify (dropping failures from
    /// the candidate list), add a coinbase to the miner, mine, announce,
    /// and repeat while transactions remain. Aborts when nothing in the
    /// pool verifies.
    fn mine_mempool(&self, miner_address: &str) -> Result<()> {
        loop {
            let candidates: Vec<Transaction> =
                self.mempool.lock().unwrap().values().cloned().collect();

            let mut txs = Vec::new();
            for tx in candidates {
                match self.chain.verify_transaction(&tx) {
                    Ok(true) => txs.push(tx),
                    Ok(false) => warn!(
                        "transaction {} failed verification",
                        hex::encode(&tx.id)
                    ),
                    Err(e) => warn!("transaction {} rejected: {}", hex::encode(&tx.id), e),
                }
            }

            if txs.is_empty() {
                warn!("no valid transactions in the mempool; waiting for more");
                return Ok(());
            }

            txs.push(Transaction::new_coinbase(miner_address, None)?);
            let new_block = self.chain.mine_block(txs.clone())?;
            info!("mined block {}", hex::encode(new_block.hash));

            {
                let mut mempool = self.mempool.lock().unwrap();
                for tx in &txs {
                    mempool.remove(&hex::encode(&tx.id));
                }
            }

            let nodes = self.known_nodes.lock().unwrap().clone();
            for node in nodes {
                if node != self.node_address {
                    self.send_inv(&node, InvKind::Block, vec![new_block.hash.to_vec()])?;
                }
            }

            if self.mempool.lock().unwrap().is_empty() {
                return Ok(());
            }
        }
    }

    /// Local chain height; a store with no blocks yet reports zero.
    fn local_best_height(&self) -> Result<u64> {
        match self.chain.best_height() {
            Ok(height) => Ok(height),
            Err(NodeError::ChainMissing) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Dial a peer and deliver one message. An unreachable peer is evicted
    /// from the known-node list and the send is dropped.
    fn send_data(&self, addr: &str, message: &Message) -> Result<()> {
        let data = message.to_bytes()?;

        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                stream.write_all(&data)?;
                Ok(())
            }
            Err(e) => {
                warn!("{} is not available, evicting: {}", addr, e);
                self.known_nodes.lock().unwrap().retain(|n| n != addr);
                Ok(())
            }
        }
    }

    fn send_version(&self, addr: &str) -> Result<()> {
        let payload = VersionPayload {
            version: NODE_VERSION,
            best_height: self.local_best_height()?,
            addr_from: self.node_address.clone(),
        };
        self.send_data(addr, &Message::Version(payload))
    }

    fn send_get_blocks(&self, addr: &str) -> Result<()> {
        let payload = GetBlocksPayload {
            addr_from: self.node_address.clone(),
        };
        self.send_data(addr, &Message::GetBlocks(payload))
    }

    fn send_inv(&self, addr: &str, kind: InvKind, items: Vec<Vec<u8>>) -> Result<()> {
        let payload = InvPayload {
            addr_from: self.node_address.clone(),
            kind,
            items,
        };
        self.send_data(addr, &Message::Inv(payload))
    }

    fn send_get_data(&self, addr: &str, kind: InvKind, id: Vec<u8>) -> Result<()> {
        let payload = GetDataPayload {
            addr_from: self.node_address.clone(),
            kind,
            id,
        };
        self.send_data(addr, &Message::GetData(payload))
    }

    fn send_block(&self, addr: &str, block: &Block) -> Result<()> {
        let payload = BlockPayload {
            addr_from: self.node_address.clone(),
            block: block.serialize()?,
        };
        self.send_data(addr, &Message::Block(payload))
    }

    fn send_tx_message(&self, addr: &str, tx: &Transaction) -> Result<()> {
        let payload = TxPayload {
            addr_from: self.node_address.clone(),
            transaction: tx.serialize()?,
        };
        self.send_data(addr, &Message::Tx(payload))
    }
}
