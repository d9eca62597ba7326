//! The meridian node daemon and operator CLI.
//!
//! `meridian kernel` runs a consensus node; the remaining commands are
//! offline key and transaction tools, direct store maintenance, and thin
//! JSON-RPC wrappers. Exit code is zero on success and nonzero on any
//! surfaced error.

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

use meridian::address::Address;
use meridian::constants;
use meridian::crypto::keys::derive_ghost_public_key;
use meridian::crypto::Key;
use meridian::genesis::{Genesis, GenesisNode};
use meridian::node::rpc;
use meridian::node::{Node, SledStore};
use meridian::transaction::{
    parse_pledge_extra, Input, Output, Script, VersionedTransaction, OUTPUT_TYPE_NODE_CANCEL,
};
use meridian::Hash;

#[derive(Parser, Debug)]
#[command(name = "meridian", version, about = "BFT round-graph ledger node")]
struct Cli {
    /// JSON-RPC endpoint for client commands.
    #[arg(long, default_value = "http://127.0.0.1:7240", global = true)]
    rpc: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a consensus node.
    Kernel {
        /// State directory holding config.json, genesis.json, nodes.json.
        #[arg(long, short)]
        dir: PathBuf,
        /// Bind address for the JSON-RPC endpoint.
        #[arg(long, default_value = "127.0.0.1:7240")]
        rpc_listen: String,
    },

    /// Generate a new address.
    Createaddress {
        /// Override the private view key (hex).
        #[arg(long)]
        view: Option<String>,
        /// Override the private spend key (hex).
        #[arg(long)]
        spend: Option<String>,
        /// Derive the view key from the spend key (public mode).
        #[arg(long)]
        public: bool,
    },

    /// Decode an address string.
    Decodeaddress {
        #[arg(long)]
        address: String,
    },

    /// Decode the pledge keys of a pledge or admission transaction.
    Decodepledge {
        /// Hex-encoded transaction.
        #[arg(long)]
        transaction: String,
    },

    /// Build and sign a raw JSON transaction.
    Signtransaction {
        /// Hex private spend key used for every input.
        #[arg(long)]
        key: String,
        /// The raw transaction JSON.
        #[arg(long)]
        raw: String,
    },

    /// Decode a hex transaction to JSON.
    Decodetransaction {
        #[arg(long)]
        transaction: String,
    },

    /// Build a signed node-cancellation for a pledge transaction.
    Canceltransaction {
        /// Hex-encoded pledge transaction.
        #[arg(long)]
        pledge: String,
        /// Hex private spend key of the pledge owner.
        #[arg(long)]
        key: String,
        /// Address receiving the refund.
        #[arg(long)]
        receiver: String,
    },

    /// Submit a signed hex transaction over RPC.
    Sendtransaction {
        #[arg(long)]
        transaction: String,
    },

    /// Replace the external reference of an empty head round.
    Updateheadreference {
        #[arg(long, short)]
        dir: PathBuf,
        #[arg(long)]
        node: String,
        #[arg(long)]
        round: u64,
        #[arg(long)]
        external: String,
    },

    /// Remove graph entries under a node id hex prefix.
    Removegraphentries {
        #[arg(long, short)]
        dir: PathBuf,
        #[arg(long)]
        prefix: String,
    },

    /// Recompute and check every graph entry.
    Validategraphentries {
        #[arg(long, short)]
        dir: PathBuf,
    },

    /// Read the forward round link between two nodes.
    Getroundlink {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },

    /// Read a node's round by number.
    Getroundbynumber {
        #[arg(long)]
        node: String,
        #[arg(long)]
        number: u64,
    },

    /// Read a round by its hash.
    Getroundbyhash {
        #[arg(long)]
        hash: String,
    },

    /// List finalized snapshots from a topology offset.
    Listsnapshots {
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long, default_value_t = 10)]
        count: u64,
    },

    /// Read a finalized snapshot by hash.
    Getsnapshot {
        #[arg(long)]
        hash: String,
    },

    /// Read a transaction by hash.
    Gettransaction {
        #[arg(long)]
        hash: String,
    },

    /// Read a UTXO with its lock state.
    Getutxo {
        #[arg(long)]
        hash: String,
        #[arg(long, default_value_t = 0)]
        index: u64,
    },

    /// List finalized kernel mint distributions.
    Listmintdistributions {
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long, default_value_t = 10)]
        count: u64,
    },

    /// Node and consensus summary.
    Getinfo,

    /// Write config, genesis, and peer lists for a local testnet.
    Setuptestnet {
        #[arg(long, short)]
        dir: PathBuf,
        #[arg(long, default_value_t = 4)]
        nodes: u8,
        #[arg(long, default_value_t = 7301)]
        port: u16,
    },
}

/// The raw transaction format `signtransaction` consumes. Hashes travel
/// as hex strings.
#[derive(Debug, Deserialize)]
struct RawTransaction {
    asset: String,
    inputs: Vec<RawInput>,
    outputs: Vec<RawOutput>,
    #[serde(default)]
    extra: String,
}

#[derive(Debug, Deserialize)]
struct RawInput {
    hash: String,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(rename = "type", default)]
    output_type: u8,
    amount: u64,
    accounts: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Kernel { dir, rpc_listen } => run_kernel(dir, rpc_listen).await,
        Command::Createaddress {
            view,
            spend,
            public,
        } => create_address(view, spend, public),
        Command::Decodeaddress { address } => {
            let addr = Address::from_string(&address)?;
            println!("public view key:\t{}", addr.public_view_key);
            println!("public spend key:\t{}", addr.public_spend_key);
            println!(
                "spend derive private:\t{}",
                addr.public_spend_key.deterministic_hash_derive()
            );
            println!(
                "spend derive public:\t{}",
                addr.public_spend_key.deterministic_hash_derive().public()
            );
            Ok(())
        }
        Command::Decodepledge { transaction } => {
            let tx = VersionedTransaction::unmarshal(&hex::decode(transaction)?)?;
            let (signer, payee) =
                parse_pledge_extra(&tx.extra).ok_or("transaction carries no pledge extra")?;
            println!("signer:\t{}", Address::from_public_spend(signer));
            println!("payee:\t{}", Address::from_public_spend(payee));
            Ok(())
        }
        Command::Signtransaction { key, raw } => sign_transaction(key, raw),
        Command::Decodetransaction { transaction } => {
            let tx = VersionedTransaction::unmarshal(&hex::decode(transaction)?)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&rpc::transaction_view(&tx, false))?
            );
            Ok(())
        }
        Command::Canceltransaction {
            pledge,
            key,
            receiver,
        } => cancel_transaction(pledge, key, receiver),
        Command::Sendtransaction { transaction } => {
            let data = call_rpc(&cli.rpc, "sendrawtransaction", vec![json!(transaction)]).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
        Command::Updateheadreference {
            dir,
            node,
            round,
            external,
        } => {
            let store = SledStore::open(&dir.join("store"))?;
            let node: Hash = node.parse()?;
            let head = store.read_round(node)?.ok_or("node not found")?;
            println!(
                "node: {} round: {} self: {} external: {}",
                head.node_id, head.number, head.references.self_, head.references.external
            );
            if head.number != round {
                return Err(format!("round number not match {}", head.number).into());
            }
            let mut references = head.references;
            references.external = external.parse()?;
            store.update_empty_head_round(node, round, references)?;
            Ok(())
        }
        Command::Removegraphentries { dir, prefix } => {
            let store = SledStore::open(&dir.join("store"))?;
            let removed = store.remove_graph_entries(&prefix)?;
            println!("removed entries: {removed}");
            Ok(())
        }
        Command::Validategraphentries { dir } => {
            let store = SledStore::open(&dir.join("store"))?;
            let network: Hash = store
                .state_get("network")?
                .ok_or("store has no network state")?;
            let (total, invalid) = store.validate_graph_entries(network)?;
            println!("invalid entries: {invalid}/{total}");
            Ok(())
        }
        Command::Getroundlink { from, to } => {
            print_rpc(&cli.rpc, "getroundlink", vec![json!(from), json!(to)]).await
        }
        Command::Getroundbynumber { node, number } => {
            print_rpc(&cli.rpc, "getroundbynumber", vec![json!(node), json!(number)]).await
        }
        Command::Getroundbyhash { hash } => {
            print_rpc(&cli.rpc, "getroundbyhash", vec![json!(hash)]).await
        }
        Command::Listsnapshots { since, count } => {
            print_rpc(&cli.rpc, "listsnapshots", vec![json!(since), json!(count)]).await
        }
        Command::Getsnapshot { hash } => {
            print_rpc(&cli.rpc, "getsnapshot", vec![json!(hash)]).await
        }
        Command::Gettransaction { hash } => {
            print_rpc(&cli.rpc, "gettransaction", vec![json!(hash)]).await
        }
        Command::Getutxo { hash, index } => {
            print_rpc(&cli.rpc, "getutxo", vec![json!(hash), json!(index)]).await
        }
        Command::Listmintdistributions { since, count } => {
            print_rpc(
                &cli.rpc,
                "listmintdistributions",
                vec![json!(since), json!(count)],
            )
            .await
        }
        Command::Getinfo => print_rpc(&cli.rpc, "getinfo", vec![]).await,
        Command::Setuptestnet { dir, nodes, port } => setup_testnet(dir, nodes, port),
    }
}

async fn run_kernel(dir: PathBuf, rpc_listen: String) -> Result<(), Box<dyn Error>> {
    let node = Node::setup(&dir)?;
    let shared = node.shared.clone();

    let rpc_addr: std::net::SocketAddr = rpc_listen.parse()?;
    tokio::spawn(rpc::serve(rpc_addr, shared));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    node.run(&dir, cancel).await?;
    Ok(())
}

fn create_address(
    view: Option<String>,
    spend: Option<String>,
    public: bool,
) -> Result<(), Box<dyn Error>> {
    let mut seed = [0u8; 64];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let mut addr = Address::from_seed(&seed);
    seed.zeroize();

    if let Some(view) = view {
        addr.private_view_key = view.parse()?;
        addr.public_view_key = addr.private_view_key.public();
    }
    if let Some(spend) = spend {
        addr.private_spend_key = spend.parse()?;
        addr.public_spend_key = addr.private_spend_key.public();
    }
    if public {
        addr.derive_public_view();
    }
    println!("address:\t{addr}");
    println!("view key:\t{}", addr.private_view_key);
    println!("spend key:\t{}", addr.private_spend_key);
    Ok(())
}

/// Build the outputs of a raw transaction: each payee gets a one-time
/// ghost key under a fresh mask.
fn build_raw_transaction(raw: &RawTransaction) -> Result<VersionedTransaction, Box<dyn Error>> {
    let asset: Hash = raw.asset.parse()?;
    let mut tx = VersionedTransaction::new(asset);
    for input in &raw.inputs {
        tx.inputs.push(Input::reference(input.hash.parse()?, input.index));
    }
    for output in &raw.outputs {
        let mask = Key::random();
        let mut keys = Vec::with_capacity(output.accounts.len());
        for account in &output.accounts {
            let addr = Address::from_string(account)?;
            keys.push(derive_ghost_public_key(
                &mask,
                &addr.public_view_key,
                &addr.public_spend_key,
            )?);
        }
        tx.outputs.push(Output {
            output_type: output.output_type,
            amount: output.amount,
            keys,
            script: Script::operator(1),
            mask: mask.public(),
        });
    }
    if !raw.extra.is_empty() {
        tx.extra = hex::decode(&raw.extra)?;
    }
    Ok(tx)
}

fn sign_transaction(key: String, raw: String) -> Result<(), Box<dyn Error>> {
    let signer: Key = key.parse()?;
    let raw: RawTransaction = serde_json::from_str(&raw)?;
    let mut tx = build_raw_transaction(&raw)?;
    tx.validate_basic()?;
    tx.sign(&[signer]);
    println!("{}", hex::encode(tx.marshal()));
    Ok(())
}

fn cancel_transaction(
    pledge: String,
    key: String,
    receiver: String,
) -> Result<(), Box<dyn Error>> {
    let pledge_tx = VersionedTransaction::unmarshal(&hex::decode(pledge)?)?;
    let signer: Key = key.parse()?;
    let receiver = Address::from_string(&receiver)?;
    let (pledge_signer, _) =
        parse_pledge_extra(&pledge_tx.extra).ok_or("transaction carries no pledge extra")?;
    if pledge_signer != signer.public() {
        return Err("key does not own this pledge".into());
    }

    let mut tx = VersionedTransaction::new(pledge_tx.asset);
    tx.inputs.push(Input::reference(pledge_tx.payload_hash(), 0));
    let mask = Key::random();
    let ghost = derive_ghost_public_key(
        &mask,
        &receiver.public_view_key,
        &receiver.public_spend_key,
    )?;
    tx.outputs.push(Output {
        output_type: OUTPUT_TYPE_NODE_CANCEL,
        // 1% of the pledge stays slashed.
        amount: constants::PLEDGE_AMOUNT - constants::PLEDGE_AMOUNT / 100,
        keys: vec![ghost],
        script: Script::operator(1),
        mask: mask.public(),
    });
    tx.extra = pledge_tx.extra.clone();
    tx.sign(&[signer]);
    println!("{}", hex::encode(tx.marshal()));
    Ok(())
}

fn setup_testnet(dir: PathBuf, nodes: u8, port: u16) -> Result<(), Box<dyn Error>> {
    let mut members = Vec::new();
    for _ in 0..nodes {
        let mut seed = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let mut addr = Address::from_seed(&seed);
        seed.zeroize();
        addr.derive_public_view();
        members.push(addr);
    }

    let genesis = Genesis {
        epoch: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_secs(),
        nodes: members
            .iter()
            .map(|addr| GenesisNode {
                signer: *addr,
                payee: *addr,
                balance: constants::PLEDGE_AMOUNT,
            })
            .collect(),
        domains: vec![],
    };
    let genesis_json = serde_json::to_string_pretty(&genesis)?;

    let peers: Vec<Value> = members
        .iter()
        .enumerate()
        .map(|(i, addr)| {
            json!({
                "signer": addr.to_string(),
                "host": format!("127.0.0.1:{}", port + i as u16),
            })
        })
        .collect();
    let peers_json = serde_json::to_string_pretty(&peers)?;

    for (i, addr) in members.iter().enumerate() {
        let node_dir = dir.join(format!("node{i}"));
        std::fs::create_dir_all(&node_dir)?;
        std::fs::write(node_dir.join("genesis.json"), &genesis_json)?;
        std::fs::write(node_dir.join("nodes.json"), &peers_json)?;
        let config = json!({
            "signer": addr.private_spend_key.to_string(),
            "listener": format!("127.0.0.1:{}", port + i as u16),
            "cache-ttl": constants::DEFAULT_CACHE_TTL_SECS,
            "max-cache-size": constants::DEFAULT_MAX_CACHE_SIZE_MB,
        });
        std::fs::write(
            node_dir.join("config.json"),
            serde_json::to_string_pretty(&config)?,
        )?;
        println!(
            "node{i}: {} @ 127.0.0.1:{}",
            addr,
            port + i as u16
        );
    }
    println!("network: {}", genesis.network_id());
    Ok(())
}

async fn call_rpc(rpc: &str, method: &str, params: Vec<Value>) -> Result<Value, Box<dyn Error>> {
    let client = reqwest::Client::new();
    let reply: Value = client
        .post(rpc)
        .json(&json!({ "method": method, "params": params }))
        .send()
        .await?
        .json()
        .await?;
    if let Some(error) = reply["error"].as_str() {
        return Err(error.into());
    }
    Ok(reply["data"].clone())
}

async fn print_rpc(rpc: &str, method: &str, params: Vec<Value>) -> Result<(), Box<dyn Error>> {
    let data = call_rpc(rpc, method, params).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}
