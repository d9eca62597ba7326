//! JSON-RPC over HTTP for the node.
//!
//! One POST endpoint; requests are `{method, params}` and replies are
//! `{data, error}`. Identifiers travel as hex strings.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::consensus::graph::FinalRound;
use crate::constants;
use crate::node::core::NodeShared;
use crate::snapshot::SnapshotWithTopologicalOrder;
use crate::transaction::{UtxoWithLock, VersionedTransaction};
use crate::Hash;

/// A JSON-RPC request body.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// A JSON-RPC response body.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub data: Value,
    pub error: Option<String>,
}

/// Build the RPC router.
pub fn router(shared: Arc<NodeShared>) -> Router {
    Router::new()
        .route("/", post(handle))
        .with_state(shared)
}

/// Serve the RPC endpoint until the process exits.
pub async fn serve(addr: SocketAddr, shared: Arc<NodeShared>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "RPC listening");
    axum::serve(listener, router(shared)).await
}

async fn handle(
    State(shared): State<Arc<NodeShared>>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    let result = dispatch(&shared, &request);
    Json(match result {
        Ok(data) => RpcResponse { data, error: None },
        Err(error) => RpcResponse {
            data: Value::Null,
            error: Some(error),
        },
    })
}

fn dispatch(shared: &NodeShared, request: &RpcRequest) -> Result<Value, String> {
    let params = &request.params;
    match request.method.as_str() {
        "sendrawtransaction" => send_raw_transaction(shared, params),
        "getinfo" => get_info(shared),
        "getsnapshot" => {
            let hash = param_hash(params, 0)?;
            let snapshot = shared
                .store
                .read_snapshot(hash)
                .map_err(|e| e.to_string())?
                .ok_or("snapshot not found")?;
            Ok(snapshot_view(&snapshot))
        }
        "gettransaction" => {
            let hash = param_hash(params, 0)?;
            let (tx, finalized) = shared
                .store
                .read_transaction(hash)
                .map_err(|e| e.to_string())?
                .ok_or("transaction not found")?;
            Ok(transaction_view(&tx, finalized))
        }
        "getutxo" => {
            let hash = param_hash(params, 0)?;
            let index = param_u64(params, 1)? as usize;
            let utxo = shared
                .store
                .read_utxo(hash, index)
                .map_err(|e| e.to_string())?
                .ok_or("utxo not found")?;
            Ok(utxo_view(&utxo))
        }
        "listsnapshots" => {
            let offset = param_u64(params, 0)?;
            let count = param_u64(params, 1)?.min(500) as usize;
            let snapshots = shared
                .store
                .read_snapshots_since_topology(offset, count)
                .map_err(|e| e.to_string())?;
            Ok(Value::Array(snapshots.iter().map(snapshot_view).collect()))
        }
        "listmintdistributions" => {
            let offset = param_u64(params, 0)?;
            let count = param_u64(params, 1)?.min(500) as usize;
            let mints = shared
                .store
                .read_mint_distributions(constants::MINT_GROUP_KERNEL, offset, count)
                .map_err(|e| e.to_string())?;
            Ok(Value::Array(
                mints
                    .iter()
                    .map(|m| {
                        json!({
                            "group": m.group,
                            "batch": m.batch,
                            "amount": m.amount,
                            "transaction": m.transaction.to_string(),
                        })
                    })
                    .collect(),
            ))
        }
        "getroundbynumber" => {
            let node = param_hash(params, 0)?;
            let number = param_u64(params, 1)?;
            let round = shared
                .store
                .read_round_by_number(node, number)
                .map_err(|e| e.to_string())?
                .ok_or("round not found")?;
            Ok(round_view(&round))
        }
        "getroundbyhash" => {
            let hash = param_hash(params, 0)?;
            let round = shared
                .store
                .read_round_by_hash(hash)
                .map_err(|e| e.to_string())?
                .ok_or("round not found")?;
            Ok(round_view(&round))
        }
        "getroundlink" => {
            let from = param_hash(params, 0)?;
            let to = param_hash(params, 1)?;
            let link = shared
                .store
                .read_round_link(from, to)
                .map_err(|e| e.to_string())?;
            Ok(json!({
                "from": from.to_string(),
                "to": to.to_string(),
                "link": link,
            }))
        }
        other => Err(format!("unknown method {other}")),
    }
}

fn send_raw_transaction(shared: &NodeShared, params: &[Value]) -> Result<Value, String> {
    let raw = params
        .first()
        .and_then(Value::as_str)
        .ok_or("params[0] must be a hex transaction")?;
    let bytes = hex::decode(raw).map_err(|e| e.to_string())?;
    let tx = VersionedTransaction::unmarshal(&bytes).map_err(|e| e.to_string())?;
    tx.validate_basic().map_err(|e| e.to_string())?;
    shared
        .store
        .cache_put_transaction(&tx)
        .map_err(|e| e.to_string())?;
    Ok(json!({ "hash": tx.payload_hash().to_string() }))
}

fn get_info(shared: &NodeShared) -> Result<Value, String> {
    let membership = shared.membership();
    Ok(json!({
        "network": shared.network_id.to_string(),
        "node": shared.my_id.to_string(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": format!("{:?}", shared.uptime()),
        "topology": shared.store.topology_sequence(),
        "consensus": {
            "accepted": membership.sorted_consensus_nodes.len(),
            "active": membership.active_nodes.len(),
            "pledging": membership.consensus_pledging.is_some(),
            "index": membership.consensus_index,
        },
        "syncpoints": shared.sync_points.len(),
    }))
}

fn param_hash(params: &[Value], index: usize) -> Result<Hash, String> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or(format!("params[{index}] must be a hash"))?
        .parse()
        .map_err(|_| format!("params[{index}] is not a valid hash"))
}

fn param_u64(params: &[Value], index: usize) -> Result<u64, String> {
    let value = params
        .get(index)
        .ok_or(format!("params[{index}] must be a number"))?;
    match value {
        Value::Number(n) => n.as_u64().ok_or(format!("params[{index}] out of range")),
        Value::String(s) => s
            .parse()
            .map_err(|_| format!("params[{index}] is not a number")),
        _ => Err(format!("params[{index}] must be a number")),
    }
}

pub fn snapshot_view(snapshot: &SnapshotWithTopologicalOrder) -> Value {
    let s = &snapshot.snapshot;
    json!({
        "hash": s.payload_hash().to_string(),
        "node": s.node_id.to_string(),
        "round": s.round_number,
        "references": {
            "self": s.references.self_.to_string(),
            "external": s.references.external.to_string(),
        },
        "transaction": s.transaction.to_string(),
        "timestamp": s.timestamp,
        "signature": s.signature.map(|c| json!({
            "signature": hex::encode(c.signature.to_bytes()),
            "mask": c.mask,
            "signers": c.signers(),
        })),
        "topology": snapshot.topological_order,
    })
}

pub fn transaction_view(tx: &VersionedTransaction, finalized: bool) -> Value {
    json!({
        "version": tx.version,
        "asset": tx.asset.to_string(),
        "hash": tx.payload_hash().to_string(),
        "type": format!("{:?}", tx.transaction_type()),
        "inputs": tx.inputs.iter().map(|i| json!({
            "hash": i.hash.to_string(),
            "index": i.index,
            "genesis": hex::encode(&i.genesis),
            "mint": i.mint.as_ref().map(|m| json!({
                "group": m.group,
                "batch": m.batch,
                "amount": m.amount,
            })),
        })).collect::<Vec<_>>(),
        "outputs": tx.outputs.iter().map(|o| json!({
            "type": o.output_type,
            "amount": o.amount,
            "keys": o.keys.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            "script": hex::encode(&o.script.0),
            "mask": o.mask.to_string(),
        })).collect::<Vec<_>>(),
        "extra": hex::encode(&tx.extra),
        "finalized": finalized,
    })
}

pub fn utxo_view(utxo: &UtxoWithLock) -> Value {
    json!({
        "hash": utxo.utxo.hash.to_string(),
        "index": utxo.utxo.index,
        "amount": utxo.utxo.output.amount,
        "type": utxo.utxo.output.output_type,
        "keys": utxo.utxo.output.keys.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        "lock": utxo.lock.map(|h| h.to_string()),
    })
}

pub fn round_view(round: &FinalRound) -> Value {
    json!({
        "node": round.node_id.to_string(),
        "number": round.number,
        "start": round.start,
        "end": round.end,
        "hash": round.hash.to_string(),
        "references": {
            "self": round.references.self_.to_string(),
            "external": round.references.external.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::core::tests::testnet_dir;
    use crate::node::core::Node;

    fn test_shared() -> Arc<NodeShared> {
        let dir = testnet_dir(2, 0, "127.0.0.1:7311");
        Node::setup(dir.path()).unwrap().shared
    }

    fn call(shared: &Arc<NodeShared>, method: &str, params: Vec<Value>) -> Result<Value, String> {
        dispatch(
            shared,
            &RpcRequest {
                method: method.into(),
                params,
            },
        )
    }

    #[test]
    fn getinfo_reports_consensus() {
        let shared = test_shared();
        let info = call(&shared, "getinfo", vec![]).unwrap();
        assert_eq!(info["consensus"]["accepted"], 2);
        assert_eq!(info["topology"], 2);
        assert_eq!(info["network"], shared.network_id.to_string());
    }

    #[test]
    fn snapshot_and_transaction_lookup() {
        let shared = test_shared();
        let listed = call(&shared, "listsnapshots", vec![json!(0), json!(10)]).unwrap();
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["topology"], 0);

        let hash = listed[0]["hash"].as_str().unwrap().to_string();
        let snapshot = call(&shared, "getsnapshot", vec![json!(hash)]).unwrap();
        assert_eq!(snapshot["round"], 0);

        let tx_hash = snapshot["transaction"].as_str().unwrap().to_string();
        let tx = call(&shared, "gettransaction", vec![json!(tx_hash.clone())]).unwrap();
        assert_eq!(tx["finalized"], true);

        let utxo = call(&shared, "getutxo", vec![json!(tx_hash), json!(0)]).unwrap();
        assert_eq!(utxo["lock"], Value::Null);
    }

    #[test]
    fn sendrawtransaction_caches() {
        let shared = test_shared();
        let genesis_tx = shared.genesis.node_transaction(0);
        let mut spend = VersionedTransaction::new(shared.network_id);
        spend
            .inputs
            .push(crate::transaction::Input::reference(
                genesis_tx.payload_hash(),
                0,
            ));
        spend.outputs.push(genesis_tx.outputs[0].clone());
        let raw = hex::encode(spend.marshal());

        let reply = call(&shared, "sendrawtransaction", vec![json!(raw)]).unwrap();
        assert_eq!(reply["hash"], spend.payload_hash().to_string());
        assert!(shared
            .store
            .cache_get_transaction(spend.payload_hash())
            .unwrap()
            .is_some());
    }

    #[test]
    fn rounds_and_links() {
        let shared = test_shared();
        let node = shared.my_id;
        let round = call(
            &shared,
            "getroundbynumber",
            vec![json!(node.to_string()), json!(0)],
        )
        .unwrap();
        assert_eq!(round["number"], 0);

        let link = call(
            &shared,
            "getroundlink",
            vec![json!(node.to_string()), json!(Hash::new(b"o").to_string())],
        )
        .unwrap();
        assert_eq!(link["link"], 0);
    }

    #[test]
    fn unknown_method_and_bad_params() {
        let shared = test_shared();
        assert!(call(&shared, "nope", vec![]).is_err());
        assert!(call(&shared, "getsnapshot", vec![]).is_err());
        assert!(call(&shared, "getsnapshot", vec![json!("zz")]).is_err());
    }
}
