use std::collections::{BTreeMap, HashSet};
use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::*;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, timeout};

use crate::config::HTTP_BIND_ADDRESS;
use crate::consensus::grid::{Blockgrid, GridError};
use crate::consensus::pow;
use crate::crypto::hash::canonical_json;
use crate::crypto::rsa::{self, Keypair};
use crate::net::oracle::TrustOracle;
use crate::net::sync::ReconciliationClient;
use crate::node::assets;
use crate::node::store::PersistentStore;
use crate::primitives::cell::{GridIndex, grid_from_wire, grid_to_wire, now_ms};

pub struct ServerState {
    pub blockgrid: Arc<RwLock<Blockgrid>>,
    /// Process-wide guard for destructive entry rewrites
    pub edit_lock: Mutex<()>,
    pub store: PersistentStore,
    pub oracle: TrustOracle,
    pub server_keys: Keypair,
    pub resolver: ReconciliationClient,
    pub shutdown: AtomicBool,
}

enum Reply {
    Json(Value),
    Zip(Vec<u8>),
    Error(StatusCode, String),
}

fn bad_request(message: &str) -> Reply {
    Reply::Error(StatusCode::BAD_REQUEST, message.to_string())
}

fn internal_error() -> Reply {
    Reply::Error(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
}

fn grid_error_reply(e: GridError) -> Reply {
    match e {
        GridError::PreviousNotMined => bad_request("Previous block has not been mined"),
        GridError::AlreadyMined => bad_request("Block has already been mined"),
        GridError::InvalidProof => bad_request("Proof of work rejected"),
        GridError::Occupied(_) | GridError::UnknownIndex(_) => bad_request("Missing values"),
        GridError::Corrupt(_) | GridError::Store(_) => internal_error(),
    }
}

/// Parse a JSON `[x, y, z]` integer triple.
fn parse_index(value: &Value) -> Option<GridIndex> {
    let parts = value.as_array()?;
    if parts.len() != 3 {
        return None;
    }
    let mut index = [0i64; 3];
    for (slot, part) in index.iter_mut().zip(parts) {
        *slot = part.as_i64()?;
    }
    Some(GridIndex(index))
}

/// Parse a JSON `[x, y, z]` world position (floats allowed) into its cell.
fn parse_world_index(value: &Value) -> Option<GridIndex> {
    let parts = value.as_array()?;
    if parts.len() != 3 {
        return None;
    }
    let mut position = [0f64; 3];
    for (slot, part) in position.iter_mut().zip(parts) {
        *slot = part.as_f64()?;
    }
    Some(GridIndex::from_world(position))
}

// ---------------------------------------------------------------------------
// Multipart parsing
//
// The unsigned-transaction endpoint receives `multipart/form-data`: one JSON
// part plus zero or more attached bundles, keyed by their field names. Small
// enough to parse by hand against the boundary from the Content-Type header.

struct MultipartPart {
    name: String,
    filename: Option<String>,
    data: Vec<u8>,
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|piece| {
        let piece = piece.trim();
        piece
            .strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn disposition_param(headers: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=\"");
    let start = headers.find(&needle)? + needle.len();
    let end = headers[start..].find('"')? + start;
    Some(headers[start..end].to_string())
}

fn parse_multipart(body: &[u8], boundary: &str) -> Vec<MultipartPart> {
    let delim = format!("--{boundary}");
    let delim_bytes = delim.as_bytes();
    let mut parts = Vec::new();

    let mut at = match find_subsequence(body, delim_bytes, 0) {
        Some(p) => p + delim_bytes.len(),
        None => return parts,
    };

    loop {
        // "--" after the delimiter closes the stream
        if body[at..].starts_with(b"--") {
            break;
        }
        // Skip the CRLF after the delimiter
        if body[at..].starts_with(b"\r\n") {
            at += 2;
        }

        let Some(header_end) = find_subsequence(body, b"\r\n\r\n", at) else {
            break;
        };
        let headers = String::from_utf8_lossy(&body[at..header_end]).to_string();
        let data_start = header_end + 4;

        let Some(next_delim) = find_subsequence(body, delim_bytes, data_start) else {
            break;
        };
        // Strip the CRLF that precedes the next delimiter
        let data_end = next_delim.saturating_sub(2).max(data_start);

        parts.push(MultipartPart {
            name: disposition_param(&headers, "name").unwrap_or_default(),
            filename: disposition_param(&headers, "filename"),
            data: body[data_start..data_end].to_vec(),
        });

        at = next_delim + delim_bytes.len();
        if at >= body.len() {
            break;
        }
    }
    parts
}

// ---------------------------------------------------------------------------
// Handlers

async fn handle_check() -> Reply {
    Reply::Json(json!({}))
}

/// Solve the proof of work for a frontier cell and claim it for the
/// submitted public key. The search runs off the lock; the final sign
/// re-checks, so the loser of a mining race gets "already mined".
async fn handle_mine(state: &ServerState, values: &Value) -> Reply {
    let (Some(index), Some(owner)) = (
        parse_index(&values["index"]),
        values["signature"].as_str(),
    ) else {
        return bad_request("Missing values");
    };

    let challenge = match state.blockgrid.read().await.mine_challenge(&index, owner) {
        Ok(c) => c,
        Err(e) => return grid_error_reply(e),
    };

    let search_index = index;
    let search = tokio::task::spawn_blocking(move || {
        pow::proof_of_work(&challenge, &search_index)
    })
    .await;
    let Ok(proof) = search else {
        return internal_error();
    };

    let mined = match state
        .blockgrid
        .write()
        .await
        .sign_block(index, proof, owner.to_string())
        .await
    {
        Ok(cell) => cell,
        Err(e) => return grid_error_reply(e),
    };

    println!(
        "{} cell {} mined (difficulty {})",
        "[grid]".bright_green().bold(),
        index,
        pow::difficulty(&index)
    );

    Reply::Json(json!({
        "message": "New Block Forged",
        "index": mined.index,
        "owner": mined.owner,
        "data": mined.data,
        "proof": mined.proof,
        "previous_hash": mined.previous_hash,
    }))
}

async fn handle_new_transaction(state: &ServerState, values: &Value) -> Reply {
    let (Some(index), Some(data), Some(signature)) = (
        parse_index(&values["index"]),
        values["data"].as_str(),
        values["signature"].as_str(),
    ) else {
        return bad_request("Missing values");
    };

    let result = state
        .blockgrid
        .write()
        .await
        .new_transaction(
            index,
            data.to_string(),
            signature.to_string(),
            now_ms(),
            true,
        )
        .await;

    match result {
        Ok(index) => Reply::Json(json!({
            "message": format!("Transaction will be added to Block {index}"),
        })),
        Err(e) => grid_error_reply(e),
    }
}

/// The multipart submission pipeline: authenticate, store attached
/// bundles, apply moderator deletes, record grouped entries signed with
/// the server key.
async fn handle_unsigned_transaction(state: &ServerState, req_parts: &hyper::http::request::Parts, body: &[u8]) -> Reply {
    let millis = now_ms();

    let boundary = req_parts
        .headers
        .get("content-type")
        .and_then(|h| h.to_str().ok())
        .and_then(multipart_boundary);
    let Some(boundary) = boundary else {
        return bad_request("Missing values");
    };

    let parts = parse_multipart(body, &boundary);
    let Some(values) = parts
        .iter()
        .find(|p| p.filename.is_none())
        .and_then(|p| serde_json::from_slice::<Value>(&p.data).ok())
    else {
        return bad_request("Missing values");
    };

    let ticket = values["ticket"].as_str().unwrap_or_default();
    let moderator = state.oracle.is_moderator(ticket).await;

    // Attached bundles, keyed by field name; re-uploads are skipped.
    for part in parts.iter().filter(|p| p.filename.is_some()) {
        match assets::store_bundle(&state.store, &part.name, &part.data, millis).await {
            Ok(true) => {
                println!(
                    "{} stored bundle {} ({} bytes)",
                    "[assets]".bright_blue().bold(),
                    part.name,
                    part.data.len()
                );
            }
            Ok(false) => {}
            Err(_) => return internal_error(),
        }
    }

    // Moderator delete directive: strip tagged assets from every entry
    // payload on each targeted cell, serialized behind the edit lock.
    if moderator && let Some(delete) = values.get("delete").and_then(|v| v.as_object()) {
        let tags: HashSet<String> = delete.keys().cloned().collect();
        let targets: Vec<GridIndex> = delete
            .values()
            .filter_map(parse_world_index)
            .collect();

        let _held = state.edit_lock.lock().await;
        for index in targets {
            let result = state.blockgrid.write().await.strip_assets(index, &tags).await;
            match result {
                Ok(()) | Err(GridError::UnknownIndex(_)) => {}
                Err(_) => return internal_error(),
            }
        }
    }

    // Group asset entries by cell and record one server-signed entry per cell.
    let mut groups: BTreeMap<GridIndex, serde_json::Map<String, Value>> = BTreeMap::new();
    if let Some(object) = values.as_object() {
        for (asset_id, fields) in object {
            let Some(position) = fields.get("position") else {
                continue;
            };
            let Some(index) = parse_world_index(position) else {
                continue;
            };
            groups
                .entry(index)
                .or_default()
                .insert(asset_id.clone(), fields.clone());
        }
    }

    let mut touched: Vec<GridIndex> = Vec::new();
    for (index, payload) in groups {
        let data = canonical_json(&Value::Object(payload));
        let signature = rsa::sign_b64(&state.server_keys.private, data.as_bytes());
        let result = state
            .blockgrid
            .write()
            .await
            .new_transaction(index, data, signature, millis, moderator)
            .await;
        match result {
            Ok(index) => touched.push(index),
            Err(GridError::UnknownIndex(_)) => {
                eprintln!(
                    "{} dropped entry for unexpanded cell {index}",
                    "[grid]".yellow().bold()
                );
            }
            Err(_) => return internal_error(),
        }
    }

    Reply::Json(json!({
        "message": format!(
            "Transaction will be added to regions {:?}",
            touched.iter().map(|i| i.0).collect::<Vec<_>>()
        ),
        "indices": touched.iter().map(|i| i.0).collect::<Vec<_>>(),
    }))
}

/// Entries at a cell, unapproved ones hidden from non-moderators.
async fn handle_data_at_index(state: &ServerState, values: &Value) -> Reply {
    if values.get("index").is_none()
        || values.get("time").is_none()
        || values.get("ticket").is_none()
    {
        return bad_request("Missing values");
    }
    let Some(index) = parse_world_index(&values["index"]) else {
        return bad_request("Missing values");
    };

    let ticket = values["ticket"].as_str().unwrap_or_default();
    let moderator = state.oracle.is_moderator(ticket).await;

    let blockgrid = state.blockgrid.read().await;
    let block: Vec<Value> = blockgrid
        .visible_entries(&index, moderator)
        .into_iter()
        .map(|e| json!({"data": e.data, "approved": e.approved}))
        .collect();
    Reply::Json(json!({ "block": block }))
}

/// A deflate ZIP of every bundle referenced by the visible entries at a
/// cell, restricted to chunks newer than `time`. Each bundle appears at
/// most once.
async fn handle_bundles_at_index(state: &ServerState, values: &Value) -> Reply {
    if values.get("index").is_none()
        || values.get("time").is_none()
        || values.get("ticket").is_none()
    {
        return bad_request("Missing values");
    }
    let Some(index) = parse_world_index(&values["index"]) else {
        return bad_request("Missing values");
    };
    let since = values["time"].as_u64().unwrap_or(0);

    let ticket = values["ticket"].as_str().unwrap_or_default();
    let moderator = state.oracle.is_moderator(ticket).await;

    // Unique bundle names across the visible entries, in entry order
    let mut names: Vec<String> = Vec::new();
    {
        let blockgrid = state.blockgrid.read().await;
        for entry in blockgrid.visible_entries(&index, moderator) {
            let Ok(payload) = serde_json::from_str::<Value>(&entry.data) else {
                continue;
            };
            let Some(object) = payload.as_object() else {
                continue;
            };
            for fields in object.values() {
                if let Some(filepath) = fields.get("filepath").and_then(|v| v.as_str())
                    && !names.iter().any(|n| n == filepath)
                {
                    names.push(filepath.to_string());
                }
            }
        }
    }

    let mut bundles: Vec<(String, Vec<u8>)> = Vec::new();
    for name in names {
        match assets::read_bundle(&state.store, &name, since).await {
            Ok(bundle) if !bundle.is_empty() => bundles.push((name, bundle)),
            Ok(_) => {}
            Err(_) => return internal_error(),
        }
    }

    match zip_bundles(&bundles) {
        Ok(archive) => Reply::Zip(archive),
        Err(_) => internal_error(),
    }
}

fn zip_bundles(bundles: &[(String, Vec<u8>)]) -> Result<Vec<u8>, zip::result::ZipError> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, bundle) in bundles {
        writer.start_file(name, options)?;
        writer.write_all(bundle)?;
    }
    Ok(writer.finish()?.into_inner())
}

async fn handle_full_grid(state: &ServerState) -> Reply {
    let blockgrid = state.blockgrid.read().await;
    Reply::Json(json!({
        "grid": grid_to_wire(blockgrid.grid()),
        "length": blockgrid.len(),
    }))
}

async fn handle_compare_grids(state: &ServerState, values: &Value) -> Reply {
    let Some(other) = values.get("grid").and_then(grid_from_wire) else {
        return bad_request("Missing values");
    };
    let auth = state.blockgrid.read().await.compare_grids(&other);
    Reply::Json(json!({ "auth": auth }))
}

// Swaps the in-memory grid only; a testing surface.
async fn handle_replace_grid(state: &ServerState, values: &Value) -> Reply {
    let Some(other) = values.get("grid").and_then(grid_from_wire) else {
        return bad_request("Missing values");
    };
    state.blockgrid.write().await.replace_grid(other);
    Reply::Json(json!({ "message": "grid has been replaced" }))
}

async fn handle_update_grids(state: &ServerState, values: &Value) -> Reply {
    let (Some(shorter), Some(longer)) = (
        values.get("shorter_grid").and_then(grid_from_wire),
        values.get("longer_grid").and_then(grid_from_wire),
    ) else {
        return bad_request("Missing values");
    };

    let merged = state
        .blockgrid
        .read()
        .await
        .update_grid(longer, &shorter)
        .await;
    match merged {
        Ok(merged) => Reply::Json(json!({
            "grid": grid_to_wire(&merged),
        })),
        Err(e) => grid_error_reply(e),
    }
}

async fn handle_register_nodes(state: &ServerState, values: &Value) -> Reply {
    let Some(nodes) = values.get("nodes").and_then(|v| v.as_array()) else {
        return bad_request("Error: Please supply a valid list of nodes");
    };

    let mut blockgrid = state.blockgrid.write().await;
    for node in nodes {
        if let Some(address) = node.as_str() {
            blockgrid.register_node(address);
        }
    }
    Reply::Json(json!({
        "message": "New nodes have been added",
        "total_nodes": blockgrid.nodes().iter().collect::<Vec<_>>(),
    }))
}

/// Run consensus against every registered peer.
async fn handle_resolve(state: &ServerState) -> Reply {
    let mut blockgrid = state.blockgrid.write().await;
    match state.resolver.resolve_conflicts(&mut blockgrid).await {
        Ok(true) => Reply::Json(json!({
            "message": "Our grid was replaced",
            "grid": grid_to_wire(blockgrid.grid()),
        })),
        Ok(false) => Reply::Json(json!({
            "message": "Our grid is authoritative",
            "grid": grid_to_wire(blockgrid.grid()),
        })),
        Err(_) => internal_error(),
    }
}

// ---------------------------------------------------------------------------
// Routing

async fn route(state: Arc<ServerState>, req: Request<Incoming>) -> Reply {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(b) => b.to_bytes(),
        Err(_) => return bad_request("Bad Request"),
    };

    let path = parts.uri.path().to_string();
    let method = parts.method.as_str().to_string();

    // Everything except the multipart endpoint carries a JSON body (possibly
    // empty for plain GETs).
    let values: Value = if body.is_empty() {
        json!({})
    } else if path == "/transactions/new/unsigned" {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => return bad_request("Missing values"),
        }
    };

    match (method.as_str(), path.as_str()) {
        ("GET", "/") => handle_check().await,
        ("GET", "/mine") => handle_mine(&state, &values).await,
        ("POST", "/transactions/new") => handle_new_transaction(&state, &values).await,
        ("POST", "/transactions/new/unsigned") => {
            handle_unsigned_transaction(&state, &parts, &body).await
        }
        ("POST", "/grid/index") => handle_data_at_index(&state, &values).await,
        ("POST", "/grid/index/bundles") => handle_bundles_at_index(&state, &values).await,
        ("GET", "/grid") => handle_full_grid(&state).await,
        ("GET", "/grid/compare") => handle_compare_grids(&state, &values).await,
        ("PUT", "/grid/replace") => handle_replace_grid(&state, &values).await,
        ("GET", "/grid/update") => handle_update_grids(&state, &values).await,
        ("POST", "/nodes/register") => handle_register_nodes(&state, &values).await,
        ("GET", "/nodes/resolve") => handle_resolve(&state).await,
        _ => Reply::Error(StatusCode::NOT_FOUND, "Not Found".into()),
    }
}

async fn handle_request(
    state: Arc<ServerState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let reply = route(state, req).await;
    let response = match reply {
        Reply::Json(value) => {
            let body = serde_json::to_vec(&value).unwrap_or_default();
            Response::builder()
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        Reply::Zip(bytes) => Response::builder()
            .header("Content-Type", "application/octet-stream")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap(),
        Reply::Error(status, message) => Response::builder()
            .status(status)
            .body(Full::new(Bytes::from(message)))
            .unwrap(),
    };
    Ok(response)
}

pub async fn start_http_server(
    state: Arc<ServerState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{HTTP_BIND_ADDRESS}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;

    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let (stream, _) = match timeout(Duration::from_millis(250), listener.accept()).await {
            Ok(Ok(pair)) => pair,
            _ => continue,
        };
        let s = state.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let s2 = s.clone();
                async move { handle_request(s2, req).await }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await;
        });
    }
    Ok(())
}
