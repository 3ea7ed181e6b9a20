// End-to-end exercise of a single daemon's HTTP surface: mining, entry
// submission (signed and multipart), moderated reads and bundle downloads.
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

fn pick_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn start_blockgridd(port: u16, data_dir: &std::path::Path) -> Child {
    let bin = env!("CARGO_BIN_EXE_blockgridd");
    Command::new(bin)
        .env("BLOCKGRID_HTTP_PORT", port.to_string())
        .env("BLOCKGRID_DATA_DIR", data_dir.to_string_lossy().to_string())
        .env("BLOCKGRID_STORE_PACE_MS", "0")
        .env("BLOCKGRID_STORE_RETRY_MS", "0")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn blockgridd")
}

async fn wait_until_ready(client: &reqwest::Client, base: &str) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while Instant::now() < deadline {
        if let Ok(resp) = client.get(format!("{base}/")).send().await
            && resp.status().is_success()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("daemon at {base} never became ready");
}

async fn mine(client: &reqwest::Client, base: &str, index: [i64; 3], key: &str) -> reqwest::Response {
    client
        .get(format!("{base}/mine"))
        .json(&json!({ "index": index, "signature": key }))
        .send()
        .await
        .expect("mine request")
}

struct Node {
    child: Child,
    base: String,
    _dir: tempfile::TempDir,
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn spawn_node(client: &reqwest::Client) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let port = pick_free_port();
    let child = start_blockgridd(port, dir.path());
    let base = format!("http://127.0.0.1:{port}");
    wait_until_ready(client, &base).await;
    Node {
        child,
        base,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_mining_and_error_surfaces() {
    let client = reqwest::Client::new();
    let node = spawn_node(&client).await;
    let base = &node.base;

    // Fresh node: a lone unmined genesis
    let grid: Value = client
        .get(format!("{base}/grid"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(grid["length"], 1);

    // Mining genesis expands the frontier
    let resp = mine(&client, base, [0, 0, 0], "key1").await;
    assert_eq!(resp.status(), 200);
    let mined: Value = resp.json().await.unwrap();
    assert_eq!(mined["message"], "New Block Forged");
    assert_eq!(mined["index"], json!([0, 0, 0]));

    let grid: Value = client
        .get(format!("{base}/grid"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(grid["length"], 7);

    // Second claim on the same cell loses
    let resp = mine(&client, base, [0, 0, 0], "key2").await;
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), "Block has already been mined");

    // Cells beyond the frontier are not mineable
    let resp = mine(&client, base, [3, 3, 3], "key1").await;
    assert_eq!(resp.status(), 400);
    assert_eq!(
        resp.text().await.unwrap(),
        "Previous block has not been mined"
    );

    // Missing fields on the signed transaction endpoint
    let resp = client
        .post(format!("{base}/transactions/new"))
        .json(&json!({ "index": [0, 0, 0] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(resp.text().await.unwrap(), "Missing values");
}

#[tokio::test]
async fn test_submission_pipeline_and_bundle_reads() {
    let client = reqwest::Client::new();
    let node = spawn_node(&client).await;
    let base = &node.base;

    mine(&client, base, [0, 0, 0], "key1").await;

    // Multipart submission: one 900 KB bundle plus an asset placed at world
    // position (10, 0, 10) → cell (0, 0, 0). No oracle is configured, so the
    // submitter is not a moderator and the entry lands unapproved.
    let bundle: Vec<u8> = (0..900_000u32).map(|i| (i % 251) as u8).collect();
    let payload = json!({
        "ticket": "t-123",
        "asset1": { "filepath": "castle", "position": [10.0, 0.0, 10.0] },
    });
    let form = reqwest::multipart::Form::new()
        .text("json", payload.to_string())
        .part(
            "castle",
            reqwest::multipart::Part::bytes(bundle.clone()).file_name("castle.bin"),
        );
    let resp = client
        .post(format!("{base}/transactions/new/unsigned"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["indices"], json!([[0, 0, 0]]));

    // Unapproved entries are invisible to non-moderators
    let resp: Value = client
        .post(format!("{base}/grid/index"))
        .json(&json!({ "index": [10.0, 0.0, 10.0], "time": 0, "ticket": "t-123" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["block"], json!([]));

    // A signed (trusted) entry referencing the same bundle is visible
    let resp = client
        .post(format!("{base}/transactions/new"))
        .json(&json!({
            "index": [0, 0, 0],
            "data": "{\"asset1\":{\"filepath\":\"castle\",\"position\":[10,0,10]}}",
            "signature": "local-sig",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp: Value = client
        .post(format!("{base}/grid/index"))
        .json(&json!({ "index": [10.0, 0.0, 10.0], "time": 0, "ticket": "t-123" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["block"].as_array().unwrap().len(), 1);

    // The bundle comes back as one ZIP entry of exactly 900 000 bytes
    let resp = client
        .post(format!("{base}/grid/index/bundles"))
        .json(&json!({ "index": [10.0, 0.0, 10.0], "time": 0, "ticket": "t-123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let archive = resp.bytes().await.unwrap().to_vec();

    let mut reader = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
    assert_eq!(reader.len(), 1);
    let mut castle = Vec::new();
    std::io::Read::read_to_end(&mut reader.by_name("castle").unwrap(), &mut castle).unwrap();
    assert_eq!(castle.len(), 900_000);
    assert_eq!(castle, bundle);

    // Re-uploading the same bundle name is a no-op (idempotent probe on _0)
    let form = reqwest::multipart::Form::new()
        .text("json", json!({ "ticket": "t-123" }).to_string())
        .part(
            "castle",
            reqwest::multipart::Part::bytes(vec![9u8; 10]).file_name("castle.bin"),
        );
    let resp = client
        .post(format!("{base}/transactions/new/unsigned"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base}/grid/index/bundles"))
        .json(&json!({ "index": [10.0, 0.0, 10.0], "time": 0, "ticket": "t-123" }))
        .send()
        .await
        .unwrap();
    let archive = resp.bytes().await.unwrap().to_vec();
    let mut reader = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
    let mut castle = Vec::new();
    std::io::Read::read_to_end(&mut reader.by_name("castle").unwrap(), &mut castle).unwrap();
    assert_eq!(castle.len(), 900_000);
}
