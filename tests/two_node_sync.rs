// Two daemons, mining different regions, converging through the compare /
// update / resolve surfaces.
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

struct Node {
    child: Child,
    base: String,
    port: u16,
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

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        if let Ok(resp) = client.get(format!("{base}/")).send().await
            && resp.status().is_success()
        {
            break;
        }
        if Instant::now() > deadline {
            panic!("daemon at {base} never became ready");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Node {
        child,
        base,
        port,
        _dir: dir,
    }
}

async fn mine(client: &reqwest::Client, node: &Node, index: [i64; 3], key: &str) {
    let resp = client
        .get(format!("{}/mine", node.base))
        .json(&json!({ "index": index, "signature": key }))
        .send()
        .await
        .expect("mine request");
    assert_eq!(resp.status(), 200, "mining {index:?} failed");
}

async fn full_grid(client: &reqwest::Client, node: &Node) -> Value {
    client
        .get(format!("{}/grid", node.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn compare(client: &reqwest::Client, node: &Node, other_grid: &Value) -> bool {
    let resp: Value = client
        .get(format!("{}/grid/compare", node.base))
        .json(&json!({ "grid": other_grid }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    resp["auth"].as_bool().unwrap()
}

#[tokio::test]
async fn test_grids_of_different_lengths() {
    let client = reqwest::Client::new();
    let a = spawn_node(&client).await;
    let b = spawn_node(&client).await;

    for index in [[0, 0, 0], [0, 0, 1], [0, 1, 0], [1, 0, 0], [2, 0, 0]] {
        mine(&client, &a, index, "key1").await;
    }
    for index in [[0, 0, 0], [0, 0, 1], [1, 0, 0], [2, 0, 0]] {
        mine(&client, &b, index, "key2").await;
    }

    let grid_a = full_grid(&client, &a).await;
    let grid_b = full_grid(&client, &b).await;
    assert!(grid_a["length"].as_u64() > grid_b["length"].as_u64());

    // A's grid is authoritative from B's point of view, not vice versa
    assert!(compare(&client, &b, &grid_a["grid"]).await);
    assert!(!compare(&client, &a, &grid_b["grid"]).await);
}

#[tokio::test]
async fn test_resolve_and_newer_data_merge() {
    let client = reqwest::Client::new();
    let a = spawn_node(&client).await;
    let b = spawn_node(&client).await;

    for index in [[0, 0, 0], [0, 0, 1], [0, 1, 0], [1, 0, 0], [2, 0, 0]] {
        mine(&client, &a, index, "key1").await;
    }
    mine(&client, &b, [0, 0, 0], "key2").await;

    // B adopts A's longer grid wholesale
    let resp = client
        .post(format!("{}/nodes/register", b.base))
        .json(&json!({ "nodes": [format!("127.0.0.1:{}", a.port)] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resolved: Value = client
        .get(format!("{}/nodes/resolve", b.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["message"], "Our grid was replaced");

    let grid_a = full_grid(&client, &a).await;
    let grid_b = full_grid(&client, &b).await;
    assert_eq!(grid_a["length"], grid_b["length"]);

    // A against the now-equal B: nothing longer out there
    let resp = client
        .post(format!("{}/nodes/register", a.base))
        .json(&json!({ "nodes": [format!("127.0.0.1:{}", b.port)] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resolved: Value = client
        .get(format!("{}/nodes/resolve", a.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["message"], "Our grid is authoritative");

    // B appends fresh entries to its mined cells; merging B into A carries
    // the newer data across because the owners match.
    for index in [[0, 0, 0], [0, 0, 1]] {
        let resp = client
            .post(format!("{}/transactions/new", b.base))
            .json(&json!({
                "index": index,
                "data": "{\"asset\":{\"filepath\":\"hut\"}}",
                "signature": "sig",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let grid_b = full_grid(&client, &b).await;
    let grid_a = full_grid(&client, &a).await;
    let merged: Value = client
        .get(format!("{}/grid/update", a.base))
        .json(&json!({
            "shorter_grid": grid_b["grid"],
            "longer_grid": grid_a["grid"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let origin = &merged["grid"]["0:0:0"];
    assert_eq!(origin["data"].as_array().unwrap().len(), 1);
    let stacked = &merged["grid"]["0:0:1"];
    assert_eq!(stacked["data"].as_array().unwrap().len(), 1);

    // A mines two more cells; B resolves again and is replaced again.
    mine(&client, &a, [0, 0, 2], "key1").await;
    mine(&client, &a, [0, 2, 0], "key1").await;

    let resolved: Value = client
        .get(format!("{}/nodes/resolve", b.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["message"], "Our grid was replaced");

    let grid_a = full_grid(&client, &a).await;
    let grid_b = full_grid(&client, &b).await;
    assert_eq!(grid_a["length"], grid_b["length"]);
}
