// blockgrid-cli — Blockgrid Command Line Interface
//
// Lightweight client that drives a running daemon over its HTTP surface.
// Usage: blockgrid-cli <command> [args...]

use std::env;

use serde_json::{Value, json};

use colored::*;

fn print_usage() {
    println!(
        "{}",
        "                    - Blockgrid Node Control -                    "
            .bright_yellow()
            .on_blue()
            .bold()
    );
    println!();
    println!(
        "{}",
        "  Usage: blockgrid-cli <command> [args...]"
            .bright_yellow()
            .bold()
    );
    println!();
    println!("{}", "  Commands:".bright_white().bold());
    println!(
        "  {} {:<34} {}",
        "❯".bright_black(),
        "status".bright_green(),
        "Ping the daemon".white()
    );
    println!(
        "  {} {:<34} {}",
        "❯".bright_black(),
        "grid".bright_green(),
        "Show grid length and mined cells".white()
    );
    println!(
        "  {} {:<34} {}",
        "❯".bright_black(),
        "mine <x> <y> <z>".bright_green(),
        "Mine the cell at an index (uses public.pem)".white()
    );
    println!(
        "  {} {:<34} {}",
        "❯".bright_black(),
        "addnode <host:port>".bright_green(),
        "Register a peer node".white()
    );
    println!(
        "  {} {:<34} {}",
        "❯".bright_black(),
        "resolve".bright_green(),
        "Run consensus against registered peers".white()
    );
    println!();
}

fn base_url() -> String {
    let port = std::env::var("BLOCKGRID_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(blockgrid::config::HTTP_PORT);
    format!("http://127.0.0.1:{port}")
}

fn miner_public_key() -> Result<String, String> {
    let path = blockgrid::config::default_data_dir().join("public.pem");
    std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))
}

async fn send(request: reqwest::RequestBuilder) -> Result<Value, String> {
    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    let text = response.text().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!("{status}: {text}"));
    }
    serde_json::from_str(&text).map_err(|e| format!("bad response: {e}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let client = reqwest::Client::new();
    let base = base_url();

    let result = match args[1].as_str() {
        "status" => send(client.get(format!("{base}/"))).await.map(|_| {
            json!({ "status": "ok" })
        }),
        "grid" => {
            send(client.get(format!("{base}/grid")))
                .await
                .map(|v| {
                    let mined: Vec<&String> = v["grid"]
                        .as_object()
                        .map(|g| {
                            g.iter()
                                .filter(|(_, cell)| !cell["owner"].is_null())
                                .map(|(k, _)| k)
                                .collect()
                        })
                        .unwrap_or_default();
                    json!({
                        "length": v["length"],
                        "mined": mined,
                    })
                })
        }
        "mine" if args.len() == 5 => {
            let index: Result<Vec<i64>, _> = args[2..5].iter().map(|a| a.parse()).collect();
            match (index, miner_public_key()) {
                (Ok(index), Ok(key)) => {
                    send(
                        client
                            .get(format!("{base}/mine"))
                            .json(&json!({ "index": index, "signature": key })),
                    )
                    .await
                }
                (Err(e), _) => Err(format!("bad index: {e}")),
                (_, Err(e)) => Err(e),
            }
        }
        "addnode" if args.len() == 3 => {
            send(
                client
                    .post(format!("{base}/nodes/register"))
                    .json(&json!({ "nodes": [args[2]] })),
            )
            .await
        }
        "resolve" => {
            send(client.get(format!("{base}/nodes/resolve")))
                .await
                .map(|v| json!({ "message": v["message"] }))
        }
        _ => {
            print_usage();
            return Ok(());
        }
    };

    match result {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value)?.bright_white()
        ),
        Err(e) => {
            eprintln!("{} {e}", "Error:".bright_red().bold());
            std::process::exit(1);
        }
    }
    Ok(())
}
