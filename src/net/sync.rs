// Peer reconciliation: fetch peer grids over HTTP and run consensus
use std::time::Duration;

use colored::*;

use crate::consensus::grid::{Blockgrid, GridError, valid_grid};
use crate::primitives::cell::{Grid, grid_from_wire};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("peer unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("peer returned status {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("peer grid failed to parse")]
    BadBody,
}

pub struct ReconciliationClient {
    http: reqwest::Client,
}

impl Default for ReconciliationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(crate::config::PEER_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        ReconciliationClient { http }
    }

    /// GET a peer's full grid. Non-2xx responses and unparseable bodies are
    /// errors the resolver skips over.
    pub async fn fetch_grid(&self, node: &str) -> Result<Grid, SyncError> {
        let url = format!("http://{node}/grid");
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::BadStatus(response.status()));
        }
        let body: serde_json::Value = response.json().await.map_err(|_| SyncError::BadBody)?;
        let wire = body.get("grid").ok_or(SyncError::BadBody)?;
        grid_from_wire(wire).ok_or(SyncError::BadBody)
    }

    /// Consensus over the node set. A valid, strictly longer peer grid
    /// replaces ours after absorbing our data; a valid shorter-or-equal peer
    /// grid is merged into ours. Returns true iff the local grid was replaced
    /// wholesale. Unreachable or invalid peers are logged and skipped.
    pub async fn resolve_conflicts(&self, blockgrid: &mut Blockgrid) -> Result<bool, GridError> {
        let nodes: Vec<String> = blockgrid.nodes().iter().cloned().collect();
        let mut replaced = false;

        for node in nodes {
            let peer_grid = match self.fetch_grid(&node).await {
                Ok(grid) => grid,
                Err(e) => {
                    eprintln!("{} peer {node} skipped: {e}", "[sync]".yellow().bold());
                    continue;
                }
            };
            if !valid_grid(&peer_grid) {
                eprintln!(
                    "{} peer {node} sent an invalid grid",
                    "[sync]".yellow().bold()
                );
                continue;
            }

            let ours = blockgrid.grid().clone();
            if peer_grid.len() > ours.len() {
                let merged = blockgrid.update_grid(peer_grid, &ours).await?;
                eprintln!(
                    "{} adopted longer grid from {node} ({} cells)",
                    "[sync]".green().bold(),
                    merged.len()
                );
                blockgrid.replace_grid(merged);
                replaced = true;
            } else {
                let merged = blockgrid.update_grid(ours, &peer_grid).await?;
                blockgrid.replace_grid(merged);
            }
        }
        Ok(replaced)
    }
}
