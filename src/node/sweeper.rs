// Maintenance sweep: delete asset-chunk rows no cell references
//
// Runs every 3 days on its own task. Collects every filepath referenced by
// any entry payload, then pages through the Assets table and deletes rows
// whose logical bundle name is orphaned. Never touches the Grid table.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use tokio::sync::RwLock;

use crate::consensus::grid::Blockgrid;
use crate::node::assets::{logical_name, referenced_filepaths};
use crate::node::store::{PersistentStore, StoreError, Table};

pub fn spawn(
    blockgrid: Arc<RwLock<Blockgrid>>,
    store: PersistentStore,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // interval fires immediately; skip the startup tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweep(&blockgrid, &store).await {
                Ok(removed) => {
                    eprintln!(
                        "{} removed {removed} orphaned chunk row(s)",
                        "[sweep]".bright_blue().bold()
                    );
                }
                Err(e) => eprintln!("{} sweep failed: {e}", "[sweep]".bright_red().bold()),
            }
        }
    })
}

/// One full sweep. Chases the scan's continuation token until it is
/// exhausted; returns how many chunk rows were deleted.
pub async fn sweep(
    blockgrid: &RwLock<Blockgrid>,
    store: &PersistentStore,
) -> Result<usize, StoreError> {
    let referenced: HashSet<String> = referenced_filepaths(blockgrid.read().await.grid());

    let mut removed = 0usize;
    let mut token = None;
    loop {
        let page = store.scan_keys(Table::Assets, token).await?;
        for name in &page.names {
            if !referenced.contains(logical_name(name)) {
                store.delete_key(Table::Assets, name).await?;
                removed += 1;
            }
        }
        token = page.next;
        if token.is_none() {
            return Ok(removed);
        }
    }
}
